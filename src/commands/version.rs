pub fn run() {
    println!("apollo {}", env!("CARGO_PKG_VERSION"));
}
