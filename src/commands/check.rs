use kube::api::ListParams;
use kube::{Api, Client};

use apollo::crd::{Device, DeviceProcess, DeviceProcessDeployment};

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. List Device permission
    print!("  List devices permission ...... ");
    let devices: Api<Device> = Api::all(client.clone());
    match devices.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} devices)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. List DeviceProcess permission
    print!("  List device processes ........ ");
    let processes: Api<DeviceProcess> = Api::all(client.clone());
    match processes.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} device processes)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 5. List DeviceProcessDeployment permission
    print!("  List deployments ............. ");
    let deployments: Api<DeviceProcessDeployment> = Api::all(client.clone());
    match deployments.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} deployments)", list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 6. Kubernetes version (already fetched above)
    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
