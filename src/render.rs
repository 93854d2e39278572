//! Unit-file and environment-file rendering (spec.md §6). Pure functions so
//! they're testable without a service manager or filesystem.

use crate::crd::{DeviceProcessSpec, RestartPolicy};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

const MAX_SANITIZED_NAME_LEN: usize = 80;

/// Render one `KEY="VALUE"` line per env entry, sorted by key. Rejects
/// invalid keys (`^[A-Za-z_][A-Za-z0-9_]*$`) or values containing `\n`/`\r`.
pub fn render_env_file(spec: &DeviceProcessSpec) -> Result<String, String> {
    let mut entries: Vec<(&str, &str)> = spec
        .execution
        .env
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_str()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    for (key, value) in entries {
        if !is_valid_env_key(key) {
            return Err(format!("invalid environment key: {key}"));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(format!("environment value for {key} contains a newline"));
        }
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        writeln!(out, "{key}=\"{escaped}\"").expect("String write is infallible");
    }
    Ok(out)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape one argv entry per spec.md §6: empty → `""`; values with space,
/// tab, quote or backslash → double-quoted with `\`/`"` escaped;
/// `\n`/`\r` are rejected outright.
pub fn escape_arg(arg: &str) -> Result<String, String> {
    if arg.contains('\n') || arg.contains('\r') {
        return Err(format!("argument contains a newline: {arg:?}"));
    }
    if arg.is_empty() {
        return Ok("\"\"".to_string());
    }
    let needs_quoting = arg.chars().any(|c| matches!(c, ' ' | '\t' | '"' | '\\'));
    if !needs_quoting {
        return Ok(arg.to_string());
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}

/// Reject any ASCII control character, the rule spec.md §6 applies to
/// `WorkingDirectory` and `User`.
fn reject_control_chars(field: &str, value: &str) -> Result<(), String> {
    if value.chars().any(|c| (c as u32) < 0x20) {
        return Err(format!("{field} contains a control character"));
    }
    Ok(())
}

/// Render the `[Unit]`/`[Service]`/`[Install]` unit file content.
pub fn render_unit_file(
    namespace: &str,
    name: &str,
    spec: &DeviceProcessSpec,
    env_path: &str,
) -> Result<String, String> {
    if spec.execution.command.is_empty() {
        return Err("execution.command must have at least one element".to_string());
    }

    let mut argv = Vec::with_capacity(spec.execution.command.len() + spec.execution.args.len());
    for part in spec.execution.command.iter().chain(spec.execution.args.iter()) {
        argv.push(escape_arg(part)?);
    }
    let exec_start = argv.join(" ");

    if let Some(wd) = &spec.execution.working_dir {
        reject_control_chars("WorkingDirectory", wd)?;
    }
    if let Some(user) = &spec.execution.user {
        reject_control_chars("User", user)?;
    }

    let restart = match spec.restart_policy {
        RestartPolicy::Always => "always",
        RestartPolicy::OnFailure => "on-failure",
        RestartPolicy::Never => "no",
    };

    let mut out = String::new();
    writeln!(out, "[Unit]").unwrap();
    writeln!(out, "Description={namespace}/{name}").unwrap();
    writeln!(out, "After=network.target").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "[Service]").unwrap();
    writeln!(out, "Type=simple").unwrap();
    writeln!(out, "ExecStart={exec_start}").unwrap();
    if let Some(wd) = &spec.execution.working_dir {
        writeln!(out, "WorkingDirectory={wd}").unwrap();
    }
    writeln!(out, "EnvironmentFile=-{env_path}").unwrap();
    writeln!(out, "Restart={restart}").unwrap();
    if let Some(user) = &spec.execution.user {
        writeln!(out, "User={user}").unwrap();
    }
    writeln!(out).unwrap();
    writeln!(out, "[Install]").unwrap();
    writeln!(out, "WantedBy=multi-user.target").unwrap();

    Ok(out)
}

/// Lowercase, replace any char outside `[A-Za-z0-9_.-]` with `-`, trim
/// leading/trailing `-`.
pub fn sanitize_component(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_matches('-').to_string()
}

/// `apollo-<sanitized-ns>-<sanitized-name>`, truncated to 80 chars with an
/// 8-hex-digest suffix when the natural name would be longer.
pub fn unit_base_name(namespace: &str, name: &str) -> String {
    let base = format!(
        "apollo-{}-{}",
        sanitize_component(namespace),
        sanitize_component(name)
    );
    if base.len() <= MAX_SANITIZED_NAME_LEN {
        return base;
    }
    let digest = Sha256::digest(base.as_bytes());
    let suffix = &hex::encode(digest)[..8];
    let budget = MAX_SANITIZED_NAME_LEN - 1 - 8;
    let truncated: String = base.chars().take(budget).collect();
    format!("{truncated}-{suffix}")
}

pub fn unit_file_name(namespace: &str, name: &str) -> String {
    format!("{}.service", unit_base_name(namespace, name))
}

pub fn env_file_name(namespace: &str, name: &str) -> String {
    format!("{}.env", unit_base_name(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ArtifactSpec, ArtifactType, DeviceRef, EnvVar, ExecutionSpec};

    fn sample_spec() -> DeviceProcessSpec {
        DeviceProcessSpec {
            device_ref: DeviceRef { kind: "Device".into(), name: "tor1-01".into() },
            artifact: ArtifactSpec { type_: ArtifactType::File, url: "file:///bin/true".into(), sha256: None },
            execution: ExecutionSpec {
                command: vec!["/usr/bin/app".into()],
                args: vec!["--flag".into()],
                env: vec![
                    EnvVar { name: "ZETA".into(), value: "1".into() },
                    EnvVar { name: "ALPHA".into(), value: "hello world".into() },
                ],
                working_dir: Some("/var/lib/app".into()),
                user: Some("nobody".into()),
                backend: None,
            },
            restart_policy: RestartPolicy::Always,
            health_check: None,
        }
    }

    #[test]
    fn env_file_sorted_by_key() {
        let out = render_env_file(&sample_spec()).unwrap();
        let alpha_pos = out.find("ALPHA").unwrap();
        let zeta_pos = out.find("ZETA").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn env_file_rejects_invalid_key() {
        let mut spec = sample_spec();
        spec.execution.env = vec![EnvVar { name: "1BAD".into(), value: "x".into() }];
        assert!(render_env_file(&spec).is_err());
    }

    #[test]
    fn env_file_rejects_newline_in_value() {
        let mut spec = sample_spec();
        spec.execution.env = vec![EnvVar { name: "X".into(), value: "a\nb".into() }];
        assert!(render_env_file(&spec).is_err());
    }

    #[test]
    fn env_value_escapes_quotes_and_backslashes() {
        let mut spec = sample_spec();
        spec.execution.env = vec![EnvVar { name: "X".into(), value: "a\"b\\c".into() }];
        let out = render_env_file(&spec).unwrap();
        assert!(out.contains(r#"X="a\"b\\c""#));
    }

    #[test]
    fn escape_arg_quotes_when_space_present() {
        assert_eq!(escape_arg("a b").unwrap(), "\"a b\"");
    }

    #[test]
    fn escape_arg_empty_becomes_empty_quotes() {
        assert_eq!(escape_arg("").unwrap(), "\"\"");
    }

    #[test]
    fn escape_arg_rejects_newline() {
        assert!(escape_arg("a\nb").is_err());
    }

    #[test]
    fn escape_arg_leaves_simple_values_unquoted() {
        assert_eq!(escape_arg("--flag").unwrap(), "--flag");
    }

    #[test]
    fn unit_file_is_deterministic() {
        let spec = sample_spec();
        let a = render_unit_file("ns", "proc", &spec, "/etc/apollo/env/x.env").unwrap();
        let b = render_unit_file("ns", "proc", &spec, "/etc/apollo/env/x.env").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unit_file_contains_expected_sections() {
        let spec = sample_spec();
        let unit = render_unit_file("ns", "proc", &spec, "/etc/apollo/env/x.env").unwrap();
        assert!(unit.contains("[Unit]"));
        assert!(unit.contains("[Service]"));
        assert!(unit.contains("[Install]"));
        assert!(unit.contains("ExecStart=/usr/bin/app --flag"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("EnvironmentFile=-/etc/apollo/env/x.env"));
    }

    #[test]
    fn unit_file_rejects_control_chars_in_working_dir() {
        let mut spec = sample_spec();
        spec.execution.working_dir = Some("/bad\x01path".into());
        assert!(render_unit_file("ns", "proc", &spec, "x").is_err());
    }

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_chars() {
        assert_eq!(sanitize_component("My_Device.01!"), "my_device.01");
    }

    #[test]
    fn sanitize_trims_leading_trailing_dashes() {
        assert_eq!(sanitize_component("--weird--"), "weird");
    }

    #[test]
    fn unit_base_name_truncates_long_names_with_hash_suffix() {
        let long_name = "x".repeat(200);
        let base = unit_base_name("ns", &long_name);
        assert_eq!(base.len(), 80);
        assert!(base.starts_with("apollo-ns-"));
    }
}
