//! Service-manager driver (spec.md §4.3 steps 4-7). A trait over the
//! operations the reconcile loop needs, with a `systemctl`-backed
//! implementation and an in-memory fake for tests — grounded on the
//! `tokio::process::Command` + timeout pattern other_examples' adaptive
//! expert platform uses for its own command-based health check.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of `systemctl show`'s output the reconcile loop needs to
/// decide whether a process is started (spec.md §4.3 step 6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitStatus {
    pub main_pid: i64,
    pub exec_main_start_timestamp: Option<String>,
    pub active_state: String,
    pub sub_state: String,
}

impl UnitStatus {
    /// spec.md §4.3 step 6: "Consider the process started iff `ActiveState
    /// == "active"` and `PID > 0`."
    pub fn is_started(&self) -> bool {
        self.active_state == "active" && self.main_pid > 0
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn reload(&self) -> Result<()>;
    async fn enable_and_start(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    /// Stop and disable `unit`. Unit-not-found is non-fatal (spec.md §4.3
    /// "Pruning").
    async fn stop_and_disable(&self, unit: &str) -> Result<()>;
    async fn status(&self, unit: &str) -> Result<UnitStatus>;
}

pub struct SystemdServiceManager;

impl SystemdServiceManager {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = timeout(COMMAND_TIMEOUT, Command::new("systemctl").args(args).output())
            .await
            .with_context(|| format!("systemctl {args:?} timed out"))?
            .with_context(|| format!("spawning systemctl {args:?}"))?;
        Ok(output)
    }

    fn unit_not_found(stderr: &str) -> bool {
        stderr.contains("not loaded") || stderr.contains("not found") || stderr.contains("No such file")
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn reload(&self) -> Result<()> {
        let output = self.run(&["daemon-reload"]).await?;
        if !output.status.success() {
            anyhow::bail!("systemctl daemon-reload failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    async fn enable_and_start(&self, unit: &str) -> Result<()> {
        let output = self.run(&["enable", "--now", unit]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "systemctl enable --now {unit} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        let output = self.run(&["restart", unit]).await?;
        if !output.status.success() {
            anyhow::bail!("systemctl restart {unit} failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    async fn stop_and_disable(&self, unit: &str) -> Result<()> {
        let output = self.run(&["disable", "--now", unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if Self::unit_not_found(&stderr) {
                return Ok(());
            }
            anyhow::bail!("systemctl disable --now {unit} failed: {stderr}");
        }
        Ok(())
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus> {
        let output = self
            .run(&[
                "show",
                unit,
                "--property=MainPID,ExecMainStartTimestamp,ActiveState,SubState",
            ])
            .await?;
        if !output.status.success() {
            anyhow::bail!("systemctl show {unit} failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(parse_show_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_show_output(stdout: &str) -> UnitStatus {
    let mut status = UnitStatus::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        match key {
            "MainPID" => status.main_pid = value.trim().parse().unwrap_or(0),
            "ExecMainStartTimestamp" if !value.trim().is_empty() => {
                status.exec_main_start_timestamp = Some(value.trim().to_string())
            }
            "ActiveState" => status.active_state = value.trim().to_string(),
            "SubState" => status.sub_state = value.trim().to_string(),
            _ => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_systemctl_show_output() {
        let stdout = "MainPID=1234\nExecMainStartTimestamp=Mon 2024-01-01 00:00:00 UTC\nActiveState=active\nSubState=running\n";
        let status = parse_show_output(stdout);
        assert_eq!(status.main_pid, 1234);
        assert_eq!(status.active_state, "active");
        assert_eq!(status.sub_state, "running");
        assert!(status.is_started());
    }

    #[test]
    fn zero_pid_is_not_started_even_if_active() {
        let status = UnitStatus { main_pid: 0, active_state: "active".into(), ..Default::default() };
        assert!(!status.is_started());
    }

    #[test]
    fn inactive_with_pid_is_not_started() {
        let status = UnitStatus { main_pid: 10, active_state: "inactive".into(), ..Default::default() };
        assert!(!status.is_started());
    }

    #[test]
    fn empty_start_timestamp_is_none() {
        let status = parse_show_output("MainPID=0\nExecMainStartTimestamp=\nActiveState=inactive\nSubState=dead\n");
        assert_eq!(status.exec_main_start_timestamp, None);
    }
}
