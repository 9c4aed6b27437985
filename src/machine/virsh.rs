use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::traits::{validate_checkpoint_name, CheckpointStore, MachineControl};
use crate::error::MachineError;

#[derive(Debug)]
struct VirshOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// libvirt domain controlled through the `virsh` command line tool.
#[derive(Debug, Clone)]
pub struct VirshMachine {
    program: String,
    vm_name: String,
    snapshot_name: String,
    command_timeout: Duration,
    agent_timeout: Duration,
}

impl VirshMachine {
    pub fn new(vm_name: impl Into<String>, snapshot_name: impl Into<String>) -> Self {
        Self {
            program: "virsh".to_string(),
            vm_name: vm_name.into(),
            snapshot_name: snapshot_name.into(),
            command_timeout: Duration::from_secs(30),
            agent_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Upper bound for any single `virsh` call. A hung call is killed and
    /// reported as [`MachineError::Timeout`].
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    async fn run(&self, args: &[&str]) -> Result<VirshOutput, MachineError> {
        self.run_within(args, self.command_timeout).await
    }

    async fn run_within(
        &self,
        args: &[&str],
        limit: Duration,
    ) -> Result<VirshOutput, MachineError> {
        log::debug!("{} {}", self.program, args.join(" "));
        let mut command = Command::new(&self.program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| MachineError::Timeout(limit.as_secs_f64()))??;

        Ok(VirshOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, MachineError> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(MachineError::Backend(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                output.stderr
            )))
        }
    }

    pub async fn domain_state(&self) -> Result<String, MachineError> {
        let state = self.run_checked(&["domstate", self.vm_name.as_str()]).await?;
        log::debug!("VM '{}' state: {}", self.vm_name, state);
        Ok(state)
    }
}

fn mentions_not_running(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("domain is not running") || lower.contains("domain not running")
}

#[async_trait]
impl MachineControl for VirshMachine {
    async fn revert_to_reference(&self) -> Result<(), MachineError> {
        if !self.reference_exists().await? {
            return Err(MachineError::ReferenceMissing(self.snapshot_name.clone()));
        }

        log::info!(
            "Reverting VM '{}' to snapshot '{}'",
            self.vm_name,
            self.snapshot_name
        );
        self.run_checked(&[
            "snapshot-revert",
            self.vm_name.as_str(),
            self.snapshot_name.as_str(),
        ])
        .await?;
        Ok(())
    }

    async fn start(&self) -> Result<(), MachineError> {
        let output = self.run(&["start", self.vm_name.as_str()]).await?;
        if output.success || output.stderr.to_lowercase().contains("already active") {
            return Ok(());
        }
        Err(MachineError::Backend(format!(
            "virsh start failed: {}",
            output.stderr
        )))
    }

    async fn stop(&self) -> Result<(), MachineError> {
        log::info!("Stopping VM '{}'", self.vm_name);
        let output = self.run(&["destroy", self.vm_name.as_str()]).await?;
        if output.success {
            return Ok(());
        }
        if mentions_not_running(&output.stderr) {
            log::info!("VM '{}' was not running", self.vm_name);
            return Ok(());
        }
        Err(MachineError::Backend(format!(
            "virsh destroy failed: {}",
            output.stderr
        )))
    }

    async fn is_running(&self) -> Result<bool, MachineError> {
        Ok(self.domain_state().await? == "running")
    }

    async fn is_responsive(&self) -> Result<bool, MachineError> {
        let args = [
            "qemu-agent-command",
            self.vm_name.as_str(),
            r#"{"execute":"guest-ping"}"#,
        ];

        match self.run_within(&args, self.agent_timeout).await {
            Ok(output) => Ok(output.success),
            Err(e) => {
                log::debug!("Guest agent ping failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for VirshMachine {
    fn reference_name(&self) -> &str {
        &self.snapshot_name
    }

    async fn list_checkpoints(&self) -> Result<Vec<String>, MachineError> {
        let stdout = self
            .run_checked(&["snapshot-list", self.vm_name.as_str(), "--name"])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn create_checkpoint(&self, name: Option<&str>) -> Result<String, MachineError> {
        let name = name.unwrap_or(&self.snapshot_name).to_string();
        validate_checkpoint_name(&name)?;
        log::info!("Creating snapshot '{}' for VM '{}'", name, self.vm_name);

        let existing = self
            .run(&["snapshot-delete", self.vm_name.as_str(), name.as_str()])
            .await?;
        if !existing.success && !existing.stderr.contains("No snapshot with name") {
            log::warn!("Could not delete existing snapshot: {}", existing.stderr);
        }

        self.run_checked(&["snapshot-create-as", self.vm_name.as_str(), name.as_str()])
            .await?;
        Ok(name)
    }

    async fn delete_checkpoint(&self, name: &str) -> Result<(), MachineError> {
        validate_checkpoint_name(name)?;
        log::info!("Deleting snapshot '{}' for VM '{}'", name, self.vm_name);
        self.run_checked(&["snapshot-delete", self.vm_name.as_str(), name])
            .await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes a stand-in `virsh` that answers from a fixed script.
    fn fake_virsh(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("virsh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_lists_snapshots() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, r#"printf 'ready\n\nbefore-update\n'"#);
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        let snapshots = machine.list_checkpoints().await.unwrap();
        assert_eq!(snapshots, vec!["ready", "before-update"]);
        assert!(machine.reference_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_revert_requires_reference() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, r#"printf 'other\n'"#);
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        let err = machine.revert_to_reference().await.unwrap_err();
        assert!(matches!(err, MachineError::ReferenceMissing(ref name) if name == "ready"));
    }

    #[tokio::test]
    async fn test_domstate_running() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, r#"echo running"#);
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        assert!(machine.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_tolerates_stopped_domain() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(
            &dir,
            r#"echo "error: Requested operation is not valid: domain is not running" >&2; exit 1"#,
        );
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        assert!(machine.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_backend_error_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, r#"echo "failed to connect to the hypervisor" >&2; exit 1"#);
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        let err = machine.is_running().await.unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, "exec sleep 5");
        let machine = VirshMachine::new("artwork", "ready")
            .with_program(program)
            .with_command_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = machine.is_running().await.unwrap_err();
        assert!(matches!(err, MachineError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_guest_ping_answers() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(
            &dir,
            r#"[ "$1" = qemu-agent-command ] || exit 2; echo '{"return":{}}'"#,
        );
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        assert!(machine.is_responsive().await.unwrap());
    }

    #[tokio::test]
    async fn test_guest_ping_fails() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, r#"echo "error: Guest agent is not responding" >&2; exit 1"#);
        let machine = VirshMachine::new("artwork", "ready").with_program(program);

        assert!(!machine.is_responsive().await.unwrap());
    }

    #[tokio::test]
    async fn test_guest_ping_hangs_past_agent_timeout() {
        let dir = TempDir::new().unwrap();
        let program = fake_virsh(&dir, "exec sleep 5");
        let machine = VirshMachine::new("artwork", "ready")
            .with_program(program)
            .with_agent_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        assert!(!machine.is_responsive().await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let machine =
            VirshMachine::new("artwork", "ready").with_program("/nonexistent/virsh-binary");
        assert!(matches!(
            machine.is_running().await,
            Err(MachineError::Io(_))
        ));
    }
}
