use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;
use crate::execution::{CommandOutput, ExecutionError, RemoteExecutor, RemoteSession};

/// Exit status ssh itself uses for connection errors
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Remote execution through the OpenSSH client. We only need to run commands so a sub process
/// is enough, `connect` starts a control master and every command is multiplexed over it so the
/// node is authenticated once per plan.
pub struct SshExecutor {
    pub connect_timeout_secs: u64,
    /// ssh client binary
    pub program: String,
    /// where the control sockets are created
    pub control_dir: PathBuf,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
        }
    }
}

pub struct SshSession {
    program: String,
    destination: String,
    control_path: PathBuf,
}

fn get_ssh_opts<'a>() -> Vec<&'a str> {
    // the VMs are new every run so there is no host key to check against
    vec!["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]
}

/// Quote an argument for the remote shell when it has anything but plain characters
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty() && arg.chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

async fn remove_control_path(control_path: &Path) {
    if control_path.exists() {
        if let Err(err) = tokio::fs::remove_file(control_path).await {
            tracing::debug!("could not remove {control_path:?}: {err}");
        }
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, address: &str, user: &str, private_key: &Path) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        let destination = format!("{user}@{address}");
        let control_path = self.control_dir
            .join(format!("overlay-compose-{}.sock", Uuid::new_v4().simple()));
        let connect_timeout = format!("ConnectTimeout={}", self.connect_timeout_secs);
        let control_arg = control_path.to_string_lossy().to_string();
        let key = private_key.to_string_lossy().to_string();
        tracing::debug!("opening ssh control master to {destination} at {control_arg}");

        let result = Command::new(&self.program)
            .args(["-i", key.as_str()])
            .args(get_ssh_opts())
            .args(["-o", connect_timeout.as_str()])
            .args(["-M", "-S", control_arg.as_str(), "-o", "ControlPersist=yes", "-f", "-N"])
            .arg(&destination)
            .kill_on_drop(true)
            .output()
            .await;
        let reason = match result {
            Ok(output) if output.status.success() => {
                return Ok(Box::new(SshSession { program: self.program.clone(), destination, control_path }));
            }
            Ok(output) => stderr_of(&output),
            Err(e) => e.to_string(),
        };
        remove_control_path(&control_path).await;
        Err(ExecutionError::Connect {
            address: address.to_string(),
            reason,
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput, ExecutionError> {
        let remote: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
        let output = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .args(get_ssh_opts())
            .arg(&self.destination)
            .arg("--")
            .args(&remote)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let exit_status = output.status.code().unwrap_or(-1);
        if exit_status == SSH_TRANSPORT_FAILURE {
            return Err(ExecutionError::Transport(stderr_of(&output)));
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_status,
        })
    }

    async fn close(self: Box<Self>) -> Result<(), ExecutionError> {
        tracing::debug!("closing ssh control master to {}", self.destination);
        let result = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .kill_on_drop(true)
            .output()
            .await;
        remove_control_path(&self.control_path).await;
        let output = result.map_err(|e| ExecutionError::Transport(e.to_string()))?;
        if !output.status.success() {
            return Err(ExecutionError::Transport(stderr_of(&output)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("options:remote_ip=10.0.0.2"), "options:remote_ip=10.0.0.2");
        assert_eq!(shell_quote("192.168.200.10/24"), "192.168.200.10/24");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SshExecutor {
            connect_timeout_secs: 1,
            program: "false".to_string(),
            control_dir: dir.path().to_path_buf(),
        };
        let err = executor.connect("192.0.2.1", "ubuntu", Path::new("/tmp/id_overlay")).await;
        assert!(matches!(err, Err(ExecutionError::Connect { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let executor = SshExecutor {
            program: "/nonexistent/ssh".to_string(),
            control_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = executor.connect("192.0.2.1", "ubuntu", Path::new("/tmp/id_overlay")).await;
        assert!(matches!(err, Err(ExecutionError::Connect { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
