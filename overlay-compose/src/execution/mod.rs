use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use overlay_compose_schemas::overlay_compose_yaml::launch_options::LaunchDefaults;
use crate::plan::{ConfigOperation, NodePlan};
use crate::run_context::{Interrupted, RetryPolicy, RunContext};

/// stderr of ovs-vsctl while ovsdb-server is not up yet
const OVSDB_NOT_READY: &str = "database connection failed";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("could not connect to {address}: {reason}")]
    Connect {
        address: String,
        reason: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("`{command}` timed out after {secs}s")]
    Timeout {
        command: String,
        secs: u64,
    },
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Opens authenticated sessions to the nodes
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, address: &str, user: &str, private_key: &Path) -> Result<Box<dyn RemoteSession>, ExecutionError>;
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Run one command, `argv` is passed to the remote shell as is
    async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput, ExecutionError>;
    async fn close(self: Box<Self>) -> Result<(), ExecutionError>;
}

/// An operation that completed with a non zero exit status
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailedOperation {
    pub operation: String,
    pub command: String,
    pub exit_status: Option<i32>,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExecutionOutcome {
    /// every operation was attempted, `failed` lists the ones that did not succeed
    Applied {
        operations: usize,
        failed: Vec<FailedOperation>,
    },
    /// no session could be opened, nothing was run
    SessionFailed(String),
    /// the run was stopped part way through the plan
    Interrupted {
        completed: usize,
        reason: String,
    },
    /// the node was not configured at all
    Skipped(String),
}

impl ExecutionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExecutionOutcome::Applied { failed, .. } if failed.is_empty())
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Applied { operations, failed } if failed.is_empty() => {
                write!(f, "configured ({operations} operations)")
            }
            ExecutionOutcome::Applied { operations, failed } => {
                write!(f, "configured with {} of {operations} operations failing", failed.len())
            }
            ExecutionOutcome::SessionFailed(reason) => write!(f, "not configured, no session: {reason}"),
            ExecutionOutcome::Interrupted { completed, reason } => {
                write!(f, "interrupted after {completed} operations: {reason}")
            }
            ExecutionOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

/// How a node's plan is applied
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub private_key: std::path::PathBuf,
    pub connect: RetryPolicy,
    pub command: RetryPolicy,
    /// wait on a fresh session before the first command
    pub settle: Duration,
    pub after_bridge: Duration,
    pub after_operation: Duration,
}

impl ExecutionSettings {
    pub fn from_defaults(defaults: &LaunchDefaults) -> Self {
        Self {
            private_key: defaults.private_key_file.clone().into(),
            connect: RetryPolicy::from(&defaults.connect_retry),
            command: RetryPolicy::from(&defaults.command_retry),
            settle: Duration::from_secs(defaults.wait_before_ssh),
            after_bridge: Duration::from_millis(defaults.pacing.after_bridge_ms),
            after_operation: Duration::from_millis(defaults.pacing.after_operation_ms),
        }
    }
}

/// Every command is run as root on the node
pub fn privileged(command: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(command.len() + 1);
    argv.push("sudo".to_string());
    argv.extend(command.iter().cloned());
    argv
}

/// A failure worth trying again: the transport dropped, the command hung, or ovsdb was not up
fn is_transient(result: &Result<CommandOutput, ExecutionError>) -> bool {
    match result {
        Ok(output) => !output.success() && output.stderr.contains(OVSDB_NOT_READY),
        Err(ExecutionError::Transport(_)) | Err(ExecutionError::Timeout { .. }) => true,
        Err(_) => false,
    }
}

/// Applies node plans over a `RemoteExecutor`
pub struct ExecutionDriver<'a> {
    executor: &'a dyn RemoteExecutor,
    settings: ExecutionSettings,
}

impl<'a> ExecutionDriver<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, settings: ExecutionSettings) -> Self {
        Self {
            executor,
            settings,
        }
    }

    /// Open a session with bounded retries, each attempt bounded by the connect timeout
    pub async fn open_session(&self, address: &str, user: &str, ctx: &RunContext) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        let policy = &self.settings.connect;
        let mut last_error = String::new();
        for attempt in 1..=policy.max_attempts {
            tracing::debug!("connecting to {user}@{address}, attempt {attempt}/{}", policy.max_attempts);
            let connect = self.executor.connect(address, user, &self.settings.private_key);
            match ctx.run_bounded(policy.timeout, connect).await? {
                Some(Ok(session)) => return Ok(session),
                Some(Err(ExecutionError::Interrupted(i))) => return Err(i.into()),
                Some(Err(err)) => last_error = err.to_string(),
                None => last_error = format!("timed out after {}s", policy.timeout.as_secs()),
            }
            tracing::warn!("could not connect to {address} ({last_error}), attempt {attempt}/{}", policy.max_attempts);
            if attempt < policy.max_attempts {
                ctx.sleep(policy.backoff(attempt)).await?;
            }
        }
        Err(ExecutionError::Connect {
            address: address.to_string(),
            reason: last_error,
        })
    }

    /// Run one command, retrying transient failures with backoff
    async fn run_command(&self, session: &mut Box<dyn RemoteSession>, argv: &[String], ctx: &RunContext) -> Result<CommandOutput, ExecutionError> {
        let policy = &self.settings.command;
        let command = argv.join(" ");
        let mut attempt = 1;
        loop {
            tracing::debug!("running `{command}`");
            let result = match ctx.run_bounded(policy.timeout, session.exec(argv)).await? {
                Some(result) => result,
                None => Err(ExecutionError::Timeout {
                    command: command.clone(),
                    secs: policy.timeout.as_secs(),
                }),
            };
            if !is_transient(&result) || attempt >= policy.max_attempts {
                return result;
            }
            tracing::warn!("`{command}` failed, retrying, attempt {attempt}/{}", policy.max_attempts);
            ctx.sleep(policy.backoff(attempt)).await?;
            attempt += 1;
        }
    }

    /// Apply a plan on `address`. Failing operations are recorded and the rest of the plan still
    /// runs, the session is always closed.
    pub async fn apply(&self, plan: &NodePlan, address: &str, user: &str, ctx: &RunContext) -> ExecutionOutcome {
        tracing::info!("configuring {} at {address} ({} operations)", plan.node, plan.operations.len());
        let mut session = match self.open_session(address, user, ctx).await {
            Ok(session) => session,
            Err(ExecutionError::Interrupted(i)) => {
                return ExecutionOutcome::Interrupted { completed: 0, reason: i.to_string() };
            }
            Err(err) => {
                tracing::error!("{}: {err}", plan.node);
                return ExecutionOutcome::SessionFailed(err.to_string());
            }
        };

        let outcome = self.run_plan(&mut session, plan, ctx).await;
        if let Err(err) = session.close().await {
            tracing::warn!("closing the session to {} failed: {err}", plan.node);
        }
        outcome
    }

    async fn run_plan(&self, session: &mut Box<dyn RemoteSession>, plan: &NodePlan, ctx: &RunContext) -> ExecutionOutcome {
        if let Err(i) = ctx.sleep(self.settings.settle).await {
            return ExecutionOutcome::Interrupted { completed: 0, reason: i.to_string() };
        }
        let mut failed = Vec::new();
        for (completed, operation) in plan.operations.iter().enumerate() {
            if let Err(err) = self.run_operation(session, operation, &mut failed, ctx).await {
                return ExecutionOutcome::Interrupted { completed, reason: err.to_string() };
            }
            let pause = if operation.is_bridge_creation() {
                self.settings.after_bridge
            } else {
                self.settings.after_operation
            };
            if let Err(i) = ctx.sleep(pause).await {
                return ExecutionOutcome::Interrupted { completed: completed + 1, reason: i.to_string() };
            }
        }
        for failure in &failed {
            tracing::warn!("{}: {} failed: {}", plan.node, failure.operation, failure.stderr.trim());
        }
        ExecutionOutcome::Applied {
            operations: plan.operations.len(),
            failed,
        }
    }

    /// Runs the commands of an operation in order, stopping at the first one that fails. Only
    /// an interruption is returned as an error.
    async fn run_operation(
        &self,
        session: &mut Box<dyn RemoteSession>,
        operation: &ConfigOperation,
        failed: &mut Vec<FailedOperation>,
        ctx: &RunContext,
    ) -> Result<(), Interrupted> {
        tracing::info!("{operation}");
        for command in operation.commands() {
            let argv = privileged(&command);
            let result = match self.run_command(session, &argv, ctx).await {
                Err(ExecutionError::Interrupted(i)) => return Err(i),
                other => other,
            };
            let failure = match result {
                Ok(output) if output.success() => continue,
                Ok(output) => FailedOperation {
                    operation: operation.to_string(),
                    command: argv.join(" "),
                    exit_status: Some(output.exit_status),
                    stderr: output.stderr,
                },
                Err(err) => FailedOperation {
                    operation: operation.to_string(),
                    command: argv.join(" "),
                    exit_status: None,
                    stderr: err.to_string(),
                },
            };
            tracing::error!("`{}` failed: {}", failure.command, failure.stderr.trim());
            failed.push(failure);
            break;
        }
        Ok(())
    }

    /// Run `uptime` on the node, used by the status checks
    pub async fn probe(&self, address: &str, user: &str, ctx: &RunContext) -> Result<String, ExecutionError> {
        let mut session = self.open_session(address, user, ctx).await?;
        let result = self.run_command(&mut session, &["uptime".to_string()], ctx).await;
        if let Err(err) = session.close().await {
            tracing::debug!("closing the probe session to {address} failed: {err}");
        }
        let output = result?;
        if !output.success() {
            return Err(ExecutionError::Transport(output.stderr));
        }
        Ok(output.stdout.trim().to_string())
    }
}


#[cfg(test)]
mod tests {
    use crate::plan::{AddressTable, Planner};
    use crate::topology::tests::example_topology;
    use crate::tunnel::TunnelAllocation;
    use super::fake::FakeExecutor;
    use super::*;

    fn settings() -> ExecutionSettings {
        ExecutionSettings {
            private_key: "/tmp/key".into(),
            connect: RetryPolicy::immediate(3, Duration::from_secs(5)),
            command: RetryPolicy::immediate(3, Duration::from_secs(5)),
            settle: Duration::ZERO,
            after_bridge: Duration::ZERO,
            after_operation: Duration::ZERO,
        }
    }

    fn sw1_plan() -> NodePlan {
        let topology = example_topology();
        let allocation = TunnelAllocation::allocate(&topology).unwrap();
        Planner::new(&topology, &allocation)
            .plan_for("sw1", &AddressTable::symbolic(&topology))
            .unwrap()
    }

    fn failing(stderr: &str) -> Result<CommandOutput, ExecutionError> {
        Ok(CommandOutput { stdout: "".into(), stderr: stderr.into(), exit_status: 1 })
    }

    #[tokio::test]
    async fn test_apply_runs_plan_in_order() {
        let executor = FakeExecutor::default();
        let driver = ExecutionDriver::new(&executor, settings());
        let plan = sw1_plan();
        let outcome = driver.apply(&plan, "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;

        assert!(outcome.is_clean());
        assert_eq!(executor.commands_for("10.0.0.1"), plan.rendered_commands());
        assert_eq!(*executor.closed.lock().unwrap(), vec!["10.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn test_applying_twice_gives_the_same_result() {
        let executor = FakeExecutor::default();
        let driver = ExecutionDriver::new(&executor, settings());
        let plan = sw1_plan();

        let first = driver.apply(&plan, "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;
        let first_commands = executor.commands_for("10.0.0.1");
        executor.log.lock().unwrap().clear();
        let second = driver.apply(&plan, "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;

        let expected = ExecutionOutcome::Applied { operations: plan.operations.len(), failed: vec![] };
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(executor.commands_for("10.0.0.1"), first_commands);
        assert_eq!(executor.closed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_operation_is_recorded_and_plan_continues() {
        let executor = FakeExecutor::default();
        executor.respond("set-fail-mode", failing("ovs-vsctl: no bridge named br1"));
        let driver = ExecutionDriver::new(&executor, settings());
        let plan = sw1_plan();
        let outcome = driver.apply(&plan, "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;

        match outcome {
            ExecutionOutcome::Applied { operations, failed } => {
                assert_eq!(operations, plan.operations.len());
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].exit_status, Some(1));
                assert!(failed[0].command.starts_with("sudo ovs-vsctl set-fail-mode"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // the tunnel ports after the failure were still added
        assert_eq!(executor.commands_for("10.0.0.1").len(), plan.rendered_commands().len());
        assert_eq!(executor.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ovsdb_not_ready_is_retried() {
        let executor = FakeExecutor::default();
        executor.respond("add-br", failing("ovs-vsctl: unix:/var/run/openvswitch/db.sock: database connection failed"));
        executor.respond("add-br", Err(ExecutionError::Transport("broken pipe".into())));
        let driver = ExecutionDriver::new(&executor, settings());
        let outcome = driver.apply(&sw1_plan(), "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;

        assert!(outcome.is_clean());
        let add_br = executor.commands_for("10.0.0.1").iter().filter(|c| c.contains("add-br")).count();
        assert_eq!(add_br, 3);
    }

    #[tokio::test]
    async fn test_plain_failure_is_not_retried() {
        let executor = FakeExecutor::default();
        executor.respond("add-br", failing("permission denied"));
        let driver = ExecutionDriver::new(&executor, settings());
        driver.apply(&sw1_plan(), "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;
        let add_br = executor.commands_for("10.0.0.1").iter().filter(|c| c.contains("add-br")).count();
        assert_eq!(add_br, 1);
    }

    #[tokio::test]
    async fn test_connect_retries_then_gives_up() {
        let executor = FakeExecutor::default();
        executor.refuse.lock().unwrap().insert("10.0.0.1".into(), 2);
        executor.refuse.lock().unwrap().insert("10.0.0.2".into(), 10);
        let driver = ExecutionDriver::new(&executor, settings());

        let outcome = driver.apply(&sw1_plan(), "10.0.0.1", "ubuntu", &RunContext::unbounded()).await;
        assert!(outcome.is_clean());
        assert_eq!(*executor.connects.lock().unwrap(), 3);

        let outcome = driver.apply(&sw1_plan(), "10.0.0.2", "ubuntu", &RunContext::unbounded()).await;
        assert!(matches!(outcome, ExecutionOutcome::SessionFailed(_)));
        assert_eq!(*executor.connects.lock().unwrap(), 6);
        assert!(executor.commands_for("10.0.0.2").is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_and_closes() {
        let executor = FakeExecutor::default();
        let mut slow = settings();
        slow.after_bridge = Duration::from_secs(3600);
        let driver = ExecutionDriver::new(&executor, slow);
        let ctx = RunContext::unbounded();
        let token = ctx.token().clone();
        let plan = sw1_plan();

        let apply = driver.apply(&plan, "10.0.0.1", "ubuntu", &ctx);
        let cancel = async {
            tokio::task::yield_now().await;
            token.cancel();
        };
        let (outcome, _) = tokio::join!(apply, cancel);
        assert_eq!(outcome, ExecutionOutcome::Interrupted { completed: 1, reason: Interrupted::Cancelled.to_string() });
        assert_eq!(executor.commands_for("10.0.0.1").len(), 1);
        assert_eq!(executor.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_probe() {
        let executor = FakeExecutor::default();
        let driver = ExecutionDriver::new(&executor, settings());
        let uptime = driver.probe("10.0.0.3", "ubuntu", &RunContext::unbounded()).await.unwrap();
        assert_eq!(uptime, "10:00:00 up 1 min");
        assert_eq!(executor.commands_for("10.0.0.3"), vec!["uptime".to_string()]);
    }
}
