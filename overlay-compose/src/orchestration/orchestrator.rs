use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use overlay_compose_schemas::cli_models::SubCommand;
use crate::execution::{ExecutionDriver, ExecutionOutcome, ExecutionSettings, RemoteExecutor};
use crate::orchestration::{check_private_key, Project};
use crate::provisioning::compute::ComputeApi;
use crate::provisioning::vm_spec::CloudScope;
use crate::provisioning::{address_table, ProvisioningCoordinator, ProvisioningRecord, Readiness};
use crate::report::{NodeReport, RunReport};
use crate::run_context::RunContext;

/// The actions that need the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Launch,
    Status { check: bool },
    Setup,
    Up,
}

impl Action {
    pub fn from_sub_command(sub_command: &SubCommand) -> Option<Self> {
        match sub_command {
            SubCommand::Topology => None,
            SubCommand::Launch => Some(Action::Launch),
            SubCommand::Status(cmd) => Some(Action::Status { check: cmd.check }),
            SubCommand::Setup => Some(Action::Setup),
            SubCommand::Up => Some(Action::Up),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Launch => "launch",
            Action::Status { .. } => "status",
            Action::Setup => "setup",
            Action::Up => "up",
        }
    }
}

/// Runs one action over a project: provisioning, readiness and overlay configuration, in that
/// order and one node at a time
pub struct Orchestrator {
    project: Project,
    compute: Arc<dyn ComputeApi>,
    executor: Arc<dyn RemoteExecutor>,
    scope: CloudScope,
}

impl Orchestrator {
    pub fn new(
        project: Project,
        compute: Arc<dyn ComputeApi>,
        executor: Arc<dyn RemoteExecutor>,
        scope: CloudScope,
    ) -> Self {
        Self {
            project,
            compute,
            executor,
            scope,
        }
    }

    /// Cancellation from the caller combined with the deadline of the launch defaults
    pub fn run_context(&self, cancel: CancellationToken) -> RunContext {
        let deadline = self.project.config.defaults.deadline.map(Duration::from_secs);
        RunContext::new(cancel, deadline)
    }

    pub async fn run(&self, action: Action, ctx: &RunContext) -> anyhow::Result<RunReport> {
        tracing::info!("running {}", action.name());
        let defaults = &self.project.config.defaults;
        defaults.validate().context("checking launch defaults")?;
        let private_key = check_private_key(&defaults.private_key_file).await?;

        let mut report = RunReport::new(action.name());
        let mut coordinator = ProvisioningCoordinator::new(
            self.compute.clone(),
            defaults.clone(),
            self.scope.clone(),
        );
        match action {
            Action::Launch => {
                let records = coordinator.launch(&self.project.topology, ctx).await;
                report.nodes = records.into_iter().map(NodeReport::new).collect();
                report.next_steps.push("run `overlay-compose status` to check the VMs are active".into());
                report.next_steps.push("then run `overlay-compose setup` to configure the overlay".into());
            }
            Action::Status { check } => {
                let records = coordinator.lookup(&self.project.topology, ctx).await;
                let records = self.wait(&coordinator, records, &mut report, ctx).await;
                report.nodes = records.into_iter().map(NodeReport::new).collect();
                if check {
                    self.sanity_checks(&coordinator, &mut report, private_key, ctx).await;
                }
                if report.failed_nodes().is_empty() {
                    report.next_steps.push("all VMs are active, run `overlay-compose setup` to configure the overlay".into());
                }
            }
            Action::Setup => {
                let records = coordinator.lookup(&self.project.topology, ctx).await;
                self.setup(&coordinator, records, &mut report, private_key, ctx).await?;
            }
            Action::Up => {
                let records = coordinator.launch(&self.project.topology, ctx).await;
                self.setup(&coordinator, records, &mut report, private_key, ctx).await?;
            }
        }
        report.finish();
        Ok(report)
    }

    async fn wait(
        &self,
        coordinator: &ProvisioningCoordinator,
        mut records: Vec<ProvisioningRecord>,
        report: &mut RunReport,
        ctx: &RunContext,
    ) -> Vec<ProvisioningRecord> {
        if let Err(interrupted) = coordinator.wait_until_ready(&mut records, ctx).await {
            tracing::warn!("stopped waiting for the VMs: {interrupted}");
            report.notes.push(format!("stopped waiting for the VMs: {interrupted}"));
        }
        records
    }

    async fn setup(
        &self,
        coordinator: &ProvisioningCoordinator,
        records: Vec<ProvisioningRecord>,
        report: &mut RunReport,
        private_key: PathBuf,
        ctx: &RunContext,
    ) -> anyhow::Result<()> {
        let records = self.wait(coordinator, records, report, ctx).await;
        // every address is known before the first plan is built
        let addresses = address_table(&records);
        report.nodes = records.into_iter().map(NodeReport::new).collect();

        let mut settings = ExecutionSettings::from_defaults(&self.project.config.defaults);
        settings.private_key = private_key;
        let driver = ExecutionDriver::new(self.executor.as_ref(), settings);
        let planner = self.project.planner();
        let mut interrupted: Option<String> = None;

        for node in report.nodes.iter_mut() {
            let record = &node.record;
            if let Some(reason) = &interrupted {
                node.configuration = Some(ExecutionOutcome::Skipped(reason.clone()));
                continue;
            }
            let address = match (&record.readiness, &record.address) {
                (Readiness::Active, Some(address)) => address.clone(),
                (readiness, _) => {
                    tracing::warn!("{} is {readiness}, not configuring it", record.node);
                    node.configuration = Some(ExecutionOutcome::Skipped(format!("VM is {readiness}")));
                    continue;
                }
            };
            let plan = planner.plan_for(&record.node, &addresses)
                .with_context(|| format!("planning {}", record.node))?;
            let outcome = driver.apply(&plan, &address, &record.spec.user, ctx).await;
            if let ExecutionOutcome::Interrupted { reason, .. } = &outcome {
                interrupted = Some(format!("run interrupted: {reason}"));
            }
            node.configuration = Some(outcome);
        }

        if let Some(reason) = interrupted {
            report.notes.push(reason);
        }
        if report.failed_nodes().is_empty() && report.degraded_nodes().is_empty() {
            report.next_steps.push("the overlay is configured".into());
        } else {
            report.next_steps.push("fix the failed nodes and run `overlay-compose setup` again, every operation can be repeated".into());
        }
        Ok(())
    }

    /// Console log checks and an ssh probe of every active VM
    async fn sanity_checks(
        &self,
        coordinator: &ProvisioningCoordinator,
        report: &mut RunReport,
        private_key: PathBuf,
        ctx: &RunContext,
    ) {
        let mut settings = ExecutionSettings::from_defaults(&self.project.config.defaults);
        settings.private_key = private_key;
        let driver = ExecutionDriver::new(self.executor.as_ref(), settings);
        for node in report.nodes.iter_mut().filter(|n| n.record.is_ready()) {
            match coordinator.console_check(&node.record).await {
                Ok(check) => {
                    if check.network_wait {
                        tracing::warn!("{} waited for a network device during boot", node.record.node);
                    }
                    node.console = Some(check);
                }
                Err(err) => tracing::warn!("could not read the console of {}: {err}", node.record.node),
            }
            let Some(address) = node.record.address.clone() else { continue };
            node.probe = Some(
                driver.probe(&address, &node.record.spec.user, ctx).await
                    .map_err(|e| e.to_string())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use overlay_compose_schemas::overlay_compose_yaml::Config;
    use crate::execution::fake::FakeExecutor;
    use crate::provisioning::compute::fake::FakeCompute;
    use crate::provisioning::compute::ServerStatus;
    use super::*;

    fn project(key: &std::path::Path) -> Project {
        let yaml = format!(r#"
topology:
  sw1:
    - [h1, 192.168.200.10]
    - sw3
  sw2:
    - sw1
  sw3:
    - [h2, 192.168.200.11]
defaults:
  image: ubuntu-ovs
  flavor: m1.small
  key_name: overlay
  private_key_file: {}
  wait_before_ssh: 0
  readiness:
    attempts: 2
    interval_secs: 0
  connect_retry:
    max_attempts: 1
    initial_backoff_ms: 0
    max_backoff_ms: 0
    timeout_secs: 5
  command_retry:
    max_attempts: 1
    initial_backoff_ms: 0
    max_backoff_ms: 0
    timeout_secs: 5
  pacing:
    after_bridge_ms: 0
    after_operation_ms: 0
"#, key.display());
        Project::from_config(Config::from_yaml(&yaml).unwrap()).unwrap()
    }

    fn scope() -> CloudScope {
        CloudScope { project_name: "demo".into(), region: "RegionOne".into() }
    }

    fn script_example(fake: &FakeCompute) {
        fake.script("overlay-sw1", vec![(ServerStatus::Active, Some("10.0.0.1"))]);
        fake.script("overlay-sw2", vec![(ServerStatus::Error, None)]);
        fake.script("overlay-sw3", vec![(ServerStatus::Active, Some("10.0.0.3"))]);
        fake.script("overlay-h1", vec![(ServerStatus::Active, Some("10.0.0.11"))]);
        fake.script("overlay-h2", vec![(ServerStatus::Active, Some("10.0.0.12"))]);
    }

    #[tokio::test]
    async fn test_up_skips_error_vms() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_overlay");
        tokio::fs::write(&key, "key").await.unwrap();
        let compute = Arc::new(FakeCompute::default());
        script_example(&compute);
        let executor = FakeExecutor::default();
        let orchestrator = Orchestrator::new(project(&key), compute.clone(), Arc::new(executor.clone()), scope());

        let report = orchestrator.run(Action::Up, &RunContext::unbounded()).await.unwrap();

        assert_eq!(compute.created.lock().unwrap().len(), 5);
        assert_eq!(report.failed_nodes(), vec!["sw2"]);
        assert!(matches!(report.node("sw2").unwrap().configuration, Some(ExecutionOutcome::Skipped(_))));
        assert!(report.node("sw1").unwrap().configuration.as_ref().unwrap().is_clean());

        // sw1 still tunnels to h1 and sw3, the tunnel to sw2 is left out
        let sw1 = executor.commands_for("10.0.0.1");
        assert!(sw1.iter().any(|c| c.contains("vxlan18") && c.contains("options:remote_ip=10.0.0.11")));
        assert!(sw1.iter().any(|c| c.contains("vxlan14") && c.contains("options:remote_ip=10.0.0.3")));
        assert!(!sw1.iter().any(|c| c.contains("vxlan13")));
        let h2 = executor.commands_for("10.0.0.12");
        assert!(h2.iter().any(|c| c == "sudo ip addr replace 192.168.200.11/24 dev p0"));
        assert_eq!(executor.closed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_launch_then_setup() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_overlay");
        tokio::fs::write(&key, "key").await.unwrap();
        let compute = Arc::new(FakeCompute::default());
        script_example(&compute);
        let executor = FakeExecutor::default();
        let orchestrator = Orchestrator::new(project(&key), compute.clone(), Arc::new(executor.clone()), scope());

        let report = orchestrator.run(Action::Launch, &RunContext::unbounded()).await.unwrap();
        assert_eq!(report.nodes.len(), 5);
        assert!(report.nodes.iter().all(|n| n.record.readiness == Readiness::Pending));
        assert!(report.to_string().contains("overlay-compose status"));
        assert!(executor.log.lock().unwrap().is_empty());

        let report = orchestrator.run(Action::Setup, &RunContext::unbounded()).await.unwrap();
        assert_eq!(compute.created.lock().unwrap().len(), 5);
        assert_eq!(report.failed_nodes(), vec!["sw2"]);
        assert!(!executor.commands_for("10.0.0.11").is_empty());
    }

    #[tokio::test]
    async fn test_status_check() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_overlay");
        tokio::fs::write(&key, "key").await.unwrap();
        let compute = Arc::new(FakeCompute::default());
        script_example(&compute);
        compute.consoles.lock().unwrap().insert("id-overlay-sw1".into(), "10.0.0.1\nGeneration complete.".into());
        let executor = FakeExecutor::default();
        let orchestrator = Orchestrator::new(project(&key), compute.clone(), Arc::new(executor.clone()), scope());
        orchestrator.run(Action::Launch, &RunContext::unbounded()).await.unwrap();

        let report = orchestrator.run(Action::Status { check: true }, &RunContext::unbounded()).await.unwrap();
        let sw1 = report.node("sw1").unwrap();
        assert!(sw1.console.as_ref().unwrap().is_healthy());
        assert!(matches!(sw1.probe, Some(Ok(_))));
        assert!(report.node("sw2").unwrap().probe.is_none());
        assert_eq!(executor.commands_for("10.0.0.1"), vec!["uptime".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_private_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let compute = Arc::new(FakeCompute::default());
        let orchestrator = Orchestrator::new(
            project(&dir.path().join("missing")),
            compute.clone(),
            Arc::new(FakeExecutor::default()),
            scope(),
        );
        assert!(orchestrator.run(Action::Up, &RunContext::unbounded()).await.is_err());
        assert!(compute.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_configures_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_overlay");
        tokio::fs::write(&key, "key").await.unwrap();
        let compute = Arc::new(FakeCompute::default());
        script_example(&compute);
        let executor = FakeExecutor::default();
        let orchestrator = Orchestrator::new(project(&key), compute.clone(), Arc::new(executor.clone()), scope());
        orchestrator.run(Action::Launch, &RunContext::unbounded()).await.unwrap();

        let ctx = orchestrator.run_context(CancellationToken::new());
        ctx.token().cancel();
        let report = orchestrator.run(Action::Setup, &ctx).await.unwrap();
        assert!(executor.log.lock().unwrap().is_empty());
        assert_eq!(report.failed_nodes().len(), 5);
    }
}
