use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use crate::execution::ExecutionOutcome;
use crate::provisioning::{ConsoleCheck, ProvisioningRecord, Readiness};

#[derive(Tabled)]
struct PropertyRow {
    #[tabled(rename = "Property")]
    property: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Everything learnt about one node during a run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeReport {
    pub record: ProvisioningRecord,
    pub configuration: Option<ExecutionOutcome>,
    pub console: Option<ConsoleCheck>,
    pub probe: Option<Result<String, String>>,
}

impl NodeReport {
    pub fn new(record: ProvisioningRecord) -> Self {
        Self {
            record,
            configuration: None,
            console: None,
            probe: None,
        }
    }

    /// The node ended up unusable, either its VM or its configuration failed
    pub fn is_failed(&self) -> bool {
        let vm_failed = matches!(
            self.record.readiness,
            Readiness::Error(_) | Readiness::Failed(_) | Readiness::Unresolved
        );
        let config_failed = matches!(
            self.configuration,
            Some(ExecutionOutcome::SessionFailed(_)) | Some(ExecutionOutcome::Interrupted { .. })
        );
        vm_failed || config_failed
    }

    fn rows(&self) -> Vec<PropertyRow> {
        let record = &self.record;
        let mut rows = vec![
            row("VM name", &record.spec.instance_name),
            row("VM number", &record.number.to_string()),
            row("Network ID", record.network_id.as_deref().unwrap_or("-")),
            row("VM ID", record.server_id.as_deref().unwrap_or("-")),
        ];
        if record.readiness == Readiness::Active {
            rows.push(row("Host", record.host.as_deref().unwrap_or("-")));
            rows.push(row("Instance Name", record.hypervisor_instance.as_deref().unwrap_or("-")));
            rows.push(row("Internal IP addr", record.address.as_deref().unwrap_or("-")));
        }
        rows.push(row("State", &record.readiness.to_string()));
        if let Some(configuration) = &self.configuration {
            rows.push(row("Overlay", &configuration.to_string()));
        }
        if let Some(console) = &self.console {
            rows.push(row("Boot finished", yes_no(console.boot_finished)));
            rows.push(row("Address in console", yes_no(console.address_configured)));
            if console.network_wait {
                rows.push(row("Warning", "VM waited for a network device during boot"));
            }
        }
        match &self.probe {
            Some(Ok(uptime)) => rows.push(row("SSH", uptime)),
            Some(Err(err)) => rows.push(row("SSH", &format!("failed: {err}"))),
            None => {}
        }
        rows
    }

    /// Property and value table for the node
    pub fn table(&self) -> String {
        tabled::Table::new(self.rows())
            .with(tabled::settings::Style::modern())
            .to_string()
    }
}

fn row(property: &str, value: &str) -> PropertyRow {
    PropertyRow {
        property: property.to_string(),
        value: value.to_string(),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// The outcome of one CLI action
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunReport {
    pub action: String,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeReport>,
    pub notes: Vec<String>,
    pub next_steps: Vec<String>,
}

impl RunReport {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            started: Utc::now(),
            finished: None,
            nodes: Vec::new(),
            notes: Vec::new(),
            next_steps: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished = Some(Utc::now());
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.record.node == name)
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes.iter()
            .filter(|n| n.is_failed())
            .map(|n| n.record.node.as_str())
            .collect()
    }

    /// Nodes with a configuration that had failing operations, they are usable but incomplete
    pub fn degraded_nodes(&self) -> Vec<&str> {
        self.nodes.iter()
            .filter(|n| matches!(&n.configuration, Some(ExecutionOutcome::Applied { failed, .. }) if !failed.is_empty()))
            .map(|n| n.record.node.as_str())
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{}", node.record.node)?;
            writeln!(f, "{}", node.table())?;
        }
        for note in &self.notes {
            writeln!(f, "{note}")?;
        }
        let failed = self.failed_nodes();
        if !failed.is_empty() {
            writeln!(f, "failed nodes: {}", failed.join(", "))?;
        }
        let degraded = self.degraded_nodes();
        if !degraded.is_empty() {
            writeln!(f, "nodes with failed operations: {}", degraded.join(", "))?;
        }
        if let Some(finished) = self.finished {
            let secs = (finished - self.started).num_seconds();
            writeln!(f, "{} finished in {secs}s", self.action)?;
        }
        for step in &self.next_steps {
            writeln!(f, "{step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::provisioning::vm_spec::VmSpec;
    use super::*;

    fn record(node: &str, readiness: Readiness) -> ProvisioningRecord {
        ProvisioningRecord {
            node: node.into(),
            number: 1,
            spec: VmSpec {
                node: node.into(),
                instance_name: format!("overlay-{node}"),
                image: "ubuntu".into(),
                flavor: "m1.small".into(),
                region: "RegionOne".into(),
                security_group: "default".into(),
                rule_cidr: "10.0.0.0/8".into(),
                network_name: "demo-net".into(),
                key_name: "lab".into(),
                user: "ubuntu".into(),
                server: None,
            },
            network_id: Some("net-1".into()),
            server_id: Some("srv-1".into()),
            address: Some("10.0.0.5".into()),
            host: Some("compute-1".into()),
            hypervisor_instance: Some("instance-0000001".into()),
            reused: false,
            readiness,
        }
    }

    #[test]
    fn test_table_rows_depend_on_readiness() {
        let active = NodeReport::new(record("sw1", Readiness::Active));
        let table = active.table();
        assert!(table.contains("Internal IP addr"));
        assert!(table.contains("10.0.0.5"));
        assert!(table.contains("overlay-sw1"));

        let pending = NodeReport::new(record("sw2", Readiness::Pending));
        let table = pending.table();
        assert!(table.contains("VM ID"));
        assert!(!table.contains("Internal IP addr"));
    }

    #[test]
    fn test_failed_nodes() {
        let mut report = RunReport::new("setup");
        report.nodes.push(NodeReport::new(record("sw1", Readiness::Active)));
        report.nodes.push(NodeReport::new(record("sw2", Readiness::Error("No valid host".into()))));
        let mut h1 = NodeReport::new(record("h1", Readiness::Active));
        h1.configuration = Some(ExecutionOutcome::SessionFailed("connection refused".into()));
        report.nodes.push(h1);
        let mut h2 = NodeReport::new(record("h2", Readiness::Active));
        h2.configuration = Some(ExecutionOutcome::Applied { operations: 4, failed: vec![] });
        report.nodes.push(h2);

        assert_eq!(report.failed_nodes(), vec!["sw2", "h1"]);
        assert!(report.degraded_nodes().is_empty());
        report.finish();
        let printed = report.to_string();
        assert!(printed.contains("failed nodes: sw2, h1"));
        assert!(printed.contains("setup finished in"));
    }
}
