pub mod compute;
pub mod openstack;
pub mod vm_spec;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Formatter;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use overlay_compose_schemas::overlay_compose_yaml::launch_options::LaunchDefaults;
use crate::plan::AddressTable;
use crate::provisioning::compute::{overlay_rules, ComputeApi, ComputeError, ServerCreate, ServerDetails, ServerStatus};
use crate::provisioning::vm_spec::{CloudScope, VmSpec};
use crate::run_context::{Interrupted, RunContext};
use crate::topology::Topology;

/// Marker cloud-init prints once the VM has finished booting
pub const CLOUD_INIT_DONE: &str = "Generation complete.";
/// Printed when the VM boots without a usable network device
pub const NETWORK_WAIT_WARNING: &str = "waiting 120 seconds for a network device";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("{node}: {source}")]
    Compute {
        node: String,
        source: ComputeError,
    },
    #[error("{node}: no server named {instance_name}, run launch first")]
    NotLaunched {
        node: String,
        instance_name: String,
    },
}

/// Readiness of a node's VM
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Readiness {
    /// created or found, not known to be active yet
    Pending,
    Active,
    /// the VM went into the ERROR state
    Error(String),
    /// still not active when polling gave up
    Unresolved,
    /// launching or finding the VM failed
    Failed(String),
}

impl Readiness {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Readiness::Pending)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Pending => f.write_str("pending"),
            Readiness::Active => f.write_str("active"),
            Readiness::Error(fault) => write!(f, "ERROR: {fault}"),
            Readiness::Unresolved => f.write_str("not ready in time"),
            Readiness::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What is known about a node's VM during one run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProvisioningRecord {
    pub node: String,
    /// position in the node list, counting from 1
    pub number: usize,
    pub spec: VmSpec,
    pub network_id: Option<String>,
    pub server_id: Option<String>,
    pub address: Option<String>,
    pub host: Option<String>,
    pub hypervisor_instance: Option<String>,
    pub reused: bool,
    pub readiness: Readiness,
}

impl ProvisioningRecord {
    fn new(number: usize, spec: VmSpec) -> Self {
        Self {
            node: spec.node.clone(),
            number,
            spec,
            network_id: None,
            server_id: None,
            address: None,
            host: None,
            hypervisor_instance: None,
            reused: false,
            readiness: Readiness::Pending,
        }
    }

    fn fail(&mut self, reason: impl ToString) {
        self.readiness = Readiness::Failed(reason.to_string());
    }

    fn update(&mut self, details: &ServerDetails) {
        self.host = details.host.clone().or(self.host.take());
        self.hypervisor_instance = details.instance_name.clone().or(self.hypervisor_instance.take());
        if details.address.is_some() {
            self.address = details.address.clone();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Active && self.address.is_some()
    }
}

/// Result of reading a VM console log after boot
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConsoleCheck {
    pub boot_finished: bool,
    pub address_configured: bool,
    pub network_wait: bool,
}

impl ConsoleCheck {
    pub fn from_console(console: &str, address: Option<&str>) -> Self {
        Self {
            boot_finished: console.contains(CLOUD_INIT_DONE),
            address_configured: address.map(|a| console.contains(a)).unwrap_or(false),
            network_wait: console.contains(NETWORK_WAIT_WARNING),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.boot_finished && self.address_configured && !self.network_wait
    }
}

#[derive(Default)]
struct RegionCache {
    images: HashMap<String, String>,
    flavors: HashMap<String, String>,
    networks: HashMap<String, String>,
    secured_groups: HashSet<String>,
    servers: Option<Vec<ServerDetails>>,
}

/// Drives VM creation and readiness through a `ComputeApi`. Nodes are handled one at a time in
/// node list order, a failure on one node is recorded and the rest carry on.
pub struct ProvisioningCoordinator {
    compute: Arc<dyn ComputeApi>,
    defaults: LaunchDefaults,
    scope: CloudScope,
    regions: HashMap<String, RegionCache>,
}

impl ProvisioningCoordinator {
    pub fn new(compute: Arc<dyn ComputeApi>, defaults: LaunchDefaults, scope: CloudScope) -> Self {
        Self {
            compute,
            defaults,
            scope,
            regions: HashMap::new(),
        }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeApi> {
        &self.compute
    }

    /// Create the VM of every node, reusing servers that already have the instance name
    pub async fn launch(&mut self, topology: &Topology, ctx: &RunContext) -> Vec<ProvisioningRecord> {
        self.resolve_all(topology, ctx, true).await
    }

    /// Find the already launched VM of every node without creating anything
    pub async fn lookup(&mut self, topology: &Topology, ctx: &RunContext) -> Vec<ProvisioningRecord> {
        self.resolve_all(topology, ctx, false).await
    }

    async fn resolve_all(&mut self, topology: &Topology, ctx: &RunContext, create: bool) -> Vec<ProvisioningRecord> {
        let mut records = Vec::with_capacity(topology.nodes().len());
        for (i, node) in topology.nodes().iter().enumerate() {
            let spec = VmSpec::resolve(node, &self.defaults, &self.scope);
            let mut record = ProvisioningRecord::new(i + 1, spec);
            if let Err(interrupted) = ctx.check() {
                record.fail(interrupted);
                records.push(record);
                continue;
            }
            let result = if create {
                self.launch_node(&mut record).await
            } else {
                self.find_node(&mut record).await
            };
            if let Err(err) = result {
                tracing::error!("{err}");
                record.fail(&err);
            }
            records.push(record);
        }
        records
    }

    async fn launch_node(&mut self, record: &mut ProvisioningRecord) -> Result<(), ProvisioningError> {
        let spec = record.spec.clone();
        let node = spec.node.clone();
        let compute = self.compute.clone();
        let wrap = |source: ComputeError| ProvisioningError::Compute { node: node.clone(), source };
        tracing::info!("launching {} as {} in {}", spec.node, spec.instance_name, spec.region);

        let image_id = self.image(&spec).await.map_err(wrap)?;
        let flavor_id = self.flavor(&spec).await.map_err(wrap)?;
        self.ensure_security_group(&spec).await.map_err(wrap)?;
        let network_id = self.network(&spec).await.map_err(wrap)?;
        record.network_id = Some(network_id.clone());

        if let Some(existing) = self.existing_server(&spec).await.map_err(wrap)? {
            tracing::info!("{} already exists with id {}, reusing it", spec.instance_name, existing.id);
            record.server_id = Some(existing.id.clone());
            record.reused = true;
            record.update(&existing);
            return Ok(());
        }

        let request = ServerCreate {
            name: spec.instance_name.clone(),
            image_id,
            flavor_id,
            key_name: spec.key_name.clone(),
            security_groups: vec![spec.security_group.clone()],
            network_id: Some(network_id),
            force_host: spec.server.clone(),
        };
        let id = compute.create_server(&spec.region, &request).await.map_err(wrap)?;
        tracing::info!("created {} with id {id}", spec.instance_name);
        record.server_id = Some(id);
        Ok(())
    }

    async fn find_node(&mut self, record: &mut ProvisioningRecord) -> Result<(), ProvisioningError> {
        let spec = record.spec.clone();
        let existing = self.existing_server(&spec).await
            .map_err(|source| ProvisioningError::Compute { node: spec.node.clone(), source })?;
        match existing {
            Some(server) => {
                record.server_id = Some(server.id.clone());
                record.reused = true;
                record.update(&server);
                Ok(())
            }
            None => Err(ProvisioningError::NotLaunched {
                node: spec.node.clone(),
                instance_name: spec.instance_name.clone(),
            }),
        }
    }

    async fn image(&mut self, spec: &VmSpec) -> Result<String, ComputeError> {
        let cache = self.regions.entry(spec.region.clone()).or_default();
        if let Some(id) = cache.images.get(&spec.image) {
            return Ok(id.clone());
        }
        let id = self.compute.find_image(&spec.region, &spec.image).await?;
        cache.images.insert(spec.image.clone(), id.clone());
        Ok(id)
    }

    async fn flavor(&mut self, spec: &VmSpec) -> Result<String, ComputeError> {
        let cache = self.regions.entry(spec.region.clone()).or_default();
        if let Some(id) = cache.flavors.get(&spec.flavor) {
            return Ok(id.clone());
        }
        let id = self.compute.find_flavor(&spec.region, &spec.flavor).await?;
        cache.flavors.insert(spec.flavor.clone(), id.clone());
        Ok(id)
    }

    async fn network(&mut self, spec: &VmSpec) -> Result<String, ComputeError> {
        let cache = self.regions.entry(spec.region.clone()).or_default();
        if let Some(id) = cache.networks.get(&spec.network_name) {
            return Ok(id.clone());
        }
        let id = self.compute.find_network(&spec.region, &spec.network_name).await?;
        cache.networks.insert(spec.network_name.clone(), id.clone());
        Ok(id)
    }

    /// Security group and overlay rules, once per region. Rules that already exist are fine.
    async fn ensure_security_group(&mut self, spec: &VmSpec) -> Result<(), ComputeError> {
        let cache = self.regions.entry(spec.region.clone()).or_default();
        if cache.secured_groups.contains(&spec.security_group) {
            return Ok(());
        }
        let group_id = self.compute.get_or_create_security_group(&spec.region, &spec.security_group).await?;
        for rule in overlay_rules(&spec.rule_cidr) {
            match self.compute.create_security_group_rule(&spec.region, &group_id, &rule).await {
                Ok(_) => tracing::debug!("added {:?} to security group {}", rule.protocol, spec.security_group),
                Err(ComputeError::Conflict(_)) => {
                    tracing::debug!("{:?} already in security group {}", rule.protocol, spec.security_group)
                }
                Err(err) => return Err(err),
            }
        }
        cache.secured_groups.insert(spec.security_group.clone());
        Ok(())
    }

    async fn existing_server(&mut self, spec: &VmSpec) -> Result<Option<ServerDetails>, ComputeError> {
        let cache = self.regions.entry(spec.region.clone()).or_default();
        if cache.servers.is_none() {
            cache.servers = Some(self.compute.list_servers(&spec.region).await?);
        }
        Ok(cache.servers.as_ref()
            .and_then(|servers| servers.iter().find(|s| s.name == spec.instance_name))
            .cloned())
    }

    /// Poll the pending VMs until all of them are terminal or the attempts run out. A VM in
    /// ERROR is not polled again, pending VMs left at the end are marked unresolved.
    pub async fn wait_until_ready(&self, records: &mut [ProvisioningRecord], ctx: &RunContext) -> Result<(), Interrupted> {
        let attempt_limit = self.defaults.readiness.attempts.max(1);
        let interval = Duration::from_secs(self.defaults.readiness.interval_secs);
        let mut counter = 0;
        while counter < attempt_limit {
            counter += 1;
            let pending = records.iter().filter(|r| !r.readiness.is_terminal()).count();
            if pending == 0 {
                break;
            }
            tracing::info!("waiting for {pending} VMs to be active, attempt {counter}/{attempt_limit}");
            for record in records.iter_mut().filter(|r| !r.readiness.is_terminal()) {
                self.poll(record).await;
            }
            if records.iter().all(|r| r.readiness.is_terminal()) {
                break;
            }
            if counter < attempt_limit {
                if let Err(interrupted) = ctx.sleep(interval).await {
                    mark_unresolved(records);
                    return Err(interrupted);
                }
            }
        }
        mark_unresolved(records);
        Ok(())
    }

    async fn poll(&self, record: &mut ProvisioningRecord) {
        let Some(id) = record.server_id.clone() else {
            record.fail("no server id");
            return;
        };
        match self.compute.get_server(&record.spec.region, &id).await {
            Ok(details) => {
                record.update(&details);
                match details.status {
                    ServerStatus::Active if record.address.is_some() => {
                        tracing::info!("{} is active at {}", record.node, record.address.as_deref().unwrap_or_default());
                        record.readiness = Readiness::Active;
                    }
                    ServerStatus::Error => {
                        let fault = details.fault.unwrap_or_else(|| "server in ERROR state".to_string());
                        tracing::error!("{} is in ERROR state: {fault}", record.node);
                        record.readiness = Readiness::Error(fault);
                    }
                    status => tracing::debug!("{} is {status}", record.node),
                }
            }
            Err(err) => tracing::warn!("could not get the state of {}: {err}", record.node),
        }
    }

    /// Read the console log of an active VM
    pub async fn console_check(&self, record: &ProvisioningRecord) -> Result<ConsoleCheck, ProvisioningError> {
        let id = record.server_id.as_deref().ok_or_else(|| ProvisioningError::NotLaunched {
            node: record.node.clone(),
            instance_name: record.spec.instance_name.clone(),
        })?;
        let console = self.compute.get_console_output(&record.spec.region, id).await
            .map_err(|source| ProvisioningError::Compute { node: record.node.clone(), source })?;
        Ok(ConsoleCheck::from_console(&console, record.address.as_deref()))
    }
}

fn mark_unresolved(records: &mut [ProvisioningRecord]) {
    for record in records.iter_mut().filter(|r| !r.readiness.is_terminal()) {
        tracing::warn!("{} is not active, giving up on it", record.node);
        record.readiness = Readiness::Unresolved;
    }
}

/// Node to address for every VM that is ready
pub fn address_table(records: &[ProvisioningRecord]) -> AddressTable {
    let mut table = AddressTable::new();
    for record in records.iter().filter(|r| r.is_ready()) {
        if let Some(address) = &record.address {
            table.insert(&record.node, address.clone());
        }
    }
    table
}
