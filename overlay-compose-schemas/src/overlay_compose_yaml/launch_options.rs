use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Global launch settings for every VM, a node's `NodeOverrides` take precedence.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct LaunchDefaults {
    /// prefix of the instance name, the node name is appended i.e. `overlay-sw1`
    pub instance_name: String,
    pub image: String,
    pub flavor: String,
    /// region for nodes without a region override, the cloud settings region otherwise
    pub region: Option<String>,
    pub security_group: String,
    /// source CIDR for the SSH, VXLAN and ICMP security group rules
    pub rule_cidr: String,
    /// network the VM NIC is attached to, defaults to `<project>-net`
    pub network_name: Option<String>,
    /// nova keypair name injected into the VMs
    pub key_name: String,
    /// local private key matching `key_name`, used for SSH into the VMs
    pub private_key_file: String,
    pub vm_user_name: String,
    /// seconds to wait on a fresh session before issuing commands, gives ovsdb time to start
    pub wait_before_ssh: u64,
    /// overall deadline in seconds for a run, unbounded when absent
    pub deadline: Option<u64>,
    pub readiness: ReadinessOptions,
    pub connect_retry: RetryOptions,
    pub command_retry: RetryOptions,
    pub pacing: PacingOptions,
}

impl Default for LaunchDefaults {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            image: "".to_string(),
            flavor: "".to_string(),
            region: None,
            security_group: default_security_group(),
            rule_cidr: default_rule_cidr(),
            network_name: None,
            key_name: "".to_string(),
            private_key_file: "".to_string(),
            vm_user_name: default_vm_user_name(),
            wait_before_ssh: 15,
            deadline: None,
            readiness: Default::default(),
            connect_retry: RetryOptions::connect(),
            command_retry: RetryOptions::command(),
            pacing: Default::default(),
        }
    }
}

impl LaunchDefaults {
    /// Make sure the values without a usable default have been given
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image.is_empty() {
            bail!("defaults.image must be set");
        }
        if self.flavor.is_empty() {
            bail!("defaults.flavor must be set");
        }
        if self.key_name.is_empty() {
            bail!("defaults.key_name must be set");
        }
        if self.private_key_file.is_empty() {
            bail!("defaults.private_key_file must be set");
        }
        if self.readiness.attempts == 0 {
            bail!("defaults.readiness.attempts must be at least 1");
        }
        if self.connect_retry.max_attempts == 0 || self.command_retry.max_attempts == 0 {
            bail!("retry max_attempts must be at least 1");
        }
        Ok(())
    }
}

fn default_instance_name() -> String {"overlay-".to_string()}
fn default_security_group() -> String {"default".to_string()}
fn default_rule_cidr() -> String {"10.0.0.0/8".to_string()}
fn default_vm_user_name() -> String {"ubuntu".to_string()}

/// Bounded readiness polling of the VMs
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct ReadinessOptions {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval_secs: 10,
        }
    }
}

/// Retry with exponential backoff, `timeout_secs` bounds every single attempt
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl RetryOptions {
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2000,
            max_backoff_ms: 30000,
            timeout_secs: 30,
        }
    }

    pub fn command() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            timeout_secs: 60,
        }
    }
}

/// Delays between the configuration commands on a node
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case", default)]
pub struct PacingOptions {
    pub after_bridge_ms: u64,
    pub after_operation_ms: u64,
}

impl Default for PacingOptions {
    fn default() -> Self {
        Self {
            after_bridge_ms: 2000,
            after_operation_ms: 1000,
        }
    }
}
