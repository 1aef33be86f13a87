use std::fmt;
use std::fmt::Formatter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// VXLAN udp port opened in the security group
pub const VXLAN_UDP_PORT: u16 = 4789;
pub const SSH_TCP_PORT: u16 = 22;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("{kind} {name} not found")]
    NotFound {
        kind: String,
        name: String,
    },
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("cloud api error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum ServerStatus {
    Active,
    Build,
    Error,
    Other(String),
}

impl From<&str> for ServerStatus {
    fn from(status: &str) -> Self {
        match status.to_uppercase().as_str() {
            "ACTIVE" => ServerStatus::Active,
            "BUILD" => ServerStatus::Build,
            "ERROR" => ServerStatus::Error,
            other => ServerStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Active => f.write_str("ACTIVE"),
            ServerStatus::Build => f.write_str("BUILD"),
            ServerStatus::Error => f.write_str("ERROR"),
            ServerStatus::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerDetails {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    /// first private address, absent until the network is attached
    pub address: Option<String>,
    pub host: Option<String>,
    pub instance_name: Option<String>,
    pub fault: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCreate {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub network_id: Option<String>,
    pub force_host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleProtocol {
    Tcp(u16),
    Udp(u16),
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityRule {
    pub protocol: RuleProtocol,
    pub cidr: String,
}

/// Rules the overlay needs: ssh for configuration, VXLAN between the nodes and ping
pub fn overlay_rules(cidr: &str) -> Vec<SecurityRule> {
    [RuleProtocol::Tcp(SSH_TCP_PORT), RuleProtocol::Udp(VXLAN_UDP_PORT), RuleProtocol::Icmp]
        .into_iter()
        .map(|protocol| SecurityRule { protocol, cidr: cidr.to_string() })
        .collect()
}

/// The cloud operations needed to launch and inspect the overlay VMs. Every call is scoped to a
/// region.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// id of the image called `name`
    async fn find_image(&self, region: &str, name: &str) -> Result<String, ComputeError>;
    /// id of the flavor called `name`
    async fn find_flavor(&self, region: &str, name: &str) -> Result<String, ComputeError>;
    /// id of the security group called `name`, created when missing
    async fn get_or_create_security_group(&self, region: &str, name: &str) -> Result<String, ComputeError>;
    /// `ComputeError::Conflict` when the rule is already there
    async fn create_security_group_rule(&self, region: &str, group_id: &str, rule: &SecurityRule) -> Result<(), ComputeError>;
    async fn find_network(&self, region: &str, name: &str) -> Result<String, ComputeError>;
    async fn list_servers(&self, region: &str) -> Result<Vec<ServerDetails>, ComputeError>;
    /// id of the new server
    async fn create_server(&self, region: &str, request: &ServerCreate) -> Result<String, ComputeError>;
    async fn get_server(&self, region: &str, id: &str) -> Result<ServerDetails, ComputeError>;
    async fn get_console_output(&self, region: &str, id: &str) -> Result<String, ComputeError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use super::*;

    /// In memory cloud. `get_server` pops the scripted statuses of a server in order and keeps
    /// returning the last one.
    #[derive(Default)]
    pub(crate) struct FakeCompute {
        pub(crate) existing: Mutex<Vec<ServerDetails>>,
        pub(crate) created: Mutex<Vec<(String, ServerCreate)>>,
        pub(crate) rules: Mutex<Vec<(String, SecurityRule)>>,
        pub(crate) scripts: Mutex<HashMap<String, VecDeque<ServerDetails>>>,
        pub(crate) consoles: Mutex<HashMap<String, String>>,
        pub(crate) missing_images: Vec<String>,
        pub(crate) polls: Mutex<u32>,
    }

    impl FakeCompute {
        pub(crate) fn script(&self, instance_name: &str, states: Vec<(ServerStatus, Option<&str>)>) {
            let details = states.into_iter()
                .map(|(status, address)| server(instance_name, status, address))
                .collect();
            self.scripts.lock().unwrap().insert(format!("id-{instance_name}"), details);
        }
    }

    pub(crate) fn server(instance_name: &str, status: ServerStatus, address: Option<&str>) -> ServerDetails {
        ServerDetails {
            id: format!("id-{instance_name}"),
            name: instance_name.to_string(),
            fault: (status == ServerStatus::Error).then(|| "No valid host was found".to_string()),
            status,
            address: address.map(|a| a.to_string()),
            host: Some("compute-1".to_string()),
            instance_name: Some(format!("instance-{instance_name}")),
        }
    }

    #[async_trait]
    impl ComputeApi for FakeCompute {
        async fn find_image(&self, _region: &str, name: &str) -> Result<String, ComputeError> {
            if self.missing_images.iter().any(|m| m == name) {
                return Err(ComputeError::NotFound { kind: "image".into(), name: name.into() });
            }
            Ok(format!("image-{name}"))
        }

        async fn find_flavor(&self, _region: &str, name: &str) -> Result<String, ComputeError> {
            Ok(format!("flavor-{name}"))
        }

        async fn get_or_create_security_group(&self, _region: &str, name: &str) -> Result<String, ComputeError> {
            Ok(format!("sg-{name}"))
        }

        async fn create_security_group_rule(&self, _region: &str, group_id: &str, rule: &SecurityRule) -> Result<(), ComputeError> {
            let mut rules = self.rules.lock().unwrap();
            if rules.iter().any(|(g, r)| g == group_id && r == rule) {
                return Err(ComputeError::Conflict(format!("{rule:?}")));
            }
            rules.push((group_id.to_string(), rule.clone()));
            Ok(())
        }

        async fn find_network(&self, _region: &str, name: &str) -> Result<String, ComputeError> {
            Ok(format!("net-{name}"))
        }

        async fn list_servers(&self, _region: &str) -> Result<Vec<ServerDetails>, ComputeError> {
            Ok(self.existing.lock().unwrap().clone())
        }

        async fn create_server(&self, _region: &str, request: &ServerCreate) -> Result<String, ComputeError> {
            let id = format!("id-{}", request.name);
            self.created.lock().unwrap().push((id.clone(), request.clone()));
            self.existing.lock().unwrap().push(server(&request.name, ServerStatus::Build, None));
            Ok(id)
        }

        async fn get_server(&self, _region: &str, id: &str) -> Result<ServerDetails, ComputeError> {
            *self.polls.lock().unwrap() += 1;
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(id)
                .ok_or_else(|| ComputeError::NotFound { kind: "server".into(), name: id.into() })?;
            let details = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            details.ok_or_else(|| ComputeError::Api("empty script".into()))
        }

        async fn get_console_output(&self, _region: &str, id: &str) -> Result<String, ComputeError> {
            Ok(self.consoles.lock().unwrap().get(id).cloned().unwrap_or_default())
        }
    }
}
