use serde::{Deserialize, Serialize};

/// A neighbour in the topology adjacency list. A bare string is a switch, a sequence is a host
/// tuple of `[host, address]` or `[host, address, bridge]` where the address may be `none`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum NeighbourDecl {
    Switch(String),
    HostWithBridge(String, String, String),
    Host(String, String),
}

impl NeighbourDecl {
    /// The node identifier this neighbour refers to
    pub fn id(&self) -> &str {
        match self {
            NeighbourDecl::Switch(id) => id,
            NeighbourDecl::HostWithBridge(id, _, _) => id,
            NeighbourDecl::Host(id, _) => id,
        }
    }
}

/// Per node attribute overrides, every field is optional and falls back to the launch defaults
/// or the planner defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NodeOverrides {
    /// OVS bridge name for a switch, defaults to `br1`
    pub bridge_name: Option<String>,
    /// OpenFlow controller as `ip:port`, no controller is attached when absent
    pub contr_addr: Option<String>,
    /// internal interface as `[name, address]` added to the switch bridge
    pub int_ip: Option<(String, String)>,
    /// hypervisor to force the VM onto, passed as the `force_hosts` scheduler hint
    pub server: Option<String>,
    pub region: Option<String>,
    pub flavor: Option<String>,
    pub image: Option<String>,
    /// instance name, defaults to the instance name prefix followed by the node name
    pub name: Option<String>,
    pub vm_user_name: Option<String>,
}
