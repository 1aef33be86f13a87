use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use std::net::Ipv4Addr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::topology::address::InterfaceAddress;
use crate::topology::{Edge, EdgeTarget, Node, NodeKind, Topology};
use crate::tunnel::{TunnelAllocation, TunnelId};
use crate::vec_of_strings;

/// Bridge used on a switch node when no `bridge_name` override is given
pub const DEFAULT_SWITCH_BRIDGE: &str = "br1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("{node} is not in the topology")]
    UnknownNode {
        node: String,
    },
    #[error("no tunnel allocated for {from} -> {target}")]
    Unallocated {
        from: String,
        target: String,
    },
}

/// A single idempotent virtual switch operation. Running any of these a second time leaves the
/// node in the same state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOperation {
    AddBridge {
        bridge: String,
    },
    SetController {
        bridge: String,
        controller: String,
    },
    AddInternalPort {
        bridge: String,
        interface: String,
    },
    AssignAddress {
        interface: String,
        address: Ipv4Addr,
        prefix_len: u8,
    },
    SetFailModeSecure {
        bridge: String,
    },
    SetOutOfBand {
        bridge: String,
    },
    AddTunnelPort {
        bridge: String,
        tunnel: TunnelId,
        remote_ip: String,
        peer: String,
    },
}

impl ConfigOperation {
    /// The remote commands that implement this operation, in order, without the `sudo` prefix
    pub fn commands(&self) -> Vec<Vec<String>> {
        match self {
            ConfigOperation::AddBridge { bridge } => vec![
                vec_of_strings!["ovs-vsctl", "--may-exist", "add-br", bridge],
            ],
            ConfigOperation::SetController { bridge, controller } => vec![
                vec_of_strings!["ovs-vsctl", "set-controller", bridge, format!("tcp:{controller}")],
            ],
            ConfigOperation::AddInternalPort { bridge, interface } => vec![
                vec_of_strings![
                    "ovs-vsctl", "--may-exist", "add-port", bridge, interface,
                    "--", "set", "interface", interface, "type=internal"
                ],
            ],
            ConfigOperation::AssignAddress { interface, address, prefix_len } => vec![
                vec_of_strings!["ip", "addr", "replace", format!("{address}/{prefix_len}"), "dev", interface],
                vec_of_strings!["ip", "link", "set", "dev", interface, "up"],
            ],
            ConfigOperation::SetFailModeSecure { bridge } => vec![
                vec_of_strings!["ovs-vsctl", "set-fail-mode", bridge, "secure"],
            ],
            ConfigOperation::SetOutOfBand { bridge } => vec![
                vec_of_strings!["ovs-vsctl", "set", "controller", bridge, "connection-mode=out-of-band"],
            ],
            ConfigOperation::AddTunnelPort { bridge, tunnel, remote_ip, .. } => {
                let port = tunnel.port_name();
                vec![vec_of_strings![
                    "ovs-vsctl", "--may-exist", "add-port", bridge, port,
                    "--", "set", "interface", port, "type=vxlan",
                    format!("options:remote_ip={remote_ip}"), format!("options:key={tunnel}")
                ]]
            }
        }
    }

    /// Bridge creation is followed by a longer pause so ovsdb has settled before ports are added
    pub fn is_bridge_creation(&self) -> bool {
        matches!(self, ConfigOperation::AddBridge { .. })
    }
}

impl fmt::Display for ConfigOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOperation::AddBridge { bridge } => write!(f, "add bridge {bridge}"),
            ConfigOperation::SetController { bridge, controller } => write!(f, "set controller of {bridge} to tcp:{controller}"),
            ConfigOperation::AddInternalPort { bridge, interface } => write!(f, "add internal port {interface} to {bridge}"),
            ConfigOperation::AssignAddress { interface, address, prefix_len } => write!(f, "assign {address}/{prefix_len} to {interface}"),
            ConfigOperation::SetFailModeSecure { bridge } => write!(f, "set fail mode of {bridge} to secure"),
            ConfigOperation::SetOutOfBand { bridge } => write!(f, "set {bridge} controller connection to out-of-band"),
            ConfigOperation::AddTunnelPort { bridge, tunnel, remote_ip, peer } => {
                write!(f, "add tunnel {} on {bridge} to {peer} ({remote_ip})", tunnel.port_name())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum PlanWarning {
    /// the tunnel was left out because the peer has no address
    UnresolvedPeer {
        peer: String,
        tunnel: TunnelId,
    },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::UnresolvedPeer { peer, tunnel } => {
                write!(f, "tunnel {} to {peer} skipped, {peer} has no address", tunnel.port_name())
            }
        }
    }
}

/// Ordered operations for one node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodePlan {
    pub node: String,
    pub kind: NodeKind,
    pub operations: Vec<ConfigOperation>,
    pub warnings: Vec<PlanWarning>,
}

impl NodePlan {
    /// Every command of the plan as it would be typed on the node
    pub fn rendered_commands(&self) -> Vec<String> {
        self.operations.iter()
            .flat_map(|op| op.commands())
            .map(|cmd| format!("sudo {}", cmd.join(" ")))
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.operations.iter()
            .filter(|op| matches!(op, ConfigOperation::AddTunnelPort { .. }))
            .count()
    }
}

/// Node name to reachable address, filled in by provisioning before any plan is built for
/// execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressTable(BTreeMap<String, String>);

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder addresses `<node>` for every node, used to show plans before anything is
    /// launched
    pub fn symbolic(topology: &Topology) -> Self {
        let mut table = Self::new();
        for node in topology.nodes() {
            table.insert(&node.name, format!("<{}>", node.name));
        }
        table
    }

    pub fn insert(&mut self, node: &str, address: impl Into<String>) {
        self.0.insert(node.to_string(), address.into());
    }

    pub fn get(&self, node: &str) -> Option<&str> {
        self.0.get(node).map(|a| a.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Builds the per node plans from the topology and its tunnel allocation
pub struct Planner<'a> {
    topology: &'a Topology,
    allocation: &'a TunnelAllocation,
}

impl<'a> Planner<'a> {
    pub fn new(topology: &'a Topology, allocation: &'a TunnelAllocation) -> Self {
        Self {
            topology,
            allocation,
        }
    }

    pub fn plan_all(&self, addresses: &AddressTable) -> Result<Vec<NodePlan>, PlanError> {
        self.topology.nodes().iter()
            .map(|node| self.plan_node(node, addresses))
            .collect()
    }

    pub fn plan_for(&self, name: &str, addresses: &AddressTable) -> Result<NodePlan, PlanError> {
        let node = self.topology.node(name)
            .ok_or_else(|| PlanError::UnknownNode { node: name.to_string() })?;
        self.plan_node(node, addresses)
    }

    pub fn plan_node(&self, node: &Node, addresses: &AddressTable) -> Result<NodePlan, PlanError> {
        let mut plan = NodePlan {
            node: node.name.clone(),
            kind: node.kind,
            operations: Vec::new(),
            warnings: Vec::new(),
        };
        match node.kind {
            NodeKind::Switch => self.plan_switch(node, addresses, &mut plan)?,
            NodeKind::Host => self.plan_host(node, addresses, &mut plan)?,
        }
        for warning in &plan.warnings {
            tracing::warn!("{}: {warning}", node.name);
        }
        Ok(plan)
    }

    fn plan_switch(&self, node: &Node, addresses: &AddressTable, plan: &mut NodePlan) -> Result<(), PlanError> {
        let bridge = node.overrides.bridge_name.clone()
            .unwrap_or_else(|| DEFAULT_SWITCH_BRIDGE.to_string());
        plan.operations.push(ConfigOperation::AddBridge { bridge: bridge.clone() });
        if let Some(controller) = &node.overrides.contr_addr {
            plan.operations.push(ConfigOperation::SetController {
                bridge: bridge.clone(),
                controller: controller.clone(),
            });
        }
        if let Some(interface) = &node.internal_interface {
            plan.operations.push(ConfigOperation::AddInternalPort {
                bridge: bridge.clone(),
                interface: interface.name.clone(),
            });
            push_address(plan, &interface.name, &interface.address);
        }
        plan.operations.push(ConfigOperation::SetFailModeSecure { bridge: bridge.clone() });
        plan.operations.push(ConfigOperation::SetOutOfBand { bridge: bridge.clone() });

        // links this switch declared first, then links other switches declared towards it
        let edges = self.topology.outgoing(&node.name)
            .chain(self.topology.incoming(&node.name));
        for edge in edges {
            self.push_tunnel(&node.name, &bridge, edge, addresses, plan)?;
        }
        Ok(())
    }

    fn plan_host(&self, node: &Node, addresses: &AddressTable, plan: &mut NodePlan) -> Result<(), PlanError> {
        for (n, edge) in self.topology.incoming(&node.name).enumerate() {
            let (address, declared_bridge) = match &edge.target {
                EdgeTarget::Host { address, bridge, .. } => (address, bridge),
                EdgeTarget::Switch(_) => continue,
            };
            let bridge = declared_bridge.clone().unwrap_or_else(|| format!("br{n}"));
            let interface = format!("p{n}");
            plan.operations.push(ConfigOperation::AddBridge { bridge: bridge.clone() });
            plan.operations.push(ConfigOperation::AddInternalPort {
                bridge: bridge.clone(),
                interface: interface.clone(),
            });
            push_address(plan, &interface, address);
            self.push_tunnel(&node.name, &bridge, edge, addresses, plan)?;
        }
        Ok(())
    }

    fn push_tunnel(
        &self,
        node: &str,
        bridge: &str,
        edge: &Edge,
        addresses: &AddressTable,
        plan: &mut NodePlan,
    ) -> Result<(), PlanError> {
        let tunnel = self.allocation.tunnel_id(edge)
            .ok_or_else(|| PlanError::Unallocated {
                from: edge.source.clone(),
                target: edge.target_name().to_string(),
            })?;
        // the edge came from outgoing/incoming of this node so it always has a peer
        let peer = edge.peer_of(node).unwrap_or_else(|| edge.target_name()).to_string();
        match addresses.get(&peer) {
            Some(remote_ip) => plan.operations.push(ConfigOperation::AddTunnelPort {
                bridge: bridge.to_string(),
                tunnel,
                remote_ip: remote_ip.to_string(),
                peer,
            }),
            None => plan.warnings.push(PlanWarning::UnresolvedPeer { peer, tunnel }),
        }
        Ok(())
    }
}

fn push_address(plan: &mut NodePlan, interface: &str, address: &InterfaceAddress) {
    if let InterfaceAddress::Ip { address, prefix_len } = address {
        plan.operations.push(ConfigOperation::AssignAddress {
            interface: interface.to_string(),
            address: *address,
            prefix_len: *prefix_len,
        });
    }
}
