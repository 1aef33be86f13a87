pub mod address;

use std::collections::{BTreeSet, HashMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use overlay_compose_schemas::overlay_compose_yaml::topology::{NeighbourDecl, NodeOverrides};
use crate::topology::address::InterfaceAddress;

/// Problems in the declared topology, these are reported before anything is provisioned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("the topology does not declare any switches")]
    Empty,
    #[error("{node} references {neighbour} which is not a declared switch")]
    UnknownSwitch {
        node: String,
        neighbour: String,
    },
    #[error("{node} has a link to itself")]
    SelfLoop {
        node: String,
    },
    #[error("{name} is declared as a switch and used as a host")]
    KindConflict {
        name: String,
    },
    #[error("invalid address {address} for {node}: {reason}")]
    InvalidAddress {
        node: String,
        address: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Switch,
    Host,
}

/// Internal interface added to a switch bridge
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InternalInterface {
    pub name: String,
    pub address: InterfaceAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub internal_interface: Option<InternalInterface>,
    /// the raw overrides, also used to resolve the VM spec
    pub overrides: NodeOverrides,
}

impl Node {
    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum EdgeTarget {
    Switch(String),
    Host {
        name: String,
        address: InterfaceAddress,
        bridge: Option<String>,
    },
}

/// A declared link. `index` is the position of the link in declaration order and is what the
/// tunnel allocation is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Edge {
    pub index: usize,
    pub source: String,
    pub target: EdgeTarget,
}

impl Edge {
    pub fn target_name(&self) -> &str {
        match &self.target {
            EdgeTarget::Switch(name) => name,
            EdgeTarget::Host { name, .. } => name,
        }
    }

    pub fn is_host_edge(&self) -> bool {
        matches!(self.target, EdgeTarget::Host { .. })
    }

    /// The other end of the edge as seen from `node`, None if the edge does not touch `node`
    pub fn peer_of(&self, node: &str) -> Option<&str> {
        if self.source == node {
            Some(self.target_name())
        } else if self.target_name() == node {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// The normalised topology: all switches in declaration order followed by the hosts sorted by
/// name, and the declared edges in declaration order.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    switch_count: usize,
    edges: Vec<Edge>,
    lookup: HashMap<String, usize>,
    declared: IndexMap<String, Vec<NeighbourDecl>>,
}

/// Only tuples whose name starts with `h` or `H` are hosts, anything else is a switch reference
fn is_host_name(name: &str) -> bool {
    name.starts_with('h') || name.starts_with('H')
}

impl Topology {
    pub fn from_config(
        topology: &IndexMap<String, Vec<NeighbourDecl>>,
        overrides: &IndexMap<String, NodeOverrides>,
    ) -> Result<Self, TopologyError> {
        if topology.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut edges = Vec::new();
        let mut host_names = BTreeSet::new();
        for (switch, neighbours) in topology {
            for neighbour in neighbours {
                let target = match neighbour {
                    NeighbourDecl::Switch(name) => EdgeTarget::Switch(name.clone()),
                    NeighbourDecl::Host(name, address) if is_host_name(name) => EdgeTarget::Host {
                        name: name.clone(),
                        address: parse_address(name, address)?,
                        bridge: None,
                    },
                    NeighbourDecl::HostWithBridge(name, address, bridge) if is_host_name(name) => EdgeTarget::Host {
                        name: name.clone(),
                        address: parse_address(name, address)?,
                        bridge: Some(bridge.clone()),
                    },
                    other => {
                        tracing::debug!("{} on {switch} is not a host name, treating it as a switch", other.id());
                        EdgeTarget::Switch(other.id().to_string())
                    }
                };
                match &target {
                    EdgeTarget::Switch(name) => {
                        if !topology.contains_key(name) {
                            return Err(TopologyError::UnknownSwitch {
                                node: switch.clone(),
                                neighbour: name.clone(),
                            });
                        }
                        if name == switch {
                            return Err(TopologyError::SelfLoop { node: switch.clone() });
                        }
                    }
                    EdgeTarget::Host { name, .. } => {
                        if topology.contains_key(name) {
                            return Err(TopologyError::KindConflict { name: name.clone() });
                        }
                        host_names.insert(name.clone());
                    }
                }
                edges.push(Edge {
                    index: edges.len(),
                    source: switch.clone(),
                    target,
                });
            }
        }

        let mut nodes = Vec::with_capacity(topology.len() + host_names.len());
        for switch in topology.keys() {
            nodes.push(new_node(switch, NodeKind::Switch, overrides)?);
        }
        for host in &host_names {
            nodes.push(new_node(host, NodeKind::Host, overrides)?);
        }

        let lookup: HashMap<_, _> = nodes.iter()
            .enumerate()
            .map(|(i, node)| (node.name.clone(), i))
            .collect();
        for name in overrides.keys() {
            if !lookup.contains_key(name) {
                tracing::warn!("node overrides given for {name} which is not in the topology, ignoring");
            }
        }

        Ok(Self {
            nodes,
            switch_count: topology.len(),
            edges,
            lookup,
            declared: topology.clone(),
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.lookup.get(name).map(|i| &self.nodes[*i])
    }

    pub fn switches(&self) -> &[Node] {
        &self.nodes[..self.switch_count]
    }

    pub fn hosts(&self) -> &[Node] {
        &self.nodes[self.switch_count..]
    }

    pub fn switch_count(&self) -> usize {
        self.switch_count
    }

    pub fn host_count(&self) -> usize {
        self.nodes.len() - self.switch_count
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges declared in this node's own adjacency list
    pub fn outgoing<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node)
    }

    /// Edges declared by other switches that point at this node
    pub fn incoming<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target_name() == node)
    }

    /// Human readable listing of the declared adjacency, switches sorted by name
    pub fn describe(&self) -> Vec<String> {
        let mut switches: Vec<_> = self.declared.iter().collect();
        switches.sort_by(|a, b| a.0.cmp(b.0));
        switches.into_iter()
            .map(|(switch, neighbours)| {
                let neighbours: Vec<String> = neighbours.iter()
                    .map(|n| match n {
                        NeighbourDecl::Switch(name) => name.clone(),
                        NeighbourDecl::Host(name, address) => format!("({name}, {address})"),
                        NeighbourDecl::HostWithBridge(name, address, bridge) => format!("({name}, {address}, {bridge})"),
                    })
                    .collect();
                format!("{switch} connects to these nodes (bidirectional): [{}]", neighbours.join(", "))
            })
            .collect()
    }
}

fn parse_address(node: &str, address: &str) -> Result<InterfaceAddress, TopologyError> {
    address.parse().map_err(|reason| TopologyError::InvalidAddress {
        node: node.to_string(),
        address: address.to_string(),
        reason,
    })
}

fn new_node(
    name: &str,
    kind: NodeKind,
    overrides: &IndexMap<String, NodeOverrides>,
) -> Result<Node, TopologyError> {
    let overrides = overrides.get(name).cloned().unwrap_or_default();
    let internal_interface = match &overrides.int_ip {
        Some((if_name, address)) => Some(InternalInterface {
            name: if_name.clone(),
            address: parse_address(name, address)?,
        }),
        None => None,
    };
    if kind == NodeKind::Host && (overrides.bridge_name.is_some() || overrides.contr_addr.is_some() || internal_interface.is_some()) {
        tracing::warn!("bridge overrides on host {name} are ignored, host bridges come from the topology");
    }
    Ok(Node {
        name: name.to_string(),
        kind,
        internal_interface,
        overrides,
    })
}
