use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Formatter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::topology::{Edge, Topology};

/// Keeps the ids clear of the low, commonly reserved VXLAN keys
pub const TUNNEL_ID_OFFSET: u32 = 10;
/// VXLAN network identifiers are 24 bit
pub const VXLAN_MAX_KEY: u32 = 16_777_215;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TunnelError {
    #[error("node name {name} does not end in a numeric index")]
    MissingIndex {
        name: String,
    },
    #[error("numeric index of node {name} is too large")]
    IndexTooLarge {
        name: String,
    },
    #[error("tunnel id for {from} -> {target} is over the VXLAN key limit of {VXLAN_MAX_KEY}")]
    OutOfRange {
        from: String,
        target: String,
    },
}

/// The shared key of a tunnel, used as the VXLAN key and as the port name suffix on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct TunnelId(pub u32);

impl TunnelId {
    pub fn port_name(&self) -> String {
        format!("vxlan{}", self.0)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The numeric index of a node is the trailing run of digits in its name, `sw12` is 12
pub fn node_index(name: &str) -> Result<u32, TunnelError> {
    let digits_start = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let digits = &name[digits_start..];
    if digits.is_empty() {
        return Err(TunnelError::MissingIndex { name: name.to_string() });
    }
    digits.parse::<u32>()
        .map_err(|_| TunnelError::IndexTooLarge { name: name.to_string() })
}

/// Base id before any collision handling. The endpoint indices are summed so the value is the
/// same from either end, host links sit `2 * switch_count` above the switch to switch links.
pub fn base_tunnel_id(edge: &Edge, switch_count: usize) -> Result<u32, TunnelError> {
    let source = node_index(&edge.source)?;
    let target = node_index(edge.target_name())?;
    let band = if edge.is_host_edge() {
        2 * switch_count as u32
    } else {
        0
    };
    source.checked_add(target)
        .and_then(|sum| sum.checked_add(band))
        .and_then(|sum| sum.checked_add(TUNNEL_ID_OFFSET))
        .ok_or_else(|| out_of_range(edge))
}

fn out_of_range(edge: &Edge) -> TunnelError {
    TunnelError::OutOfRange {
        from: edge.source.clone(),
        target: edge.target_name().to_string(),
    }
}

/// Tunnel ids for every edge of a topology. Edges are allocated in declaration order and an id
/// that is already used on either endpoint is bumped until it is free on both, so that both
/// ends of a link configure the same id and no node has the same id twice.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TunnelAllocation {
    by_edge: Vec<TunnelId>,
    per_node: BTreeMap<String, BTreeSet<TunnelId>>,
}

impl TunnelAllocation {
    pub fn allocate(topology: &Topology) -> Result<Self, TunnelError> {
        let mut allocation = Self::default();
        for edge in topology.edges() {
            let mut id = base_tunnel_id(edge, topology.switch_count())?;
            while allocation.is_used(&edge.source, id) || allocation.is_used(edge.target_name(), id) {
                id += 1;
            }
            if id > VXLAN_MAX_KEY {
                return Err(out_of_range(edge));
            }
            let id = TunnelId(id);
            tracing::debug!("allocated tunnel {id} for {} -> {}", edge.source, edge.target_name());
            allocation.by_edge.push(id);
            allocation.per_node.entry(edge.source.clone()).or_default().insert(id);
            allocation.per_node.entry(edge.target_name().to_string()).or_default().insert(id);
        }
        Ok(allocation)
    }

    fn is_used(&self, node: &str, id: u32) -> bool {
        self.per_node.get(node)
            .map(|ids| ids.contains(&TunnelId(id)))
            .unwrap_or(false)
    }

    /// The id allocated to an edge of the topology this allocation was built from
    pub fn tunnel_id(&self, edge: &Edge) -> Option<TunnelId> {
        self.by_edge.get(edge.index).copied()
    }

    /// All ids configured on a node, sorted
    pub fn ids_on(&self, node: &str) -> Vec<TunnelId> {
        self.per_node.get(node)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_edge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_edge.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use overlay_compose_schemas::overlay_compose_yaml::topology::NeighbourDecl;
    use crate::topology::tests::example_topology;
    use super::*;

    #[test]
    fn test_node_index() {
        assert_eq!(node_index("sw1"), Ok(1));
        assert_eq!(node_index("h12"), Ok(12));
        assert_eq!(node_index("switch-3"), Ok(3));
        assert_eq!(node_index("gateway"), Err(TunnelError::MissingIndex { name: "gateway".into() }));
    }

    #[test]
    fn test_example_allocation() {
        let topology = example_topology();
        let allocation = TunnelAllocation::allocate(&topology).unwrap();
        let ids: Vec<_> = topology.edges().iter()
            .map(|e| allocation.tunnel_id(e).unwrap().0)
            .collect();
        // sw1-h1: 1+1+6+10, sw1-sw3: 1+3+10, sw2-sw1: 2+1+10, sw3-h2: 3+2+6+10
        assert_eq!(ids, vec![18, 14, 13, 21]);
        assert_eq!(allocation.ids_on("sw1"), vec![TunnelId(13), TunnelId(14), TunnelId(18)]);
        assert_eq!(allocation.ids_on("h2"), vec![TunnelId(21)]);
    }

    #[test]
    fn test_parallel_edges_get_distinct_ids() {
        // sw1 <-> sw2 declared from both sides and a second link sw1 -> sw2
        let mut topology = IndexMap::new();
        topology.insert("sw1".to_string(), vec![
            NeighbourDecl::Switch("sw2".into()),
            NeighbourDecl::Switch("sw2".into()),
        ]);
        topology.insert("sw2".to_string(), vec![NeighbourDecl::Switch("sw1".into())]);
        let topology = Topology::from_config(&topology, &IndexMap::new()).unwrap();
        let allocation = TunnelAllocation::allocate(&topology).unwrap();
        assert_eq!(allocation.ids_on("sw1"), vec![TunnelId(13), TunnelId(14), TunnelId(15)]);
        assert_eq!(allocation.ids_on("sw2"), allocation.ids_on("sw1"));
    }

    #[test]
    fn test_same_base_on_disjoint_edges_is_kept() {
        // sw1-sw4 and sw2-sw3 both have base 15 but share no endpoint, so both keep it
        let mut topology = IndexMap::new();
        topology.insert("sw1".to_string(), vec![NeighbourDecl::Switch("sw4".into())]);
        topology.insert("sw2".to_string(), vec![NeighbourDecl::Switch("sw3".into())]);
        topology.insert("sw3".to_string(), vec![]);
        topology.insert("sw4".to_string(), vec![NeighbourDecl::Switch("sw3".into())]);
        let topology = Topology::from_config(&topology, &IndexMap::new()).unwrap();
        let allocation = TunnelAllocation::allocate(&topology).unwrap();
        let ids: Vec<_> = topology.edges().iter()
            .map(|e| allocation.tunnel_id(e).unwrap().0)
            .collect();
        // sw4-sw3 has base 17, no clash
        assert_eq!(ids, vec![15, 15, 17]);

        for node in topology.node_names() {
            let ids = allocation.ids_on(node);
            let on_node = topology.edges().iter().filter(|e| e.peer_of(node).is_some()).count();
            assert_eq!(ids.len(), on_node, "duplicate id on {node}");
        }
    }

    #[test]
    fn test_host_band_collision() {
        // with one switch the host band is 2, sw1-h1 = 14 and sw1-h2 = 15, the second link to h1
        // starts at 14 and has to move past both
        let mut topology = IndexMap::new();
        topology.insert("sw1".to_string(), vec![
            NeighbourDecl::Host("h1".into(), "10.0.0.1".into()),
            NeighbourDecl::Host("h2".into(), "10.0.0.2".into()),
            NeighbourDecl::Host("h1".into(), "10.0.1.1".into()),
        ]);
        let topology = Topology::from_config(&topology, &IndexMap::new()).unwrap();
        let allocation = TunnelAllocation::allocate(&topology).unwrap();
        assert_eq!(allocation.ids_on("sw1"), vec![TunnelId(14), TunnelId(15), TunnelId(16)]);
        assert_eq!(allocation.ids_on("h1"), vec![TunnelId(14), TunnelId(16)]);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let topology = example_topology();
        let first = TunnelAllocation::allocate(&topology).unwrap();
        for _ in 0..10 {
            let again = TunnelAllocation::allocate(&topology).unwrap();
            for edge in topology.edges() {
                assert_eq!(first.tunnel_id(edge), again.tunnel_id(edge));
            }
        }
    }

    #[test]
    fn test_missing_index_is_an_error() {
        let mut topology = IndexMap::new();
        topology.insert("core".to_string(), vec![NeighbourDecl::Host("h1".into(), "none".into())]);
        let topology = Topology::from_config(&topology, &IndexMap::new()).unwrap();
        assert_eq!(
            TunnelAllocation::allocate(&topology).unwrap_err(),
            TunnelError::MissingIndex { name: "core".into() }
        );
    }

    #[test]
    fn test_index_too_large_is_an_error() {
        assert_eq!(node_index("sw12"), Ok(12));
        assert_eq!(
            node_index("sw99999999999"),
            Err(TunnelError::IndexTooLarge { name: "sw99999999999".into() })
        );
        assert_eq!(node_index("sw"), Err(TunnelError::MissingIndex { name: "sw".into() }));
    }

    #[test]
    fn test_out_of_range_names_the_edge() {
        let err = TunnelError::OutOfRange { from: "sw1".into(), target: "h9".into() };
        assert_eq!(err.to_string(), "tunnel id for sw1 -> h9 is over the VXLAN key limit of 16777215");
    }
}
