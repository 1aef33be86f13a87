use serde::{Deserialize, Serialize};
use overlay_compose_schemas::overlay_compose_yaml::launch_options::LaunchDefaults;
use crate::topology::Node;

/// Cloud wide values that are not part of the project file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudScope {
    pub project_name: String,
    pub region: String,
}

/// Everything needed to create the VM of one node, resolved from the node overrides falling back
/// to the launch defaults
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmSpec {
    pub node: String,
    pub instance_name: String,
    pub image: String,
    pub flavor: String,
    pub region: String,
    pub security_group: String,
    pub rule_cidr: String,
    pub network_name: String,
    pub key_name: String,
    pub user: String,
    /// hypervisor the scheduler is forced onto
    pub server: Option<String>,
}

impl VmSpec {
    pub fn resolve(node: &Node, defaults: &LaunchDefaults, scope: &CloudScope) -> Self {
        let overrides = &node.overrides;
        let instance_name = overrides.name.clone()
            .unwrap_or_else(|| format!("{}{}", defaults.instance_name, node.name));
        let region = overrides.region.clone()
            .or_else(|| defaults.region.clone())
            .unwrap_or_else(|| scope.region.clone());
        let network_name = defaults.network_name.clone()
            .unwrap_or_else(|| format!("{}-net", scope.project_name));
        Self {
            node: node.name.clone(),
            instance_name,
            image: overrides.image.clone().unwrap_or_else(|| defaults.image.clone()),
            flavor: overrides.flavor.clone().unwrap_or_else(|| defaults.flavor.clone()),
            region,
            security_group: defaults.security_group.clone(),
            rule_cidr: defaults.rule_cidr.clone(),
            network_name,
            key_name: defaults.key_name.clone(),
            user: overrides.vm_user_name.clone().unwrap_or_else(|| defaults.vm_user_name.clone()),
            server: overrides.server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use overlay_compose_schemas::overlay_compose_yaml::topology::{NeighbourDecl, NodeOverrides};
    use crate::topology::Topology;
    use super::*;

    #[test]
    fn test_resolve_defaults_and_overrides() {
        let mut declared = IndexMap::new();
        declared.insert("sw1".to_string(), vec![NeighbourDecl::Host("h1".into(), "none".into())]);
        let mut overrides = IndexMap::new();
        overrides.insert("h1".to_string(), NodeOverrides {
            server: Some("compute-3".into()),
            region: Some("RegionTwo".into()),
            flavor: Some("m1.large".into()),
            vm_user_name: Some("debian".into()),
            ..Default::default()
        });
        let topology = Topology::from_config(&declared, &overrides).unwrap();
        let defaults = LaunchDefaults {
            image: "ubuntu-22.04".into(),
            flavor: "m1.small".into(),
            key_name: "lab".into(),
            ..Default::default()
        };
        let scope = CloudScope { project_name: "demo".into(), region: "RegionOne".into() };

        let sw1 = VmSpec::resolve(topology.node("sw1").unwrap(), &defaults, &scope);
        assert_eq!(sw1.instance_name, "overlay-sw1");
        assert_eq!(sw1.region, "RegionOne");
        assert_eq!(sw1.flavor, "m1.small");
        assert_eq!(sw1.network_name, "demo-net");
        assert_eq!(sw1.user, "ubuntu");
        assert!(sw1.server.is_none());

        let h1 = VmSpec::resolve(topology.node("h1").unwrap(), &defaults, &scope);
        assert_eq!(h1.region, "RegionTwo");
        assert_eq!(h1.flavor, "m1.large");
        assert_eq!(h1.image, "ubuntu-22.04");
        assert_eq!(h1.user, "debian");
        assert_eq!(h1.server.as_deref(), Some("compute-3"));
    }
}
