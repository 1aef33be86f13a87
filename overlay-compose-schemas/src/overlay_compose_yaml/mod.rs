pub mod launch_options;
pub mod topology;

use crate::overlay_compose_yaml::launch_options::LaunchDefaults;
use crate::overlay_compose_yaml::topology::{NeighbourDecl, NodeOverrides};
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The project file. `topology` keeps the declaration order of the yaml mapping as the switch
/// order is significant for the node list and the tunnel allocation.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub topology: IndexMap<String, Vec<NeighbourDecl>>,
    #[serde(default)]
    pub nodes: IndexMap<String, NodeOverrides>,
    #[serde(default)]
    pub defaults: LaunchDefaults,
}

impl Config {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.with_context(|| "Reading Config file")?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let value: Self = serde_yaml::from_str(text).with_context(|| "Parsing Config YAML")?;
        Ok(value)
    }
}
