use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(version = "1.0", author = "Bristol Cyber Security Group (BCSG)")]
pub struct Opts {
    #[arg(long, default_value = "overlay-compose.yaml", help = "Topology and launch configuration file")]
    pub input: String,
    #[arg(long, help = "Cloud credentials json, defaults to /etc/overlay-compose/cloud.json")]
    pub cloud_config: Option<String>,
    #[arg(short, long)]
    pub verbosity: Option<String>,
    #[command(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Subcommand, Debug, Deserialize, Serialize)]
pub enum SubCommand {
    #[command(about = "Print the topology, tunnel allocation and node plans without touching the cloud")]
    Topology,
    #[command(about = "Create or reuse a VM for every node in the topology")]
    Launch,
    #[command(about = "Check that the VMs are ready")]
    Status(StatusCmd),
    #[command(about = "Wait for the VMs and configure the overlay tunnels")]
    Setup,
    #[command(about = "Launch the VMs and configure the overlay tunnels")]
    Up,
}

impl SubCommand {
    pub fn name(&self) -> String {
        match &self {
            SubCommand::Topology => "topology".into(),
            SubCommand::Launch => "launch".into(),
            SubCommand::Status(_) => "status".into(),
            SubCommand::Setup => "setup".into(),
            SubCommand::Up => "up".into(),
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StatusCmd {
    #[clap(long, short, action, help = "Also inspect console logs and run an SSH probe")]
    pub check: bool,
}
