use std::fmt;
use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use crate::OVERLAY_SETTINGS_FOLDER;

/// Environment variable that takes precedence over the password in the settings file
pub const PASSWORD_ENV: &str = "OS_PASSWORD";

/// Credentials and endpoints for the cloud, kept apart from the project file so that a topology
/// can be shared without leaking credentials.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct CloudSettings {
    /// keystone endpoint i.e. `http://controller:5000/v3`
    pub auth_url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// project (tenant) the VMs are launched in, the VM network is `<project_name>-net`
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    #[serde(default = "default_domain")]
    pub project_domain_name: String,
    /// region used when neither the node nor the launch defaults give one
    pub region_name: String,
}

fn default_domain() -> String {"Default".to_string()}

impl fmt::Display for CloudSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // never print the password
        let mut redacted = self.clone();
        if !redacted.password.is_empty() {
            redacted.password = "********".to_string();
        }
        let json = serde_json::to_string_pretty(&redacted).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl CloudSettings {
    pub fn default_location() -> PathBuf {
        PathBuf::from(format!("{OVERLAY_SETTINGS_FOLDER}cloud.json"))
    }

    pub async fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<CloudSettings> {
        let name = path.as_ref();
        tracing::trace!("expected cloud settings json location: {:?}", name);
        if !name.is_file() {
            bail!("could not read cloud settings at {name:?}");
        }
        let text = tokio::fs::read_to_string(name).await?;
        let mut settings: CloudSettings = serde_json::from_str(&text)
            .context("parsing cloud settings json")?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            settings.password = password;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_url.is_empty() || self.username.is_empty() || self.project_name.is_empty() {
            bail!("cloud settings need auth_url, username and project_name");
        }
        if self.password.is_empty() {
            bail!("no cloud password, set it in the settings file or with {PASSWORD_ENV}");
        }
        Ok(())
    }
}
