use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exit;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster_name: String,
    pub dns_zone_name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub provider_network_name: Option<String>,
    pub private_network_name: Option<String>,
    pub image: ImageConfig,
    pub flavor: FlavorConfig,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    /// Parent of the per-cluster realm directories, `~/.bkos` when unset
    pub realm_root: Option<PathBuf>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub openstack: OpenStackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    pub url: String,
    pub file: PathBuf,
    pub name: String,
    pub os_version: String,
    pub sha256: Option<String>,
}

impl ImageConfig {
    pub fn download_url(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.file.display()
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlavorConfig {
    pub vcpus: u32,
    /// GiB
    pub ram: u64,
    /// GiB
    pub disk: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_marker")]
    pub marker: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            grace_secs: default_grace_secs(),
            timeout_secs: None,
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            marker: default_marker(),
        }
    }
}

/// Anything left unset here falls back to the matching `OS_*` environment variable.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct OpenStackConfig {
    pub auth_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub project_name: Option<String>,
    pub user_domain_name: Option<String>,
    pub project_domain_name: Option<String>,
    pub region: Option<String>,
    pub interface: Option<String>,
}

fn default_provider() -> String {
    "openstack".to_owned()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_interval_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    120
}

fn default_ssh_user() -> String {
    "clex".to_owned()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_marker() -> String {
    ".i_am_ready".to_owned()
}

impl Config {
    pub fn registry_fqdn(&self) -> String {
        format!("{}.{}", self.cluster_name, self.dns_zone_name)
    }

    pub fn realm(&self) -> Result<PathBuf> {
        let root = match &self.realm_root {
            Some(root) => expand_home(root)?,
            None => home::home_dir()
                .ok_or_else(|| anyhow!("could not determine the home directory"))?
                .join(".bkos"),
        };
        Ok(root.join(&self.cluster_name))
    }

    pub fn validate(&self) -> Result<()> {
        let label = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")?;
        if !label.is_match(&self.cluster_name) {
            exit!(
                "invalid cluster_name",
                "cluster_name {:?} must be a lowercase DNS label",
                self.cluster_name
            );
        }
        if self.dns_zone_name.trim_end_matches('.').is_empty() {
            exit!("invalid dns_zone_name", "dns_zone_name must not be empty");
        }
        if self.flavor.vcpus == 0 || self.flavor.ram == 0 || self.flavor.disk == 0 {
            exit!(
                "invalid flavor",
                "flavor vcpus, ram and disk must all be greater than zero"
            );
        }
        if !Regex::new(r"^[a-z_][a-z0-9_-]*$")?.is_match(&self.readiness.ssh_user) {
            exit!(
                "invalid readiness",
                "readiness.ssh_user {:?} is not a valid login name",
                self.readiness.ssh_user
            );
        }
        if !Regex::new(r"^[A-Za-z0-9._-]+$")?.is_match(&self.readiness.marker) {
            exit!(
                "invalid readiness",
                "readiness.marker {:?} must be a plain file name",
                self.readiness.marker
            );
        }
        if self.readiness.interval_secs == 0 {
            exit!("invalid readiness", "readiness.interval_secs must be greater than zero");
        }
        if self.provider == "openstack" {
            if self.provider_network_name.is_none() {
                exit!("missing provider_network_name", "provider_network_name must be set");
            }
            if self.private_network_name.is_none() {
                exit!("missing private_network_name", "private_network_name must be set");
            }
        }
        Ok(())
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home::home_dir()
            .ok_or_else(|| anyhow!("could not determine the home directory"))?
            .join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

pub fn parse_config_str(config: &str) -> Result<Config> {
    let config: Config = toml::from_str(config)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(file: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(err) => exit!(err, "Could not read config file {}", file),
    };

    let config = match parse_config_str(&config) {
        Ok(c) => c,
        Err(err) => exit!(err, "Could not parse config file {}", file),
    };

    info!("config file parsed");
    Ok(config)
}
