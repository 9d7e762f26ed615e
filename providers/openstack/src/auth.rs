use anyhow::{anyhow, bail, Context, Result};
use common::config::OpenStackConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_name: String,
    pub region: Option<String>,
    pub interface: String,
}

impl Credentials {
    pub fn resolve(config: &OpenStackConfig) -> Result<Self> {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    fn resolve_with(config: &OpenStackConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |value: &Option<String>, key: &str| {
            value
                .clone()
                .or_else(|| env(key))
                .filter(|v| !v.trim().is_empty())
        };
        let require = |value: &Option<String>, key: &str| {
            pick(value, key).ok_or_else(|| anyhow!("openstack credentials: {key} is not set"))
        };

        Ok(Self {
            auth_url: require(&config.auth_url, "OS_AUTH_URL")?,
            username: require(&config.username, "OS_USERNAME")?,
            password: require(&config.password, "OS_PASSWORD")?,
            project_name: require(&config.project_name, "OS_PROJECT_NAME")?,
            user_domain_name: pick(&config.user_domain_name, "OS_USER_DOMAIN_NAME")
                .unwrap_or_else(|| "Default".to_owned()),
            project_domain_name: pick(&config.project_domain_name, "OS_PROJECT_DOMAIN_NAME")
                .unwrap_or_else(|| "Default".to_owned()),
            region: pick(&config.region, "OS_REGION_NAME"),
            interface: pick(&config.interface, "OS_INTERFACE")
                .unwrap_or_else(|| "public".to_owned()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
    expires_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Endpoint {
    pub interface: String,
    pub region_id: Option<String>,
    pub region: Option<String>,
    pub url: String,
}

/// A scoped token plus the service endpoints the provisioner talks to.
/// Endpoint urls never carry a trailing slash.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub compute: String,
    pub image: String,
    pub network: String,
    pub dns: String,
}

pub async fn authenticate(client: &Client, credentials: &Credentials) -> Result<Session> {
    let url = format!(
        "{}/auth/tokens",
        versioned(&credentials.auth_url, "v3")
    );
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": credentials.username,
                        "domain": { "name": credentials.user_domain_name },
                        "password": credentials.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": credentials.project_name,
                    "domain": { "name": credentials.project_domain_name },
                }
            }
        }
    });

    debug!("POST {url}");
    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("could not reach keystone at {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("keystone authentication failed: status={} body={}", status.as_u16(), text);
    }

    let token = resp
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .ok_or_else(|| anyhow!("keystone response carried no X-Subject-Token header"))?;
    let body: TokenResponse = resp.json().await?;
    info!(
        "authenticated as {} in project {} (token expires {})",
        credentials.username,
        credentials.project_name,
        body.token.expires_at.as_deref().unwrap_or("never")
    );

    let catalog = &body.token.catalog;
    let region = credentials.region.as_deref();
    let interface = credentials.interface.as_str();
    Ok(Session {
        token,
        compute: select_endpoint(catalog, "compute", interface, region)?,
        image: versioned(&select_endpoint(catalog, "image", interface, region)?, "v2"),
        network: versioned(&select_endpoint(catalog, "network", interface, region)?, "v2.0"),
        dns: versioned(&select_endpoint(catalog, "dns", interface, region)?, "v2"),
    })
}

pub(crate) fn select_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .filter(|endpoint| endpoint.interface == interface)
        .find(|endpoint| match region {
            Some(region) => {
                endpoint.region_id.as_deref() == Some(region)
                    || endpoint.region.as_deref() == Some(region)
            }
            None => true,
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_owned())
        .ok_or_else(|| {
            anyhow!(
                "no {interface} {service_type} endpoint in the service catalog{}",
                region.map(|r| format!(" for region {r}")).unwrap_or_default()
            )
        })
}

/// Appends the API version segment unless the catalog url already ends in one.
pub(crate) fn versioned(url: &str, version: &str) -> String {
    let url = url.trim_end_matches('/');
    let last = url.rsplit('/').next().unwrap_or_default();
    let has_version = last.len() > 1
        && last.starts_with('v')
        && last[1..].chars().all(|c| c.is_ascii_digit() || c == '.');
    if has_version {
        url.to_owned()
    } else {
        format!("{url}/{version}")
    }
}
