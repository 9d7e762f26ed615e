use std::sync::Arc;

use anyhow::Result;
use common::{config::Config, exit, provider::CloudProvider};
use tracing::info;

pub const PROVIDERS: &[&str] = &["openstack", "mock"];

pub async fn get_provider(config: &Config) -> Result<Arc<dyn CloudProvider>> {
    let provider: Arc<dyn CloudProvider> = match config.provider.as_str() {
        "openstack" => Arc::new(openstack::OpenStack::connect(&config.openstack).await?),
        "mock" => Arc::new(mock::Mock::new()),
        other => exit!(
            "unknown provider",
            "Unknown provider {}, expected one of {:?}",
            other,
            PROVIDERS
        ),
    };
    info!("using provider {}", provider.name());
    Ok(provider)
}
