use std::{net::Ipv4Addr, time::Duration};

use anyhow::{bail, Context, Result};
use common::{config::OpenStackConfig, provider::*};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub use auth::{Credentials, Session};

mod auth;
mod compute;
mod dns;
mod image;
mod network;

/// OpenStack over its public REST APIs: Keystone v3 for the token, then Nova,
/// Glance, Neutron and Designate from the service catalog.
pub struct OpenStack {
    client: Client,
    session: Session,
    poll_interval: Duration,
}

impl OpenStack {
    pub async fn connect(config: &OpenStackConfig) -> Result<Self> {
        let credentials = Credentials::resolve(config)?;
        // No overall timeout, image uploads can take a long time.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let session = auth::authenticate(&client, &credentials).await?;
        Ok(Self::with_session(client, session))
    }

    pub fn with_session(client: Client, session: Session) -> Self {
        Self {
            client,
            session,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Arms a delete of `url` for a resource whose create has not finished.
    fn rollback(&self, url: String, what: String) -> Rollback {
        Rollback {
            client: self.client.clone(),
            token: self.session.token.clone(),
            url,
            what,
            armed: true,
        }
    }

    fn get(&self, url: &str) -> RequestBuilder {
        debug!("GET {url}");
        self.client.get(url).header("X-Auth-Token", &self.session.token)
    }

    fn post(&self, url: &str) -> RequestBuilder {
        debug!("POST {url}");
        self.client.post(url).header("X-Auth-Token", &self.session.token)
    }

    fn put(&self, url: &str) -> RequestBuilder {
        debug!("PUT {url}");
        self.client.put(url).header("X-Auth-Token", &self.session.token)
    }

    fn delete_req(&self, url: &str) -> RequestBuilder {
        debug!("DELETE {url}");
        self.client.delete(url).header("X-Auth-Token", &self.session.token)
    }

    async fn checked(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("{what} failed: status={} body={}", status.as_u16(), text);
        }
        Ok(resp)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T> {
        let resp = self.checked(req, what).await?;
        resp.json::<T>()
            .await
            .with_context(|| format!("{what}: unexpected response body"))
    }

    /// Deletes treat a 404 as already done so a half finished destroy can be re-run.
    async fn send_delete(&self, url: &str, what: &str) -> Result<()> {
        let resp = self
            .delete_req(url)
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            warn!("{what}: already gone");
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("{what} failed: status={} body={}", status.as_u16(), text);
        }
        Ok(())
    }
}

/// Deletes a half built resource. `run` does it in place after a failed
/// step; dropping an armed guard, as happens when the creating future is
/// cancelled, hands the delete to the runtime.
#[must_use]
struct Rollback {
    client: Client,
    token: String,
    url: String,
    what: String,
    armed: bool,
}

impl Rollback {
    fn disarm(mut self) {
        self.armed = false;
    }

    async fn run(mut self) {
        self.armed = false;
        remove(&self.client, &self.token, &self.url, &self.what).await;
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("{} left behind, delete it by hand", self.what);
            return;
        };
        let client = self.client.clone();
        let token = std::mem::take(&mut self.token);
        let url = std::mem::take(&mut self.url);
        let what = std::mem::take(&mut self.what);
        handle.spawn(async move { remove(&client, &token, &url, &what).await });
    }
}

async fn remove(client: &Client, token: &str, url: &str, what: &str) {
    warn!("removing half built {what}");
    match client.delete(url).header("X-Auth-Token", token).send().await {
        Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {}
        Ok(resp) => warn!("could not remove {what}: status={}", resp.status().as_u16()),
        Err(err) => warn!("could not remove {what}: {err}"),
    }
}

#[async_trait::async_trait]
impl CloudProvider for OpenStack {
    fn name(&self) -> String {
        "openstack".to_owned()
    }

    async fn create_keypair(&self, name: &str, public_key: &str) -> Result<Keypair> {
        compute::create_keypair(self, name, public_key).await
    }

    async fn delete_keypair(&self, keypair: &Keypair) -> Result<()> {
        compute::delete_keypair(self, keypair).await
    }

    async fn create_image(&self, request: &ImageRequest) -> Result<Image> {
        image::create_image(self, request).await
    }

    async fn delete_image(&self, image: &Image) -> Result<()> {
        image::delete_image(self, image).await
    }

    async fn create_flavor(&self, request: &FlavorRequest) -> Result<Flavor> {
        compute::create_flavor(self, request).await
    }

    async fn delete_flavor(&self, flavor: &Flavor) -> Result<()> {
        compute::delete_flavor(self, flavor).await
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        network::create_security_group(self, name, description).await
    }

    async fn delete_security_group(&self, group: &SecurityGroup) -> Result<()> {
        network::delete_security_group(self, group).await
    }

    async fn create_security_rule(&self, request: &SecurityRuleRequest) -> Result<SecurityRule> {
        network::create_security_rule(self, request).await
    }

    async fn delete_security_rule(&self, rule: &SecurityRule) -> Result<()> {
        network::delete_security_rule(self, rule).await
    }

    async fn create_floating_ip(&self, pool: &str) -> Result<FloatingIp> {
        network::create_floating_ip(self, pool).await
    }

    async fn delete_floating_ip(&self, floating_ip: &FloatingIp) -> Result<()> {
        network::delete_floating_ip(self, floating_ip).await
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        compute::create_instance(self, request).await
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        compute::delete_instance(self, instance).await
    }

    async fn associate_floating_ip(
        &self,
        floating_ip: &FloatingIp,
        instance_id: &str,
        fixed_ip: Ipv4Addr,
    ) -> Result<FloatingIpAssociation> {
        network::associate_floating_ip(self, floating_ip, instance_id, fixed_ip).await
    }

    async fn disassociate_floating_ip(&self, association: &FloatingIpAssociation) -> Result<()> {
        network::disassociate_floating_ip(self, association).await
    }

    async fn get_dns_zone(&self, name: &str) -> Result<DnsZone> {
        dns::get_dns_zone(self, name).await
    }

    async fn create_record_set(&self, request: &RecordSetRequest) -> Result<RecordSet> {
        dns::create_record_set(self, request).await
    }

    async fn delete_record_set(&self, record_set: &RecordSet) -> Result<()> {
        dns::delete_record_set(self, record_set).await
    }
}
