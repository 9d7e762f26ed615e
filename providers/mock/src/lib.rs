use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    sync::Mutex,
};

use anyhow::{bail, Result};
use common::provider::*;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    allocated: u8,
    calls: Vec<String>,
    live: BTreeMap<String, String>,
    zones: BTreeMap<String, String>,
    user_data: BTreeMap<String, String>,
}

/// Cloud that only exists in memory. Ids are random, floating addresses come
/// from 203.0.113.0/24 and fixed addresses from 10.0.0.0/24.
pub struct Mock {
    inner: Mutex<Inner>,
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Mock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes `name` resolvable by `get_dns_zone`. Without any registered
    /// zone every lookup succeeds.
    pub fn with_zone(self, name: &str) -> Self {
        self.lock()
            .zones
            .insert(name.to_owned(), uuid::Uuid::new_v4().to_string());
        self
    }

    /// Every call made so far, as `<operation> <subject>`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    /// User data the named instance was booted with.
    pub fn user_data(&self, instance: &str) -> Option<String> {
        self.lock().user_data.get(instance).cloned()
    }

    /// Resources created and not yet deleted, id -> kind.
    pub fn live(&self) -> BTreeMap<String, String> {
        self.lock().live.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create(&self, kind: &str, subject: &str) -> (String, u8) {
        let mut inner = self.lock();
        inner.allocated = inner.allocated.wrapping_add(1);
        let id = uuid::Uuid::new_v4().to_string();
        inner.calls.push(format!("create_{kind} {subject}"));
        inner.live.insert(id.clone(), kind.to_owned());
        info!("mock created {kind} {subject} ({id})");
        (id, inner.allocated)
    }

    fn delete(&self, kind: &str, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(format!("delete_{kind} {id}"));
        match inner.live.remove(id) {
            Some(k) if k == kind => Ok(()),
            Some(k) => bail!("{id} is a {k}, not a {kind}"),
            None => bail!("no {kind} with id {id}"),
        }
    }
}

#[async_trait::async_trait]
impl CloudProvider for Mock {
    fn name(&self) -> String {
        "mock".to_owned()
    }

    async fn create_keypair(&self, name: &str, public_key: &str) -> Result<Keypair> {
        if !public_key.starts_with("ssh-") {
            bail!("keypair {name}: public key is not in OpenSSH format");
        }
        let mut inner = self.lock();
        inner.calls.push(format!("create_keypair {name}"));
        inner.live.insert(name.to_owned(), "keypair".to_owned());
        Ok(Keypair {
            name: name.to_owned(),
            fingerprint: None,
        })
    }

    async fn delete_keypair(&self, keypair: &Keypair) -> Result<()> {
        self.delete("keypair", &keypair.name)
    }

    async fn create_image(&self, request: &ImageRequest) -> Result<Image> {
        let size = tokio::fs::metadata(&request.local_file_path).await?.len();
        let (id, _) = self.create("image", &request.name);
        Ok(Image {
            id,
            name: request.name.clone(),
            size_bytes: Some(size),
            status: "active".to_owned(),
        })
    }

    async fn delete_image(&self, image: &Image) -> Result<()> {
        self.delete("image", &image.id)
    }

    async fn create_flavor(&self, request: &FlavorRequest) -> Result<Flavor> {
        let (id, _) = self.create("flavor", &request.name);
        Ok(Flavor {
            id,
            name: request.name.clone(),
        })
    }

    async fn delete_flavor(&self, flavor: &Flavor) -> Result<()> {
        self.delete("flavor", &flavor.id)
    }

    async fn create_security_group(&self, name: &str, _: &str) -> Result<SecurityGroup> {
        let (id, _) = self.create("security_group", name);
        Ok(SecurityGroup {
            id,
            name: name.to_owned(),
        })
    }

    async fn delete_security_group(&self, group: &SecurityGroup) -> Result<()> {
        self.delete("security_group", &group.id)
    }

    async fn create_security_rule(&self, request: &SecurityRuleRequest) -> Result<SecurityRule> {
        if self.lock().live.get(&request.security_group_id).map(String::as_str)
            != Some("security_group")
        {
            bail!("security group {} does not exist", request.security_group_id);
        }
        let (id, _) = self.create("security_rule", &request.description);
        Ok(SecurityRule {
            id,
            security_group_id: request.security_group_id.clone(),
            description: request.description.clone(),
        })
    }

    async fn delete_security_rule(&self, rule: &SecurityRule) -> Result<()> {
        self.delete("security_rule", &rule.id)
    }

    async fn create_floating_ip(&self, pool: &str) -> Result<FloatingIp> {
        let (id, n) = self.create("floating_ip", pool);
        Ok(FloatingIp {
            id,
            address: IpAddr::V4(Ipv4Addr::new(203, 0, 113, n)),
        })
    }

    async fn delete_floating_ip(&self, floating_ip: &FloatingIp) -> Result<()> {
        self.delete("floating_ip", &floating_ip.id)
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        if request.user_data.is_empty() {
            bail!("instance {} has no user data", request.name);
        }
        let (id, n) = self.create("instance", &request.name);
        self.lock()
            .user_data
            .insert(request.name.clone(), request.user_data.clone());
        Ok(Instance {
            id,
            name: request.name.clone(),
            fixed_ip_v4: Ipv4Addr::new(10, 0, 0, n),
        })
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        self.delete("instance", &instance.id)
    }

    async fn associate_floating_ip(
        &self,
        floating_ip: &FloatingIp,
        instance_id: &str,
        fixed_ip: Ipv4Addr,
    ) -> Result<FloatingIpAssociation> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("associate_floating_ip {}", floating_ip.address));
        if inner.live.get(instance_id).map(String::as_str) != Some("instance") {
            bail!("instance {instance_id} does not exist");
        }
        Ok(FloatingIpAssociation {
            floating_ip_id: floating_ip.id.clone(),
            floating_ip: floating_ip.address,
            instance_id: instance_id.to_owned(),
            fixed_ip,
        })
    }

    async fn disassociate_floating_ip(&self, association: &FloatingIpAssociation) -> Result<()> {
        self.lock()
            .calls
            .push(format!("disassociate_floating_ip {}", association.floating_ip));
        Ok(())
    }

    async fn get_dns_zone(&self, name: &str) -> Result<DnsZone> {
        let mut inner = self.lock();
        inner.calls.push(format!("get_dns_zone {name}"));
        let id = if inner.zones.is_empty() {
            format!("zone-{}", name.trim_end_matches('.'))
        } else {
            match inner.zones.get(name) {
                Some(id) => id.clone(),
                None => bail!("zone {name} not found"),
            }
        };
        Ok(DnsZone {
            id,
            name: name.to_owned(),
        })
    }

    async fn create_record_set(&self, request: &RecordSetRequest) -> Result<RecordSet> {
        let (id, _) = self.create("record_set", &request.name);
        Ok(RecordSet {
            id,
            zone_id: request.zone_id.clone(),
            name: request.name.clone(),
            records: request.records.clone(),
        })
    }

    async fn delete_record_set(&self, record_set: &RecordSet) -> Result<()> {
        self.delete("record_set", &record_set.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_distinct_addresses() {
        let mock = Mock::new();
        let a = mock.create_floating_ip("public").await.unwrap();
        let b = mock.create_floating_ip("public").await.unwrap();
        assert_ne!(a.address, b.address);
        assert_eq!(mock.count("create_floating_ip"), 2);
    }

    #[tokio::test]
    async fn rules_need_an_existing_group() {
        let mock = Mock::new();
        let request = SecurityRuleRequest {
            security_group_id: "nope".into(),
            direction: "ingress".into(),
            ethertype: "IPv4".into(),
            protocol: "icmp".into(),
            port_range: None,
            remote_ip_prefix: "0.0.0.0/0".into(),
            description: "Allow incoming icmp".into(),
        };
        assert!(mock.create_security_rule(&request).await.is_err());

        let sg = mock.create_security_group("reg1-sg", "").await.unwrap();
        let request = SecurityRuleRequest {
            security_group_id: sg.id,
            ..request
        };
        assert!(mock.create_security_rule(&request).await.is_ok());
    }

    #[tokio::test]
    async fn delete_forgets_the_resource() {
        let mock = Mock::new();
        let flavor = mock
            .create_flavor(&FlavorRequest {
                name: "reg1-flavor".into(),
                vcpus: 2,
                ram_mb: 4096,
                disk_gb: 20,
                is_public: true,
            })
            .await
            .unwrap();
        assert_eq!(mock.live().len(), 1);
        mock.delete_flavor(&flavor).await.unwrap();
        assert!(mock.live().is_empty());
        assert!(mock.delete_flavor(&flavor).await.is_err());
    }

    #[tokio::test]
    async fn unknown_zone_is_an_error_once_zones_are_registered() {
        let mock = Mock::new().with_zone("example.com.");
        assert!(mock.get_dns_zone("example.com.").await.is_ok());
        assert!(mock.get_dns_zone("example.org.").await.is_err());
    }
}
