use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    pub name: String,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub size_bytes: Option<u64>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: String,
    pub security_group_id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// First fixed IPv4 on the instance's only network
    pub fixed_ip_v4: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIpAssociation {
    pub floating_ip_id: String,
    pub floating_ip: IpAddr,
    pub instance_id: String,
    pub fixed_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    pub id: String,
    pub zone_id: String,
    pub name: String,
    pub records: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub name: String,
    pub container_format: String,
    pub disk_format: String,
    pub local_file_path: PathBuf,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FlavorRequest {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct SecurityRuleRequest {
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    pub protocol: String,
    /// Inclusive (min, max); `None` for protocols without ports
    pub port_range: Option<(u16, u16)>,
    pub remote_ip_prefix: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub source_type: String,
    pub destination_type: String,
    pub delete_on_termination: bool,
    pub volume_size: u64,
    pub uuid: String,
}

#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    pub flavor_id: String,
    pub key_pair: String,
    pub security_groups: Vec<String>,
    pub user_data: String,
    pub block_devices: Vec<BlockDevice>,
    pub network_name: String,
}

#[derive(Debug, Clone)]
pub struct RecordSetRequest {
    pub zone_id: String,
    pub name: String,
    pub records: Vec<String>,
    pub ttl: u32,
    pub record_type: String,
}

/// The cloud calls the provisioning graph is allowed to make. Every create is
/// expected to return once the resource is usable, every delete once it is gone.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> String;

    async fn create_keypair(&self, name: &str, public_key: &str) -> Result<Keypair>;
    async fn delete_keypair(&self, keypair: &Keypair) -> Result<()>;

    async fn create_image(&self, request: &ImageRequest) -> Result<Image>;
    async fn delete_image(&self, image: &Image) -> Result<()>;

    async fn create_flavor(&self, request: &FlavorRequest) -> Result<Flavor>;
    async fn delete_flavor(&self, flavor: &Flavor) -> Result<()>;

    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup>;
    async fn delete_security_group(&self, group: &SecurityGroup) -> Result<()>;

    async fn create_security_rule(&self, request: &SecurityRuleRequest) -> Result<SecurityRule>;
    async fn delete_security_rule(&self, rule: &SecurityRule) -> Result<()>;

    /// `pool` is the name of the external network to allocate from
    async fn create_floating_ip(&self, pool: &str) -> Result<FloatingIp>;
    async fn delete_floating_ip(&self, floating_ip: &FloatingIp) -> Result<()>;

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance>;
    async fn delete_instance(&self, instance: &Instance) -> Result<()>;

    async fn associate_floating_ip(
        &self,
        floating_ip: &FloatingIp,
        instance_id: &str,
        fixed_ip: Ipv4Addr,
    ) -> Result<FloatingIpAssociation>;
    async fn disassociate_floating_ip(&self, association: &FloatingIpAssociation) -> Result<()>;

    /// `name` is the fully qualified zone name, trailing dot included
    async fn get_dns_zone(&self, name: &str) -> Result<DnsZone>;

    async fn create_record_set(&self, request: &RecordSetRequest) -> Result<RecordSet>;
    async fn delete_record_set(&self, record_set: &RecordSet) -> Result<()>;
}
