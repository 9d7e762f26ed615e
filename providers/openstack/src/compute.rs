use std::{collections::BTreeMap, net::Ipv4Addr, time::Instant};

use anyhow::{anyhow, bail, Result};
use base64::Engine;
use common::provider::*;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::{network, OpenStack};

/// Upper bound on waiting for Nova to build or remove a server.
const SERVER_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Debug, Deserialize)]
struct KeypairEnvelope {
    keypair: KeypairBody,
}

#[derive(Debug, Deserialize)]
struct KeypairBody {
    name: String,
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlavorEnvelope {
    flavor: FlavorBody,
}

#[derive(Debug, Deserialize)]
struct FlavorBody {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Debug, Deserialize)]
struct ServerBody {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<ServerAddress>>,
    fault: Option<ServerFault>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerAddress {
    addr: String,
    version: u8,
    #[serde(rename = "OS-EXT-IPS:type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerFault {
    message: String,
}

pub(crate) async fn create_keypair(os: &OpenStack, name: &str, public_key: &str) -> Result<Keypair> {
    let url = format!("{}/os-keypairs", os.session.compute);
    let body = json!({ "keypair": { "name": name, "public_key": public_key.trim() } });
    let resp: KeypairEnvelope = os
        .send(os.post(&url).json(&body), &format!("create keypair {name}"))
        .await?;
    Ok(Keypair {
        name: resp.keypair.name,
        fingerprint: resp.keypair.fingerprint,
    })
}

pub(crate) async fn delete_keypair(os: &OpenStack, keypair: &Keypair) -> Result<()> {
    let url = format!("{}/os-keypairs/{}", os.session.compute, keypair.name);
    os.send_delete(&url, &format!("delete keypair {}", keypair.name))
        .await
}

pub(crate) async fn create_flavor(os: &OpenStack, request: &FlavorRequest) -> Result<Flavor> {
    let url = format!("{}/flavors", os.session.compute);
    let body = json!({
        "flavor": {
            "name": request.name,
            "vcpus": request.vcpus,
            "ram": request.ram_mb,
            "disk": request.disk_gb,
            "os-flavor-access:is_public": request.is_public,
        }
    });
    let resp: FlavorEnvelope = os
        .send(os.post(&url).json(&body), &format!("create flavor {}", request.name))
        .await?;
    Ok(Flavor {
        id: resp.flavor.id,
        name: resp.flavor.name,
    })
}

pub(crate) async fn delete_flavor(os: &OpenStack, flavor: &Flavor) -> Result<()> {
    let url = format!("{}/flavors/{}", os.session.compute, flavor.id);
    os.send_delete(&url, &format!("delete flavor {}", flavor.name))
        .await
}

pub(crate) async fn create_instance(os: &OpenStack, request: &InstanceRequest) -> Result<Instance> {
    let network_id = network::network_id(os, &request.network_name).await?;
    let block_devices: Vec<_> = request
        .block_devices
        .iter()
        .enumerate()
        .map(|(i, d)| {
            json!({
                "boot_index": i,
                "source_type": d.source_type,
                "destination_type": d.destination_type,
                "delete_on_termination": d.delete_on_termination,
                "volume_size": d.volume_size,
                "uuid": d.uuid,
            })
        })
        .collect();
    let security_groups: Vec<_> = request
        .security_groups
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    let body = json!({
        "server": {
            "name": request.name,
            "flavorRef": request.flavor_id,
            "key_name": request.key_pair,
            "security_groups": security_groups,
            "user_data": base64::engine::general_purpose::STANDARD.encode(&request.user_data),
            "block_device_mapping_v2": block_devices,
            "networks": [{ "uuid": network_id }],
        }
    });

    let url = format!("{}/servers", os.session.compute);
    let resp: ServerEnvelope = os
        .send(os.post(&url).json(&body), &format!("create server {}", request.name))
        .await?;
    info!("server {} ({}) requested, waiting for ACTIVE", request.name, resp.server.id);

    let rollback = os.rollback(
        format!("{}/servers/{}", os.session.compute, resp.server.id),
        format!("server {}", resp.server.id),
    );
    match wait_for_active(os, &resp.server.id, &request.network_name).await {
        Ok(instance) => {
            rollback.disarm();
            Ok(instance)
        }
        Err(err) => {
            rollback.run().await;
            Err(err)
        }
    }
}

async fn get_server(os: &OpenStack, id: &str) -> Result<Option<ServerBody>> {
    let url = format!("{}/servers/{}", os.session.compute, id);
    let resp = os
        .get(&url)
        .send()
        .await
        .map_err(|e| anyhow!("get server {id}: {e}"))?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        bail!("get server {id} failed: status={status} body={text}");
    }
    let server: ServerEnvelope = resp.json().await?;
    Ok(Some(server.server))
}

async fn wait_for_active(os: &OpenStack, id: &str, network_name: &str) -> Result<Instance> {
    let start = Instant::now();
    loop {
        let server = get_server(os, id)
            .await?
            .ok_or_else(|| anyhow!("server {id} disappeared while building"))?;
        debug!("server {id} status {}", server.status);
        match server.status.as_str() {
            "ACTIVE" => {
                let fixed_ip_v4 = fixed_ipv4(&server.addresses, network_name).ok_or_else(|| {
                    anyhow!("server {id} is ACTIVE but has no fixed IPv4 on {network_name}")
                })?;
                return Ok(Instance {
                    id: server.id,
                    name: server.name,
                    fixed_ip_v4,
                });
            }
            "ERROR" => bail!(
                "server {id} failed to build: {}",
                server
                    .fault
                    .map(|f| f.message)
                    .unwrap_or_else(|| "no fault reported".to_owned())
            ),
            _ => {}
        }
        if start.elapsed().as_secs() > SERVER_TIMEOUT_SECS {
            bail!("server {id} still {} after {SERVER_TIMEOUT_SECS}s", server.status);
        }
        tokio::time::sleep(os.poll_interval).await;
    }
}

pub(crate) async fn delete_instance(os: &OpenStack, instance: &Instance) -> Result<()> {
    let url = format!("{}/servers/{}", os.session.compute, instance.id);
    os.send_delete(&url, &format!("delete server {}", instance.name))
        .await?;

    let start = Instant::now();
    while get_server(os, &instance.id).await?.is_some() {
        if start.elapsed().as_secs() > SERVER_TIMEOUT_SECS {
            bail!("server {} still present after {SERVER_TIMEOUT_SECS}s", instance.id);
        }
        tokio::time::sleep(os.poll_interval).await;
    }
    Ok(())
}

/// First fixed IPv4 on `network_name`, or on any network when that one is
/// not listed.
pub(crate) fn fixed_ipv4(
    addresses: &BTreeMap<String, Vec<ServerAddress>>,
    network_name: &str,
) -> Option<Ipv4Addr> {
    let fixed = |list: &Vec<ServerAddress>| {
        list.iter()
            .filter(|a| a.version == 4)
            .filter(|a| a.kind.as_deref() != Some("floating"))
            .find_map(|a| a.addr.parse::<Ipv4Addr>().ok())
    };
    match addresses.get(network_name) {
        Some(list) => fixed(list),
        None => addresses.values().find_map(fixed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses() -> BTreeMap<String, Vec<ServerAddress>> {
        serde_json::from_value(json!({
            "private": [
                { "addr": "fd00::5", "version": 6, "OS-EXT-IPS:type": "fixed" },
                { "addr": "203.0.113.9", "version": 4, "OS-EXT-IPS:type": "floating" },
                { "addr": "10.0.0.5", "version": 4, "OS-EXT-IPS:type": "fixed" }
            ],
            "other": [
                { "addr": "192.168.1.4", "version": 4 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn picks_fixed_ipv4_on_the_named_network() {
        assert_eq!(
            fixed_ipv4(&addresses(), "private"),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }

    #[test]
    fn falls_back_to_any_network() {
        let mut only_other = addresses();
        only_other.remove("private");
        assert_eq!(
            fixed_ipv4(&only_other, "private"),
            Some(Ipv4Addr::new(192, 168, 1, 4))
        );
        assert_eq!(fixed_ipv4(&BTreeMap::new(), "private"), None);
    }
}
