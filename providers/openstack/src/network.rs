use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Context, Result};
use common::provider::*;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::OpenStack;

#[derive(Debug, Deserialize)]
struct Networks {
    networks: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupEnvelope {
    security_group: SecurityGroupBody,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupBody {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SecurityRuleEnvelope {
    security_group_rule: IdOnly,
}

#[derive(Debug, Deserialize)]
struct FloatingIpEnvelope {
    floatingip: FloatingIpBody,
}

#[derive(Debug, Deserialize)]
struct FloatingIpBody {
    id: String,
    floating_ip_address: String,
}

#[derive(Debug, Deserialize)]
struct Ports {
    ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
struct Port {
    id: String,
    #[serde(default)]
    fixed_ips: Vec<PortFixedIp>,
}

#[derive(Debug, Deserialize)]
struct PortFixedIp {
    ip_address: String,
}

pub(crate) async fn network_id(os: &OpenStack, name: &str) -> Result<String> {
    let url = format!("{}/networks", os.session.network);
    let resp: Networks = os
        .send(os.get(&url).query(&[("name", name)]), &format!("look up network {name}"))
        .await?;
    resp.networks
        .into_iter()
        .next()
        .map(|n| n.id)
        .ok_or_else(|| anyhow!("network {name} not found"))
}

pub(crate) async fn create_security_group(
    os: &OpenStack,
    name: &str,
    description: &str,
) -> Result<SecurityGroup> {
    let url = format!("{}/security-groups", os.session.network);
    let body = json!({ "security_group": { "name": name, "description": description } });
    let resp: SecurityGroupEnvelope = os
        .send(os.post(&url).json(&body), &format!("create security group {name}"))
        .await?;
    Ok(SecurityGroup {
        id: resp.security_group.id,
        name: resp.security_group.name,
    })
}

pub(crate) async fn delete_security_group(os: &OpenStack, group: &SecurityGroup) -> Result<()> {
    let url = format!("{}/security-groups/{}", os.session.network, group.id);
    os.send_delete(&url, &format!("delete security group {}", group.name))
        .await
}

pub(crate) async fn create_security_rule(
    os: &OpenStack,
    request: &SecurityRuleRequest,
) -> Result<SecurityRule> {
    let mut rule = json!({
        "security_group_id": request.security_group_id,
        "direction": request.direction,
        "ethertype": request.ethertype,
        "protocol": request.protocol,
        "remote_ip_prefix": request.remote_ip_prefix,
        "description": request.description,
    });
    if let Some((min, max)) = request.port_range {
        rule["port_range_min"] = json!(min);
        rule["port_range_max"] = json!(max);
    }

    let url = format!("{}/security-group-rules", os.session.network);
    let resp: SecurityRuleEnvelope = os
        .send(
            os.post(&url).json(&json!({ "security_group_rule": rule })),
            &format!("create security group rule ({})", request.description),
        )
        .await?;
    Ok(SecurityRule {
        id: resp.security_group_rule.id,
        security_group_id: request.security_group_id.clone(),
        description: request.description.clone(),
    })
}

pub(crate) async fn delete_security_rule(os: &OpenStack, rule: &SecurityRule) -> Result<()> {
    let url = format!("{}/security-group-rules/{}", os.session.network, rule.id);
    os.send_delete(&url, &format!("delete security group rule ({})", rule.description))
        .await
}

pub(crate) async fn create_floating_ip(os: &OpenStack, pool: &str) -> Result<FloatingIp> {
    let network = network_id(os, pool).await?;
    let url = format!("{}/floatingips", os.session.network);
    let body = json!({ "floatingip": { "floating_network_id": network } });
    let resp: FloatingIpEnvelope = os
        .send(os.post(&url).json(&body), &format!("allocate floating ip from {pool}"))
        .await?;
    let address: IpAddr = resp
        .floatingip
        .floating_ip_address
        .parse()
        .context("neutron returned an unparseable floating ip")?;
    Ok(FloatingIp {
        id: resp.floatingip.id,
        address,
    })
}

pub(crate) async fn delete_floating_ip(os: &OpenStack, floating_ip: &FloatingIp) -> Result<()> {
    let url = format!("{}/floatingips/{}", os.session.network, floating_ip.id);
    os.send_delete(&url, &format!("release floating ip {}", floating_ip.address))
        .await
}

pub(crate) async fn associate_floating_ip(
    os: &OpenStack,
    floating_ip: &FloatingIp,
    instance_id: &str,
    fixed_ip: Ipv4Addr,
) -> Result<FloatingIpAssociation> {
    let url = format!("{}/ports", os.session.network);
    let ports: Ports = os
        .send(
            os.get(&url).query(&[("device_id", instance_id)]),
            &format!("list ports of server {instance_id}"),
        )
        .await?;
    let wanted = fixed_ip.to_string();
    let port = ports
        .ports
        .into_iter()
        .find(|p| p.fixed_ips.iter().any(|ip| ip.ip_address == wanted))
        .ok_or_else(|| anyhow!("server {instance_id} has no port with address {fixed_ip}"))?;

    set_port(os, floating_ip, json!(port.id), json!(wanted)).await?;
    Ok(FloatingIpAssociation {
        floating_ip_id: floating_ip.id.clone(),
        floating_ip: floating_ip.address,
        instance_id: instance_id.to_owned(),
        fixed_ip,
    })
}

pub(crate) async fn disassociate_floating_ip(
    os: &OpenStack,
    association: &FloatingIpAssociation,
) -> Result<()> {
    let floating_ip = FloatingIp {
        id: association.floating_ip_id.clone(),
        address: association.floating_ip,
    };
    set_port(os, &floating_ip, Value::Null, Value::Null).await
}

async fn set_port(os: &OpenStack, floating_ip: &FloatingIp, port_id: Value, fixed_ip: Value) -> Result<()> {
    let url = format!("{}/floatingips/{}", os.session.network, floating_ip.id);
    let mut body = json!({ "floatingip": { "port_id": port_id } });
    if !fixed_ip.is_null() {
        body["floatingip"]["fixed_ip_address"] = fixed_ip;
    }
    os.checked(
        os.put(&url).json(&body),
        &format!("update floating ip {}", floating_ip.address),
    )
    .await?;
    Ok(())
}
