use anyhow::{anyhow, Result};
use common::provider::{DnsZone, RecordSet, RecordSetRequest};
use serde::Deserialize;
use serde_json::json;

use crate::OpenStack;

#[derive(Debug, Deserialize)]
struct Zones {
    zones: Vec<ZoneBody>,
}

#[derive(Debug, Deserialize)]
struct ZoneBody {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordSetBody {
    id: String,
    name: String,
    #[serde(default)]
    records: Vec<String>,
}

pub(crate) async fn get_dns_zone(os: &OpenStack, name: &str) -> Result<DnsZone> {
    let url = format!("{}/zones", os.session.dns);
    let resp: Zones = os
        .send(os.get(&url).query(&[("name", name)]), &format!("look up zone {name}"))
        .await?;
    resp.zones
        .into_iter()
        .find(|z| z.name == name)
        .map(|z| DnsZone { id: z.id, name: z.name })
        .ok_or_else(|| anyhow!("dns zone {name} not found"))
}

pub(crate) async fn create_record_set(os: &OpenStack, request: &RecordSetRequest) -> Result<RecordSet> {
    let url = format!("{}/zones/{}/recordsets", os.session.dns, request.zone_id);
    let body = json!({
        "name": request.name,
        "type": request.record_type,
        "records": request.records,
        "ttl": request.ttl,
    });
    let resp: RecordSetBody = os
        .send(os.post(&url).json(&body), &format!("create record set {}", request.name))
        .await?;
    Ok(RecordSet {
        id: resp.id,
        zone_id: request.zone_id.clone(),
        name: resp.name,
        records: resp.records,
    })
}

pub(crate) async fn delete_record_set(os: &OpenStack, record_set: &RecordSet) -> Result<()> {
    let url = format!(
        "{}/zones/{}/recordsets/{}",
        os.session.dns, record_set.zone_id, record_set.id
    );
    os.send_delete(&url, &format!("delete record set {}", record_set.name))
        .await
}
