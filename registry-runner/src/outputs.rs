use std::{collections::BTreeMap, net::IpAddr};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::graph::Output;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exports {
    pub image_id: String,
    pub image_name: String,
    pub image_size: Option<u64>,
    pub image_status: String,
    pub registry_fip_address: IpAddr,
}

impl Exports {
    pub fn from_outputs(outputs: &BTreeMap<String, Output>) -> Result<Self> {
        let Some(Output::Image(image)) = outputs.get("image") else {
            return Err(anyhow!("no image has been provisioned"));
        };
        let Some(Output::FloatingIp(fip)) = outputs.get("registry_fip") else {
            return Err(anyhow!("no floating ip has been provisioned"));
        };
        Ok(Self {
            image_id: image.id.clone(),
            image_name: image.name.clone(),
            image_size: image.size_bytes,
            image_status: image.status.clone(),
            registry_fip_address: fip.address,
        })
    }

    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("image_id             {}", self.image_id),
            format!("image_name           {}", self.image_name),
            format!(
                "image_size           {}",
                self.image_size.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
            ),
            format!("image_status         {}", self.image_status),
            format!("registry_fip_address {}", self.registry_fip_address),
        ]
    }

    pub fn print(&self) {
        for line in self.lines() {
            println!("{line}");
        }
    }
}
