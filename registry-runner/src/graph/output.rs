use std::collections::BTreeMap;

use common::provider::*;
use serde::{Deserialize, Serialize};

use super::GraphError;

/// What a node hands to the nodes that depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Output {
    Keypair(Keypair),
    Image(Image),
    Flavor(Flavor),
    SecurityGroup(SecurityGroup),
    SecurityRule(SecurityRule),
    FloatingIp(FloatingIp),
    Zone(DnsZone),
    Rendered(String),
    Instance(Instance),
    Association(FloatingIpAssociation),
    Record(RecordSet),
    Ready,
}

impl Output {
    pub fn kind(&self) -> &'static str {
        match self {
            Output::Keypair(_) => "keypair",
            Output::Image(_) => "image",
            Output::Flavor(_) => "flavor",
            Output::SecurityGroup(_) => "security group",
            Output::SecurityRule(_) => "security rule",
            Output::FloatingIp(_) => "floating ip",
            Output::Zone(_) => "dns zone",
            Output::Rendered(_) => "rendered template",
            Output::Instance(_) => "instance",
            Output::Association(_) => "floating ip association",
            Output::Record(_) => "record set",
            Output::Ready => "readiness",
        }
    }
}

/// Outputs of exactly the nodes a node declared as dependencies.
#[derive(Debug, Clone)]
pub struct Inputs {
    node: String,
    outputs: BTreeMap<String, Output>,
}

macro_rules! input {
    ($fn:ident, $variant:ident, $ty:ty, $kind:literal) => {
        pub fn $fn(&self, name: &str) -> Result<&$ty, GraphError> {
            match self.outputs.get(name) {
                Some(Output::$variant(v)) => Ok(v),
                _ => Err(self.missing(name, $kind)),
            }
        }
    };
}

impl Inputs {
    pub(super) fn new(node: &str, outputs: BTreeMap<String, Output>) -> Self {
        Self {
            node: node.to_owned(),
            outputs,
        }
    }

    fn missing(&self, name: &str, expected: &'static str) -> GraphError {
        GraphError::MissingInput {
            node: self.node.clone(),
            input: name.to_owned(),
            expected,
        }
    }

    input!(keypair, Keypair, Keypair, "keypair");
    input!(image, Image, Image, "image");
    input!(flavor, Flavor, Flavor, "flavor");
    input!(security_group, SecurityGroup, SecurityGroup, "security group");
    input!(floating_ip, FloatingIp, FloatingIp, "floating ip");
    input!(zone, Zone, DnsZone, "dns zone");
    input!(rendered, Rendered, String, "rendered template");
    input!(instance, Instance, Instance, "instance");
    input!(association, Association, FloatingIpAssociation, "floating ip association");
}
