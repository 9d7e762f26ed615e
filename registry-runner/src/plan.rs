use std::{collections::BTreeMap, future::Future, sync::Arc};

use anyhow::Result;
use common::{config::Config, provider::*};
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::{
    graph::{Graph, GraphBuilder, GraphError, Inputs, Node, Output},
    image::ensure_image_file,
    keys::KeyPair,
    readiness::{self, PollSettings, ReadinessProbe, SshTarget},
    templates::Templates,
};

const INSTANCE_NAME: &str = "registry";
const RECORD_TTL: u32 = 3600;

/// Everything the graph's nodes reach for while running.
pub struct Context {
    pub config: Arc<Config>,
    pub provider: Arc<dyn CloudProvider>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub templates: Templates,
    pub keys: KeyPair,
    pub http: Client,
    pub cancel: CancellationToken,
}

impl Context {
    fn template_vars(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("cluster_name", self.config.cluster_name.clone()),
            ("dns_zone_name", self.config.dns_zone_name.clone()),
            ("registry_fqdn", self.config.registry_fqdn()),
        ])
    }

    fn zone_name(&self) -> String {
        format!("{}.", self.config.dns_zone_name.trim_end_matches('.'))
    }
}

fn task<F, Fut>(ctx: &Arc<Context>, name: &str, msgs: [&str; 3], f: F) -> Node
where
    F: Fn(Arc<Context>, Inputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Output>> + Send + 'static,
{
    let ctx = ctx.clone();
    Node::new(name, msgs, move |inputs| f(ctx.clone(), inputs))
}

/// The registry VM and everything around it.
pub fn provisioning_graph(ctx: &Arc<Context>) -> Result<Graph, GraphError> {
    let rule = |name: &str, protocol: &'static str, port: Option<u16>, description: &'static str| {
        task(
            ctx,
            name,
            ["Opening firewall", "Could not add firewall rule", "Firewall rule added"],
            move |ctx, inputs| security_rule(ctx, inputs, protocol, port, description),
        )
        .after(&["security_group"])
        .persisted()
    };
    let template = |name: &str, file: &'static str, vars: &'static [&'static str]| {
        task(
            ctx,
            name,
            ["Rendering template", "Could not render template", "Template rendered"],
            move |ctx, inputs| render_content(ctx, inputs, file, vars),
        )
        .after(&["registry_fip"])
    };

    GraphBuilder::new()
        .node(
            task(ctx, "keypair", ["Uploading keypair", "Could not upload keypair", "Keypair uploaded"], keypair)
                .persisted(),
        )
        .node(
            task(ctx, "image", ["Uploading image", "Could not upload image", "Image uploaded"], image)
                .persisted(),
        )
        .node(
            task(ctx, "flavor", ["Creating flavor", "Could not create flavor", "Flavor created"], flavor)
                .persisted(),
        )
        .node(
            task(
                ctx,
                "security_group",
                ["Creating security group", "Could not create security group", "Security group created"],
                security_group,
            )
            .persisted(),
        )
        .node(rule("sg_icmp", "icmp", None, "Allow incoming icmp"))
        .node(rule("sg_tcp_ssh", "tcp", Some(22), "Allow incoming ssh"))
        .node(rule("sg_tcp_registry", "tcp", Some(5000), "Allow incoming registry"))
        .node(rule("sg_tcp_etcd_discovery", "tcp", Some(8087), "Allow incoming etcd discovery service"))
        .node(
            task(
                ctx,
                "registry_fip",
                ["Allocating floating ip", "Could not allocate floating ip", "Floating ip allocated"],
                floating_ip,
            )
            .persisted(),
        )
        .node(template("push_images_tmpl", "push_images.sh.j2", &["registry_fqdn"]))
        .node(template("post_run_tmpl", "post_run.sh.j2", &["registry_fip_address", "registry_fqdn"]))
        .node(template(
            "etchosts_tmpl",
            "etchosts.j2",
            &["registry_fip_address", "cluster_name", "registry_fqdn"],
        ))
        .node(template(
            "etcd_discovery_conf_tmpl",
            "etcd_discovery_conf.j2",
            &["cluster_name", "dns_zone_name"],
        ))
        .node(
            task(
                ctx,
                "userdata_tmpl",
                ["Rendering user data", "Could not render user data", "User data rendered"],
                userdata,
            )
            .after(&["post_run_tmpl", "push_images_tmpl", "etchosts_tmpl", "etcd_discovery_conf_tmpl"]),
        )
        .node(
            task(ctx, "registry", ["Booting registry", "Could not boot registry", "Registry booted"], instance)
                .after(&["flavor", "keypair", "security_group", "image", "userdata_tmpl"])
                .persisted(),
        )
        .node(
            task(
                ctx,
                "registry_fip_assoc",
                ["Attaching floating ip", "Could not attach floating ip", "Floating ip attached"],
                associate,
            )
            .after(&["registry", "registry_fip"])
            .persisted(),
        )
        .node(task(
            ctx,
            "dns_zone",
            ["Looking up dns zone", "Could not find dns zone", "Dns zone found"],
            dns_zone,
        ))
        .node(
            task(
                ctx,
                "registry_dns_record",
                ["Creating dns record", "Could not create dns record", "Dns record created"],
                dns_record,
            )
            .after(&["registry_fip_assoc", "registry_fip", "dns_zone"])
            .persisted(),
        )
        .node(
            task(
                ctx,
                "wait_sleep",
                ["Waiting for ssh port", "Ssh port never opened", "Ssh port open"],
                wait_for_ssh,
            )
            .after(&["registry_fip_assoc", "registry_dns_record", "sg_tcp_ssh"]),
        )
        .node(
            task(
                ctx,
                "registry_ready",
                ["Waiting for registry", "Registry never became ready", "Registry ready"],
                wait_for_ready,
            )
            .after(&["wait_sleep", "registry_fip"]),
        )
        .build()
}

async fn keypair(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let name = format!("{}_key", ctx.config.cluster_name);
    let keypair = ctx.provider.create_keypair(&name, &ctx.keys.public_key).await?;
    Ok(Output::Keypair(keypair))
}

async fn image(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let config = &ctx.config.image;
    let local_file_path = ensure_image_file(
        &ctx.http,
        &config.download_url(),
        &config.file,
        config.sha256.as_deref(),
    )
    .await?;
    let properties = BTreeMap::from([
        ("hw_disk_bus".to_owned(), "scsi".to_owned()),
        ("hw_scsi_model".to_owned(), "virtio-scsi".to_owned()),
        ("os_type".to_owned(), "linux".to_owned()),
        ("os_distro".to_owned(), "debian".to_owned()),
        ("os_admin_user".to_owned(), "debian".to_owned()),
        ("os_version".to_owned(), config.os_version.clone()),
    ]);
    let request = ImageRequest {
        name: config.name.clone(),
        container_format: "bare".to_owned(),
        disk_format: "qcow2".to_owned(),
        local_file_path,
        properties,
    };
    Ok(Output::Image(ctx.provider.create_image(&request).await?))
}

async fn flavor(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let config = &ctx.config.flavor;
    let request = FlavorRequest {
        name: format!("{}-flavor", ctx.config.cluster_name),
        vcpus: config.vcpus,
        ram_mb: config.ram * 1024,
        disk_gb: config.disk,
        is_public: true,
    };
    Ok(Output::Flavor(ctx.provider.create_flavor(&request).await?))
}

async fn security_group(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let cluster = &ctx.config.cluster_name;
    let group = ctx
        .provider
        .create_security_group(&format!("{cluster}-sg"), &format!("Security Group for {cluster}"))
        .await?;
    Ok(Output::SecurityGroup(group))
}

async fn security_rule(
    ctx: Arc<Context>,
    inputs: Inputs,
    protocol: &'static str,
    port: Option<u16>,
    description: &'static str,
) -> Result<Output> {
    let group = inputs.security_group("security_group")?;
    let request = SecurityRuleRequest {
        security_group_id: group.id.clone(),
        direction: "ingress".to_owned(),
        ethertype: "IPv4".to_owned(),
        protocol: protocol.to_owned(),
        port_range: port.map(|p| (p, p)),
        remote_ip_prefix: "0.0.0.0/0".to_owned(),
        description: description.to_owned(),
    };
    Ok(Output::SecurityRule(ctx.provider.create_security_rule(&request).await?))
}

async fn floating_ip(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let pool = ctx.config.provider_network_name.clone().unwrap_or_default();
    Ok(Output::FloatingIp(ctx.provider.create_floating_ip(&pool).await?))
}

async fn render_content(
    ctx: Arc<Context>,
    inputs: Inputs,
    file: &'static str,
    wanted: &'static [&'static str],
) -> Result<Output> {
    let mut all = ctx.template_vars();
    all.insert("registry_fip_address", inputs.floating_ip("registry_fip")?.address.to_string());
    let vars = all.into_iter().filter(|(k, _)| wanted.contains(k)).collect();
    Ok(Output::Rendered(ctx.templates.render(file, &vars)?))
}

async fn userdata(ctx: Arc<Context>, inputs: Inputs) -> Result<Output> {
    let vars = BTreeMap::from([
        ("public_key", ctx.keys.public_key.trim_end().to_owned()),
        ("ssh_user", ctx.config.readiness.ssh_user.clone()),
        ("marker", ctx.config.readiness.marker.clone()),
        ("post_run", inputs.rendered("post_run_tmpl")?.clone()),
        ("push_images", inputs.rendered("push_images_tmpl")?.clone()),
        ("etcd_discovery_conf", inputs.rendered("etcd_discovery_conf_tmpl")?.clone()),
        ("etchosts", inputs.rendered("etchosts_tmpl")?.clone()),
    ]);
    Ok(Output::Rendered(ctx.templates.render("userdata.j2", &vars)?))
}

async fn instance(ctx: Arc<Context>, inputs: Inputs) -> Result<Output> {
    let request = InstanceRequest {
        name: INSTANCE_NAME.to_owned(),
        flavor_id: inputs.flavor("flavor")?.id.clone(),
        key_pair: inputs.keypair("keypair")?.name.clone(),
        security_groups: vec![inputs.security_group("security_group")?.name.clone()],
        user_data: inputs.rendered("userdata_tmpl")?.clone(),
        block_devices: vec![BlockDevice {
            source_type: "image".to_owned(),
            destination_type: "volume".to_owned(),
            delete_on_termination: true,
            volume_size: ctx.config.flavor.disk,
            uuid: inputs.image("image")?.id.clone(),
        }],
        network_name: ctx.config.private_network_name.clone().unwrap_or_default(),
    };
    Ok(Output::Instance(ctx.provider.create_instance(&request).await?))
}

async fn associate(ctx: Arc<Context>, inputs: Inputs) -> Result<Output> {
    let instance = inputs.instance("registry")?;
    let floating_ip = inputs.floating_ip("registry_fip")?;
    let association = ctx
        .provider
        .associate_floating_ip(floating_ip, &instance.id, instance.fixed_ip_v4)
        .await?;
    Ok(Output::Association(association))
}

async fn dns_zone(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    Ok(Output::Zone(ctx.provider.get_dns_zone(&ctx.zone_name()).await?))
}

async fn dns_record(ctx: Arc<Context>, inputs: Inputs) -> Result<Output> {
    let zone = inputs.zone("dns_zone")?;
    let request = RecordSetRequest {
        zone_id: zone.id.clone(),
        name: format!("{}.{}", ctx.config.cluster_name, ctx.zone_name()),
        records: vec![inputs.floating_ip("registry_fip")?.address.to_string()],
        ttl: RECORD_TTL,
        record_type: "A".to_owned(),
    };
    Ok(Output::Record(ctx.provider.create_record_set(&request).await?))
}

async fn wait_for_ssh(ctx: Arc<Context>, _: Inputs) -> Result<Output> {
    let readiness = &ctx.config.readiness;
    readiness::wait_for_port(
        ctx.probe.as_ref(),
        &ctx.config.registry_fqdn(),
        readiness.ssh_port,
        &PollSettings::from(readiness),
        &ctx.cancel,
    )
    .await?;
    Ok(Output::Ready)
}

async fn wait_for_ready(ctx: Arc<Context>, inputs: Inputs) -> Result<Output> {
    let readiness = &ctx.config.readiness;
    let target = SshTarget {
        user: readiness.ssh_user.clone(),
        host: inputs.floating_ip("registry_fip")?.address.to_string(),
        port: readiness.ssh_port,
        identity: ctx.keys.private_key_path.clone(),
    };
    readiness::wait_for_marker(
        ctx.probe.as_ref(),
        &target,
        &readiness.marker,
        &PollSettings::from(readiness),
        &ctx.cancel,
    )
    .await?;
    Ok(Output::Ready)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use common::config::parse_config_str;

    use super::*;
    use crate::readiness::SystemProbe;

    fn graph() -> Graph {
        let config = parse_config_str(
            r#"
            cluster_name = "reg1"
            dns_zone_name = "example.com"
            provider = "mock"

            [image]
            url = "http://x/img"
            file = "img.qcow2"
            name = "debian"
            os_version = "11"

            [flavor]
            vcpus = 2
            ram = 4
            disk = 20
            "#,
        )
        .unwrap();
        let ctx = Arc::new(Context {
            config: Arc::new(config),
            provider: Arc::new(mock::Mock::new()),
            probe: Arc::new(SystemProbe),
            templates: Templates::default(),
            keys: KeyPair::unloaded(&PathBuf::from("/nonexistent")),
            http: Client::new(),
            cancel: CancellationToken::new(),
        });
        provisioning_graph(&ctx).unwrap()
    }

    #[test]
    fn independent_resources_have_no_edges_between_them() {
        let graph = graph();
        let roots = ["keypair", "image", "flavor", "security_group", "registry_fip", "dns_zone"];
        for a in roots {
            assert_eq!(graph.deps(a), Some(&[][..]), "{a} should be a root");
            for b in roots {
                assert!(!graph.depends_on(a, b));
            }
        }
        for rule in ["sg_icmp", "sg_tcp_ssh", "sg_tcp_registry", "sg_tcp_etcd_discovery"] {
            assert_eq!(graph.deps(rule), Some(&["security_group".to_owned()][..]));
        }
    }

    #[test]
    fn templates_follow_the_floating_ip_and_precede_the_instance() {
        let graph = graph();
        for tmpl in ["push_images_tmpl", "post_run_tmpl", "etchosts_tmpl", "etcd_discovery_conf_tmpl"] {
            assert!(graph.depends_on(tmpl, "registry_fip"));
            assert!(graph.depends_on("userdata_tmpl", tmpl));
        }
        for dep in ["flavor", "keypair", "security_group", "image", "userdata_tmpl"] {
            assert!(graph.depends_on("registry", dep), "registry must wait for {dep}");
        }
    }

    #[test]
    fn waits_come_last() {
        let graph = graph();
        assert!(graph.depends_on("registry_fip_assoc", "registry"));
        assert!(graph.depends_on("registry_fip_assoc", "registry_fip"));
        assert!(graph.depends_on("registry_dns_record", "registry_fip_assoc"));
        assert!(graph.depends_on("registry_dns_record", "dns_zone"));
        assert!(graph.depends_on("wait_sleep", "registry_fip_assoc"));
        assert!(graph.depends_on("registry_ready", "wait_sleep"));

        let order = graph.order();
        assert_eq!(order.last(), Some(&"registry_ready"));
        assert_eq!(order.len(), 20);
    }

    #[test]
    fn only_cloud_resources_are_persisted() {
        let graph = graph();
        assert!(graph.is_persisted("registry"));
        assert!(graph.is_persisted("sg_tcp_ssh"));
        assert!(!graph.is_persisted("userdata_tmpl"));
        assert!(!graph.is_persisted("dns_zone"));
        assert!(!graph.is_persisted("wait_sleep"));
    }
}
