use std::sync::Arc;

use anyhow::Result;
use common::{command::Reporter, config::parse_config, provider::CloudProvider};
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    args::Cli,
    commands::up::STATE_FILE,
    graph::{Graph, Output},
    keys::KeyPair,
    plan::{provisioning_graph, Context},
    readiness::SystemProbe,
    state::State,
    templates::Templates,
};

pub async fn destroy(cli: &Cli) -> Result<()> {
    let config = Arc::new(parse_config(&cli.file)?);
    let realm = config.realm()?;
    let mut state = State::load(&realm.join(STATE_FILE))?;
    if state.resources().is_empty() {
        println!("Nothing to destroy for {}", config.registry_fqdn());
        return Ok(());
    }

    let provider = base_provider::get_provider(&config).await?;
    let ctx = Arc::new(Context {
        config: config.clone(),
        provider: provider.clone(),
        probe: Arc::new(SystemProbe),
        templates: Templates::default(),
        keys: KeyPair::unloaded(&realm),
        http: Client::new(),
        cancel: CancellationToken::new(),
    });
    let graph = provisioning_graph(&ctx)?;
    let reporter = Reporter::new(cli.verbose);
    teardown(&graph, provider.as_ref(), &mut state, &reporter).await?;
    info!("keys and the cached image are kept, remove {} by hand if unwanted", realm.display());
    Ok(())
}

/// Deletes recorded resources dependents first, dropping each from `state`
/// once it is gone.
pub async fn teardown(
    graph: &Graph,
    provider: &dyn CloudProvider,
    state: &mut State,
    reporter: &Reporter,
) -> Result<()> {
    let order = graph.order();
    for name in state.resources().keys().filter(|n| !order.contains(&n.as_str())) {
        warn!("{name} is in the state file but not in the graph, leaving it alone");
    }

    for name in order.into_iter().rev() {
        let Some(output) = state.get(name).cloned() else {
            continue;
        };
        let pb = reporter.start(&format!("Deleting {}", output.kind()));
        let start = Instant::now();
        if let Err(err) = delete(provider, &output).await {
            reporter.fail(&format!("Could not delete {}", output.kind()), name, pb);
            return Err(err.context(format!("could not delete {name}")));
        }
        state.remove(name)?;
        reporter.finish(&format!("Deleted {}", output.kind()), name, start.elapsed(), pb);
    }
    Ok(())
}

async fn delete(provider: &dyn CloudProvider, output: &Output) -> Result<()> {
    match output {
        Output::Keypair(k) => provider.delete_keypair(k).await,
        Output::Image(i) => provider.delete_image(i).await,
        Output::Flavor(f) => provider.delete_flavor(f).await,
        Output::SecurityGroup(g) => provider.delete_security_group(g).await,
        Output::SecurityRule(r) => provider.delete_security_rule(r).await,
        Output::FloatingIp(f) => provider.delete_floating_ip(f).await,
        Output::Instance(i) => provider.delete_instance(i).await,
        Output::Association(a) => provider.disassociate_floating_ip(a).await,
        Output::Record(r) => provider.delete_record_set(r).await,
        Output::Zone(_) | Output::Rendered(_) | Output::Ready => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use mock::Mock;

    use super::*;
    use crate::commands::up::{
        provision,
        tests::{context, FakeProbe},
    };

    fn position(calls: &[String], prefix: &str) -> usize {
        calls.iter().position(|c| c.starts_with(prefix)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_everything_dependents_first() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(Mock::new());
        let ctx = context(dir.path(), mock.clone(), Arc::new(FakeProbe::default()));
        let state_path = ctx.config.realm().unwrap().join(STATE_FILE);
        let reporter = Reporter::new(true);

        let mut state = State::load(&state_path).unwrap();
        provision(&ctx, &mut state, &reporter).await.unwrap();
        assert!(!mock.live().is_empty());

        let graph = provisioning_graph(&ctx).unwrap();
        teardown(&graph, mock.as_ref(), &mut state, &reporter).await.unwrap();

        assert!(mock.live().is_empty());
        assert!(State::load(&state_path).unwrap().resources().is_empty());

        let calls = mock.calls();
        assert!(position(&calls, "delete_record_set") < position(&calls, "disassociate_floating_ip"));
        assert!(position(&calls, "disassociate_floating_ip") < position(&calls, "delete_instance"));
        assert!(position(&calls, "disassociate_floating_ip") < position(&calls, "delete_floating_ip"));
        assert!(position(&calls, "delete_instance") < position(&calls, "delete_image"));
        assert!(position(&calls, "delete_security_rule") < position(&calls, "delete_security_group"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_keeps_the_rest_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(Mock::new());
        let ctx = context(dir.path(), mock.clone(), Arc::new(FakeProbe::default()));
        let reporter = Reporter::new(true);

        let mut state = State::default();
        provision(&ctx, &mut state, &reporter).await.unwrap();
        // gone behind our back, the mock refuses to delete it twice
        let Some(Output::Record(record)) = state.get("registry_dns_record").cloned() else {
            panic!("no record recorded");
        };
        mock.delete_record_set(&record).await.unwrap();

        let graph = provisioning_graph(&ctx).unwrap();
        assert!(teardown(&graph, mock.as_ref(), &mut state, &reporter).await.is_err());
        assert!(state.get("registry_dns_record").is_some());
        assert!(state.get("registry").is_some());
    }
}
