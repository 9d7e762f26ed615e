use std::sync::Arc;

use anyhow::Result;
use common::{command::Reporter, config::parse_config, exit};
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    args::Cli,
    keys::ensure_keypair,
    outputs::Exports,
    plan::{provisioning_graph, Context},
    readiness::SystemProbe,
    state::State,
    templates::Templates,
};

pub const STATE_FILE: &str = "state.json";

pub async fn up(cli: &Cli) -> Result<()> {
    let config = Arc::new(parse_config(&cli.file)?);
    let realm = config.realm()?;

    let keys = {
        let key_realm = realm.clone();
        match tokio::task::spawn_blocking(move || ensure_keypair(&key_realm)).await? {
            Ok(keys) => keys,
            Err(err) => exit!(err, "Could not prepare the keypair in {}", realm.display()),
        }
    };
    let templates = match Templates::load(&config.templates_dir) {
        Ok(t) => t,
        Err(err) => exit!(
            err,
            "Could not load templates from {}",
            config.templates_dir.display()
        ),
    };
    let provider = base_provider::get_provider(&config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                cancel.cancel();
            }
        });
    }

    let ctx = Arc::new(Context {
        config: config.clone(),
        provider,
        probe: Arc::new(SystemProbe),
        templates,
        keys,
        http: Client::new(),
        cancel,
    });
    let mut state = State::load(&realm.join(STATE_FILE))?;
    let reporter = Reporter::new(cli.verbose);

    let start = Instant::now();
    let exports = match provision(&ctx, &mut state, &reporter).await {
        Ok(e) => e,
        Err(err) => exit!(err, "Could not provision {}: {:#}", config.registry_fqdn(), err),
    };
    reporter.finish("Registry up", &config.registry_fqdn(), start.elapsed(), None);
    exports.print();
    Ok(())
}

/// Runs the whole graph and hands back the exports once every node,
/// readiness waits included, is done.
pub async fn provision(ctx: &Arc<Context>, state: &mut State, reporter: &Reporter) -> Result<Exports> {
    let graph = provisioning_graph(ctx)?;
    state.set_complete(false)?;
    let outputs = graph.execute(state, &ctx.cancel, reporter).await?;
    let exports = Exports::from_outputs(&outputs)?;
    state.set_complete(true)?;
    info!("provisioning of {} complete", ctx.config.registry_fqdn());
    Ok(exports)
}
