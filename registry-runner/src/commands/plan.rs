use std::sync::Arc;

use anyhow::Result;
use common::config::parse_config;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::{
    args::Cli,
    commands::up::STATE_FILE,
    graph::Graph,
    keys::KeyPair,
    plan::{provisioning_graph, Context},
    readiness::SystemProbe,
    state::State,
    templates::Templates,
};

/// Prints the graph without touching the cloud, the keys or the image cache.
pub async fn plan(cli: &Cli) -> Result<()> {
    let config = Arc::new(parse_config(&cli.file)?);
    let realm = config.realm()?;
    let state = State::load(&realm.join(STATE_FILE))?;

    // Tasks are never run, the provider only has to exist.
    let ctx = Arc::new(Context {
        config,
        provider: Arc::new(mock::Mock::new()),
        probe: Arc::new(SystemProbe),
        templates: Templates::default(),
        keys: KeyPair::unloaded(&realm),
        http: Client::new(),
        cancel: CancellationToken::new(),
    });
    let graph = provisioning_graph(&ctx)?;
    for line in plan_lines(&graph, &state) {
        println!("{line}");
    }
    Ok(())
}

fn plan_lines(graph: &Graph, state: &State) -> Vec<String> {
    graph
        .order()
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let mut line = format!("{:>2}. {name}", i + 1);
            if state.get(name).is_some() {
                line.push_str(" [provisioned]");
            } else if !graph.is_persisted(name) {
                line.push_str(" [always runs]");
            }
            let deps = graph.deps(name).unwrap_or_default();
            if !deps.is_empty() {
                line.push_str(&format!(" <- {}", deps.join(", ")));
            }
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use common::provider::Flavor;

    use super::*;
    use crate::graph::{GraphBuilder, Node, Output};

    fn noop(name: &str) -> Node {
        Node::new(name, ["", "", ""], |_| async { Ok::<_, anyhow::Error>(Output::Ready) })
    }

    #[test]
    fn lists_nodes_in_order_with_their_state() {
        let graph = GraphBuilder::new()
            .node(noop("wait").after(&["flavor", "keypair"]))
            .node(noop("flavor").persisted())
            .node(noop("keypair").persisted())
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::load(&dir.path().join(STATE_FILE)).unwrap();
        state
            .record(
                "flavor",
                &Output::Flavor(Flavor {
                    id: "f-1".into(),
                    name: "reg1-flavor".into(),
                }),
            )
            .unwrap();

        assert_eq!(
            plan_lines(&graph, &state),
            vec![
                " 1. flavor [provisioned]",
                " 2. keypair",
                " 3. wait [always runs] <- flavor, keypair",
            ]
        );
    }
}
