use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    future::Future,
};

use anyhow::Result;
use common::command::Reporter;
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::State;

pub use self::output::{Inputs, Output};

mod output;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} is declared twice")]
    DuplicateNode(String),
    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: String, dependency: String },
    #[error("dependency cycle between {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("node {node} has no {expected} input named {input}")]
    MissingInput {
        node: String,
        input: String,
        expected: &'static str,
    },
}

type Task = Box<dyn Fn(Inputs) -> BoxFuture<'static, Result<Output>> + Send + Sync>;

pub struct Node {
    name: String,
    deps: Vec<String>,
    /// ongoing, failure, success
    msgs: [String; 3],
    persist: bool,
    task: Task,
}

impl Node {
    pub fn new<F, Fut>(name: &str, msgs: [&str; 3], task: F) -> Self
    where
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output>> + Send + 'static,
    {
        Self {
            name: name.to_owned(),
            deps: Vec::new(),
            msgs: msgs.map(str::to_owned),
            persist: false,
            task: Box::new(move |inputs| Box::pin(task(inputs))),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.deps.extend(deps.iter().map(|d| (*d).to_owned()));
        self
    }

    /// The output names a cloud resource: record it in the state file and
    /// reuse it on the next run instead of creating the resource again.
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }
}

#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let mut index = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }
        for node in &self.nodes {
            if let Some(dep) = node.deps.iter().find(|d| !index.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    node: node.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        // Kahn, ties broken by declaration order
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                dependents[index[dep]].push(i);
            }
        }
        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|i| pending[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|i| pending[*i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(Graph {
            nodes: self.nodes,
            index,
            order,
        })
    }
}

pub struct Graph {
    nodes: Vec<Node>,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
}

impl Graph {
    /// Node names in a valid execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|i| self.nodes[*i].name.as_str()).collect()
    }

    pub fn deps(&self, name: &str) -> Option<&[String]> {
        self.index.get(name).map(|i| self.nodes[*i].deps.as_slice())
    }

    pub fn is_persisted(&self, name: &str) -> bool {
        self.index.get(name).is_some_and(|i| self.nodes[*i].persist)
    }

    /// Whether `node` can only start after `ancestor` completed.
    pub fn depends_on(&self, node: &str, ancestor: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![node];
        while let Some(current) = stack.pop() {
            for dep in self.deps(current).unwrap_or_default() {
                if dep == ancestor {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Runs every node once its dependencies are done, as many at a time as
    /// are ready. Persisted outputs already in `state` are reused. The first
    /// failure cancels `cancel`, drops the nodes still running and is returned.
    pub async fn execute(
        &self,
        state: &mut State,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<BTreeMap<String, Output>> {
        let mut done: BTreeMap<String, Output> = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| n.persist) {
            if let Some(output) = state.get(&node.name) {
                info!("{} already provisioned, reusing it", node.name);
                done.insert(node.name.clone(), output.clone());
            }
        }

        let mut started: BTreeSet<usize> = self
            .order
            .iter()
            .copied()
            .filter(|i| done.contains_key(&self.nodes[*i].name))
            .collect();
        let mut running = FuturesUnordered::new();

        loop {
            for &i in &self.order {
                let node = &self.nodes[i];
                if started.contains(&i) || !node.deps.iter().all(|d| done.contains_key(d)) {
                    continue;
                }
                started.insert(i);
                let inputs: BTreeMap<String, Output> = node
                    .deps
                    .iter()
                    .filter_map(|d| done.get(d).map(|o| (d.clone(), o.clone())))
                    .collect();
                debug!("starting {}", node.name);
                let pb = reporter.start(&node.msgs[0]);
                let fut = (node.task)(Inputs::new(&node.name, inputs));
                running.push(async move {
                    let start = Instant::now();
                    let result = fut.await;
                    (i, result, start.elapsed(), pb)
                });
            }

            if running.is_empty() {
                break;
            }

            let (i, result, elapsed, pb) = tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("provisioning cancelled"),
                Some(finished) = running.next() => finished,
            };
            let node = &self.nodes[i];
            match result {
                Ok(output) => {
                    reporter.finish(&node.msgs[2], &node.name, elapsed, pb);
                    if node.persist {
                        state.record(&node.name, &output)?;
                    }
                    done.insert(node.name.clone(), output);
                }
                Err(err) => {
                    reporter.fail(&node.msgs[1], &node.name, pb);
                    cancel.cancel();
                    return Err(err.context(format!("{} ({})", node.msgs[1], node.name)));
                }
            }
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::anyhow;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Logs start and end, sleeps `secs` in between.
    fn timed(name: &'static str, secs: u64, log: &Log) -> Node {
        let log = log.clone();
        Node::new(name, ["run", "fail", "done"], move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("start {name}"));
                tokio::time::sleep(Duration::from_secs(secs)).await;
                log.lock().unwrap().push(format!("end {name}"));
                Ok::<_, anyhow::Error>(Output::Rendered(name.to_owned()))
            }
        })
    }

    fn ok(output: Output) -> Result<Output> {
        Ok(output)
    }

    fn position(log: &Log, entry: &str) -> usize {
        log.lock().unwrap().iter().position(|e| e == entry).unwrap()
    }

    #[test]
    fn rejects_duplicates_unknown_deps_and_cycles() {
        let log = Log::default();
        let dup = GraphBuilder::new()
            .node(timed("a", 0, &log))
            .node(timed("a", 0, &log))
            .build();
        assert_eq!(dup.err(), Some(GraphError::DuplicateNode("a".into())));

        let unknown = GraphBuilder::new()
            .node(timed("a", 0, &log).after(&["ghost"]))
            .build();
        assert!(matches!(unknown, Err(GraphError::UnknownDependency { .. })));

        let cycle = GraphBuilder::new()
            .node(timed("a", 0, &log).after(&["b"]))
            .node(timed("b", 0, &log).after(&["a"]))
            .node(timed("c", 0, &log))
            .build();
        assert_eq!(
            cycle.err(),
            Some(GraphError::Cycle(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn order_respects_edges() {
        let log = Log::default();
        let graph = GraphBuilder::new()
            .node(timed("c", 0, &log).after(&["b"]))
            .node(timed("b", 0, &log).after(&["a"]))
            .node(timed("a", 0, &log))
            .build()
            .unwrap();
        assert_eq!(graph.order(), vec!["a", "b", "c"]);
        assert!(graph.depends_on("c", "a"));
        assert!(!graph.depends_on("a", "c"));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_nodes_overlap_and_dependents_wait() {
        let log = Log::default();
        let graph = GraphBuilder::new()
            .node(timed("slow", 10, &log))
            .node(timed("fast", 1, &log))
            .node(timed("after_fast", 1, &log).after(&["fast"]))
            .node(timed("last", 0, &log).after(&["slow", "after_fast"]))
            .build()
            .unwrap();

        let start = Instant::now();
        let outputs = graph
            .execute(&mut State::default(), &CancellationToken::new(), &Reporter::new(true))
            .await
            .unwrap();

        assert_eq!(outputs.len(), 4);
        assert!(start.elapsed() < Duration::from_secs(12));
        // after_fast does not wait for the unrelated slow node
        assert!(position(&log, "start after_fast") < position(&log, "end slow"));
        assert!(position(&log, "start last") > position(&log, "end slow"));
        assert!(position(&log, "start last") > position(&log, "end after_fast"));
    }

    #[tokio::test]
    async fn nodes_see_only_their_dependencies() {
        let graph = GraphBuilder::new()
            .node(Node::new("a", ["", "", ""], |_| async { ok(Output::Rendered("a".into())) }))
            .node(Node::new("b", ["", "", ""], |_| async { ok(Output::Rendered("b".into())) }))
            .node(
                Node::new("c", ["", "", ""], |inputs: Inputs| async move {
                    assert_eq!(inputs.rendered("b")?, "b");
                    assert!(inputs.rendered("a").is_err());
                    Ok::<_, anyhow::Error>(Output::Ready)
                })
                .after(&["b"]),
            )
            .build()
            .unwrap();
        graph
            .execute(&mut State::default(), &CancellationToken::new(), &Reporter::new(true))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_cancels_the_rest() {
        let log = Log::default();
        let graph = GraphBuilder::new()
            .node(timed("slow", 60, &log))
            .node(Node::new("broken", ["run", "broke", "done"], |_| async {
                Err::<Output, _>(anyhow!("boom"))
            }))
            .node(timed("never", 0, &log).after(&["broken"]))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let err = graph
            .execute(&mut State::default(), &cancel, &Reporter::new(true))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(cancel.is_cancelled());

        let log = log.lock().unwrap();
        assert!(!log.contains(&"end slow".to_owned()));
        assert!(!log.iter().any(|e| e.ends_with("never")));
    }

    #[tokio::test]
    async fn recorded_outputs_are_reused() {
        let runs = Arc::new(Mutex::new(0));
        let counted = {
            let runs = runs.clone();
            Node::new("resource", ["", "", ""], move |_| {
                let runs = runs.clone();
                async move {
                    *runs.lock().unwrap() += 1;
                    ok(Output::Rendered("made".into()))
                }
            })
            .persisted()
        };
        let graph = GraphBuilder::new().node(counted).build().unwrap();

        let mut state = State::default();
        let reporter = Reporter::new(true);
        graph.execute(&mut state, &CancellationToken::new(), &reporter).await.unwrap();
        let second = graph
            .execute(&mut state, &CancellationToken::new(), &reporter)
            .await
            .unwrap();

        assert_eq!(*runs.lock().unwrap(), 1);
        assert_eq!(second["resource"], Output::Rendered("made".into()));
    }
}
