use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::Output;

/// Cloud resources created so far, keyed by graph node. Saved after every
/// change so an aborted run can be picked up again.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(default)]
    resources: BTreeMap<String, Output>,
    /// Set once a run got through every node, readiness included
    #[serde(default)]
    complete: bool,
}

impl State {
    /// A missing file is an empty state bound to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut state = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("could not read state file {}", path.display()))?;
            serde_json::from_str::<State>(&text)
                .with_context(|| format!("could not parse state file {}", path.display()))?
        } else {
            State::default()
        };
        state.path = Some(path.to_path_buf());
        Ok(state)
    }

    pub fn get(&self, name: &str) -> Option<&Output> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> &BTreeMap<String, Output> {
        &self.resources
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn record(&mut self, name: &str, output: &Output) -> Result<()> {
        self.resources.insert(name.to_owned(), output.clone());
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.resources.remove(name);
        self.complete = false;
        self.save()
    }

    pub fn set_complete(&mut self, complete: bool) -> Result<()> {
        self.complete = complete;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("could not write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("could not replace state file {}", path.display()))?;
        debug!("state saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::provider::Flavor;

    use super::*;

    #[test]
    fn survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg1").join("state.json");
        let flavor = Output::Flavor(Flavor {
            id: "f-1".into(),
            name: "reg1-flavor".into(),
        });

        let mut state = State::load(&path).unwrap();
        assert!(state.resources().is_empty());
        state.record("flavor", &flavor).unwrap();
        state.set_complete(true).unwrap();

        let mut reloaded = State::load(&path).unwrap();
        assert_eq!(reloaded.get("flavor"), Some(&flavor));
        assert!(reloaded.is_complete());
        assert!(!path.with_extension("json.tmp").exists());

        reloaded.remove("flavor").unwrap();
        let emptied = State::load(&path).unwrap();
        assert!(emptied.get("flavor").is_none());
        assert!(!emptied.is_complete());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(State::load(&path).is_err());
    }
}
