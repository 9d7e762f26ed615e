use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use tera::Tera;
use tracing::debug;

/// Named templates loaded from one directory. Rendering fails on a missing
/// template or on any variable the caller did not provide.
#[derive(Default)]
pub struct Templates {
    tera: Tera,
}

impl Templates {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut tera = Tera::default();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("could not read templates directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            debug!("loading template {name}");
            tera.add_template_file(&path, Some(&name))
                .with_context(|| format!("could not parse template {}", path.display()))?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, name: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
        let mut context = tera::Context::new();
        for (k, v) in vars {
            context.insert(*k, v);
        }
        self.tera
            .render(name, &context)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("could not render template {name}"))
    }
}
