use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::graph::Graph;

/// Directory of `<name>.json` graph templates.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn load(&self, name: &str) -> Result<Graph> {
        let path = self.path_for(name)?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading template {}", path.display()))?;
        Graph::from_json_str(&raw).with_context(|| format!("template '{name}' is invalid"))
    }

    pub fn save(&self, name: &str, graph: &Graph) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating {}", self.dir.display()))?;
        std::fs::write(&path, serde_json::to_string_pretty(graph)?)
            .with_context(|| format!("failed writing template {}", path.display()))?;
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        std::fs::remove_file(&path)
            .with_context(|| format!("failed deleting template {}", path.display()))
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            bail!("template name must not be empty");
        }
        if trimmed.contains(['/', '\\']) || trimmed.contains("..") {
            bail!("template name '{trimmed}' must not contain path separators");
        }
        Ok(self.dir.join(format!("{trimmed}.json")))
    }
}
