//! Loading of cases, template catalogs and environments from disk.

use crate::model::{ApiTemplate, Environment, TestCase};
use crate::store::InMemoryTemplateStore;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Finds and parses case files.
#[derive(Debug)]
pub struct CaseLoader {
    pub case_paths: Vec<PathBuf>,
}

impl CaseLoader {
    pub fn new() -> Self {
        Self {
            case_paths: vec![PathBuf::from("tests/cases")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.case_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single case file (`.yaml`, `.yml` or `.json`).
    pub fn load_case<P: AsRef<Path>>(&self, path: P) -> Result<TestCase> {
        let path = path.as_ref();
        info!("Loading test case from {}", path.display());
        let case: TestCase = read_document(path)?;
        debug!("Successfully loaded test case: {}", case.name);
        Ok(case)
    }

    /// Load every case file directly inside `dir`. Files that fail to
    /// parse are skipped with a debug log.
    pub fn load_cases_from_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<TestCase>> {
        let dir = dir.as_ref();
        info!("Loading test cases from directory: {}", dir.display());

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_case_file(path))
            .collect();
        entries.sort();

        let mut cases = Vec::new();
        for path in entries {
            match self.load_case(&path) {
                Ok(case) => cases.push(case),
                Err(err) => {
                    debug!(
                        "Failed to load case from {}: {:#}",
                        path.display(),
                        err
                    );
                }
            }
        }

        info!("Loaded {} test cases from {}", cases.len(), dir.display());
        Ok(cases)
    }

    /// Load cases from every configured directory that exists.
    pub fn load_all_cases(&self) -> Result<Vec<TestCase>> {
        let mut all_cases = Vec::new();
        for path in &self.case_paths {
            if path.is_dir() {
                match self.load_cases_from_dir(path) {
                    Ok(mut cases) => all_cases.append(&mut cases),
                    Err(err) => {
                        debug!(
                            "Failed to load cases from {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
        info!("Loaded {} test cases in total", all_cases.len());
        Ok(all_cases)
    }
}

impl Default for CaseLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// A template catalog: either a bare list or `{templates: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateCatalog {
    List(Vec<ApiTemplate>),
    Wrapped { templates: Vec<ApiTemplate> },
}

/// Load a template catalog into an in-memory store.
pub fn load_templates<P: AsRef<Path>>(
    path: P,
) -> Result<InMemoryTemplateStore> {
    let path = path.as_ref();
    let catalog: TemplateCatalog = read_document(path)?;
    let templates = match catalog {
        TemplateCatalog::List(templates) => templates,
        TemplateCatalog::Wrapped { templates } => templates,
    };
    if let Some(blank) = templates.iter().find(|t| t.id.is_empty()) {
        anyhow::bail!(
            "Template with url_path '{}' in {} has no id",
            blank.url_path,
            path.display()
        );
    }
    let store = InMemoryTemplateStore::from_templates(templates);
    info!("Loaded {} API templates from {}", store.len(), path.display());
    Ok(store)
}

pub fn load_environment<P: AsRef<Path>>(path: P) -> Result<Environment> {
    read_document(path.as_ref())
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read file: {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .context(format!("Failed to parse JSON from {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))
    }
}

/// `true` for `.yaml`, `.yml` and `.json` files.
fn is_case_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
