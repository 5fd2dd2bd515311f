//! Declarative feature manifest.
//!
//! A deployment can restrict and re-parameterise the built-in formulas with
//! a JSON file, for example:
//!
//! ```json
//! { "features": [
//!     { "name": "bullpen_fatigue_index_3d", "min": 0.0, "max": 1.0,
//!       "latency_class": "real_time", "tags": ["baseball"] }
//! ] }
//! ```
//!
//! Schema validation of the upstream definitions happens before this file is
//! produced; here we only bind entries to compute functions.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::{FeatureDefinition, LatencyClass};

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureManifest {
    pub features: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub min: f64,
    pub max: f64,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub latency_class: Option<LatencyClass>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub required_columns: Option<Vec<String>>,
}

fn default_nullable() -> bool {
    true
}

impl FeatureManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse feature manifest")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature manifest {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Pair every entry with the compute function of the same name.
    pub(super) fn bind(&self, available: Vec<FeatureDefinition>) -> Result<Vec<FeatureDefinition>> {
        let mut by_name: HashMap<String, FeatureDefinition> = available
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.features.len());

        for entry in &self.features {
            if !seen.insert(entry.name.clone()) {
                bail!("feature '{}' appears twice in the manifest", entry.name);
            }
            if entry.min > entry.max {
                bail!(
                    "feature '{}' declares min {} above max {}",
                    entry.name,
                    entry.min,
                    entry.max
                );
            }
            let Some(mut def) = by_name.remove(&entry.name) else {
                bail!("feature '{}' has no compute implementation", entry.name);
            };
            def.valid_range = (entry.min, entry.max);
            def.nullable = entry.nullable;
            if let Some(class) = entry.latency_class {
                def.latency_class = class;
            }
            if !entry.tags.is_empty() {
                def.tags = entry.tags.clone();
            }
            if let Some(columns) = &entry.required_columns {
                def.required_columns = columns.iter().cloned().collect();
            }
            out.push(def);
        }
        Ok(out)
    }
}
