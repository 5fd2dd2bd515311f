//! Feature registry: the fixed, process-wide table of named formulas.
//!
//! Built once at startup and shared read-only behind an `Arc`. Invocation
//! runs in three explicit stages so the contract is visible at the call
//! site:
//!
//! 1. [`FeatureDefinition::check_input`] – row count and declared columns
//! 2. [`FeatureDefinition::execute`] – the formula plus the length contract
//! 3. [`FeatureDefinition::finalize`] – non-finite → missing, clip to range,
//!    median fill for non-nullable features

pub mod manifest;
pub mod window;

pub use manifest::{FeatureManifest, ManifestEntry};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{ComputeError, FeatureError};
use crate::models::Record;

/// Signature every formula conforms to: ordered rows in, aligned values out.
pub type ComputeFn = fn(&[Record]) -> Result<Vec<Option<f64>>, ComputeError>;

/// Freshness / latency tier of a feature. Maps to a cache TTL and a default
/// timeout through the pipeline policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    RealTime,
    NearRealTime,
    Batch,
}

#[derive(Debug, Clone)]
pub struct FeatureDefinition {
    pub name: String,
    pub compute: ComputeFn,
    pub valid_range: (f64, f64),
    pub required_columns: BTreeSet<String>,
    /// Minimum number of input rows. `0` marks a feature that accepts an
    /// empty row set (and returns an empty output for it).
    pub min_rows: usize,
    pub nullable: bool,
    pub latency_class: LatencyClass,
    pub tags: Vec<String>,
}

impl FeatureDefinition {
    pub fn new(name: &str, compute: ComputeFn, min: f64, max: f64) -> Self {
        FeatureDefinition {
            name: name.to_string(),
            compute,
            valid_range: (min, max),
            required_columns: BTreeSet::new(),
            min_rows: 1,
            nullable: true,
            latency_class: LatencyClass::NearRealTime,
            tags: Vec::new(),
        }
    }

    pub fn requires(mut self, columns: &[&str]) -> Self {
        self.required_columns
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn min_rows(mut self, n: usize) -> Self {
        self.min_rows = n;
        self
    }

    pub fn latency(mut self, class: LatencyClass) -> Self {
        self.latency_class = class;
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn non_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn computation_error(&self, cause: ComputeError) -> FeatureError {
        FeatureError::Computation {
            feature: self.name.clone(),
            cause,
        }
    }

    /// Reject input the formula cannot run on before any work is scheduled.
    pub fn check_input(&self, rows: &[Record]) -> Result<(), FeatureError> {
        if rows.len() < self.min_rows {
            return Err(self.computation_error(ComputeError::InsufficientData(format!(
                "{} row(s) supplied, at least {} required",
                rows.len(),
                self.min_rows
            ))));
        }
        if rows.is_empty() {
            return Ok(());
        }
        for column in &self.required_columns {
            if !window::column_present(rows, column) {
                return Err(self.computation_error(ComputeError::MissingColumn(column.clone())));
            }
        }
        Ok(())
    }

    /// Run the formula and enforce the output-length contract.
    pub fn execute(&self, rows: &[Record]) -> Result<Vec<Option<f64>>, FeatureError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let values = (self.compute)(rows).map_err(|cause| self.computation_error(cause))?;
        if values.len() != rows.len() {
            error!(
                "🚨 Feature '{}' returned {} values for {} rows – registration bug",
                self.name,
                values.len(),
                rows.len()
            );
            return Err(FeatureError::ContractViolation {
                feature: self.name.clone(),
                detail: format!(
                    "output length {} does not match input length {}",
                    values.len(),
                    rows.len()
                ),
            });
        }
        Ok(values)
    }

    /// Apply the framework-level output guarantees.
    pub fn finalize(&self, values: Vec<Option<f64>>) -> Vec<Option<f64>> {
        let (min, max) = self.valid_range;
        let mut clipped = 0usize;
        let mut out: Vec<Option<f64>> = values
            .into_iter()
            .map(|v| match v {
                Some(x) if x.is_finite() => {
                    let c = x.clamp(min, max);
                    if c != x {
                        clipped += 1;
                    }
                    Some(c)
                }
                _ => None,
            })
            .collect();

        if clipped > 0 {
            warn!(
                "Feature '{}': {} value(s) clipped to [{}, {}]",
                self.name, clipped, min, max
            );
        }

        if !self.nullable && out.iter().any(Option::is_none) {
            if let Some(fill) = median(&out) {
                warn!(
                    "Feature '{}' is non-nullable; filling missing values with median {:.4}",
                    self.name, fill
                );
                for v in out.iter_mut().filter(|v| v.is_none()) {
                    *v = Some(fill);
                }
            }
        }
        out
    }

    /// All three stages in sequence, on the calling thread.
    pub fn run(&self, rows: &[Record]) -> Result<Vec<Option<f64>>, FeatureError> {
        self.check_input(rows)?;
        let raw = self.execute(rows)?;
        Ok(self.finalize(raw))
    }
}

fn median(values: &[Option<f64>]) -> Option<f64> {
    let mut present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return None;
    }
    present.sort_by(f64::total_cmp);
    let mid = present.len() / 2;
    Some(if present.len() % 2 == 0 {
        (present[mid - 1] + present[mid]) / 2.0
    } else {
        present[mid]
    })
}

/// Read-only name → definition table.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    definitions: HashMap<String, Arc<FeatureDefinition>>,
}

impl FeatureRegistry {
    /// Build from a definition list, rejecting duplicate names and invalid
    /// bounds.
    pub fn from_definitions(definitions: Vec<FeatureDefinition>) -> Result<Self> {
        let mut map = HashMap::with_capacity(definitions.len());
        for def in definitions {
            let (min, max) = def.valid_range;
            if !(min.is_finite() && max.is_finite()) || min > max {
                bail!(
                    "feature '{}' has an invalid range [{}, {}]",
                    def.name,
                    min,
                    max
                );
            }
            let name = def.name.clone();
            if map.insert(name.clone(), Arc::new(def)).is_some() {
                bail!("feature '{}' is registered twice", name);
            }
        }
        info!("Feature registry initialised with {} feature(s)", map.len());
        Ok(FeatureRegistry { definitions: map })
    }

    /// The registry of built-in formulas.
    pub fn builtin() -> Result<Self> {
        Self::from_definitions(crate::features::builtin_definitions())
    }

    /// Bind a declarative manifest to compute functions from `available`.
    /// Only features listed in the manifest are registered.
    pub fn with_manifest(
        available: Vec<FeatureDefinition>,
        manifest: &FeatureManifest,
    ) -> Result<Self> {
        let definitions = manifest.bind(available)?;
        Self::from_definitions(definitions)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<FeatureDefinition>, FeatureError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureError::NotFound(name.to_string()))
    }

    /// Resolve and run a feature synchronously on the calling thread.
    pub fn invoke(&self, name: &str, rows: &[Record]) -> Result<Vec<Option<f64>>, FeatureError> {
        self.resolve(name)?.run(rows)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions sorted by name.
    pub fn definitions(&self) -> Vec<Arc<FeatureDefinition>> {
        let mut defs: Vec<_> = self.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{record, Value};

    fn doubled(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
        window::numbers(rows, "x").map(|v| v.into_iter().map(|x| x.map(|x| x * 2.0)).collect())
    }

    fn short_output(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
        Ok(vec![Some(0.5); rows.len().saturating_sub(1)])
    }

    fn rows(xs: &[Value]) -> Vec<Record> {
        xs.iter().map(|x| record([("x", x.clone())])).collect()
    }

    fn registry() -> FeatureRegistry {
        FeatureRegistry::from_definitions(vec![
            FeatureDefinition::new("doubled", doubled, 0.0, 10.0).requires(&["x"]),
            FeatureDefinition::new("short", short_output, 0.0, 1.0),
            FeatureDefinition::new("dense", doubled, 0.0, 10.0).non_nullable(),
            FeatureDefinition::new("tolerant", doubled, 0.0, 10.0).min_rows(0),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let err = registry().resolve("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_invoke_clips_and_marks_missing() {
        let input = rows(&[
            Value::Float(1.0),
            Value::Float(9.0),
            Value::Null,
            Value::Float(f64::NAN),
        ]);
        let out = registry().invoke("doubled", &input).unwrap();
        assert_eq!(out.len(), input.len());
        assert_eq!(out[0], Some(2.0));
        assert_eq!(out[1], Some(10.0)); // 18 clipped
        assert_eq!(out[2], None);
        assert_eq!(out[3], None);
    }

    #[test]
    fn test_missing_required_column() {
        let input = vec![record([("y", Value::Int(1))])];
        let err = registry().invoke("doubled", &input).unwrap_err();
        match err {
            FeatureError::Computation { cause, .. } => {
                assert_eq!(cause, ComputeError::MissingColumn("x".into()))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_error_unless_tolerated() {
        let reg = registry();
        let err = reg.invoke("doubled", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComputationError);
        assert_eq!(reg.invoke("tolerant", &[]).unwrap(), Vec::<Option<f64>>::new());
    }

    #[test]
    fn test_length_mismatch_is_contract_violation() {
        let input = rows(&[Value::Float(1.0), Value::Float(2.0)]);
        let err = registry().invoke("short", &input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }

    #[test]
    fn test_non_nullable_fills_with_median() {
        let input = rows(&[
            Value::Float(1.0),
            Value::Null,
            Value::Float(2.0),
            Value::Float(4.0),
        ]);
        let out = registry().invoke("dense", &input).unwrap();
        assert_eq!(out, vec![Some(2.0), Some(4.0), Some(4.0), Some(8.0)]);
    }

    #[test]
    fn test_duplicate_and_inverted_ranges_rejected() {
        let dup = FeatureRegistry::from_definitions(vec![
            FeatureDefinition::new("a", doubled, 0.0, 1.0),
            FeatureDefinition::new("a", doubled, 0.0, 1.0),
        ]);
        assert!(dup.is_err());

        let inverted =
            FeatureRegistry::from_definitions(vec![FeatureDefinition::new("a", doubled, 2.0, 1.0)]);
        assert!(inverted.is_err());
    }

    #[test]
    fn test_definitions_sorted() {
        let names: Vec<String> = registry().definitions().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["dense", "doubled", "short", "tolerant"]);
    }
}
