use crate::column::ParameterSalience;
use crate::dataset::{DataRow, Dataset};
use crate::error::{Result, TrellisError};
use crate::item::{DataItem, ItemContent};
use crate::provenance::{Generator, ProvenanceRecord};
use crate::space::Frequency;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use ulid::Ulid;

/// A declared derivation step: which source columns it consumes, which
/// sink columns it fills, and at what frequency it iterates. The actual
/// computation is supplied to [`Pipeline::run`] as a closure.
pub struct Pipeline {
    name: String,
    frequency: Frequency,
    sources: Vec<String>,
    sinks: Vec<String>,
    parameters: Vec<ParameterSpec>,
    include_low_quality: bool,
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub salience: ParameterSalience,
    pub default: Option<serde_json::Value>,
}

/// Everything the apply closure sees for one row.
pub struct RowContext<'a, 'd> {
    pub row: &'a DataRow<'d>,
    /// Resolved source items by column name. Optional columns may be
    /// absent; check [`DataItem::is_absent`] before loading.
    pub inputs: BTreeMap<String, Arc<DataItem>>,
    pub parameters: &'a BTreeMap<String, serde_json::Value>,
}

/// Outcome of one run over a dataset. Failures are per-row; a run only
/// errors out as a whole for usage mistakes or a missing `Required`
/// source.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub processed: usize,
    pub skipped_up_to_date: usize,
    pub skipped_quality: usize,
    pub failed: Vec<RowFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub coordinates: String,
    pub error: String,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Pipeline {
    pub fn new(name: &str, frequency: Frequency) -> Pipeline {
        Pipeline {
            name: name.to_string(),
            frequency,
            sources: Vec::new(),
            sinks: Vec::new(),
            parameters: Vec::new(),
            include_low_quality: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn source(mut self, column: &str) -> Pipeline {
        self.sources.push(column.to_string());
        self
    }

    pub fn sink(mut self, column: &str) -> Pipeline {
        self.sinks.push(column.to_string());
        self
    }

    pub fn parameter(mut self, name: &str, salience: ParameterSalience) -> Pipeline {
        self.parameters.push(ParameterSpec {
            name: name.to_string(),
            salience,
            default: None,
        });
        self
    }

    pub fn parameter_with_default(
        mut self,
        name: &str,
        salience: ParameterSalience,
        default: serde_json::Value,
    ) -> Pipeline {
        self.parameters.push(ParameterSpec {
            name: name.to_string(),
            salience,
            default: Some(default),
        });
        self
    }

    /// Also process rows whose inputs fell below their column's quality
    /// threshold (skipped by default).
    pub fn include_low_quality(mut self) -> Pipeline {
        self.include_low_quality = true;
        self
    }

    /// Merge provided values over declared defaults, rejecting unknown
    /// names and missing `Required` parameters.
    fn effective_parameters(
        &self,
        provided: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        for name in provided.keys() {
            if !self.parameters.iter().any(|p| &p.name == name) {
                return Err(TrellisError::Usage(format!(
                    "pipeline {} has no parameter named {name}",
                    self.name
                )));
            }
        }
        let mut merged = BTreeMap::new();
        for spec in &self.parameters {
            match provided.get(&spec.name).or(spec.default.as_ref()) {
                Some(value) => {
                    merged.insert(spec.name.clone(), value.clone());
                }
                None if spec.salience.is_required() => {
                    return Err(TrellisError::Usage(format!(
                        "pipeline {} requires parameter {}",
                        self.name, spec.name
                    )));
                }
                None => {
                    if spec.salience >= ParameterSalience::Recommended {
                        log::warn!(
                            "pipeline {} running without recommended parameter {}",
                            self.name,
                            spec.name
                        );
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Run over every row at the pipeline's frequency. Rows whose sinks
    /// already carry provenance for the same pipeline, parameters and
    /// input checksums are skipped without a single write; provenance is
    /// recorded after all of a row's sinks are written, so a partially
    /// written row is re-derived on the next run.
    pub fn run<F>(
        &self,
        dataset: &Dataset,
        parameters: &BTreeMap<String, serde_json::Value>,
        apply: F,
    ) -> Result<RunReport>
    where
        F: Fn(&RowContext<'_, '_>) -> Result<BTreeMap<String, ItemContent>>,
    {
        for name in &self.sources {
            if dataset.source(name).is_none() {
                return Err(TrellisError::Usage(format!(
                    "pipeline {} reads undeclared source column {name}",
                    self.name
                )));
            }
        }
        for name in &self.sinks {
            if dataset.sink(name).is_none() {
                return Err(TrellisError::Usage(format!(
                    "pipeline {} writes undeclared sink column {name}",
                    self.name
                )));
            }
        }
        let parameters = self.effective_parameters(parameters)?;

        let mut report = RunReport {
            run_id: Ulid::new().to_string(),
            pipeline: self.name.clone(),
            processed: 0,
            skipped_up_to_date: 0,
            skipped_quality: 0,
            failed: Vec::new(),
        };

        let rows = dataset.rows(self.frequency)?;
        log::info!(
            "run {}: pipeline {} over {} rows",
            report.run_id,
            self.name,
            rows.len()
        );

        for row in &rows {
            match self.run_row(dataset, row, &parameters, &report.run_id, &apply)? {
                RowOutcome::Processed => report.processed += 1,
                RowOutcome::UpToDate => report.skipped_up_to_date += 1,
                RowOutcome::LowQuality => report.skipped_quality += 1,
                RowOutcome::Failed(error) => {
                    log::warn!("run {}: row [{}] failed: {error}", report.run_id, row.coordinates());
                    report.failed.push(RowFailure {
                        coordinates: row.coordinates().to_string(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// One row end to end. `Err` aborts the whole run (a missing
    /// `Required` source); recoverable problems come back as
    /// `RowOutcome::Failed`.
    fn run_row<F>(
        &self,
        dataset: &Dataset,
        row: &DataRow<'_>,
        parameters: &BTreeMap<String, serde_json::Value>,
        run_id: &str,
        apply: &F,
    ) -> Result<RowOutcome>
    where
        F: Fn(&RowContext<'_, '_>) -> Result<BTreeMap<String, ItemContent>>,
    {
        let mut inputs = BTreeMap::new();
        let mut low_quality = false;
        for name in &self.sources {
            // Presence checked in run()
            let Some(column) = dataset.source(name) else {
                continue;
            };
            match row.item(name) {
                Ok(item) => {
                    if item.excluded_by_quality() {
                        low_quality = true;
                    }
                    inputs.insert(name.clone(), item);
                }
                Err(err) if column.salience.aborts_run() => return Err(err),
                Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
            }
        }
        if low_quality && !self.include_low_quality {
            return Ok(RowOutcome::LowQuality);
        }

        let mut input_sums = BTreeMap::new();
        for (name, item) in &inputs {
            if item.is_absent() {
                input_sums.insert(name.clone(), "absent".to_string());
                continue;
            }
            match item.checksum() {
                Ok(sum) => {
                    input_sums.insert(name.clone(), sum);
                }
                Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
            }
        }

        let mut record = ProvenanceRecord {
            run_id: run_id.to_string(),
            pipeline: self.name.clone(),
            generator: Generator::this_crate(),
            parameters: parameters.clone(),
            inputs: input_sums,
            outputs: BTreeMap::new(),
            recorded_at: chrono::Utc::now(),
        };

        let mut sink_items: BTreeMap<String, Arc<DataItem>> = BTreeMap::new();
        for name in &self.sinks {
            match row.item(name) {
                Ok(item) => {
                    sink_items.insert(name.clone(), item);
                }
                Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
            }
        }
        let mut up_to_date = !self.sinks.is_empty();
        for item in sink_items.values() {
            match item.read_provenance() {
                Ok(Some(existing)) if existing.matches(&record) => {}
                Ok(_) => {
                    up_to_date = false;
                    break;
                }
                Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
            }
        }
        if up_to_date {
            return Ok(RowOutcome::UpToDate);
        }

        let context = RowContext {
            row,
            inputs,
            parameters,
        };
        let outputs = match apply(&context) {
            Ok(outputs) => outputs,
            Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
        };
        for name in outputs.keys() {
            if !sink_items.contains_key(name) {
                return Ok(RowOutcome::Failed(format!(
                    "pipeline produced undeclared output {name}"
                )));
            }
        }
        for name in &self.sinks {
            if !outputs.contains_key(name) {
                return Ok(RowOutcome::Failed(format!(
                    "pipeline produced no content for sink {name}"
                )));
            }
        }

        for (name, content) in outputs {
            let item = &sink_items[&name];
            if let Err(err) = item.put(content) {
                return Ok(RowOutcome::Failed(err.to_string()));
            }
            match item.checksum() {
                Ok(sum) => {
                    record.outputs.insert(name, sum);
                }
                Err(err) => return Ok(RowOutcome::Failed(err.to_string())),
            }
        }
        for item in sink_items.values() {
            if let Err(err) = item.record_provenance(&record) {
                return Ok(RowOutcome::Failed(err.to_string()));
            }
        }
        Ok(RowOutcome::Processed)
    }
}

enum RowOutcome {
    Processed,
    UpToDate,
    LowQuality,
    Failed(String),
}
