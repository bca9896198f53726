use crate::column::{ColumnSalience, MatchCriteria, SinkColumn, SourceColumn};
use crate::error::{Result, TrellisError};
use crate::format::DataFormat;
use crate::space::DataSpace;
use crate::store::{DataQuality, DataStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::Dataset;

/// Serialized shape of a dataset: the space it spans, the hierarchy its
/// rows are laid out under in the store, and its column declarations.
/// Frequencies are stored by name so definitions survive edits to alias
/// tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub space: DataSpace,
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSpec>,
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub format: DataFormat,
    pub frequency: String,
    #[serde(default)]
    pub salience: ColumnSalience,
    #[serde(default, skip_serializing_if = "MatchCriteria::is_empty")]
    pub criteria: MatchCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<DataQuality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub format: DataFormat,
    pub frequency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DatasetDefinition {
    pub(crate) fn from_dataset(dataset: &Dataset, hierarchy: &[String]) -> DatasetDefinition {
        let space = dataset.space();
        DatasetDefinition {
            space: space.clone(),
            hierarchy: hierarchy.to_vec(),
            sources: dataset
                .sources()
                .map(|column| {
                    (
                        column.name.clone(),
                        SourceSpec {
                            format: column.format.clone(),
                            frequency: space.frequency_name(column.frequency),
                            salience: column.salience,
                            criteria: column.criteria.clone(),
                            quality_threshold: column.quality_threshold,
                        },
                    )
                })
                .collect(),
            sinks: dataset
                .sinks()
                .map(|column| {
                    (
                        column.name.clone(),
                        SinkSpec {
                            format: column.format.clone(),
                            frequency: space.frequency_name(column.frequency),
                            path: column.path.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<DatasetDefinition> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Build a live dataset from this definition. The space and every
    /// named frequency are re-validated; hand-edited definitions fail
    /// here rather than at first use.
    pub fn instantiate(&self, store: Arc<dyn DataStore>, id: &str) -> Result<Dataset> {
        self.space.ensure_valid()?;
        for layer in &self.hierarchy {
            if self.space.dimension_flag(layer).is_none() {
                return Err(TrellisError::Definition(format!(
                    "hierarchy layer {layer} is not a dimension of space {}",
                    self.space.name()
                )));
            }
        }

        let mut dataset = Dataset::open(store, id, self.space.clone());
        for (name, spec) in &self.sources {
            let frequency = self.space.frequency(&spec.frequency)?;
            let mut column =
                SourceColumn::new(name, spec.format.clone(), frequency).salience(spec.salience);
            if !spec.criteria.is_empty() {
                column = column.criteria(spec.criteria.clone());
            }
            if let Some(threshold) = spec.quality_threshold {
                column = column.quality_threshold(threshold);
            }
            dataset.add_source(column)?;
        }
        for (name, spec) in &self.sinks {
            let frequency = self.space.frequency(&spec.frequency)?;
            let mut column = SinkColumn::new(name, spec.format.clone(), frequency);
            if let Some(path) = &spec.path {
                column = column.path(path);
            }
            dataset.add_sink(column)?;
        }
        Ok(dataset)
    }
}
