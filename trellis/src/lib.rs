pub mod column;
pub mod dataset;
pub mod error;
pub mod format;
pub mod item;
pub mod pipeline;
pub mod provenance;
pub mod space;
pub mod store;

pub use column::{ColumnSalience, MatchCriteria, ParameterSalience, SinkColumn, SourceColumn};
pub use dataset::{DataRow, Dataset, DatasetDefinition};
pub use error::{Result, TrellisError};
pub use format::{DataFormat, FieldKind};
pub use item::{DataItem, ItemContent};
pub use pipeline::{Pipeline, RunReport};
pub use provenance::ProvenanceRecord;
pub use space::{Coordinates, DataSpace, Frequency};
pub use store::{DataQuality, DataStore, FileTreeStore, MemoryStore, RetryingStore};
