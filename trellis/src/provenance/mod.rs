use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// What produced a derived item: recorded alongside every sink write and
/// consulted before re-deriving. Two records describe the same derivation
/// when pipeline, parameters and input checksums all agree; run ids,
/// timestamps and outputs are incidental.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub run_id: String,
    pub pipeline: String,
    pub generator: Generator,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Source column name -> content checksum.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Sink column name -> content checksum.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// The software that ran the derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub name: String,
    pub version: String,
}

impl Generator {
    pub fn this_crate() -> Generator {
        Generator {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ProvenanceRecord {
    pub fn new(pipeline: &str) -> ProvenanceRecord {
        ProvenanceRecord {
            run_id: Ulid::new().to_string(),
            pipeline: pipeline.to_string(),
            generator: Generator::this_crate(),
            parameters: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Equality for idempotence checks: same pipeline, same parameters,
    /// same input checksums.
    pub fn matches(&self, other: &ProvenanceRecord) -> bool {
        self.pipeline == other.pipeline
            && self.parameters == other.parameters
            && self.inputs == other.inputs
    }
}

// Checksums identify content for provenance comparison only; they are not
// tamper-evident.

pub fn checksum_bytes(bytes: &[u8]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Checksum of a named blob set, invariant to insertion order.
pub fn checksum_files(files: &BTreeMap<String, Vec<u8>>) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for (name, bytes) in files {
        name.hash(&mut hasher);
        bytes.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

pub fn checksum_value(value: &serde_json::Value) -> String {
    checksum_bytes(value.to_string().as_bytes())
}
