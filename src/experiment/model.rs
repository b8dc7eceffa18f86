//! Experiment and variant records as persisted in the store

use serde::{Deserialize, Serialize};

/// A named A/B test. The JSON document stored under `experiment:{id}` is the
/// source of truth; `id` is always taken from the key, never from the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub hypothesis: String,
    pub variants: Vec<Variant>,
}

/// One arm of an experiment. Id 0 means "no variant".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variant {
    pub id: u64,
    pub name: String,
    /// Payload served to users bucketed into this variant.
    pub value: String,
    /// Informational only.
    pub control: bool,
    /// Persisted but not used by selection, which is uniform.
    pub weight: i64,
}

impl Experiment {
    /// Decode a stored record, forcing the id to the one derived from its key.
    pub fn from_record(id: u64, data: &[u8]) -> crate::Result<Self> {
        let mut experiment: Experiment = serde_json::from_slice(data)?;
        experiment.id = id;
        Ok(experiment)
    }

    /// Linear scan for a variant id. Id 0 never matches.
    pub fn variant(&self, id: u64) -> Option<&Variant> {
        if id == 0 {
            return None;
        }
        self.variants.iter().find(|variant| variant.id == id)
    }
}

impl Variant {
    /// True for the zero-value variant returned when nothing resolved.
    pub fn is_none(&self) -> bool {
        self.id == 0
    }
}
