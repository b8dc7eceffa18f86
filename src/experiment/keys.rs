//! Storage key derivation
//!
//! Every key the engine touches is built here. The layout is shared with any
//! other client of the same store, so the formats must not change.

/// Counter used to allocate experiment ids.
pub const EXPERIMENT_COUNTER: &str = "experiments";

/// Set of experiment ids currently accepting conversions.
pub const ACTIVE_EXPERIMENTS: &str = "active_experiments";

/// Pattern matching every experiment record.
pub const EXPERIMENT_PATTERN: &str = "experiment:*";

const EXPERIMENT_PREFIX: &str = "experiment:";

/// `experiment:{id}`
pub fn experiment(id: u64) -> String {
    format!("{}{}", EXPERIMENT_PREFIX, id)
}

/// `bucket-users:{expId}:{varId}`
pub fn bucket_users(experiment_id: u64, variant_id: u64) -> String {
    format!("bucket-users:{}:{}", experiment_id, variant_id)
}

/// `bucket-impressions:{expId}:{varId}`
pub fn bucket_impressions(experiment_id: u64, variant_id: u64) -> String {
    format!("bucket-impressions:{}:{}", experiment_id, variant_id)
}

/// `convert-users:{expId}:{varId}`
pub fn convert_users(experiment_id: u64, variant_id: u64) -> String {
    format!("convert-users:{}:{}", experiment_id, variant_id)
}

/// `convert-impressions:{expId}:{varId}`
pub fn convert_impressions(experiment_id: u64, variant_id: u64) -> String {
    format!("convert-impressions:{}:{}", experiment_id, variant_id)
}

/// Per-user hash holding one assignment field per experiment.
pub fn user(user_id: &[u8]) -> Vec<u8> {
    let mut key = b"user:".to_vec();
    key.extend_from_slice(user_id);
    key
}

/// Extract the id from an `experiment:{id}` key. Keys with extra segments are ignored.
pub fn experiment_id_from_key(key: &[u8]) -> Option<u64> {
    let rest = key.strip_prefix(EXPERIMENT_PREFIX.as_bytes())?;
    if rest.contains(&b':') {
        return None;
    }
    std::str::from_utf8(rest).ok()?.parse().ok()
}
