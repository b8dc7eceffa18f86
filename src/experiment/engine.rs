//! Bucketing and conversion engine
//!
//! All experiment state lives in the backend store. The engine borrows one
//! store connection for the duration of a command and translates domain
//! operations into store primitives.
//!
//! Assignment is a read-then-write against the user's hash and is not atomic:
//! two first-time requests for the same user may both see "unassigned", both
//! pick a variant, and both write. The last hash write wins, while the
//! bucket-users sets absorb the duplicate adds. Each racing request counts its
//! impression against the variant it picked. This is accepted behavior.

use crate::experiment::{Experiment, Variant, keys};
use crate::storage::Store;
use crate::{Error, Result};
use rand::Rng;
use tracing::debug;

/// Counters for one variant of an experiment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantStats {
    pub experiment_id: u64,
    pub variant_id: u64,
    pub bucket_unique: u64,
    pub bucket_impressions: u64,
    pub convert_unique: u64,
    pub convert_impressions: u64,
}

impl VariantStats {
    /// `(store key, value)` pairs in reporting order.
    pub fn entries(&self) -> [(String, u64); 4] {
        let (e, v) = (self.experiment_id, self.variant_id);
        [
            (keys::bucket_users(e, v), self.bucket_unique),
            (keys::bucket_impressions(e, v), self.bucket_impressions),
            (keys::convert_users(e, v), self.convert_unique),
            (keys::convert_impressions(e, v), self.convert_impressions),
        ]
    }
}

/// Domain operations over one borrowed store connection
pub struct Engine<'a> {
    store: &'a mut dyn Store,
}

impl<'a> Engine<'a> {
    pub fn new(store: &'a mut dyn Store) -> Self {
        Engine { store }
    }

    /// Load an experiment, optionally requiring it to be in the active set.
    pub async fn experiment(&mut self, id: u64, require_active: bool) -> Result<Experiment> {
        let raw = self
            .store
            .get(keys::experiment(id).as_bytes())
            .await?
            .ok_or(Error::ExperimentNotFound(id))?;
        let experiment = Experiment::from_record(id, &raw)?;

        if require_active && !self.is_active(id).await? {
            return Err(Error::ExperimentNotActive(id));
        }
        Ok(experiment)
    }

    pub async fn exists(&mut self, id: u64) -> Result<bool> {
        Ok(self.store.get(keys::experiment(id).as_bytes()).await?.is_some())
    }

    pub async fn is_active(&mut self, id: u64) -> Result<bool> {
        self.store
            .sismember(keys::ACTIVE_EXPERIMENTS.as_bytes(), id.to_string().as_bytes())
            .await
    }

    /// Ids in the active set, ascending. Members that are not ids are ignored.
    pub async fn active_ids(&mut self) -> Result<Vec<u64>> {
        let members = self
            .store
            .smembers(keys::ACTIVE_EXPERIMENTS.as_bytes())
            .await?;
        let mut ids: Vec<u64> = members.iter().filter_map(|m| parse_id(m)).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Ids of every stored experiment record, ascending.
    pub async fn all_ids(&mut self) -> Result<Vec<u64>> {
        let found = self.store.keys(keys::EXPERIMENT_PATTERN.as_bytes()).await?;
        let mut ids: Vec<u64> = found
            .iter()
            .filter_map(|key| keys::experiment_id_from_key(key))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Store a new experiment under a freshly allocated id. The payload only
    /// has to be syntactically valid JSON.
    pub async fn add(&mut self, payload: &[u8]) -> Result<u64> {
        validate_json(payload)?;
        let id = self
            .store
            .incr(keys::EXPERIMENT_COUNTER.as_bytes())
            .await?;
        let id = u64::try_from(id)
            .map_err(|_| Error::Storage(format!("Invalid experiment counter value {}", id)))?;
        self.store
            .set(keys::experiment(id).as_bytes(), payload)
            .await?;
        debug!("Added experiment {}", id);
        Ok(id)
    }

    /// Overwrite an existing experiment record verbatim.
    pub async fn update(&mut self, id: u64, payload: &[u8]) -> Result<()> {
        validate_json(payload)?;
        if !self.exists(id).await? {
            return Err(Error::ExperimentNotFound(id));
        }
        self.store
            .set(keys::experiment(id).as_bytes(), payload)
            .await
    }

    /// Add to the active set. Returns false when no record exists for the id.
    pub async fn activate(&mut self, id: u64) -> Result<bool> {
        if !self.exists(id).await? {
            return Ok(false);
        }
        self.store
            .sadd(keys::ACTIVE_EXPERIMENTS.as_bytes(), id.to_string().as_bytes())
            .await?;
        Ok(true)
    }

    /// Remove from the active set, keeping the record. Returns whether it was active.
    pub async fn deactivate(&mut self, id: u64) -> Result<bool> {
        self.store
            .srem(keys::ACTIVE_EXPERIMENTS.as_bytes(), id.to_string().as_bytes())
            .await
    }

    /// Resolve the user's variant, assigning one uniformly at random when
    /// `allow_assign` is set and no current assignment exists.
    ///
    /// Every resolved lookup counts one bucket impression. When nothing
    /// resolves the zero variant is returned and no counter is touched.
    pub async fn assign_or_fetch(
        &mut self,
        experiment: &Experiment,
        user_id: &[u8],
        allow_assign: bool,
    ) -> Result<Variant> {
        let user_key = keys::user(user_id);
        let field = keys::experiment(experiment.id);

        let stored = self.store.hget(&user_key, field.as_bytes()).await?;
        let mut variant = stored
            .as_deref()
            .and_then(parse_id)
            .and_then(|id| experiment.variant(id))
            .cloned()
            .unwrap_or_default();

        if variant.is_none() && allow_assign && !experiment.variants.is_empty() {
            let idx = rand::rng().random_range(0..experiment.variants.len());
            variant = experiment.variants[idx].clone();
            self.store
                .hset(&user_key, field.as_bytes(), variant.id.to_string().as_bytes())
                .await?;
            self.store
                .sadd(
                    keys::bucket_users(experiment.id, variant.id).as_bytes(),
                    user_id,
                )
                .await?;
            debug!(
                "Assigned user {} to variant {} of experiment {}",
                String::from_utf8_lossy(user_id),
                variant.id,
                experiment.id
            );
        }

        if !variant.is_none() {
            self.store
                .incr(keys::bucket_impressions(experiment.id, variant.id).as_bytes())
                .await?;
        }

        Ok(variant)
    }

    /// Record a conversion for a user already bucketed into an active
    /// experiment. Returns false when the user has no assignment.
    pub async fn record_conversion(&mut self, experiment_id: u64, user_id: &[u8]) -> Result<bool> {
        let experiment = self.experiment(experiment_id, true).await?;
        let variant = self.assign_or_fetch(&experiment, user_id, false).await?;
        if variant.is_none() {
            return Ok(false);
        }

        self.store
            .sadd(
                keys::convert_users(experiment_id, variant.id).as_bytes(),
                user_id,
            )
            .await?;
        self.store
            .incr(keys::convert_impressions(experiment_id, variant.id).as_bytes())
            .await?;
        Ok(true)
    }

    /// Counters for every variant of an experiment. Missing counters read as zero.
    pub async fn stats(&mut self, experiment_id: u64) -> Result<Vec<VariantStats>> {
        let experiment = self.experiment(experiment_id, false).await?;
        let mut stats = Vec::with_capacity(experiment.variants.len());

        for variant in &experiment.variants {
            let v = variant.id;
            stats.push(VariantStats {
                experiment_id,
                variant_id: v,
                bucket_unique: self
                    .store
                    .scard(keys::bucket_users(experiment_id, v).as_bytes())
                    .await?,
                bucket_impressions: self
                    .counter(&keys::bucket_impressions(experiment_id, v))
                    .await?,
                convert_unique: self
                    .store
                    .scard(keys::convert_users(experiment_id, v).as_bytes())
                    .await?,
                convert_impressions: self
                    .counter(&keys::convert_impressions(experiment_id, v))
                    .await?,
            });
        }

        Ok(stats)
    }

    async fn counter(&mut self, key: &str) -> Result<u64> {
        match self.store.get(key.as_bytes()).await? {
            None => Ok(0),
            Some(raw) => parse_id(&raw)
                .ok_or_else(|| Error::Storage(format!("Counter {} is not an integer", key))),
        }
    }
}

fn validate_json(payload: &[u8]) -> Result<()> {
    serde_json::from_slice::<serde::de::IgnoredAny>(payload)?;
    Ok(())
}

fn parse_id(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
