//! One handler per protocol verb
//!
//! Each handler borrows a single store connection from the pool for the
//! whole command; the guard returns it on every exit path. Domain failures
//! become verb-specific negative responses. Store failures are returned as
//! errors so the connection loop can answer `SERVER_ERROR`.

use crate::experiment::{Engine, Experiment};
use crate::protocol::{Command, GetKey, Response, StoreHeader};
use crate::storage::StorePool;
use crate::{Error, Result};
use tracing::debug;

/// Executes parsed commands against the shared store pool
#[derive(Clone)]
pub struct Handler {
    pool: StorePool,
}

/// Failures that are answered in-band rather than aborting the command.
fn is_domain_error(e: &Error) -> bool {
    matches!(
        e,
        Error::ExperimentNotFound(_) | Error::ExperimentNotActive(_) | Error::Json(_)
    )
}

impl Handler {
    pub fn new(pool: StorePool) -> Self {
        Handler { pool }
    }

    /// Run one command and collect the responses to send, in order.
    pub async fn execute(&self, command: Command) -> Result<Vec<Response>> {
        match command {
            Command::Get { keys } => self.get(keys).await,
            Command::Set { id, header } => self.set(id, header).await,
            Command::Add { header } => self.add(header).await,
            Command::Rejected { message, .. } => Ok(vec![Response::ClientError(message)]),
            Command::Delete { id } => self.delete(id).await,
            Command::Touch { id, noreply } => self.touch(id, noreply).await,
            Command::Incr {
                experiment_id,
                user_id,
            } => self.incr(experiment_id, user_id).await,
            Command::Stats { ids } => self.stats(ids).await,
            Command::Quit => Ok(Vec::new()),
        }
    }

    async fn get(&self, keys: Vec<(Vec<u8>, GetKey)>) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);
        let mut responses = Vec::new();

        for (raw, key) in keys {
            let data = match key {
                GetKey::Experiment(id) => match engine.experiment(id, false).await {
                    Ok(experiment) => Some(serde_json::to_vec(&experiment)?),
                    Err(e) if is_domain_error(&e) => None,
                    Err(e) => return Err(e),
                },
                GetKey::AllExperiments => {
                    let ids = engine.all_ids().await?;
                    list_experiments(&mut engine, ids).await?
                }
                GetKey::ActiveExperiments => {
                    let ids = engine.active_ids().await?;
                    list_experiments(&mut engine, ids).await?
                }
                GetKey::Bucket {
                    experiment_id,
                    user_id,
                } => match engine.experiment(experiment_id, true).await {
                    Ok(experiment) => {
                        let variant = engine.assign_or_fetch(&experiment, &user_id, true).await?;
                        (!variant.is_none()).then(|| variant.value.into_bytes())
                    }
                    Err(e) if is_domain_error(&e) => None,
                    Err(e) => return Err(e),
                },
                GetKey::Unresolvable => None,
            };

            match data {
                Some(data) => responses.push(Response::Value { key: raw, data }),
                None => debug!("Skipping unresolvable key {}", String::from_utf8_lossy(&raw)),
            }
        }

        responses.push(Response::End);
        Ok(responses)
    }

    async fn set(&self, id: u64, header: StoreHeader) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        if let Some(mismatch) = check_length(&header) {
            return Ok(vec![mismatch]);
        }
        let stored = match engine.update(id, &header.payload).await {
            Ok(()) => true,
            Err(e) if is_domain_error(&e) => {
                debug!("SET {} not stored: {}", id, e);
                false
            }
            Err(e) => return Err(e),
        };
        Ok(store_reply(stored, header.noreply))
    }

    async fn add(&self, header: StoreHeader) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        if let Some(mismatch) = check_length(&header) {
            return Ok(vec![mismatch]);
        }
        let stored = match engine.add(&header.payload).await {
            Ok(id) => {
                debug!("ADD stored experiment {}", id);
                true
            }
            Err(e) if is_domain_error(&e) => {
                debug!("ADD not stored: {}", e);
                false
            }
            Err(e) => return Err(e),
        };
        Ok(store_reply(stored, header.noreply))
    }

    async fn delete(&self, id: Option<u64>) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        let deleted = match id {
            Some(id) => engine.deactivate(id).await?,
            None => false,
        };
        Ok(vec![if deleted {
            Response::Deleted
        } else {
            Response::NotFound
        }])
    }

    async fn touch(&self, id: Option<u64>, noreply: bool) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        let touched = match id {
            Some(id) => engine.activate(id).await?,
            None => false,
        };
        if noreply {
            return Ok(Vec::new());
        }
        Ok(vec![if touched {
            Response::Touched
        } else {
            Response::NotFound
        }])
    }

    async fn incr(&self, experiment_id: Option<u64>, user_id: Vec<u8>) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        let converted = match experiment_id {
            Some(id) => match engine.record_conversion(id, &user_id).await {
                Ok(converted) => converted,
                Err(e) if is_domain_error(&e) => {
                    debug!("INCR {} not recorded: {}", id, e);
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };
        let data = if converted { "1" } else { "0" };
        Ok(vec![Response::Data(data.to_string())])
    }

    async fn stats(&self, ids: Option<Vec<u64>>) -> Result<Vec<Response>> {
        let mut conn = self.pool.get().await?;
        let mut engine = Engine::new(&mut *conn);

        let ids = match ids {
            Some(ids) => ids,
            None => engine.active_ids().await?,
        };

        let mut responses = Vec::new();
        for id in ids {
            let stats = match engine.stats(id).await {
                Ok(stats) => stats,
                Err(e) if is_domain_error(&e) => continue,
                Err(e) => return Err(e),
            };
            for variant in stats {
                for (name, value) in variant.entries() {
                    responses.push(Response::Stat { name, value });
                }
            }
        }

        responses.push(Response::End);
        Ok(responses)
    }
}

/// JSON array of the experiments among `ids` that load, or `None` when none do.
async fn list_experiments(engine: &mut Engine<'_>, ids: Vec<u64>) -> Result<Option<Vec<u8>>> {
    let mut experiments: Vec<Experiment> = Vec::with_capacity(ids.len());
    for id in ids {
        match engine.experiment(id, false).await {
            Ok(experiment) => experiments.push(experiment),
            Err(e) if is_domain_error(&e) => continue,
            Err(e) => return Err(e),
        }
    }

    if experiments.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_vec(&experiments)?))
}

fn check_length(header: &StoreHeader) -> Option<Response> {
    (header.payload.len() != header.bytes).then(|| {
        Response::ClientError("Value length does not match number of bytes sent".to_string())
    })
}

fn store_reply(stored: bool, noreply: bool) -> Vec<Response> {
    match (noreply, stored) {
        (true, _) => Vec::new(),
        (false, true) => vec![Response::Stored],
        (false, false) => vec![Response::NotStored],
    }
}
