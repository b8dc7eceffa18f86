//! In-memory storage implementation

use crate::storage::{Connector, Store};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A value held under one key, typed the way the backend store types it.
#[derive(Debug, Clone)]
enum Entry {
    String(Vec<u8>),
    Set(HashSet<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
}

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// In-process key-value store. Clones share the same keyspace, so every clone
/// behaves like another connection to one server.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<Vec<u8>, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of keys in store
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn with_set<T>(
        &self,
        key: &[u8],
        create: bool,
        f: impl FnOnce(Option<&mut HashSet<Vec<u8>>>) -> T,
    ) -> Result<T> {
        let mut data = self.data.lock();
        if create && !data.contains_key(key) {
            data.insert(key.to_vec(), Entry::Set(HashSet::new()));
        }
        match data.get_mut(key) {
            Some(Entry::Set(set)) => Ok(f(Some(set))),
            Some(_) => Err(Error::Storage(WRONG_TYPE.to_string())),
            None => Ok(f(None)),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.data.lock().get(key) {
            Some(Entry::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(Error::Storage(WRONG_TYPE.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data
            .lock()
            .insert(key.to_vec(), Entry::String(value.to_vec()));
        Ok(())
    }

    async fn incr(&mut self, key: &[u8]) -> Result<i64> {
        let mut data = self.data.lock();
        let current = match data.get(key) {
            Some(Entry::String(value)) => std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    Error::Storage("ERR value is not an integer or out of range".to_string())
                })?,
            Some(_) => return Err(Error::Storage(WRONG_TYPE.to_string())),
            None => 0,
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::Storage("ERR increment or decrement would overflow".to_string()))?;
        data.insert(key.to_vec(), Entry::String(next.to_string().into_bytes()));
        debug!("INCR {} = {}", String::from_utf8_lossy(key), next);
        Ok(next)
    }

    async fn sadd(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.with_set(key, true, |set| {
            set.map(|set| set.insert(member.to_vec())).unwrap_or(false)
        })
    }

    async fn srem(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        let removed = self.with_set(key, false, |set| {
            set.map(|set| set.remove(member)).unwrap_or(false)
        })?;
        // Empty sets disappear, as they do in the backend store.
        let mut data = self.data.lock();
        if matches!(data.get(key), Some(Entry::Set(set)) if set.is_empty()) {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn sismember(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.with_set(key, false, |set| {
            set.map(|set| set.contains(member)).unwrap_or(false)
        })
    }

    async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.with_set(key, false, |set| {
            set.map(|set| set.iter().cloned().collect()).unwrap_or_default()
        })
    }

    async fn scard(&mut self, key: &[u8]) -> Result<u64> {
        self.with_set(key, false, |set| set.map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn hget(&mut self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.data.lock().get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Error::Storage(WRONG_TYPE.to_string())),
            None => Ok(None),
        }
    }

    async fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let entry = data
            .entry(key.to_vec())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry {
            Entry::Hash(hash) => {
                hash.insert(field.to_vec(), value.to_vec());
                Ok(())
            }
            _ => Err(Error::Storage(WRONG_TYPE.to_string())),
        }
    }

    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn Store>> {
        Ok(Box::new(self.clone()))
    }
}

/// Glob matching supporting `*` and `?`, enough for key enumeration patterns.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
