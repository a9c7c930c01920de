//! This module implements the problem metadata client and its in-process TTL
//! cache.
//!

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};

use judge::{Result, validation_error};
use sandbox::Context;

/// Metadata of the latest version of a problem. Immutable per
/// (problem, version).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemMeta {
    /// Id of the problem.
    pub problem_id: i64,

    /// Version of the problem's data pack.
    pub version: i32,

    /// Hex sha-256 of the manifest.
    #[serde(default)]
    pub manifest_hash: String,

    /// Object storage key of the data pack.
    pub data_pack_key: String,

    /// Hex sha-256 of the data pack; empty disables verification.
    #[serde(default)]
    pub data_pack_hash: String,

    /// Unix timestamp of the last update.
    #[serde(default)]
    pub updated_at: u64,
}

impl ProblemMeta {
    /// Check the id fields.
    pub fn validate(&self) -> Result<()> {
        if self.problem_id <= 0 {
            return Err(validation_error(format!(
                "invalid problem id {}", self.problem_id)));
        }
        if self.version <= 0 {
            return Err(validation_error(format!(
                "invalid problem version {}", self.version)));
        }
        Ok(())
    }
}

/// The RPC surface of the problem service.
pub trait MetaService: Send + Sync {
    /// Fetch the latest metadata of the given problem.
    fn get_latest(&self, ctx: &Context, problem_id: i64) -> Result<ProblemMeta>;
}

/// A `MetaService` wrapper adding a per-process TTL cache.
pub struct MetaClient {
    service: Arc<dyn MetaService>,
    ttl: Duration,
    cache: Mutex<HashMap<i64, (ProblemMeta, Instant)>>,
}

impl MetaClient {
    /// Create a client caching results for `ttl`. A zero TTL disables
    /// caching entirely.
    pub fn new(service: Arc<dyn MetaService>, ttl: Duration) -> Self {
        MetaClient {
            service,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The latest metadata of the given problem, served from the cache when
    /// fresh.
    pub fn get(&self, ctx: &Context, problem_id: i64) -> Result<ProblemMeta> {
        if self.ttl > Duration::from_secs(0) {
            let cache = self.cache.lock().unwrap();
            if let Some((meta, expires_at)) = cache.get(&problem_id) {
                if Instant::now() < *expires_at {
                    return Ok(meta.clone());
                }
            }
        }

        let meta = self.service.get_latest(ctx, problem_id)?;
        meta.validate()?;

        if self.ttl > Duration::from_secs(0) {
            let mut cache = self.cache.lock().unwrap();
            cache.insert(problem_id, (meta.clone(), Instant::now() + self.ttl));
        }

        Ok(meta)
    }
}
