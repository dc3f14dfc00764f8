//! Content hashing and process-local memoization.
//!
//! Two bounded LRU caches keyed by structural hashes:
//!
//! 1. manifest hash -> [`AnalyzedManifest`];
//! 2. `(manifest hash, catalog, schema, dynamic-fields mode)` ->
//!    [`SessionIndex`].
//!
//! Hashes are computed over the canonical JSON serialization, so they are
//! stable across processes and insensitive to wire formatting. Racing
//! misses may compute the same value twice; only the cached result must
//! be stable, and it is, because analysis is pure.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ManifestError, PlanError, PlanResult};
use crate::manifest::Manifest;
use crate::semantic::{AnalyzedManifest, SessionIndex};
use crate::session::SessionContext;
use crate::sql::MAX_MANIFEST_BYTES;

/// Compute the SHA-256 hash of a serializable value.
///
/// The value is serialized to JSON first, making the hash structural and
/// deterministic. Returns a 64-character lowercase hex string.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Parse a manifest JSON document, enforcing the size bound.
pub fn parse_manifest(json: &str) -> PlanResult<Manifest> {
    if json.len() > MAX_MANIFEST_BYTES {
        return Err(PlanError::InputTooLarge {
            what: "manifest JSON",
            limit: MAX_MANIFEST_BYTES,
            actual: json.len(),
        });
    }
    serde_json::from_str(json).map_err(|e| {
        PlanError::from(ManifestError::Json {
            message: e.to_string(),
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    manifest_hash: String,
    catalog: String,
    schema: String,
    dynamic_fields: bool,
}

/// Thread-safe, bounded memoization for manifest analysis.
pub struct PlanCache {
    analyzed: Mutex<LruCache<String, Arc<AnalyzedManifest>>>,
    sessions: Mutex<LruCache<SessionKey, Arc<SessionIndex>>>,
}

const DEFAULT_ANALYZED_CAPACITY: usize = 64;
const DEFAULT_SESSION_CAPACITY: usize = 256;

impl Default for PlanCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ANALYZED_CAPACITY, DEFAULT_SESSION_CAPACITY)
    }
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(analyzed: usize, sessions: usize) -> Self {
        let analyzed = NonZeroUsize::new(analyzed.max(1)).expect("capacity is at least one");
        let sessions = NonZeroUsize::new(sessions.max(1)).expect("capacity is at least one");
        PlanCache {
            analyzed: Mutex::new(LruCache::new(analyzed)),
            sessions: Mutex::new(LruCache::new(sessions)),
        }
    }

    /// Analyze a manifest JSON document, reusing a prior analysis of
    /// structurally equal content.
    pub fn analyzed_from_json(&self, json: &str) -> PlanResult<Arc<AnalyzedManifest>> {
        let manifest = parse_manifest(json)?;
        self.analyzed(manifest)
    }

    /// Analyze a manifest value, reusing a prior analysis of structurally
    /// equal content.
    pub fn analyzed(&self, manifest: Manifest) -> PlanResult<Arc<AnalyzedManifest>> {
        let key = compute_hash(&manifest)
            .map_err(|e| PlanError::internal(format!("manifest hashing failed: {e}")))?;
        if let Some(hit) = lock(&self.analyzed).get(&key) {
            return Ok(Arc::clone(hit));
        }
        let analyzed = Arc::new(AnalyzedManifest::analyze(manifest)?);
        lock(&self.analyzed).put(key, Arc::clone(&analyzed));
        Ok(analyzed)
    }

    /// The session-scoped qualified-reference index for one analyzed
    /// manifest.
    pub fn session_index(
        &self,
        analyzed: &Arc<AnalyzedManifest>,
        session: &SessionContext,
    ) -> PlanResult<Arc<SessionIndex>> {
        let manifest_hash = compute_hash(analyzed.manifest())
            .map_err(|e| PlanError::internal(format!("manifest hashing failed: {e}")))?;
        let catalog = if session.catalog.is_empty() {
            analyzed.catalog().to_string()
        } else {
            session.catalog.clone()
        };
        let schema = if session.schema.is_empty() {
            analyzed.schema().to_string()
        } else {
            session.schema.clone()
        };
        let key = SessionKey {
            manifest_hash,
            catalog: catalog.clone(),
            schema: schema.clone(),
            dynamic_fields: session.enable_dynamic_fields,
        };
        if let Some(hit) = lock(&self.sessions).get(&key) {
            return Ok(Arc::clone(hit));
        }
        let index = Arc::new(SessionIndex::new(analyzed, &catalog, &schema));
        lock(&self.sessions).put(key, Arc::clone(&index));
        Ok(index)
    }
}

/// Lock a cache shard, recovering from poisoning: the caches hold only
/// derived, recomputable values.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::builder::{ColumnBuilder, ManifestBuilder, ModelBuilder};

    fn manifest_json(name: &str) -> String {
        format!(
            r#"{{"catalog": "test", "schema": "test", "models": [
                 {{"name": "{name}", "refSql": "SELECT 1 AS x",
                   "columns": [{{"name": "x", "type": "integer"}}]}}]}}"#
        )
    }

    #[test]
    fn hash_is_deterministic_and_structural() {
        let a = parse_manifest(&manifest_json("Orders")).unwrap();
        let b = parse_manifest(&manifest_json("Orders")).unwrap();
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&b).unwrap());
        let c = parse_manifest(&manifest_json("Customer")).unwrap();
        assert_ne!(compute_hash(&a).unwrap(), compute_hash(&c).unwrap());
        assert_eq!(compute_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn equal_manifests_share_one_analysis() {
        let cache = PlanCache::new();
        let first = cache.analyzed_from_json(&manifest_json("Orders")).unwrap();
        let second = cache.analyzed_from_json(&manifest_json("Orders")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn eviction_is_bounded() {
        let cache = PlanCache::with_capacity(1, 1);
        let first = cache.analyzed_from_json(&manifest_json("A")).unwrap();
        let _second = cache.analyzed_from_json(&manifest_json("B")).unwrap();
        let third = cache.analyzed_from_json(&manifest_json("A")).unwrap();
        // "A" was evicted by "B": a fresh analysis, equal but not shared.
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.catalog(), third.catalog());
    }

    #[test]
    fn session_indexes_are_memoized_per_mode() {
        let cache = PlanCache::new();
        let manifest = ManifestBuilder::new()
            .catalog("test")
            .schema("test")
            .model(
                ModelBuilder::new("Orders")
                    .ref_sql("SELECT 1 AS x")
                    .column(ColumnBuilder::new("x", "integer").build())
                    .build(),
            )
            .build();
        let analyzed = cache.analyzed(manifest).unwrap();
        let session = SessionContext::default();
        let first = cache.session_index(&analyzed, &session).unwrap();
        let second = cache.session_index(&analyzed, &session).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let full = session.clone().with_full_materialization();
        let third = cache.session_index(&analyzed, &full).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(third.resolve("test.test.Orders.x").is_some());
        assert!(third.resolve("Orders.x").is_some());
        assert!(third.resolve("Orders.nope").is_none());
    }

    #[test]
    fn oversized_manifest_is_rejected() {
        let padding = "x".repeat(MAX_MANIFEST_BYTES);
        let json = format!(r#"{{"catalog": "{padding}", "schema": "s"}}"#);
        assert!(matches!(
            parse_manifest(&json),
            Err(PlanError::InputTooLarge { .. })
        ));
    }
}
