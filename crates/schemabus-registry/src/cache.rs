//! Memoizing schema cache in front of a [`SchemaRegistry`].
//!
//! Each cache map is guarded by a reader-writer lock and holds one
//! [`OnceCell`] slot per key. A hit only takes the read lock. A miss takes
//! the write lock, re-checks, inserts an empty slot and releases the lock
//! before the registry call; racing callers for the same key then wait on the
//! slot, so at most one fetch per key is in flight while misses on different
//! keys proceed in parallel. A failed fetch leaves the slot empty and the
//! next caller retries; once nobody waits on an empty slot it is dropped
//! from the map, so unresolvable keys do not accumulate.
//!
//! Entries are never evicted: a registry id always names the same schema.

use crate::registry::{RegistryError, SchemaFormat, SchemaRegistry};
use crate::schema::{ParsedSchema, SchemaError, SchemaHandle};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

type Slot = Arc<OnceCell<Arc<SchemaHandle>>>;
type SlotMap<K> = RwLock<HashMap<K, Slot>>;

/// Cache of parsed schemas keyed by id and by subject.
pub struct SchemaCache {
    registry: Arc<dyn SchemaRegistry>,
    by_id: SlotMap<u32>,
    latest_by_subject: SlotMap<String>,
    registered: SlotMap<(String, SchemaFormat, String)>,
}

impl SchemaCache {
    /// Create an empty cache backed by `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            by_id: RwLock::default(),
            latest_by_subject: RwLock::default(),
            registered: RwLock::default(),
        }
    }

    /// The registry behind this cache.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn SchemaRegistry> {
        &self.registry
    }

    /// Resolve a schema id to a parsed schema.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Fetch`] if the registry call fails
    /// - [`CacheError::Parse`] if the returned text is not a valid schema
    pub async fn resolve_by_id(&self, id: u32) -> Result<Arc<SchemaHandle>, CacheError> {
        let slot = slot(&self.by_id, &id).await;
        let result = slot
            .get_or_try_init(|| async {
                tracing::debug!(schema_id = id, "Schema cache miss, fetching by id");

                let registered =
                    self.registry
                        .schema_by_id(id)
                        .await
                        .map_err(|source| CacheError::Fetch {
                            key: format!("id {id}"),
                            source,
                        })?;

                let handle = SchemaHandle::from_registered(registered).map_err(|source| {
                    CacheError::Parse {
                        key: format!("id {id}"),
                        source,
                    }
                })?;

                Ok::<_, CacheError>(Arc::new(handle))
            })
            .await
            .map(Arc::clone);

        if result.is_err() {
            discard_empty(&self.by_id, &id, &slot).await;
        }
        result
    }

    /// Resolve the latest schema registered under `subject`.
    ///
    /// The first successful lookup is cached for the lifetime of the cache.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Fetch`] if the registry call fails
    /// - [`CacheError::Parse`] if the returned text is not a valid schema
    pub async fn resolve_latest(&self, subject: &str) -> Result<Arc<SchemaHandle>, CacheError> {
        let key = subject.to_string();
        let slot = slot(&self.latest_by_subject, &key).await;
        let handle = match slot
            .get_or_try_init(|| async {
                tracing::debug!(subject, "Schema cache miss, fetching latest version");

                let registered = self.registry.latest_schema(subject).await.map_err(|source| {
                    CacheError::Fetch {
                        key: format!("subject {subject}"),
                        source,
                    }
                })?;

                let handle = SchemaHandle::from_registered(registered).map_err(|source| {
                    CacheError::Parse {
                        key: format!("subject {subject}"),
                        source,
                    }
                })?;

                Ok::<_, CacheError>(Arc::new(handle))
            })
            .await
        {
            Ok(handle) => Arc::clone(handle),
            Err(err) => {
                discard_empty(&self.latest_by_subject, &key, &slot).await;
                return Err(err);
            }
        };

        self.remember(&handle).await;
        Ok(handle)
    }

    /// Resolve `definition` under `subject`, registering it if absent.
    ///
    /// The text is parsed locally before anything is sent, so an invalid
    /// schema never reaches the registry. Registration is idempotent on the
    /// registry side; the cache additionally guarantees at most one
    /// registration call per `(subject, format, definition)`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Parse`] if `definition` is not a valid schema
    /// - [`CacheError::Registration`] if the registry rejects the schema
    pub async fn resolve_or_register(
        &self,
        subject: &str,
        definition: &str,
        format: SchemaFormat,
    ) -> Result<Arc<SchemaHandle>, CacheError> {
        let key = (subject.to_string(), format, definition.to_string());
        let slot = slot(&self.registered, &key).await;
        let handle = match slot
            .get_or_try_init(|| async {
                let parsed =
                    ParsedSchema::parse(format, definition).map_err(|source| CacheError::Parse {
                        key: format!("subject {subject}"),
                        source,
                    })?;

                let id = self
                    .registry
                    .register_schema(subject, definition, format)
                    .await
                    .map_err(|source| CacheError::Registration {
                        subject: subject.to_string(),
                        source,
                    })?;

                tracing::info!(subject, schema_id = id, %format, "Schema registered");

                Ok::<_, CacheError>(Arc::new(SchemaHandle::new(
                    id,
                    Some(subject.to_string()),
                    definition.to_string(),
                    parsed,
                )))
            })
            .await
        {
            Ok(handle) => Arc::clone(handle),
            Err(err) => {
                discard_empty(&self.registered, &key, &slot).await;
                return Err(err);
            }
        };

        self.remember(&handle).await;
        Ok(handle)
    }

    /// Number of key slots held across all maps, resolved or not.
    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.by_id.read().await.len()
            + self.latest_by_subject.read().await.len()
            + self.registered.read().await.len()
    }

    /// Whether `id` has already been resolved.
    pub async fn contains_id(&self, id: u32) -> bool {
        self.by_id
            .read()
            .await
            .get(&id)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of ids currently resolved.
    pub async fn cached_ids(&self) -> usize {
        self.by_id
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Make a subject-resolved handle reachable by id as well. An id that is
    /// already present keeps its first handle.
    async fn remember(&self, handle: &Arc<SchemaHandle>) {
        let slot = slot(&self.by_id, &handle.id()).await;
        // Err means the id is already cached or being fetched; both are fine.
        let _ = slot.set(Arc::clone(handle));
    }
}

/// Find or create the slot for `key`, double-checking under the write lock.
async fn slot<K>(map: &SlotMap<K>, key: &K) -> Slot
where
    K: Eq + Hash + Clone,
{
    if let Some(slot) = map.read().await.get(key) {
        return Arc::clone(slot);
    }

    let mut guard = map.write().await;
    Arc::clone(guard.entry(key.clone()).or_default())
}

/// Remove `slot` after a failed fetch unless it got filled meanwhile or
/// another caller still holds it (the map and `slot` account for two).
async fn discard_empty<K>(map: &SlotMap<K>, key: &K, slot: &Slot)
where
    K: Eq + Hash,
{
    let mut guard = map.write().await;
    let unused = guard.get(key).is_some_and(|current| {
        Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
    });
    if unused {
        guard.remove(key);
    }
}

/// Errors from schema resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Registry lookup failed
    #[error("failed to fetch schema ({key}): {source}")]
    Fetch {
        /// What was looked up, e.g. `id 42` or `subject orders-value`
        key: String,
        /// Underlying registry error
        source: RegistryError,
    },
    /// Schema text could not be parsed
    #[error("failed to parse schema ({key}): {source}")]
    Parse {
        /// What was looked up
        key: String,
        /// Underlying parse error
        source: SchemaError,
    },
    /// Registry rejected a registration
    #[error("failed to register schema for subject {subject}: {source}")]
    Registration {
        /// Subject the schema was registered under
        subject: String,
        /// Underlying registry error
        source: RegistryError,
    },
}
