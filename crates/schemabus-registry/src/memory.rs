//! In-process schema registry.
//!
//! Mirrors the registry semantics the clients rely on: ids are assigned once
//! per distinct schema text, registration of an identical schema returns the
//! existing id, and subjects keep an ordered version list. Call counters make
//! caching behaviour observable in tests.

use crate::registry::{RegisteredSchema, RegistryError, SchemaFormat, SchemaRegistry};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    schemas: HashMap<u32, (SchemaFormat, String)>,
    subjects: HashMap<String, Vec<u32>>,
    rejected_subjects: HashSet<String>,
}

/// Schema registry held entirely in memory.
#[derive(Debug, Default)]
pub struct MemorySchemaRegistry {
    state: Mutex<State>,
    latency: Option<Duration>,
    by_id_calls: AtomicUsize,
    latest_calls: AtomicUsize,
    register_calls: AtomicUsize,
}

impl MemorySchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, to widen race windows in tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every future registration under `subject` fail as incompatible.
    pub async fn reject_subject(&self, subject: impl Into<String>) {
        self.state.lock().await.rejected_subjects.insert(subject.into());
    }

    /// Number of fetch-by-id calls served so far.
    #[must_use]
    pub fn fetch_by_id_calls(&self) -> usize {
        self.by_id_calls.load(Ordering::SeqCst)
    }

    /// Number of fetch-latest calls served so far.
    #[must_use]
    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    /// Number of register calls served so far, including rejected ones.
    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn not_found(error_code: i64, message: String) -> RegistryError {
    RegistryError::Api {
        status: 404,
        error_code: Some(error_code),
        message,
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn schema_by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        self.by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let state = self.state.lock().await;
        let (format, schema) = state
            .schemas
            .get(&id)
            .ok_or_else(|| not_found(40403, format!("Schema {id} not found")))?;

        Ok(RegisteredSchema {
            id,
            subject: None,
            version: None,
            format: *format,
            schema: schema.clone(),
        })
    }

    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let state = self.state.lock().await;
        let versions = state
            .subjects
            .get(subject)
            .filter(|versions| !versions.is_empty())
            .ok_or_else(|| not_found(40401, format!("Subject '{subject}' not found")))?;

        let id = versions[versions.len() - 1];
        let (format, schema) = &state.schemas[&id];

        Ok(RegisteredSchema {
            id,
            subject: Some(subject.to_string()),
            version: u32::try_from(versions.len()).ok(),
            format: *format,
            schema: schema.clone(),
        })
    }

    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        format: SchemaFormat,
    ) -> Result<u32, RegistryError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;

        if state.rejected_subjects.contains(subject) {
            return Err(RegistryError::Api {
                status: 409,
                error_code: Some(409),
                message: format!(
                    "Schema being registered is incompatible with an earlier schema for subject \"{subject}\""
                ),
            });
        }

        let existing = state
            .schemas
            .iter()
            .find(|(_, (f, s))| *f == format && s == schema)
            .map(|(id, _)| *id);

        let id = if let Some(id) = existing {
            id
        } else {
            state.next_id += 1;
            let id = state.next_id;
            state.schemas.insert(id, (format, schema.to_string()));
            id
        };

        let versions = state.subjects.entry(subject.to_string()).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }

        Ok(id)
    }
}
