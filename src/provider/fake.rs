//! In-memory provider used by executor and reconciler tests.
//!
//! Objects live in a map. Two attributes steer behaviour: `fail: true` makes
//! create and update reject the request, and `delay_ms: n` makes the call
//! sleep first. Computed attributes from the schema are filled in as
//! `"{id}-{attribute}"`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{ProviderError, ProviderResult};
use crate::graph::Attributes;

use super::{CreatedResource, DestroyOutcome, Provider, ProviderSchema};

/// Scripted in-memory provider.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    schema: ProviderSchema,
    objects: Mutex<BTreeMap<(String, String), Attributes>>,
    calls: Mutex<Vec<String>>,
    failing_destroys: Mutex<Vec<String>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new(schema: ProviderSchema) -> Self {
        Self::named("fake", schema)
    }

    pub fn named(name: &str, schema: ProviderSchema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failing_destroys: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Mutating calls so far, as `"op:kind"` or `"op:kind:id"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Number of create, update and destroy calls.
    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !c.starts_with("read:"))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn object(&self, kind: &str, id: &str) -> Option<Attributes> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&(kind.to_string(), id.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("objects lock").len()
    }

    /// Changes an attribute behind the engine's back.
    pub fn tamper(&self, kind: &str, id: &str, attribute: &str, value: Value) {
        if let Some(object) = self
            .objects
            .lock()
            .expect("objects lock")
            .get_mut(&(kind.to_string(), id.to_string()))
        {
            object.insert(attribute.to_string(), value);
        }
    }

    /// Deletes an object behind the engine's back.
    pub fn forget(&self, kind: &str, id: &str) {
        self.objects
            .lock()
            .expect("objects lock")
            .remove(&(kind.to_string(), id.to_string()));
    }

    /// Makes destroy calls for `id` fail.
    pub fn fail_destroy(&self, id: &str) {
        self.failing_destroys
            .lock()
            .expect("destroy lock")
            .push(id.to_string());
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    async fn enter(&self, attributes: Option<&Attributes>) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = attributes
            .and_then(|a| a.get("delay_ms"))
            .and_then(Value::as_u64)
            .unwrap_or(5);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn should_fail(attributes: &Attributes) -> bool {
        attributes.get("fail") == Some(&Value::Bool(true))
    }

    fn with_computed(&self, kind: &str, id: &str, mut attributes: Attributes) -> Attributes {
        if let Some(schema) = self.schema.kind(kind) {
            for attribute in &schema.computed {
                attributes.insert(attribute.clone(), Value::String(format!("{id}-{attribute}")));
            }
        }
        attributes
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ProviderSchema {
        self.schema.clone()
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<CreatedResource> {
        self.record(format!("create:{kind}"));
        self.enter(Some(attributes)).await;
        self.leave();

        if Self::should_fail(attributes) {
            return Err(ProviderError::rejected(400, format!("{kind} refused")));
        }

        let id = format!("{kind}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let stored = self.with_computed(kind, &id, attributes.clone());
        self.objects
            .lock()
            .expect("objects lock")
            .insert((kind.to_string(), id.clone()), stored.clone());

        Ok(CreatedResource {
            id,
            attributes: stored,
        })
    }

    async fn read(&self, kind: &str, id: &str) -> ProviderResult<Option<Attributes>> {
        self.record(format!("read:{kind}:{id}"));
        Ok(self.object(kind, id))
    }

    async fn update(&self, kind: &str, id: &str, changed: &Attributes) -> ProviderResult<Attributes> {
        self.record(format!("update:{kind}:{id}"));
        self.enter(Some(changed)).await;
        self.leave();

        if Self::should_fail(changed) {
            return Err(ProviderError::rejected(400, format!("{kind} refused")));
        }

        let mut objects = self.objects.lock().expect("objects lock");
        let object = objects
            .get_mut(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| ProviderError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;
        for (key, value) in changed {
            if value.is_null() {
                object.remove(key);
            } else {
                object.insert(key.clone(), value.clone());
            }
        }
        Ok(object.clone())
    }

    async fn destroy(&self, kind: &str, id: &str) -> ProviderResult<DestroyOutcome> {
        self.record(format!("destroy:{kind}:{id}"));
        self.enter(None).await;
        self.leave();

        if self.failing_destroys.lock().expect("destroy lock").iter().any(|d| d == id) {
            return Err(ProviderError::Conflict {
                message: format!("{id} still in use"),
            });
        }

        let removed = self
            .objects
            .lock()
            .expect("objects lock")
            .remove(&(kind.to_string(), id.to_string()));
        Ok(if removed.is_some() {
            DestroyOutcome::Destroyed
        } else {
            DestroyOutcome::NotFound
        })
    }
}
