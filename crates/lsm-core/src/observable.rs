//! Observable device values.
//!
//! Reactive value source using `tokio::sync::watch` for multi-subscriber
//! notifications. Device DOFs (light-sheet position, detection Z, exposure)
//! and acquisition controls are exposed as `Observable`s so that queues can
//! read the current state and UIs or loops can react to changes.
//!
//! # Propagation
//!
//! An observable can forward every accepted value to other observables
//! ([`Observable::send_updates_to`]); [`Observable::sync_with`] links two of
//! them both ways. Forwarding edges form a directed graph that may contain
//! cycles. Each `set` starts a propagation pass carrying its own visited set,
//! so a value reaches every node at most once and cycles terminate without any
//! shared traversal state.
//!
//! # Example
//!
//! ```
//! use lsm_core::observable::Observable;
//!
//! let exposure = Observable::new("exposure", 0.010)
//!     .with_units("s")
//!     .with_range(0.0, 10.0);
//! let mirror = Observable::new("exposure_mirror", 0.0);
//! exposure.sync_with(&mirror);
//!
//! exposure.set(0.020)?;
//! assert_eq!(mirror.get(), 0.020);
//!
//! mirror.set(0.005)?;
//! assert_eq!(exposure.get(), 0.005);
//! # Ok::<(), lsm_core::LsmError>(())
//! ```

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{LsmError, LsmResult};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Validator<T> = Arc<dyn Fn(&T) -> LsmResult<()> + Send + Sync>;

/// Metadata for an observable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Value name (unique within its device)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical units (e.g., "um", "s", "deg")
    pub units: Option<String>,
    /// Whether the value rejects external writes
    pub read_only: bool,
}

struct Inner<T> {
    id: u64,
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
    targets: RwLock<Vec<Weak<Inner<T>>>>,
}

/// A thread-safe, observable value with change notifications.
///
/// Clones share the same value, subscribers and forwarding edges.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.inner.metadata)
            .field("has_validator", &self.inner.validator.is_some())
            .field("targets", &self.inner.targets.read().len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                sender,
                metadata: ObservableMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                },
                validator: None,
                targets: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Add a description. Only meaningful before the observable is shared.
    #[must_use]
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.map_inner(|inner| inner.metadata.description = Some(description.into()))
    }

    /// Add units.
    #[must_use]
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.map_inner(|inner| inner.metadata.units = Some(units.into()))
    }

    /// Mark as read-only: [`Observable::set`] fails, propagation still applies.
    #[must_use]
    pub fn read_only(self) -> Self {
        self.map_inner(|inner| inner.metadata.read_only = true)
    }

    /// Add a custom validator function.
    #[must_use]
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> LsmResult<()> + Send + Sync + 'static,
    {
        self.map_inner(|inner| inner.validator = Some(Arc::new(validator)))
    }

    fn map_inner(self, f: impl FnOnce(&mut Inner<T>)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            // Already shared: builder methods are no-ops.
            Err(inner) => Self { inner },
        }
    }

    /// Get the current value (clone).
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.sender.borrow().clone()
    }

    /// Get the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.metadata.name
    }

    /// Get the metadata.
    #[must_use]
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.inner.metadata
    }

    /// Set a new value, notifying subscribers and forwarding it along the
    /// propagation graph.
    ///
    /// Returns error if the value is read-only or the validator rejects it.
    pub fn set(&self, value: T) -> LsmResult<()> {
        if self.inner.metadata.read_only {
            return Err(LsmError::Parameter(format!(
                "'{}' is read-only",
                self.inner.metadata.name
            )));
        }
        let mut visited = HashSet::new();
        Self::propagate(&self.inner, value, &mut visited)
    }

    /// Apply `value` to `node` and forward it to every target not yet visited
    /// in this pass.
    fn propagate(node: &Arc<Inner<T>>, value: T, visited: &mut HashSet<u64>) -> LsmResult<()> {
        if !visited.insert(node.id) {
            return Ok(());
        }
        if let Some(validator) = &node.validator {
            validator(&value)?;
        }
        node.sender.send_replace(value.clone());

        let targets: Vec<Arc<Inner<T>>> = {
            let mut edges = node.targets.write();
            edges.retain(|weak| weak.strong_count() > 0);
            edges.iter().filter_map(Weak::upgrade).collect()
        };
        for target in &targets {
            if let Err(err) = Self::propagate(target, value.clone(), visited) {
                tracing::debug!(
                    source = %node.metadata.name,
                    target = %target.metadata.name,
                    error = %err,
                    "Propagated value rejected"
                );
            }
        }
        Ok(())
    }

    /// Forward every value accepted by `self` to `target`.
    ///
    /// Edges are weak: dropping the last handle of `target` removes the edge.
    pub fn send_updates_to(&self, target: &Observable<T>) {
        if Arc::ptr_eq(&self.inner, &target.inner) {
            return;
        }
        let mut edges = self.inner.targets.write();
        let already = edges
            .iter()
            .filter_map(Weak::upgrade)
            .any(|t| Arc::ptr_eq(&t, &target.inner));
        if !already {
            edges.push(Arc::downgrade(&target.inner));
        }
    }

    /// Stop forwarding values to `target`.
    pub fn stop_updates_to(&self, target: &Observable<T>) {
        self.inner
            .targets
            .write()
            .retain(|weak| weak.upgrade().is_some_and(|t| !Arc::ptr_eq(&t, &target.inner)));
    }

    /// Link two observables both ways. `other` takes the current value of
    /// `self`.
    pub fn sync_with(&self, other: &Observable<T>) {
        self.send_updates_to(other);
        other.send_updates_to(self);
        let mut visited = HashSet::new();
        visited.insert(self.inner.id);
        if let Err(err) = Self::propagate(&other.inner, self.get(), &mut visited) {
            tracing::debug!(name = %other.name(), error = %err, "Initial sync rejected");
        }
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.sender.subscribe()
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Get the current value as JSON
    pub fn get_json(&self) -> LsmResult<serde_json::Value> {
        serde_json::to_value(self.get()).map_err(|e| {
            LsmError::Parameter(format!(
                "failed to serialize '{}': {e}",
                self.inner.metadata.name
            ))
        })
    }

    /// Set the value from JSON
    pub fn set_json(&self, json_value: serde_json::Value) -> LsmResult<()> {
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            LsmError::Parameter(format!(
                "failed to deserialize '{}': {e}. Expected type: {}",
                self.inner.metadata.name,
                std::any::type_name::<T>()
            ))
        })?;
        self.set(value)
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add min/max range validation.
    #[must_use]
    pub fn with_range(self, min: T, max: T) -> Self {
        let name = self.name().to_string();
        self.with_validator(move |value: &T| {
            if value < &min || value > &max {
                Err(LsmError::Parameter(format!(
                    "'{name}' value {value:?} out of range [{min:?}, {max:?}]"
                )))
            } else {
                Ok(())
            }
        })
    }
}

impl Observable<u64> {
    /// Add one and return the new value.
    pub fn increment(&self) -> u64 {
        let next = self.get().saturating_add(1);
        let mut visited = HashSet::new();
        // Counters carry no validator that could reject an increment.
        let _ = Self::propagate(&self.inner, next, &mut visited);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("test", 42);
        assert_eq!(obs.get(), 42);
        obs.set(100).unwrap();
        assert_eq!(obs.get(), 100);
    }

    #[test]
    fn test_observable_metadata() {
        let obs = Observable::new("z", 0.0)
            .with_units("um")
            .with_description("Detection focus");
        assert_eq!(obs.name(), "z");
        assert_eq!(obs.metadata().units.as_deref(), Some("um"));
        assert_eq!(obs.metadata().description.as_deref(), Some("Detection focus"));
    }

    #[test]
    fn test_observable_range_validation() {
        let obs = Observable::new("power", 50.0).with_range(0.0, 100.0);
        assert!(obs.set(75.0).is_ok());
        assert!(obs.set(150.0).is_err());
        assert_eq!(obs.get(), 75.0);
    }

    #[test]
    fn test_observable_read_only() {
        let obs = Observable::new("readout", 3.9).read_only();
        assert!(obs.set(1.0).is_err());
        assert_eq!(obs.get(), 3.9);
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("counter", 0_u64);
        let mut rx = obs.subscribe();

        obs.increment();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let obs = Observable::new("exposure", 0.01);
        assert_eq!(obs.get_json().unwrap(), serde_json::json!(0.01));
        obs.set_json(serde_json::json!(0.02)).unwrap();
        assert_eq!(obs.get(), 0.02);
        assert!(obs.set_json(serde_json::json!("fast")).is_err());
    }

    #[test]
    fn test_one_way_propagation() {
        let source = Observable::new("source", 0);
        let target = Observable::new("target", 0);
        source.send_updates_to(&target);

        source.set(5).unwrap();
        assert_eq!(target.get(), 5);

        target.set(9).unwrap();
        assert_eq!(source.get(), 5);
    }

    #[test]
    fn test_cycle_terminates() {
        let a = Observable::new("a", 0);
        let b = Observable::new("b", 0);
        let c = Observable::new("c", 0);
        a.send_updates_to(&b);
        b.send_updates_to(&c);
        c.send_updates_to(&a);

        b.set(3).unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (3, 3, 3));
    }

    #[test]
    fn test_sync_with_takes_source_value() {
        let a = Observable::new("a", 7);
        let b = Observable::new("b", 0);
        a.sync_with(&b);
        assert_eq!(b.get(), 7);
        b.set(1).unwrap();
        assert_eq!(a.get(), 1);
    }

    #[test]
    fn test_rejected_target_keeps_source_value() {
        let source = Observable::new("source", 0.0);
        let bounded = Observable::new("bounded", 0.0).with_range(-1.0, 1.0);
        source.send_updates_to(&bounded);

        source.set(5.0).unwrap();
        assert_eq!(source.get(), 5.0);
        assert_eq!(bounded.get(), 0.0);
    }

    #[test]
    fn test_dropped_target_edge_removed() {
        let source = Observable::new("source", 0);
        {
            let target = Observable::new("target", 0);
            source.send_updates_to(&target);
        }
        source.set(1).unwrap();
        assert_eq!(source.inner.targets.read().len(), 0);
    }

    #[test]
    fn test_stop_updates() {
        let source = Observable::new("source", 0);
        let target = Observable::new("target", 0);
        source.send_updates_to(&target);
        source.stop_updates_to(&target);
        source.set(4).unwrap();
        assert_eq!(target.get(), 0);
    }
}
