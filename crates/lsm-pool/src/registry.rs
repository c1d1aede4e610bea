//! Named recycler registry.
//!
//! Acquisition modes ask for a recycler by name ("interactive", "timelapse")
//! with the limits they need. The registry hands back the existing instance
//! when the limits match and replaces it otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{Recycler, RecyclerLimits};

/// Registry of recyclers keyed by name.
#[derive(Debug, Default)]
pub struct RecyclerRegistry {
    recyclers: Mutex<HashMap<String, Arc<Recycler>>>,
}

impl RecyclerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the recycler `name` with the given limits.
    ///
    /// A recycler registered under the same name with different limits is
    /// closed and replaced. Leases on the old instance stay valid and return
    /// to it when dropped.
    pub fn use_recycler(
        &self,
        name: &str,
        min_available: usize,
        max_available: usize,
        max_live: usize,
    ) -> Arc<Recycler> {
        let limits = RecyclerLimits::new(min_available, max_available, max_live).normalized();
        let mut recyclers = self.recyclers.lock();

        if let Some(existing) = recyclers.get(name) {
            if existing.limits() == limits {
                return Arc::clone(existing);
            }
            info!(
                recycler = name,
                old = ?existing.limits(),
                new = ?limits,
                "Replacing recycler with new limits"
            );
            existing.close();
        } else {
            info!(
                recycler = name,
                min_available, max_available, max_live, "Created stack recycler"
            );
        }

        let recycler = Recycler::new(name, limits);
        recyclers.insert(name.to_string(), Arc::clone(&recycler));
        recycler
    }

    /// Look up a registered recycler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Recycler>> {
        self.recyclers.lock().get(name).cloned()
    }

    /// Names of the registered recyclers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recyclers.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
