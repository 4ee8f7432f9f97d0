//! Round-robin credential selection
//!
//! The dispatcher is stateless over the store except for its rotation
//! cursor. Every retry attempt re-picks, so one failing credential never
//! monopolizes a stuck request. Rotation is uniform across a single process
//! lifetime only; the cursor is not persisted.

use std::sync::atomic::{AtomicUsize, Ordering};

use intra_auth::{AppRecord, AppStore};

/// Rotation cursor over the fleet's insertion order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next app in rotation, or `None` when the fleet is empty.
    ///
    /// Callers check for a non-empty fleet before submitting work; `None`
    /// here means the fleet was emptied while a request was in flight.
    pub async fn next_app(&self, store: &AppStore) -> Option<(String, AppRecord)> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        store.nth(idx).await
    }
}
