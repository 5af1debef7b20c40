//! Per-key single-flight with a shared outcome

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome published by a leader, typed by the caller
pub type Shared = Arc<dyn Any + Send + Sync>;

type Slot = watch::Receiver<Option<Shared>>;

/// Collapses concurrent cold-miss loads of one key within the process.
///
/// The first caller for a key becomes the [`Leader`] and runs the load;
/// callers arriving while it runs get a [`Waiter`] and receive whatever
/// the leader publishes, error included. The entry is removed when the
/// leader is dropped.
#[derive(Default, Clone)]
pub struct Flight {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

pub enum Role {
    Leader(Leader),
    Waiter(Waiter),
}

pub struct Leader {
    key: String,
    tx: watch::Sender<Option<Shared>>,
    flight: Flight,
}

pub struct Waiter(Slot);

impl Flight {
    /// Lead the load of `key`, or wait on the one already running
    #[must_use]
    pub fn join(&self, key: &str) -> Role {
        let mut map = self.inner.lock();
        if let Some(slot) = map.get(key) {
            return Role::Waiter(Waiter(slot.clone()));
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.to_string(), rx);
        Role::Leader(Leader {
            key: key.to_string(),
            tx,
            flight: self.clone(),
        })
    }

    /// Keys with a load in progress
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Leader {
    /// Publish the outcome to every waiter and retire the key
    pub fn complete<T: Any + Send + Sync>(self, outcome: T) {
        self.tx.send_replace(Some(Arc::new(outcome)));
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        self.flight.inner.lock().remove(&self.key);
    }
}

impl Waiter {
    /// The leader's outcome, or `None` if it went away without one
    pub async fn outcome(mut self) -> Option<Shared> {
        let outcome = match self.0.wait_for(Option::is_some).await {
            Ok(shared) => shared.clone(),
            Err(_) => None,
        };
        outcome
    }
}
