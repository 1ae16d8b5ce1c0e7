//! Per-source single-flight guard
//!
//! At most one fetch runs per canonical source id. The first caller becomes
//! the leader and executes the fetch; everyone else arriving while it runs
//! subscribes to the leader's completion and shares its outcome. The
//! scheduler uses [`SingleFlight::in_flight`] to skip busy sources without
//! penalty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::models::NewsItem;

/// Caller-facing metadata attached to every `get_news` result.
#[derive(Debug, Clone, Default)]
pub struct FetchMeta {
    pub cache_hit: bool,
    pub protection_applied: bool,
    pub age_ms: u64,
    pub error_kind: Option<ErrorKind>,
}

/// The leader's outcome as shared data. Errors travel as (kind, message) so
/// the payload stays `Clone` across any number of followers.
#[derive(Debug)]
pub struct FlightOutcome {
    pub result: Result<(Vec<NewsItem>, FetchMeta), (ErrorKind, String)>,
}

pub type SharedOutcome = Arc<FlightOutcome>;

/// What `begin` hands back.
pub enum FlightRole {
    /// This caller executes the fetch and must call [`FlightLeader::complete`].
    Leader(FlightLeader),
    /// Another fetch is in flight; await the broadcast for its outcome.
    Follower(broadcast::Receiver<SharedOutcome>),
}

/// Leadership token for one source. Completing (or dropping) it releases the
/// slot and wakes every follower.
pub struct FlightLeader {
    flight: Arc<SingleFlight>,
    source_id: String,
    tx: broadcast::Sender<SharedOutcome>,
    completed: bool,
}

impl FlightLeader {
    /// Subscribe to this flight's own completion. Lets the initiating caller
    /// wait like a follower while the fetch runs on a detached task.
    pub fn subscribe(&self) -> broadcast::Receiver<SharedOutcome> {
        self.tx.subscribe()
    }

    /// Publish the outcome and release the slot.
    pub fn complete(mut self, outcome: SharedOutcome) {
        self.completed = true;
        self.flight.release(&self.source_id);
        // Send after release: a new fetch can start as soon as followers wake.
        let _ = self.tx.send(outcome);
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        if !self.completed {
            // Leader aborted (panic or cancellation): release the slot and
            // fail any followers rather than leaving them to time out.
            self.flight.release(&self.source_id);
            let _ = self.tx.send(Arc::new(FlightOutcome {
                result: Err((
                    ErrorKind::AdapterInternal,
                    "leader fetch aborted".to_string(),
                )),
            }));
        }
    }
}

/// The guard itself: one broadcast channel per in-flight source.
pub struct SingleFlight {
    inner: Mutex<HashMap<String, broadcast::Sender<SharedOutcome>>>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Join the flight for a source: first caller leads, the rest follow.
    pub fn begin(self: &Arc<Self>, source_id: &str) -> FlightRole {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.get(source_id) {
            return FlightRole::Follower(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        inner.insert(source_id.to_string(), tx.clone());
        FlightRole::Leader(FlightLeader {
            flight: Arc::clone(self),
            source_id: source_id.to_string(),
            tx,
            completed: false,
        })
    }

    /// Whether a fetch is currently running for the source.
    pub fn in_flight(&self, source_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(source_id)
    }

    /// Number of in-flight fetches (shutdown drain).
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn release(&self, source_id: &str) {
        self.inner.lock().unwrap().remove(source_id);
    }
}
