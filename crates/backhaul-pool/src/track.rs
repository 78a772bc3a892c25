//! Connection tracker: decides how many agent slots may be outstanding.
//!
//! The tracker knows the set of proxy ids the pool has ever observed and
//! which of them are currently claimed by a live agent. It hands out
//! [`Lease`]s on demand: the number of outstanding *unclaimed* leases is
//! bounded by `max(1, |known \ claimed|)`, so there is always capacity to
//! bootstrap the first connection and to reach any discovered proxy nobody
//! is bonded to yet.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Shared>,
}

struct Shared {
    cluster: String,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    known: BTreeSet<String>,
    claimed: HashSet<String>,
    unclaimed_leases: usize,
    next_lease: u64,
}

impl State {
    fn desired_unclaimed(&self) -> usize {
        (self.known.len() - self.claimed.len()).max(1)
    }
}

impl Tracker {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                cluster: cluster.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Waits until policy allows another agent and returns its lease.
    ///
    /// Cancellation-safe: abandoning the future before it resolves leaves the
    /// tracker unchanged, and a lease dropped unused is released on drop.
    pub async fn acquire(&self) -> Lease {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.unclaimed_leases < state.desired_unclaimed() {
                    state.unclaimed_leases += 1;
                    state.next_lease += 1;
                    let id = state.next_lease;
                    debug!(
                        cluster = %self.inner.cluster,
                        lease = id,
                        known = state.known.len(),
                        claimed = state.claimed.len(),
                        "issued lease"
                    );
                    return Lease {
                        id,
                        shared: self.inner.clone(),
                        claimed: Mutex::new(None),
                        released: AtomicBool::new(false),
                    };
                }
            }
            notified.await;
        }
    }

    /// Records proxies announced by the cluster, waking lease waiters when
    /// the set grows.
    pub fn track_proxies<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = false;
        {
            let mut state = self.inner.state.lock().unwrap();
            for id in ids {
                if state.known.insert(id) {
                    added = true;
                }
            }
        }
        if added {
            debug!(cluster = %self.inner.cluster, "proxy set grew");
            self.inner.notify.notify_waiters();
        }
    }

    /// Proxy ids ever observed, in stable order.
    pub fn known_proxies(&self) -> Vec<String> {
        let state = self.inner.state.lock().unwrap();
        state.known.iter().cloned().collect()
    }

    pub fn claimed_count(&self) -> usize {
        self.inner.state.lock().unwrap().claimed.len()
    }
}

/// Capability to run one agent.
///
/// A lease starts unclaimed. Once the agent authenticates and learns which
/// proxy it reached, [`Lease::claim`] binds the lease to that proxy id.
/// Release happens exactly once, explicitly or on drop.
pub struct Lease {
    id: u64,
    shared: Arc<Shared>,
    claimed: Mutex<Option<String>>,
    released: AtomicBool,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Binds the lease to `proxy_id`. Fails when another lease already holds
    /// that proxy, which is how duplicate sessions to the same proxy are
    /// rejected.
    pub fn claim(&self, proxy_id: &str) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        let mut bound = self.claimed.lock().unwrap();
        if bound.is_some() {
            return false;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.known.insert(proxy_id.to_string());
            if !state.claimed.insert(proxy_id.to_string()) {
                debug!(
                    cluster = %self.shared.cluster,
                    lease = self.id,
                    proxy = proxy_id,
                    "proxy already claimed"
                );
                return false;
            }
            *bound = Some(proxy_id.to_string());
            // The lease no longer counts against the unclaimed budget.
            state.unclaimed_leases -= 1;
        }
        debug!(
            cluster = %self.shared.cluster,
            lease = self.id,
            proxy = proxy_id,
            "lease claimed"
        );
        self.shared.notify.notify_waiters();
        true
    }

    /// Returns the lease to the tracker. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            // Lock order matches claim(): bound before tracker state.
            let bound = self.claimed.lock().unwrap().take();
            let mut state = self.shared.state.lock().unwrap();
            match bound {
                Some(proxy_id) => {
                    state.claimed.remove(&proxy_id);
                }
                None => {
                    state.unclaimed_leases -= 1;
                }
            }
        }
        debug!(cluster = %self.shared.cluster, lease = self.id, "lease released");
        self.shared.notify.notify_waiters();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}
