//! Insertion-ordered set of live agents.

use std::sync::{Arc, Mutex};

/// Holds the pool's live agents in the order they were added.
///
/// Entries are compared by pointer identity, so removal is exact even when
/// two agents look alike. The mutex is never held across an await point.
pub(crate) struct AgentStore<T> {
    agents: Mutex<Vec<Arc<T>>>,
}

impl<T> AgentStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            agents: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, agent: Arc<T>) {
        self.agents.lock().unwrap().push(agent);
    }

    /// Removes `agent` if present; reports whether removal happened.
    pub(crate) fn remove(&self, agent: &Arc<T>) -> bool {
        let mut agents = self.agents.lock().unwrap();
        match agents.iter().position(|a| Arc::ptr_eq(a, agent)) {
            Some(idx) => {
                agents.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    /// Most recently added agent.
    #[allow(dead_code)]
    pub(crate) fn last(&self) -> Option<Arc<T>> {
        self.agents.lock().unwrap().last().cloned()
    }

    /// Removes and returns the oldest agents while more than `n` remain.
    pub(crate) fn pop_while_over(&self, n: usize) -> Vec<Arc<T>> {
        let mut agents = self.agents.lock().unwrap();
        let surplus = agents.len().saturating_sub(n);
        agents.drain(..surplus).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.agents.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) -> Vec<Arc<T>> {
        std::mem::take(&mut *self.agents.lock().unwrap())
    }
}
