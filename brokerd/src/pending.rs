//! Registry of executables currently being activated.
//!
//! The one piece of state shared across concurrent activation episodes.
//! `claim` observes absence and inserts in a single critical section, so
//! exactly one caller per executable ever becomes the launcher.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct PendingRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

#[allow(dead_code)]
impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically record that this caller is activating `name`. Returns a
    /// guard if the name was not already claimed; the entry is removed when
    /// the guard drops, which covers every exit path of the owning request.
    pub fn claim(&self, name: &str) -> Option<PendingGuard> {
        let mut set = self.inner.lock().unwrap();
        if set.insert(name.to_string()) {
            Some(PendingGuard {
                registry: self.inner.clone(),
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry from the registry on drop.
#[derive(Debug)]
pub struct PendingGuard {
    registry: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn claim_is_exclusive_until_released() {
        let registry = PendingRegistry::new();

        let guard = registry.claim("mdv-server").expect("first claim");
        assert!(registry.contains("mdv-server"));
        assert!(registry.claim("mdv-server").is_none());

        // A different executable is unaffected.
        assert!(registry.claim("spdb-server").is_some());

        drop(guard);
        assert!(!registry.contains("mdv-server"));
        assert!(registry.claim("mdv-server").is_some());
    }

    #[test]
    fn concurrent_claims_admit_exactly_one_winner() {
        let registry = PendingRegistry::new();
        let mut handles = Vec::new();

        // Each thread returns its guard (if any), so no claim is released
        // until all threads have raced.
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || registry.claim("mdv-server")));
        }

        let guards: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .collect();

        assert_eq!(guards.len(), 1);
        assert!(registry.contains("mdv-server"));

        drop(guards);
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_cleans_up_on_panic() {
        let registry = PendingRegistry::new();
        let cloned = registry.clone();

        let result = thread::spawn(move || {
            let _guard = cloned.claim("mdv-server").unwrap();
            panic!("launch blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!registry.contains("mdv-server"));
    }
}
