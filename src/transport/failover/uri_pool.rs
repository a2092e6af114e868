//! Candidate broker URIs shared by the reconnect task and the backup pool
//!
//! A URI is either *available* (may be handed out) or *checked out* (the
//! active transport or a backup is using it). `get_uri` checks a candidate
//! out; it comes back with `return_uri` when the transport using it fails.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct PoolState {
    members: Vec<String>,
    /// Explicitly configured priority URIs
    priority: Vec<String>,
    available: VecDeque<String>,
    randomize: bool,
}

impl PoolState {
    fn is_priority(&self, uri: &str) -> bool {
        if self.priority.is_empty() {
            self.members.first().map(|first| first == uri).unwrap_or(false)
        } else {
            self.priority.iter().any(|p| p == uri)
        }
    }

    fn take_at(&mut self, index: usize) -> Option<String> {
        self.available.remove(index)
    }
}

/// Thread-safe pool of candidate URIs
#[derive(Debug, Default)]
pub struct UriPool {
    state: Mutex<PoolState>,
}

impl UriPool {
    pub fn new<I, P>(uris: I, priority: P, randomize: bool) -> Self
    where
        I: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        let pool = Self {
            state: Mutex::new(PoolState {
                priority: priority.into_iter().map(|uri| uri.trim().to_string()).collect(),
                randomize,
                ..PoolState::default()
            }),
        };
        for uri in uris {
            pool.add_uri(&uri);
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out the next candidate
    ///
    /// Available explicit priority URIs win; otherwise the head of the
    /// rotation, or a random entry when randomizing.
    pub fn get_uri(&self) -> Option<String> {
        let mut state = self.lock();
        if state.available.is_empty() {
            return None;
        }

        if !state.priority.is_empty() {
            let position = state
                .available
                .iter()
                .position(|uri| state.priority.contains(uri));
            if let Some(position) = position {
                return state.take_at(position);
            }
        }

        let index = if state.randomize {
            rand::thread_rng().gen_range(0..state.available.len())
        } else {
            0
        };
        state.take_at(index)
    }

    /// Check out an available priority URI, if there is one
    pub fn get_priority_uri(&self) -> Option<String> {
        let mut state = self.lock();
        let position = state
            .available
            .iter()
            .position(|uri| state.is_priority(uri))?;
        state.take_at(position)
    }

    /// Make a checked out URI available again
    ///
    /// URIs removed from the pool while checked out are dropped.
    pub fn return_uri(&self, uri: &str) {
        let mut state = self.lock();
        if state.members.iter().any(|member| member == uri)
            && !state.available.iter().any(|available| available == uri)
        {
            state.available.push_back(uri.to_string());
        }
    }

    /// Check out a specific URI; false if it is not available
    pub fn checkout(&self, uri: &str) -> bool {
        let mut state = self.lock();
        match state.available.iter().position(|available| available == uri) {
            Some(position) => {
                state.available.remove(position);
                true
            }
            None => false,
        }
    }

    /// Add a URI; false if it is already a member
    pub fn add_uri(&self, uri: &str) -> bool {
        let uri = uri.trim();
        if uri.is_empty() {
            return false;
        }
        let mut state = self.lock();
        if state.members.iter().any(|member| member == uri) {
            return false;
        }
        state.members.push(uri.to_string());
        state.available.push_back(uri.to_string());
        true
    }

    /// Remove a URI whether or not it is checked out; false if unknown
    pub fn remove_uri(&self, uri: &str) -> bool {
        let mut state = self.lock();
        let before = state.members.len();
        state.members.retain(|member| member != uri);
        state.available.retain(|available| available != uri);
        state.members.len() != before
    }

    pub fn is_priority(&self, uri: &str) -> bool {
        self.lock().is_priority(uri)
    }

    /// Whether any priority URI is waiting to be checked out
    pub fn is_priority_available(&self) -> bool {
        let state = self.lock();
        state.available.iter().any(|uri| state.is_priority(uri))
    }

    pub fn has_explicit_priority(&self) -> bool {
        !self.lock().priority.is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.lock().members.iter().any(|member| member == uri)
    }

    pub fn is_available(&self, uri: &str) -> bool {
        self.lock().available.iter().any(|available| available == uri)
    }

    /// Members in the order they were added
    pub fn members(&self) -> Vec<String> {
        self.lock().members.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.lock().available.len()
    }

    pub fn is_randomized(&self) -> bool {
        self.lock().randomize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn uris(list: &[&str]) -> Vec<String> {
        list.iter().map(|uri| uri.to_string()).collect()
    }

    #[test]
    fn test_sequential_pool_hands_out_in_order() {
        let pool = UriPool::new(uris(&["mock://a:1", "mock://b:2", "mock://c:3"]), vec![], false);

        assert_eq!(pool.get_uri().as_deref(), Some("mock://a:1"));
        assert_eq!(pool.get_uri().as_deref(), Some("mock://b:2"));
        assert_eq!(pool.get_uri().as_deref(), Some("mock://c:3"));
        assert_eq!(pool.get_uri(), None);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let pool = UriPool::new(uris(&["mock://a:1", "mock://a:1"]), vec![], false);

        assert_eq!(pool.len(), 1);
        assert!(!pool.add_uri("mock://a:1"));
        assert!(pool.add_uri("mock://b:2"));
        assert_eq!(pool.members(), uris(&["mock://a:1", "mock://b:2"]));
    }

    #[test]
    fn test_return_uri_only_for_members() {
        let pool = UriPool::new(uris(&["mock://a:1", "mock://b:2"]), vec![], false);
        let first = pool.get_uri().unwrap();

        // Removed while checked out: not returned to rotation
        pool.remove_uri(&first);
        pool.return_uri(&first);
        assert!(!pool.is_available(&first));

        // Returning twice does not duplicate
        let second = pool.get_uri().unwrap();
        pool.return_uri(&second);
        pool.return_uri(&second);
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_explicit_priority_is_preferred() {
        let pool = UriPool::new(
            uris(&["mock://a:1", "mock://b:2", "mock://c:3"]),
            uris(&["mock://c:3"]),
            false,
        );

        assert!(pool.is_priority("mock://c:3"));
        assert!(!pool.is_priority("mock://a:1"));
        assert_eq!(pool.get_uri().as_deref(), Some("mock://c:3"));
        assert_eq!(pool.get_uri().as_deref(), Some("mock://a:1"));
    }

    #[test]
    fn test_first_uri_is_implicit_priority() {
        let pool = UriPool::new(uris(&["mock://a:1", "mock://b:2"]), vec![], true);

        assert!(pool.is_priority("mock://a:1"));
        assert!(!pool.is_priority("mock://b:2"));
        assert!(pool.is_priority_available());
        assert_eq!(pool.get_priority_uri().as_deref(), Some("mock://a:1"));
        assert!(!pool.is_priority_available());
        assert_eq!(pool.get_priority_uri(), None);
    }

    #[test]
    fn test_checkout_specific_uri() {
        let pool = UriPool::new(uris(&["mock://a:1", "mock://b:2"]), vec![], false);

        assert!(pool.checkout("mock://b:2"));
        assert!(!pool.checkout("mock://b:2"));
        assert_eq!(pool.get_uri().as_deref(), Some("mock://a:1"));
        assert_eq!(pool.get_uri(), None);
    }

    proptest! {
        #[test]
        fn sequential_selection_cycles_in_configured_order(
            names in proptest::collection::hash_set("[a-z]{1,8}", 1..8),
            rounds in 1usize..4
        ) {
            // Property: get/return cycles visit every URI in configured order
            let configured: Vec<String> = names.iter().map(|n| format!("mock://{n}:1")).collect();
            let pool = UriPool::new(configured.clone(), vec![], false);

            for _ in 0..rounds {
                for expected in &configured {
                    let uri = pool.get_uri();
                    prop_assert_eq!(uri.as_ref(), Some(expected));
                    pool.return_uri(expected);
                }
            }
        }

        #[test]
        fn randomized_selection_hands_out_each_member_once(
            names in proptest::collection::hash_set("[a-z]{1,8}", 1..8)
        ) {
            // Property: draining a randomized pool yields every member exactly once
            let configured: Vec<String> = names.iter().map(|n| format!("mock://{n}:1")).collect();
            let pool = UriPool::new(configured.clone(), vec![], true);

            let mut seen = HashSet::new();
            while let Some(uri) = pool.get_uri() {
                prop_assert!(seen.insert(uri));
            }
            prop_assert_eq!(seen.len(), configured.len());
        }
    }
}
