//! Registered threads and fibers.
//!
//! Entries are kept in registration order. Deregistering only flips the
//! liveness flag; the entry, with whatever its storage still holds, stays in
//! place until [`Registry::reap_dead`] runs between capture sessions.

use crate::capture::engine::SharedState;
use crate::capture::events::current_tid;
use crate::capture::status::RegistrationError;
use crate::capture::storage::{EventStorage, StorageKind};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadDescription {
    pub name: String,
    pub thread_id: u64,
    /// Set for threads of another process whose switches are reported to us.
    pub from_other_process: bool,
}

impl ThreadDescription {
    pub fn new(name: impl Into<String>, thread_id: u64) -> Self {
        Self {
            name: name.into(),
            thread_id,
            from_other_process: false,
        }
    }

    pub fn foreign(name: impl Into<String>, thread_id: u64) -> Self {
        Self {
            from_other_process: true,
            ..Self::new(name, thread_id)
        }
    }

    /// Description of the calling thread.
    pub fn current() -> Self {
        let thread = std::thread::current();
        let tid = current_tid();
        let name = thread
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("thread-{tid}"));
        Self::new(name, tid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FiberDescription {
    pub id: u64,
}

pub struct ThreadEntry {
    description: ThreadDescription,
    storage: Arc<EventStorage>,
    alive: AtomicBool,
}

impl ThreadEntry {
    pub fn description(&self) -> &ThreadDescription {
        &self.description
    }

    pub fn storage(&self) -> &Arc<EventStorage> {
        &self.storage
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.storage.retire();
    }
}

pub struct FiberEntry {
    description: FiberDescription,
    storage: Arc<EventStorage>,
    alive: AtomicBool,
}

impl FiberEntry {
    pub fn description(&self) -> FiberDescription {
        self.description
    }

    pub fn storage(&self) -> &Arc<EventStorage> {
        &self.storage
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.storage.retire();
    }
}

pub(crate) struct Registry {
    threads: Vec<Arc<ThreadEntry>>,
    fibers: Vec<Arc<FiberEntry>>,
    max_threads: usize,
    max_fibers: usize,
}

impl Registry {
    pub(crate) fn new(max_threads: usize, max_fibers: usize) -> Self {
        Self {
            threads: Vec::new(),
            fibers: Vec::new(),
            max_threads,
            max_fibers,
        }
    }

    pub(crate) fn add_thread(
        &mut self,
        description: ThreadDescription,
        shared: &Arc<SharedState>,
    ) -> Result<Arc<ThreadEntry>, RegistrationError> {
        if self.find_thread(description.thread_id).is_some() {
            return Err(RegistrationError::ThreadAlreadyRegistered(
                description.thread_id,
            ));
        }
        if self.threads.len() >= self.max_threads {
            return Err(RegistrationError::RegistryFull {
                limit: self.max_threads,
            });
        }
        let entry = Arc::new(ThreadEntry {
            description,
            storage: Arc::new(EventStorage::new(shared.clone(), StorageKind::Thread)),
            alive: AtomicBool::new(true),
        });
        self.threads.push(entry.clone());
        Ok(entry)
    }

    pub(crate) fn add_fiber(
        &mut self,
        description: FiberDescription,
        shared: &Arc<SharedState>,
    ) -> Result<Arc<FiberEntry>, RegistrationError> {
        if self.find_fiber(description.id).is_some() {
            return Err(RegistrationError::FiberAlreadyRegistered(description.id));
        }
        if self.fibers.len() >= self.max_fibers {
            return Err(RegistrationError::RegistryFull {
                limit: self.max_fibers,
            });
        }
        let entry = Arc::new(FiberEntry {
            description,
            storage: Arc::new(EventStorage::new(shared.clone(), StorageKind::Fiber)),
            alive: AtomicBool::new(true),
        });
        self.fibers.push(entry.clone());
        Ok(entry)
    }

    /// Live entry for `thread_id`.
    pub(crate) fn find_thread(&self, thread_id: u64) -> Option<&Arc<ThreadEntry>> {
        self.threads
            .iter()
            .find(|t| t.is_alive() && t.description.thread_id == thread_id)
    }

    pub(crate) fn find_fiber(&self, id: u64) -> Option<&Arc<FiberEntry>> {
        self.fibers
            .iter()
            .find(|f| f.is_alive() && f.description.id == id)
    }

    pub(crate) fn is_registered_thread(&self, thread_id: u64) -> bool {
        self.find_thread(thread_id).is_some()
    }

    pub(crate) fn unregister_thread(&mut self, thread_id: u64) -> Option<Arc<ThreadEntry>> {
        let entry = self.find_thread(thread_id)?.clone();
        entry.mark_dead();
        Some(entry)
    }

    pub(crate) fn unregister_fiber(&mut self, id: u64) -> Option<Arc<FiberEntry>> {
        let entry = self.find_fiber(id)?.clone();
        entry.mark_dead();
        Some(entry)
    }

    pub(crate) fn threads(&self) -> &[Arc<ThreadEntry>] {
        &self.threads
    }

    pub(crate) fn fibers(&self) -> &[Arc<FiberEntry>] {
        &self.fibers
    }

    /// Drop dead entries. Returns how many were removed.
    pub(crate) fn reap_dead(&mut self) -> usize {
        let before = self.threads.len() + self.fibers.len();
        self.threads.retain(|t| t.is_alive());
        self.fibers.retain(|f| f.is_alive());
        before - self.threads.len() - self.fibers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::clock::Clock;

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new(Clock::monotonic()))
    }

    #[test]
    fn test_register_and_lookup() {
        let shared = shared();
        let mut registry = Registry::new(4, 4);
        registry
            .add_thread(ThreadDescription::new("main", 10), &shared)
            .unwrap();
        assert!(registry.is_registered_thread(10));
        assert!(!registry.is_registered_thread(11));
    }

    #[test]
    fn test_duplicate_thread_is_rejected() {
        let shared = shared();
        let mut registry = Registry::new(4, 4);
        registry
            .add_thread(ThreadDescription::new("a", 1), &shared)
            .unwrap();
        let err = registry
            .add_thread(ThreadDescription::new("b", 1), &shared)
            .err();
        assert_eq!(err, Some(RegistrationError::ThreadAlreadyRegistered(1)));
        assert_eq!(registry.threads().len(), 1);
    }

    #[test]
    fn test_capacity_limit_has_no_side_effects() {
        let shared = shared();
        let mut registry = Registry::new(1, 1);
        registry
            .add_thread(ThreadDescription::new("a", 1), &shared)
            .unwrap();
        let err = registry
            .add_thread(ThreadDescription::new("b", 2), &shared)
            .err();
        assert_eq!(err, Some(RegistrationError::RegistryFull { limit: 1 }));
        assert!(!registry.is_registered_thread(2));

        registry
            .add_fiber(FiberDescription { id: 7 }, &shared)
            .unwrap();
        assert!(registry.add_fiber(FiberDescription { id: 8 }, &shared).is_err());
        assert_eq!(registry.fibers().len(), 1);
    }

    #[test]
    fn test_unregister_keeps_entry_until_reaped() {
        let shared = shared();
        let mut registry = Registry::new(4, 4);
        let entry = registry
            .add_thread(ThreadDescription::new("a", 1), &shared)
            .unwrap();
        assert!(registry.unregister_thread(1).is_some());
        assert!(registry.unregister_thread(1).is_none());
        assert!(!entry.is_alive());
        assert!(entry.storage().is_retired());
        assert!(!registry.is_registered_thread(1));
        assert_eq!(registry.threads().len(), 1);

        // A new thread may reuse the id while the old entry waits for cleanup.
        registry
            .add_thread(ThreadDescription::new("a2", 1), &shared)
            .unwrap();
        assert_eq!(registry.reap_dead(), 1);
        assert_eq!(registry.threads().len(), 1);
        assert!(registry.is_registered_thread(1));
    }

    #[test]
    fn test_current_thread_description() {
        let description = std::thread::Builder::new()
            .name("worker-x".into())
            .spawn(ThreadDescription::current)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(description.name, "worker-x");
        assert!(!description.from_other_process);
        assert!(ThreadDescription::foreign("other", 3).from_other_process);
    }
}
