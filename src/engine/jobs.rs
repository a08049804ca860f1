use std::collections::HashSet;
use std::sync::Mutex;

/// Keys of the uploads currently in flight.
#[derive(Default)]
pub struct JobRegistry {
    active: Mutex<HashSet<String>>,
}

impl JobRegistry {
    /// Register `key`, or return `None` if it is already active.
    /// The key stays registered until the returned guard is dropped.
    pub fn try_acquire(&self, key: &str) -> Option<JobGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.to_string()) {
            return None;
        }
        Some(JobGuard {
            registry: self,
            key: key.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_active(&self, key: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Removes its key from the registry on drop, including on panic and
/// when the owning future is cancelled.
pub struct JobGuard<'a> {
    registry: &'a JobRegistry,
    key: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
