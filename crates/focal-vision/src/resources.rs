//! Pixel-buffer lifecycle tracking.
//!
//! Every buffer allocated while analyzing an image is registered with a
//! [`ResourceTracker`] through a per-request [`RequestScope`]. The returned
//! [`Tracked`] guard releases its registration exactly once when dropped, on
//! success and error paths alike. When the scope itself ends it sweeps any
//! registration still open and reports it as a leak.
//!
//! The tracker is intentionally single-threaded (`Cell`/`RefCell`): one
//! worker process handles one request at a time.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use image::{DynamicImage, ImageBuffer, Pixel};
use tracing::{debug, warn};

/// Anything whose memory footprint can be reported to the tracker.
pub trait TrackedBuffer {
    fn byte_len(&self) -> usize;
}

impl TrackedBuffer for DynamicImage {
    fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl<P: Pixel> TrackedBuffer for ImageBuffer<P, Vec<P::Subpixel>> {
    fn byte_len(&self) -> usize {
        self.as_raw().len() * std::mem::size_of::<P::Subpixel>()
    }
}

impl<T: Copy> TrackedBuffer for Vec<T> {
    fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

#[derive(Debug)]
struct Registration {
    label: &'static str,
    bytes: usize,
    scope: u64,
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Registrations not yet released
    pub live: usize,
    /// Registrations ever made
    pub total: u64,
    /// Registrations released (normally or by a sweep)
    pub released: u64,
    /// Bytes held by live registrations
    pub live_bytes: usize,
}

/// Registry of live pixel buffers for one worker process.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    registry: RefCell<HashMap<u64, Registration>>,
    next_id: Cell<u64>,
    next_scope: Cell<u64>,
    total: Cell<u64>,
    released: Cell<u64>,
    leaked: Cell<u64>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scope for one request.
    pub fn scope(&self, request: impl Into<String>) -> RequestScope<'_> {
        let id = self.next_scope.get() + 1;
        self.next_scope.set(id);
        RequestScope {
            tracker: self,
            id,
            request: request.into(),
        }
    }

    /// Number of registrations not yet released.
    pub fn live(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Number of registrations ever made.
    pub fn total(&self) -> u64 {
        self.total.get()
    }

    /// Number of registrations swept by scopes instead of released by their owner.
    pub fn leaked(&self) -> u64 {
        self.leaked.get()
    }

    pub fn stats(&self) -> ResourceStats {
        let registry = self.registry.borrow();
        ResourceStats {
            live: registry.len(),
            total: self.total.get(),
            released: self.released.get(),
            live_bytes: registry.values().map(|r| r.bytes).sum(),
        }
    }

    /// Release every live registration. Returns how many were released.
    ///
    /// Used right before the worker is torn down.
    pub fn force_cleanup(&self) -> usize {
        let drained: Vec<Registration> = self.registry.borrow_mut().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        if count > 0 {
            warn!(
                count,
                labels = ?drained.iter().map(|r| r.label).collect::<Vec<_>>(),
                "Force-released live pixel buffers"
            );
        }
        self.released.set(self.released.get() + count as u64);
        count
    }

    fn register(&self, scope: u64, label: &'static str, bytes: usize) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.total.set(self.total.get() + 1);
        self.registry
            .borrow_mut()
            .insert(id, Registration { label, bytes, scope });
        id
    }

    /// Release one registration. Returns false if it was already released.
    fn release(&self, id: u64) -> bool {
        let removed = self.registry.borrow_mut().remove(&id).is_some();
        if removed {
            self.released.set(self.released.get() + 1);
        }
        removed
    }

    fn sweep_scope(&self, scope: u64) -> Vec<Registration> {
        let mut registry = self.registry.borrow_mut();
        let ids: Vec<u64> = registry
            .iter()
            .filter(|(_, r)| r.scope == scope)
            .map(|(id, _)| *id)
            .collect();
        let swept: Vec<Registration> = ids.iter().filter_map(|id| registry.remove(id)).collect();
        drop(registry);

        self.released.set(self.released.get() + swept.len() as u64);
        self.leaked.set(self.leaked.get() + swept.len() as u64);
        swept
    }
}

/// Allocation scope for a single request.
///
/// Dropping the scope sweeps anything registered through it that was not
/// released, logging each as a leak.
pub struct RequestScope<'t> {
    tracker: &'t ResourceTracker,
    id: u64,
    request: String,
}

impl<'t> RequestScope<'t> {
    /// Register a buffer and wrap it in a release-on-drop guard.
    pub fn track<T: TrackedBuffer>(&self, label: &'static str, value: T) -> Tracked<'_, T> {
        let id = self.tracker.register(self.id, label, value.byte_len());
        Tracked {
            value,
            id,
            tracker: self.tracker,
        }
    }

    /// Registrations opened through this scope and not yet released.
    pub fn live(&self) -> usize {
        self.tracker
            .registry
            .borrow()
            .values()
            .filter(|r| r.scope == self.id)
            .count()
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        let swept = self.tracker.sweep_scope(self.id);
        if swept.is_empty() {
            debug!(request = %self.request, "Request released all pixel buffers");
            return;
        }

        let bytes: usize = swept.iter().map(|r| r.bytes).sum();
        warn!(
            request = %self.request,
            leaked = swept.len(),
            bytes,
            labels = ?swept.iter().map(|r| r.label).collect::<Vec<_>>(),
            "Pixel buffers leaked by request; released by scope sweep"
        );
        metrics::counter!("focal_resources_leaked_total").increment(swept.len() as u64);
    }
}

/// A registered buffer. Derefs to the inner value; releases on drop.
pub struct Tracked<'a, T> {
    value: T,
    id: u64,
    tracker: &'a ResourceTracker,
}

impl<T> Tracked<'_, T> {
    /// Tracker registration id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Deref for Tracked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Tracked<'_, T> {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Tracked<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn test_release_on_drop() {
        let tracker = ResourceTracker::new();
        {
            let scope = tracker.scope("req-1");
            let gray = scope.track("gray", GrayImage::new(10, 10));
            assert_eq!(gray.width(), 10);
            assert_eq!(tracker.live(), 1);
            assert_eq!(tracker.stats().live_bytes, 100);
        }
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.total(), 1);
        assert_eq!(tracker.leaked(), 0);
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing(scope: &RequestScope<'_>) -> Result<(), String> {
            let _buffer = scope.track("scratch", vec![0.0f32; 16]);
            Err("stage failed".to_string())
        }

        let tracker = ResourceTracker::new();
        let scope = tracker.scope("req-err");
        assert!(failing(&scope).is_err());
        assert_eq!(scope.live(), 0);
        drop(scope);
        assert_eq!(tracker.leaked(), 0);
    }

    #[test]
    fn test_scope_sweeps_leaks() {
        let tracker = ResourceTracker::new();
        {
            let scope = tracker.scope("req-leak");
            let kept = scope.track("kept", vec![1u8; 8]);
            std::mem::forget(scope.track("forgotten", vec![2u8; 8]));
            drop(kept);
            assert_eq!(tracker.live(), 1);
        }
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.leaked(), 1);
        assert_eq!(tracker.stats().released, 2);
    }

    #[test]
    fn test_live_never_negative_and_force_cleanup() {
        let tracker = ResourceTracker::new();
        let scope = tracker.scope("req-force");

        for _ in 0..5 {
            std::mem::forget(scope.track("buf", vec![0u8; 4]));
        }
        let released_once = scope.track("once", vec![0u8; 4]);
        let id = released_once.id();
        drop(released_once);

        // Double release is a no-op
        assert!(!tracker.release(id));
        assert_eq!(tracker.live(), 5);

        assert_eq!(tracker.force_cleanup(), 5);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.force_cleanup(), 0);
        assert_eq!(tracker.total(), 6);

        // The scope sweep after a forced cleanup finds nothing
        drop(scope);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.leaked(), 0);
    }
}
