//! Rebuild-on-miss holders for heavy device-backed objects
//!
//! A [`Resident`] owns at most one instance. [`Resident::get`] builds it on
//! a miss; an owner-driven policy decides when to drop it again through
//! [`Resident::evict_if_idle`] or [`Resident::evict`]. Nothing is released
//! behind the owner's back.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ForgeResult;

type Builder<T> = Box<dyn Fn() -> ForgeResult<T> + Send + Sync>;

struct Slot<T> {
    value: Arc<T>,
    last_used: Instant,
}

pub struct Resident<T> {
    name: String,
    builder: Builder<T>,
    idle_timeout: Duration,
    slot: Mutex<Option<Slot<T>>>,
    builds: AtomicUsize,
}

impl<T> Resident<T> {
    pub fn new<F>(name: &str, idle_timeout: Duration, builder: F) -> Self
    where
        F: Fn() -> ForgeResult<T> + Send + Sync + 'static,
    {
        Resident {
            name: name.to_string(),
            builder: Box::new(builder),
            idle_timeout,
            slot: Mutex::new(None),
            builds: AtomicUsize::new(0),
        }
    }

    /// The live instance, built first if absent. Stamps the last use.
    ///
    /// Build failures are returned and leave the holder empty.
    pub fn get(&self) -> ForgeResult<Arc<T>> {
        let mut slot = self.slot.lock()?;
        let now = Instant::now();
        if let Some(live) = slot.as_mut() {
            live.last_used = now;
            return Ok(Arc::clone(&live.value));
        }
        let value = Arc::new((self.builder)()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Built resident '{}'", self.name);
        *slot = Some(Slot {
            value: Arc::clone(&value),
            last_used: now,
        });
        Ok(value)
    }

    /// Drop the instance if unused for the idle timeout as of `now` and no
    /// caller still holds it. Returns whether it was dropped.
    pub fn evict_if_idle(&self, now: Instant) -> bool {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        let idle = match slot.as_ref() {
            Some(live) => {
                now.saturating_duration_since(live.last_used) >= self.idle_timeout
                    && Arc::strong_count(&live.value) == 1
            }
            None => false,
        };
        if idle {
            *slot = None;
            tracing::debug!("Evicted idle resident '{}'", self.name);
        }
        idle
    }

    /// Drop the instance now. Outstanding `Arc`s keep their copy alive.
    pub fn evict(&self) -> bool {
        match self.slot.lock() {
            Ok(mut slot) => slot.take().is_some(),
            Err(_) => false,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Times the builder has succeeded
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl<T> fmt::Debug for Resident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resident")
            .field("name", &self.name)
            .field("resident", &self.is_resident())
            .field("builds", &self.builds())
            .finish()
    }
}
