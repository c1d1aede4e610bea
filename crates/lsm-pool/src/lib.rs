//! Bounded recycler of reusable image stack buffers.
//!
//! Cameras lease [`StackBuffer`]s from a [`Recycler`] while a queue plays back
//! and hand them downstream; consumers drop (or explicitly release) the
//! [`StackLease`] when done, which returns the buffer to the pool.
//!
//! # Accounting
//!
//! Every buffer is in exactly one state:
//! - **available**: idle in the pool, reusable for a matching request
//! - **live**: leased to a consumer
//!
//! A semaphore with `max_live` permits bounds the live count. A request that
//! finds no permit waits (FIFO) up to the caller's timeout. The idle pool is
//! guarded by a single lock and never holds more than `max_available` buffers.
//! A request the pool cannot serve tops it up to `min_available` buffers of
//! the requested descriptor, so steady-state acquisition stops allocating.
//!
//! # Example
//!
//! ```
//! use lsm_pool::{Recycler, RecyclerLimits, StackRequest};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let recycler = Recycler::new("interactive", RecyclerLimits::new(2, 4, 4));
//! let request = StackRequest::plane(512, 512);
//!
//! let mut stack = recycler.request(&request, Duration::from_millis(100)).await?;
//! stack.data_mut()[0] = 42;
//! assert_eq!(recycler.live(), 1);
//! assert_eq!(recycler.available(), 2);
//!
//! // Returned to the pool when released or dropped
//! stack.release();
//! assert_eq!(recycler.live(), 0);
//! assert_eq!(recycler.available(), 3);
//! # Ok::<(), lsm_pool::RecyclerError>(())
//! # });
//! ```

pub mod limits;
pub mod registry;
pub mod stack;

pub use registry::RecyclerRegistry;
pub use stack::{PixelType, StackBuffer, StackMetadata, StackRequest};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Errors raised by recyclers and stack allocation.
#[derive(Debug, Error)]
pub enum RecyclerError {
    /// No buffer became available before the deadline.
    #[error("recycler '{name}' timed out after {timeout:?} ({live} live of {max_live})")]
    Timeout {
        /// Recycler name.
        name: String,
        /// Waited duration.
        timeout: Duration,
        /// Live count when the wait expired.
        live: usize,
        /// Configured live limit.
        max_live: usize,
    },

    /// The live limit is reached and the caller asked not to wait.
    #[error("recycler '{name}' exhausted ({max_live} live stacks)")]
    Exhausted {
        /// Recycler name.
        name: String,
        /// Configured live limit.
        max_live: usize,
    },

    /// The recycler was closed while waiting.
    #[error("recycler '{0}' is closed")]
    Closed(String),

    /// Invalid pool limits.
    #[error("invalid recycler limits: {0}")]
    InvalidLimits(String),

    /// A stack dimension is zero.
    #[error("empty stack requested ({width}x{height}x{depth})")]
    EmptyStack {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
        /// Requested depth.
        depth: u32,
    },

    /// A stack dimension exceeds the hard limit.
    #[error("stack dimensions {width}x{height}x{depth} exceed limit {max_dimension}")]
    StackDimensionsTooLarge {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
        /// Requested depth.
        depth: u32,
        /// Maximum plane dimension.
        max_dimension: u32,
    },

    /// The stack payload exceeds the hard limit.
    #[error("stack of {bytes} bytes exceeds limit of {max_bytes} bytes")]
    StackTooLarge {
        /// Requested payload size.
        bytes: usize,
        /// Maximum payload size.
        max_bytes: usize,
    },

    /// Arithmetic overflow while sizing a stack.
    #[error("size overflow computing {context}")]
    SizeOverflow {
        /// What was being computed.
        context: &'static str,
    },
}

/// Pool limits of a recycler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecyclerLimits {
    /// Idle buffers kept warm for the last requested descriptor.
    pub min_available: usize,
    /// Maximum number of idle buffers kept for reuse.
    pub max_available: usize,
    /// Maximum number of simultaneously leased buffers.
    pub max_live: usize,
}

impl RecyclerLimits {
    /// Create limits.
    #[must_use]
    pub const fn new(min_available: usize, max_available: usize, max_live: usize) -> Self {
        Self {
            min_available,
            max_available,
            max_live,
        }
    }

    /// Clamp the limits into a usable shape: at least one live slot and
    /// `min_available <= max_available`.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            min_available: self.min_available.min(self.max_available),
            max_available: self.max_available,
            max_live: self.max_live.max(1),
        }
    }

    /// Check the limits are usable.
    pub fn validate(&self) -> Result<(), RecyclerError> {
        if self.max_live == 0 {
            return Err(RecyclerError::InvalidLimits(
                "max_live must be greater than 0".into(),
            ));
        }
        if self.min_available > self.max_available {
            return Err(RecyclerError::InvalidLimits(format!(
                "min_available ({}) exceeds max_available ({})",
                self.min_available, self.max_available
            )));
        }
        Ok(())
    }
}

impl Default for RecyclerLimits {
    fn default() -> Self {
        Self::new(60, 60, 60)
    }
}

/// Bounded pool of reusable stack buffers.
pub struct Recycler {
    name: String,
    limits: RecyclerLimits,
    /// Idle buffers, oldest first.
    available: Mutex<VecDeque<StackBuffer>>,
    /// One permit per live slot.
    live_permits: Arc<Semaphore>,
    live: AtomicUsize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for Recycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recycler")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("live", &self.live())
            .field("available", &self.available())
            .finish()
    }
}

impl Recycler {
    /// Create an empty recycler. Buffers are allocated lazily.
    ///
    /// A `max_live` of zero is raised to one; use [`Recycler::try_new`] to
    /// reject invalid limits instead.
    pub fn new(name: impl Into<String>, limits: RecyclerLimits) -> Arc<Self> {
        let limits = limits.normalized();
        Arc::new(Self {
            name: name.into(),
            limits,
            available: Mutex::new(VecDeque::with_capacity(limits.max_available)),
            live_permits: Arc::new(Semaphore::new(limits.max_live)),
            live: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Create a recycler, rejecting invalid limits.
    pub fn try_new(name: impl Into<String>, limits: RecyclerLimits) -> Result<Arc<Self>, RecyclerError> {
        limits.validate()?;
        Ok(Self::new(name, limits))
    }

    /// Lease a buffer matching `request`, waiting up to `timeout` when the
    /// live limit is reached.
    pub async fn request(
        self: &Arc<Self>,
        request: &StackRequest,
        timeout: Duration,
    ) -> Result<StackLease, RecyclerError> {
        request.validate()?;

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.live_permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RecyclerError::Closed(self.name.clone())),
            Err(_) => {
                warn!(
                    recycler = %self.name,
                    timeout_ms = timeout.as_millis(),
                    live = self.live(),
                    max_live = self.limits.max_live,
                    "Recycler request timed out - stacks are not being released"
                );
                return Err(RecyclerError::Timeout {
                    name: self.name.clone(),
                    timeout,
                    live: self.live(),
                    max_live: self.limits.max_live,
                });
            }
        };

        self.lease(request, permit)
    }

    /// Lease a buffer without waiting.
    pub fn try_request(self: &Arc<Self>, request: &StackRequest) -> Result<StackLease, RecyclerError> {
        request.validate()?;

        let permit = Arc::clone(&self.live_permits)
            .try_acquire_owned()
            .map_err(|_| RecyclerError::Exhausted {
                name: self.name.clone(),
                max_live: self.limits.max_live,
            })?;

        self.lease(request, permit)
    }

    /// Fill the idle pool with buffers for `request` until it holds at least
    /// `count` of them (capped at `max_available`). Returns how many were
    /// allocated.
    pub fn ensure_preallocated(&self, count: usize, request: &StackRequest) -> Result<usize, RecyclerError> {
        let target = count.min(self.limits.max_available);
        let mut allocated = 0;
        loop {
            let matching = self
                .available
                .lock()
                .iter()
                .filter(|b| b.matches(request))
                .count();
            if matching >= target {
                break;
            }
            let buffer = self.allocate(*request)?;
            let mut available = self.available.lock();
            if available.len() >= self.limits.max_available {
                break;
            }
            available.push_back(buffer);
            allocated += 1;
        }
        if allocated > 0 {
            debug!(recycler = %self.name, allocated, request = %request, "Preallocated stacks");
        }
        Ok(allocated)
    }

    /// Drop every idle buffer.
    pub fn free_available(&self) -> usize {
        let drained: Vec<StackBuffer> = self.available.lock().drain(..).collect();
        let freed = drained.len();
        self.evictions.fetch_add(freed as u64, Ordering::Relaxed);
        freed
    }

    /// Close the recycler: pending and future requests fail with
    /// [`RecyclerError::Closed`]. Outstanding leases still return normally.
    pub fn close(&self) {
        self.live_permits.close();
    }

    /// Recycler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> RecyclerLimits {
        self.limits
    }

    /// Number of leased buffers.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of idle buffers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    /// Total number of buffers allocated over the recycler's lifetime.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of requests served from the idle pool.
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of idle buffers discarded (descriptor mismatch, overflow, free).
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn lease(
        self: &Arc<Self>,
        request: &StackRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<StackLease, RecyclerError> {
        let (buffer, reused) = self.take_or_allocate(request)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        let lease = StackLease {
            recycler: Arc::clone(self),
            buffer,
            _permit: permit,
        };
        // A miss means the pool is cold for this descriptor.
        if !reused && self.limits.min_available > 0 {
            self.ensure_preallocated(self.limits.min_available, request)?;
        }
        Ok(lease)
    }

    /// Reuse an idle buffer with a matching descriptor, otherwise evict one
    /// mismatching idle buffer and allocate a fresh one. The flag tells
    /// whether the buffer was reused.
    fn take_or_allocate(&self, request: &StackRequest) -> Result<(StackBuffer, bool), RecyclerError> {
        let evicted = {
            let mut available = self.available.lock();
            let reused = available
                .iter()
                .position(|b| b.matches(request))
                .and_then(|pos| available.remove(pos));
            match reused {
                Some(mut buffer) => {
                    drop(available);
                    buffer.reset();
                    self.reuses.fetch_add(1, Ordering::Relaxed);
                    return Ok((buffer, true));
                }
                None => available.pop_front(),
            }
        };

        if let Some(old) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                recycler = %self.name,
                old = %old.request(),
                new = %request,
                "Evicting idle stack with mismatching dimensions"
            );
            drop(old);
        }

        Ok((self.allocate(*request)?, false))
    }

    fn allocate(&self, request: StackRequest) -> Result<StackBuffer, RecyclerError> {
        let buffer = StackBuffer::allocate(request)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    /// Called by [`StackLease`] on release.
    fn recycle(&self, mut buffer: StackBuffer) {
        buffer.reset();
        let overflow = {
            let mut available = self.available.lock();
            if available.len() < self.limits.max_available {
                available.push_back(buffer);
                None
            } else {
                Some(buffer)
            }
        };
        if overflow.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII lease on a recycler buffer.
///
/// Dereferences to the [`StackBuffer`]. The buffer returns to its recycler when
/// the lease is dropped or [released](StackLease::release); the live permit is
/// given back after the buffer is in the pool, waking one waiter.
pub struct StackLease {
    recycler: Arc<Recycler>,
    buffer: StackBuffer,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for StackLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLease")
            .field("recycler", &self.recycler.name)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl StackLease {
    /// Return the buffer to its recycler.
    pub fn release(self) {
        drop(self);
    }

    /// The recycler this lease belongs to.
    #[must_use]
    pub fn recycler(&self) -> &Arc<Recycler> {
        &self.recycler
    }
}

impl Deref for StackLease {
    type Target = StackBuffer;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for StackLease {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for StackLease {
    fn drop(&mut self) {
        let detached = StackBuffer::detached(*self.buffer.request());
        let buffer = std::mem::replace(&mut self.buffer, detached);
        self.recycler.recycle(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> StackRequest {
        StackRequest::plane(32, 32)
    }

    #[tokio::test]
    async fn test_request_and_release() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 2, 2));

        let mut stack = recycler
            .request(&plane(), Duration::from_millis(10))
            .await
            .unwrap();
        stack.data_mut()[0] = 42;
        assert_eq!(recycler.live(), 1);
        assert_eq!(recycler.available(), 0);

        drop(stack);
        assert_eq!(recycler.live(), 0);
        assert_eq!(recycler.available(), 1);
    }

    #[tokio::test]
    async fn test_reuse_resets_metadata() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 2, 2));

        let mut stack = recycler.try_request(&plane()).unwrap();
        stack.index = 5;
        stack.metadata.add_entry("camera", 1);
        stack.release();

        let stack = recycler.try_request(&plane()).unwrap();
        assert_eq!(stack.index, 0);
        assert!(stack.metadata.is_empty());
        assert_eq!(recycler.allocations(), 1);
        assert_eq!(recycler.reuses(), 1);
    }

    #[tokio::test]
    async fn test_try_request_exhausted() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 1));

        let _held = recycler.try_request(&plane()).unwrap();
        assert!(matches!(
            recycler.try_request(&plane()),
            Err(RecyclerError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_timeout_when_exhausted() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 1));

        let _held = recycler.try_request(&plane()).unwrap();
        let result = recycler.request(&plane(), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RecyclerError::Timeout { live: 1, .. })));
        assert_eq!(recycler.live(), 1);
    }

    #[tokio::test]
    async fn test_mismatch_evicts_idle_buffer() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 2));

        recycler.try_request(&plane()).unwrap().release();
        assert_eq!(recycler.available(), 1);

        let other = StackRequest::plane(64, 64);
        let stack = recycler.try_request(&other).unwrap();
        assert_eq!(stack.request(), &other);
        assert_eq!(recycler.available(), 0);
        assert_eq!(recycler.evictions(), 1);
        assert_eq!(recycler.allocations(), 2);
    }

    #[tokio::test]
    async fn test_release_beyond_max_available_frees() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 3));

        let a = recycler.try_request(&plane()).unwrap();
        let b = recycler.try_request(&plane()).unwrap();
        a.release();
        b.release();

        assert_eq!(recycler.available(), 1);
        assert_eq!(recycler.live(), 0);
        assert_eq!(recycler.evictions(), 1);
    }

    #[tokio::test]
    async fn test_ensure_preallocated() {
        let recycler = Recycler::new("test", RecyclerLimits::new(3, 4, 4));

        let allocated = recycler.ensure_preallocated(3, &plane()).unwrap();
        assert_eq!(allocated, 3);
        assert_eq!(recycler.available(), 3);

        // Already satisfied
        assert_eq!(recycler.ensure_preallocated(3, &plane()).unwrap(), 0);

        // Capped at max_available
        assert_eq!(recycler.ensure_preallocated(10, &plane()).unwrap(), 1);
        assert_eq!(recycler.available(), 4);
    }

    #[tokio::test]
    async fn test_invalid_request_does_not_consume_permit() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 1));

        let bad = StackRequest::plane(0, 16);
        assert!(recycler.try_request(&bad).is_err());
        assert_eq!(recycler.live(), 0);
        assert!(recycler.try_request(&plane()).is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 1));
        let held = recycler.try_request(&plane()).unwrap();

        let waiter = {
            let recycler = Arc::clone(&recycler);
            tokio::spawn(async move { recycler.request(&plane(), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        recycler.close();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(RecyclerError::Closed(_))
        ));
        drop(held);
        assert_eq!(recycler.live(), 0);
    }

    #[test]
    fn test_limits_validation() {
        assert!(RecyclerLimits::new(1, 2, 2).validate().is_ok());
        assert!(RecyclerLimits::new(3, 2, 2).validate().is_err());
        assert!(RecyclerLimits::new(0, 2, 0).validate().is_err());
        assert!(Recycler::try_new("bad", RecyclerLimits::new(0, 0, 0)).is_err());
    }
}
