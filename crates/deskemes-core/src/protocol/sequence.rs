//! Thread-safe allocator for channel-zero request IDs.
//!
//! # What is a request ID? (for beginners)
//!
//! Every channel-zero Request carries a one-byte ID, and the peer echoes it
//! in the matching Response or Error.  The ID lets the sender pair a reply
//! with the request that caused it even when several requests are in flight.
//!
//! One byte only allows 256 distinct IDs, so the counter wraps.  Replies
//! normally arrive long before the counter comes round again; stale pending
//! entries are pruned by the owner of the pending-request table.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU8` internally, so it can be shared behind an
//! `Arc` without a `Mutex`.

use std::sync::atomic::{AtomicU8, Ordering};

/// A wrapping counter handing out channel-zero request IDs.
///
/// # Examples
///
/// ```rust
/// use deskemes_core::protocol::RequestIdCounter;
///
/// let counter = RequestIdCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RequestIdCounter {
    inner: AtomicU8,
}

impl RequestIdCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU8::new(0),
        }
    }

    /// Creates a counter whose first ID is `start`.
    pub fn starting_at(start: u8) -> Self {
        Self {
            inner: AtomicU8::new(start),
        }
    }

    /// Returns the next request ID, wrapping from 255 back to 0.
    ///
    /// `Ordering::Relaxed` is sufficient: IDs only need to be distinct, not
    /// ordered with respect to other memory operations.
    pub fn next(&self) -> u8 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the ID the next call to [`next`](Self::next) will hand out.
    pub fn peek(&self) -> u8 {
        self.inner.load(Ordering::Relaxed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
