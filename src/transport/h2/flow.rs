//! Flow-control windows and outbound credit reservation (RFC 9113 Section 5.2).
//!
//! Every outbound DATA byte is debited from two windows: the stream's and the
//! connection's. Balances are signed because a SETTINGS_INITIAL_WINDOW_SIZE
//! reduction can push a stream window below zero.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::h2::frame::MAX_WINDOW_SIZE;

/// Default initial window size (RFC 9113 Section 6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// A credit would push the window past 2^31-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow-control window would exceed 2^31-1")]
pub struct WindowOverflow;

/// Signed credit counter with a "credit available" signal.
#[derive(Debug)]
pub struct FlowControlWindow {
    balance: AtomicI64,
    credit_available: Notify,
}

impl FlowControlWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            balance: AtomicI64::new(initial as i64),
            credit_available: Notify::new(),
        }
    }

    /// Current balance. May be negative.
    pub fn available(&self) -> i64 {
        self.balance.load(Ordering::Acquire)
    }

    /// Remove `amount` and return the new balance.
    pub fn debit(&self, amount: u32) -> i64 {
        self.balance.fetch_sub(amount as i64, Ordering::AcqRel) - amount as i64
    }

    /// Add `amount` received from the peer (WINDOW_UPDATE).
    ///
    /// The window is left untouched on overflow.
    pub fn credit(&self, amount: u32) -> std::result::Result<i64, WindowOverflow> {
        self.adjust(amount as i64)
    }

    /// Apply a signed delta (SETTINGS_INITIAL_WINDOW_SIZE change).
    pub fn adjust(&self, delta: i64) -> std::result::Result<i64, WindowOverflow> {
        let prev = self.balance.fetch_add(delta, Ordering::AcqRel);
        let next = prev + delta;
        if next > MAX_WINDOW_SIZE as i64 {
            self.balance.fetch_sub(delta, Ordering::AcqRel);
            return Err(WindowOverflow);
        }
        if delta > 0 {
            self.signal();
        }
        Ok(next)
    }

    /// Give back credit taken by [`debit`](Self::debit) and wake waiters.
    pub fn release(&self, amount: u32) {
        if amount == 0 {
            return;
        }
        self.balance.fetch_add(amount as i64, Ordering::AcqRel);
        self.signal();
    }

    /// Wake every task waiting for credit on this window.
    pub fn signal(&self) {
        self.credit_available.notify_waiters();
    }

    /// Inbound replenishment: once the balance drops below half of `target`,
    /// refill to `target` minus the `held` bytes still buffered for the
    /// application and return the WINDOW_UPDATE increment.
    pub fn replenish(&self, target: u32, held: u32) -> Option<u32> {
        let available = self.available();
        let target = target as i64;
        if available >= target / 2 {
            return None;
        }
        let increment = target - available - held as i64;
        if increment <= 0 {
            return None;
        }
        self.balance.fetch_add(increment, Ordering::AcqRel);
        u32::try_from(increment).ok()
    }

    /// Wait until the balance is positive.
    ///
    /// Registration happens before the balance is re-checked so a signal
    /// raised in between is not lost.
    async fn wait_for_credit(&self) {
        let notified = self.credit_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.available() > 0 {
            return;
        }
        notified.await;
    }
}

/// Credit reserved on both windows for one outbound DATA frame.
///
/// Whatever has not been committed when the reservation drops goes back to
/// both windows, error paths included.
#[derive(Debug)]
pub struct CreditReservation {
    stream: Arc<FlowControlWindow>,
    connection: Arc<FlowControlWindow>,
    remaining: u32,
}

impl CreditReservation {
    /// Credit still held by this reservation.
    pub fn len(&self) -> u32 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Mark `amount` as spent on a queued frame.
    pub fn commit(&mut self, amount: u32) {
        self.remaining = self.remaining.saturating_sub(amount);
    }
}

impl Drop for CreditReservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.stream.release(self.remaining);
            self.connection.release(self.remaining);
        }
    }
}

/// Reserve up to `desired` bytes of outbound credit.
///
/// The grant is capped by both balances and by `max_frame_size`, so callers
/// loop for the remainder. Blocks while either window is exhausted, checking
/// the stream window first.
pub async fn reserve(
    stream: &Arc<FlowControlWindow>,
    connection: &Arc<FlowControlWindow>,
    desired: usize,
    max_frame_size: u32,
    cancel: &CancellationToken,
) -> Result<CreditReservation> {
    let mut waited = false;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let visible = stream.available().min(connection.available()).max(0);
        let want = (desired as i64).min(max_frame_size as i64).min(visible) as u32;

        if want > 0 {
            let stream_left = stream.debit(want);
            let conn_left = connection.debit(want);
            if stream_left >= 0 && conn_left >= 0 {
                if waited {
                    // Another waiter may have been woken by the same signal
                    stream.signal();
                    connection.signal();
                }
                return Ok(CreditReservation {
                    stream: Arc::clone(stream),
                    connection: Arc::clone(connection),
                    remaining: want,
                });
            }
            stream.release(want);
            connection.release(want);
        }

        let blocking = if stream.available() <= 0 {
            stream
        } else if connection.available() <= 0 {
            connection
        } else {
            // Lost a race with another reserver; both windows still have credit
            tokio::task::yield_now().await;
            continue;
        };

        waited = true;
        tokio::select! {
            _ = blocking.wait_for_credit() => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}
