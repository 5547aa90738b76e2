//! Flow-control windows, kept at two scopes: one pair for the whole
//! connection and one pair per stream.

use std::fmt;

use super::frame::MAX_INITIAL_WINDOW_SIZE;

/// The send-direction window: how many DATA payload bytes the peer is
/// currently willing to accept.
///
/// Kept signed because a SETTINGS_INITIAL_WINDOW_SIZE decrease applies a
/// negative delta to every open stream, which can push an already-spent
/// window below zero. Nothing more is sent until WINDOW_UPDATEs bring it
/// back up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendWindow {
    window: i64,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> SendWindow {
        SendWindow {
            window: initial as i64,
        }
    }

    /// Bytes available to send right now.
    pub(crate) fn available(&self) -> u32 {
        self.window.clamp(0, MAX_INITIAL_WINDOW_SIZE as i64) as u32
    }

    /// Record `n` bytes as sent. The caller checks `available` first.
    pub(crate) fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.available());
        self.window -= n as i64;
    }

    /// Apply a WINDOW_UPDATE. Fails when the window would exceed the
    /// 2^31 - 1 maximum, which the peer must never cause.
    pub(crate) fn grow(&mut self, n: u32) -> Result<(), ()> {
        let grown = self.window + n as i64;
        if grown > MAX_INITIAL_WINDOW_SIZE as i64 {
            return Err(());
        }
        self.window = grown;
        Ok(())
    }

    /// Apply the signed delta of a SETTINGS_INITIAL_WINDOW_SIZE change.
    pub(crate) fn apply_delta(&mut self, delta: i64) {
        self.window += delta;
    }
}

/// The receive-direction window: tracks how many bytes the peer has in
/// flight against what we advertised, and how much consumed credit has
/// not yet been returned via WINDOW_UPDATE.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvWindow {
    /// The window we advertised.
    window: u32,
    /// Received bytes not yet credited back.
    in_flight: u32,
    /// Consumed bytes accumulated toward the next WINDOW_UPDATE.
    unacked: u32,
}

impl RecvWindow {
    pub(crate) fn new(window: u32) -> RecvWindow {
        RecvWindow {
            window,
            in_flight: 0,
            unacked: 0,
        }
    }

    /// Account for an incoming DATA payload. An overrun means the peer
    /// ignored our advertised window.
    pub(crate) fn buffer(&mut self, n: u32) -> Result<(), ()> {
        let in_flight = self.in_flight.checked_add(n).ok_or(())?;
        if in_flight > self.window {
            return Err(());
        }
        self.in_flight = in_flight;
        Ok(())
    }

    /// Record `n` consumed (delivered or discarded) bytes and return the
    /// credit to announce in a WINDOW_UPDATE, if the strategy says the
    /// threshold has been crossed.
    pub(crate) fn release(&mut self, n: u32, strategy: &dyn WindowUpdateStrategy) -> Option<u32> {
        self.unacked += n;
        if self.unacked == 0 || !strategy.should_release(self.unacked, self.window) {
            return None;
        }
        let credit = self.unacked;
        debug_assert!(credit <= self.in_flight);
        self.in_flight -= credit;
        self.unacked = 0;
        Some(credit)
    }
}

/// Policy for when consumed receive credit is returned to the peer.
///
/// Implementations may release credit earlier than the default, but can
/// never mint more than was consumed, so the advertised window is
/// preserved.
pub trait WindowUpdateStrategy: Send + Sync + fmt::Debug {
    /// Whether `unacked` consumed bytes against an advertised window of
    /// `window` warrant a WINDOW_UPDATE now.
    fn should_release(&self, unacked: u32, window: u32) -> bool;
}

/// The default policy: return credit once half the window has been
/// consumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdWindowUpdates;

impl WindowUpdateStrategy for ThresholdWindowUpdates {
    fn should_release(&self, unacked: u32, window: u32) -> bool {
        unacked >= window / 2
    }
}

/// Return credit after every consumed chunk. Keeps the peer's view of
/// the window close to full at the cost of more WINDOW_UPDATE frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct EagerWindowUpdates;

impl WindowUpdateStrategy for EagerWindowUpdates {
    fn should_release(&self, unacked: u32, _window: u32) -> bool {
        unacked > 0
    }
}
