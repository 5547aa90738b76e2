//! Listener for the lifecycle of a call.

use std::sync::Arc;
use std::time::Duration;

use crate::{Call, Error};

/// Observes the quantity, size, and duration of a call's events.
///
/// All methods have no-op defaults; implement the ones of interest.
/// Implementations must not mutate the snapshots they receive, and a
/// panicking listener never affects the progress of the call it
/// observes.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync + 'static {
    /// The call was handed to the client, before the dispatcher saw it.
    fn call_start(&self, call: &Call) {}

    /// The call entered the dispatcher's ready queue because a limit was
    /// reached. Not fired for calls promoted immediately.
    fn queue_start(&self, call: &Call) {}

    /// The call left the ready queue, after `wait`.
    fn queue_end(&self, call: &Call, wait: Duration) {}

    /// A pooled connection was bound to the call.
    fn connection_acquired(&self, call: &Call, reused: bool) {}

    /// The call's connection was handed back.
    fn connection_released(&self, call: &Call) {}

    /// Request headers went out on the wire.
    fn request_headers_end(&self, call: &Call) {}

    /// The request body was fully written, `bytes` long.
    fn request_body_end(&self, call: &Call, bytes: u64) {}

    /// Response headers arrived.
    fn response_headers_end(&self, call: &Call, status: http::StatusCode) {}

    /// The response body was fully read, `bytes` long on the wire.
    fn response_body_end(&self, call: &Call, bytes: u64) {}

    /// The exchange will be transparently retried after a recoverable
    /// failure.
    fn retry(&self, call: &Call, error: &Error) {}

    /// The call finished with a response.
    fn call_end(&self, call: &Call) {}

    /// The call finished with a failure.
    fn call_failed(&self, call: &Call, error: &Error) {}
}

/// The default listener: observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {}

/// Invoke one listener callback, swallowing panics so a broken listener
/// cannot fail the call.
pub(crate) fn emit<F>(listener: &Arc<dyn EventListener>, f: F)
where
    F: FnOnce(&dyn EventListener),
{
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        f(listener.as_ref())
    }));
    if result.is_err() {
        debug!("event listener panicked; ignoring");
    }
}
