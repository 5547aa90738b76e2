//! Admission control for asynchronous calls: a global concurrency limit,
//! a per-host limit, FIFO promotion, and an idle signal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::call::Call;
use crate::events;
use crate::response::Response;
use crate::{Error, Result};

type Callback = Box<dyn FnOnce(Result<Response>) + Send>;
type IdleCallback = Box<dyn Fn() + Send + Sync>;

/// The policy for when asynchronous calls run.
///
/// Each dispatcher keeps a FIFO of ready calls and promotes them as
/// capacity allows: at most `max_requests` running overall and at most
/// `max_requests_per_host` per destination host. Promoted calls run on
/// the tokio runtime.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<State>,
}

struct State {
    max_requests: usize,
    max_requests_per_host: usize,
    ready_async: VecDeque<QueuedCall>,
    running_async: Vec<Call>,
    running_sync: Vec<Call>,
    /// Running async calls per host key.
    per_host: HashMap<String, usize>,
    idle_callback: Option<Arc<IdleCallback>>,
    shutdown: bool,
}

struct QueuedCall {
    call: Call,
    callback: Callback,
    enqueued_at: Instant,
    /// Whether a queue-start event went out; calls promoted in the same
    /// pass as their enqueue never announce queueing at all.
    announced: bool,
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new(64, 5)
    }
}

impl Dispatcher {
    pub(crate) fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(State {
                    max_requests,
                    max_requests_per_host,
                    ready_async: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                    per_host: HashMap::new(),
                    idle_callback: None,
                    shutdown: false,
                }),
            }),
        }
    }

    /// The maximum number of requests to execute concurrently.
    pub fn max_requests(&self) -> usize {
        self.lock().max_requests
    }

    /// Set the maximum number of requests to execute concurrently.
    /// Lowering the limit does not interrupt running calls.
    pub fn set_max_requests(&self, max: usize) {
        assert!(max >= 1, "max_requests must be at least 1");
        self.lock().max_requests = max;
        self.promote_and_execute();
    }

    /// The maximum number of requests to execute concurrently per host.
    pub fn max_requests_per_host(&self) -> usize {
        self.lock().max_requests_per_host
    }

    /// Set the per-host concurrency limit. WebSocket calls are exempt
    /// from this limit.
    pub fn set_max_requests_per_host(&self, max: usize) {
        assert!(max >= 1, "max_requests_per_host must be at least 1");
        self.lock().max_requests_per_host = max;
        self.promote_and_execute();
    }

    /// A callback invoked each time the dispatcher becomes idle: no
    /// calls running, synchronous or asynchronous.
    pub fn set_idle_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lock().idle_callback = Some(Arc::new(Box::new(callback)));
    }

    /// Stop accepting new calls. Ready calls are failed; running calls
    /// finish on their own.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.promote_and_execute();
    }

    /// Cancel all calls currently enqueued or running, synchronous and
    /// asynchronous.
    pub fn cancel_all(&self) {
        let calls: Vec<Call> = {
            let state = self.lock();
            state
                .ready_async
                .iter()
                .map(|queued| queued.call.clone())
                .chain(state.running_async.iter().cloned())
                .chain(state.running_sync.iter().cloned())
                .collect()
        };
        for call in calls {
            call.cancel();
        }
    }

    /// Snapshot of the calls awaiting promotion.
    pub fn queued_calls(&self) -> Vec<Call> {
        self.lock()
            .ready_async
            .iter()
            .map(|queued| queued.call.clone())
            .collect()
    }

    /// Snapshot of the calls currently running, asynchronous and
    /// synchronous.
    pub fn running_calls(&self) -> Vec<Call> {
        let state = self.lock();
        state
            .running_async
            .iter()
            .chain(state.running_sync.iter())
            .cloned()
            .collect()
    }

    /// The number of calls currently running.
    pub fn running_calls_count(&self) -> usize {
        let state = self.lock();
        state.running_async.len() + state.running_sync.len()
    }

    /// The number of calls awaiting promotion.
    pub fn queued_calls_count(&self) -> usize {
        self.lock().ready_async.len()
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Callback) {
        {
            let mut state = self.lock();
            state.ready_async.push_back(QueuedCall {
                call,
                callback,
                enqueued_at: Instant::now(),
                announced: false,
            });
        }
        self.promote_and_execute();
    }

    pub(crate) fn register_sync(&self, call: Call) {
        self.lock().running_sync.push(call);
    }

    pub(crate) fn finished_sync(&self, call: &Call) {
        {
            let mut state = self.lock();
            remove_call(&mut state.running_sync, call);
        }
        self.finished();
    }

    fn finished_async(&self, call: &Call) {
        {
            let mut state = self.lock();
            remove_call(&mut state.running_async, call);
            if !call.is_web_socket() {
                let host = call.host_key().to_owned();
                if let Some(count) = state.per_host.get_mut(&host) {
                    *count -= 1;
                    if *count == 0 {
                        state.per_host.remove(&host);
                    }
                }
            }
        }
        self.finished();
    }

    /// Post-completion bookkeeping shared by both call kinds: promote
    /// what now fits, and fire the idle callback on the transition to
    /// zero running calls.
    fn finished(&self) {
        self.promote_and_execute();

        let idle_callback = {
            let state = self.lock();
            if state.running_async.is_empty() && state.running_sync.is_empty() {
                state.idle_callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = idle_callback {
            callback();
        }
    }

    /// Promote ready calls into the running set, then start them outside
    /// the lock. User code never runs under the dispatcher lock.
    fn promote_and_execute(&self) {
        let mut to_run: Vec<QueuedCall> = Vec::new();
        let mut to_fail: Vec<QueuedCall> = Vec::new();
        let mut to_announce: Vec<Call> = Vec::new();

        {
            let mut state = self.lock();

            if state.shutdown {
                to_fail.extend(state.ready_async.drain(..));
            } else {
                let mut index = 0;
                while index < state.ready_async.len() {
                    if state.running_async.len() >= state.max_requests {
                        break;
                    }

                    let host = state.ready_async[index].call.host_key().to_owned();
                    let exempt = state.ready_async[index].call.is_web_socket();
                    let host_count = state.per_host.get(&host).copied().unwrap_or(0);

                    if !exempt && host_count >= state.max_requests_per_host {
                        // This host is saturated; later hosts may still
                        // be promotable.
                        index += 1;
                        continue;
                    }

                    let queued = state.ready_async.remove(index).expect("index in bounds");
                    if !exempt {
                        *state.per_host.entry(host).or_insert(0) += 1;
                    }
                    state.running_async.push(queued.call.clone());
                    to_run.push(queued);
                }

                // Whatever still waits after this pass has observably
                // queued.
                for queued in state.ready_async.iter_mut() {
                    if !queued.announced {
                        queued.announced = true;
                        to_announce.push(queued.call.clone());
                    }
                }
            }
        }

        for call in to_announce {
            events::emit(call.listener(), |l| l.queue_start(&call));
        }

        for queued in to_fail {
            let call = queued.call;
            let callback = queued.callback;
            debug!("rejecting call; dispatcher is shut down");
            callback(Err(
                Error::request("dispatcher rejected execution: shut down")
                    .with_uri(call.uri().clone()),
            ));
        }

        for queued in to_run {
            let QueuedCall {
                call,
                callback,
                enqueued_at,
                announced,
            } = queued;

            if announced {
                let wait = enqueued_at.elapsed();
                events::emit(call.listener(), |l| l.queue_end(&call, wait));
            }

            let dispatcher = self.clone();
            tokio::spawn(async move {
                let result = call.run().await;
                callback(result);
                dispatcher.finished_async(&call);
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("dispatcher state poisoned")
    }
}

fn remove_call(calls: &mut Vec<Call>, target: &Call) {
    if let Some(position) = calls.iter().position(|call| call.ptr_eq(target)) {
        calls.swap_remove(position);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("queued", &state.ready_async.len())
            .field("running", &(state.running_async.len() + state.running_sync.len()))
            .finish()
    }
}
