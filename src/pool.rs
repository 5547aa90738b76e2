//! The connection pool: shares multiplexed connections across calls to
//! the same destination, evicts idle ones, and builds at most one new
//! connection per destination at a time.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::connect::{Address, CoalescingPolicy, Connector};
use crate::proto;
use crate::Result;

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    /// Idle connections beyond this are evicted oldest-first.
    pub(crate) max_idle_connections: usize,
    /// Idle connections older than this are evicted.
    pub(crate) keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// Tracks one in-flight exchange on a connection. The pool holds these
/// weakly: an exchange that disappears without being released shows up
/// as a dead weak reference, which is how leaks are detected.
pub(crate) struct ExchangeMarker {
    _private: (),
}

/// One pooled connection and its bookkeeping.
pub(crate) struct PooledConnection {
    address: Address,
    h2: proto::Connection,
    exchanges: Mutex<Vec<Weak<ExchangeMarker>>>,
    idle_since: Mutex<Instant>,
    no_new_exchanges: AtomicBool,
}

impl PooledConnection {
    fn new(address: Address, h2: proto::Connection) -> PooledConnection {
        PooledConnection {
            address,
            h2,
            exchanges: Mutex::new(Vec::new()),
            idle_since: Mutex::new(Instant::now()),
            no_new_exchanges: AtomicBool::new(false),
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn h2(&self) -> &proto::Connection {
        &self.h2
    }

    /// Stop handing this connection to new exchanges.
    pub(crate) fn no_new_exchanges(&self) {
        self.no_new_exchanges.store(true, Ordering::SeqCst);
    }

    fn is_eligible(&self) -> bool {
        !self.no_new_exchanges.load(Ordering::SeqCst) && self.h2.is_healthy()
    }

    /// Register a new exchange, unless the connection stopped accepting
    /// them or its peer's concurrent-stream limit is spoken for.
    fn allocate(&self) -> Option<Arc<ExchangeMarker>> {
        if !self.is_eligible() {
            return None;
        }
        let marker = Arc::new(ExchangeMarker { _private: () });
        let mut exchanges = self.lock_exchanges();
        exchanges.retain(|weak| weak.strong_count() > 0);
        if let Some(max) = self.h2.max_concurrent_streams() {
            if exchanges.len() as u32 >= max {
                return None;
            }
        }
        exchanges.push(Arc::downgrade(&marker));
        Some(marker)
    }

    /// Live exchanges, pruning dead markers. The second value reports
    /// whether any marker died without a release, i.e. leaked.
    fn prune_exchanges(&self) -> (usize, bool) {
        let mut exchanges = self.lock_exchanges();
        let before = exchanges.len();
        exchanges.retain(|weak| weak.strong_count() > 0);
        (exchanges.len(), exchanges.len() < before)
    }

    fn active_exchanges(&self) -> usize {
        let mut exchanges = self.lock_exchanges();
        exchanges.retain(|weak| weak.strong_count() > 0);
        exchanges.len()
    }

    fn lock_exchanges(&self) -> std::sync::MutexGuard<'_, Vec<Weak<ExchangeMarker>>> {
        self.exchanges.lock().expect("exchange list poisoned")
    }

    fn idle_since(&self) -> Instant {
        *self.idle_since.lock().expect("idle timestamp poisoned")
    }

    fn touch_idle(&self) {
        *self.idle_since.lock().expect("idle timestamp poisoned") = Instant::now();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .field("active_exchanges", &self.active_exchanges())
            .finish()
    }
}

/// An exchange's claim on a pooled connection. Dropping the lease (or
/// calling [`Lease::release`]) returns the claim and stamps the
/// connection's idle clock.
pub(crate) struct Lease {
    conn: Arc<PooledConnection>,
    marker: Option<Arc<ExchangeMarker>>,
    pool: Pool,
    /// Whether the connection had already served an exchange.
    reused: bool,
}

impl Lease {
    pub(crate) fn connection(&self) -> &Arc<PooledConnection> {
        &self.conn
    }

    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(marker) = self.marker.take() {
            drop(marker);
            if self.conn.active_exchanges() == 0 {
                self.conn.touch_idle();
            }
            self.pool.kick_cleanup();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("address", self.conn.address())
            .field("reused", &self.reused)
            .finish()
    }
}

/// The pool itself. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Connector,
    coalescing: Arc<dyn CoalescingPolicy>,
    state: Mutex<PoolState>,
    /// Wakes acquirers waiting on an in-flight build for their key.
    build_done: Notify,
    /// Wakes the eviction task for an immediate pass.
    cleanup_kick: Notify,
}

struct PoolState {
    connections: Vec<Arc<PooledConnection>>,
    /// Destinations with a connection build in flight. At most one build
    /// per destination.
    building: HashSet<Address>,
    cleanup_running: bool,
}

impl Pool {
    pub(crate) fn new(
        config: PoolConfig,
        connector: Connector,
        coalescing: Arc<dyn CoalescingPolicy>,
    ) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                connector,
                coalescing,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    building: HashSet::new(),
                    cleanup_running: false,
                }),
                build_done: Notify::new(),
                cleanup_kick: Notify::new(),
            }),
        }
    }

    /// Acquire a connection for the address: an existing one to the same
    /// destination, a coalesced one, or a freshly built one. While
    /// another task is building a connection for the same destination,
    /// this waits for that build instead of racing it.
    pub(crate) async fn acquire(&self, address: &Address) -> Result<Lease> {
        loop {
            {
                let mut state = self.lock();

                if let Some(lease) = self.try_reuse(&state, address) {
                    trace!("reusing pooled connection to {}", address);
                    return Ok(lease);
                }

                if !state.building.contains(address) {
                    state.building.insert(address.clone());
                    break;
                }
            }

            // Someone else is building a connection for this key; wait
            // and look again.
            let notified = self.inner.build_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.reusable_or_buildable(address) {
                continue;
            }
            notified.as_mut().await;
        }

        let built = self.inner.connector.connect(address).await;

        let result = match built {
            Ok(h2) => {
                let conn = Arc::new(PooledConnection::new(address.clone(), h2));
                let marker = conn.allocate().expect("fresh connection must be eligible");
                let mut state = self.lock();
                state.building.remove(address);
                state.connections.push(conn.clone());
                self.ensure_cleanup_task(&mut state);
                Ok(Lease {
                    conn,
                    marker: Some(marker),
                    pool: self.clone(),
                    reused: false,
                })
            }
            Err(err) => {
                let mut state = self.lock();
                state.building.remove(address);
                Err(err.with_uri(
                    format!("{address}")
                        .parse()
                        .unwrap_or_default(),
                ))
            }
        };

        self.inner.build_done.notify_waiters();
        result
    }

    fn try_reuse(&self, state: &PoolState, address: &Address) -> Option<Lease> {
        // Exact destination first, coalesced matches second.
        let exact = state
            .connections
            .iter()
            .filter(|conn| conn.address() == address);
        let coalesced = state.connections.iter().filter(|conn| {
            conn.address() != address && self.inner.coalescing.permits(conn.address(), address)
        });

        for conn in exact.chain(coalesced) {
            if let Some(marker) = conn.allocate() {
                return Some(Lease {
                    conn: conn.clone(),
                    marker: Some(marker),
                    pool: self.clone(),
                    reused: true,
                });
            }
        }
        None
    }

    fn reusable_or_buildable(&self, address: &Address) -> bool {
        let state = self.lock();
        !state.building.contains(address)
            || state
                .connections
                .iter()
                .any(|conn| conn.address() == address && conn.is_eligible())
    }

    /// Ask the eviction task for an immediate pass.
    pub(crate) fn kick_cleanup(&self) {
        self.inner.cleanup_kick.notify_waiters();
    }

    /// Snapshot of the number of connections held.
    pub(crate) fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Snapshot of the number of idle connections held.
    pub(crate) fn idle_connection_count(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|conn| conn.active_exchanges() == 0)
            .count()
    }

    fn ensure_cleanup_task(&self, state: &mut PoolState) {
        if state.cleanup_running {
            return;
        }
        state.cleanup_running = true;
        let pool = self.clone();
        tokio::spawn(async move {
            pool.run_cleanup().await;
        });
    }

    async fn run_cleanup(self) {
        loop {
            let wait = self.cleanup(Instant::now());

            let sleep = match wait {
                Some(duration) => duration,
                // Empty pool: the task retires until the next insert.
                None => {
                    let mut state = self.lock();
                    if state.connections.is_empty() {
                        state.cleanup_running = false;
                        return;
                    }
                    continue;
                }
            };

            if sleep.is_zero() {
                continue;
            }

            let kicked = self.inner.cleanup_kick.notified();
            tokio::pin!(kicked);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = &mut kicked => {}
            }
        }
    }

    /// One eviction pass. Returns how long to sleep until the next
    /// candidate becomes evictable, `Some(ZERO)` to run again right
    /// away, or `None` when the pool is empty.
    fn cleanup(&self, now: Instant) -> Option<Duration> {
        let evicted = {
            let mut state = self.lock();

            let mut idle_count = 0;
            let mut longest_idle: Option<(usize, Instant)> = None;
            let mut evict_index = None;

            for (index, conn) in state.connections.iter().enumerate() {
                let (active, leaked) = conn.prune_exchanges();

                if active > 0 {
                    if leaked {
                        // An exchange vanished without releasing its
                        // claim; stop reusing the connection.
                        warn!("leaked exchange detected on {}", conn.address());
                        conn.no_new_exchanges();
                    }
                    continue;
                }

                if !conn.h2.is_healthy() {
                    evict_index = Some(index);
                    break;
                }

                idle_count += 1;
                let since = conn.idle_since();
                if longest_idle.map(|(_, oldest)| since < oldest).unwrap_or(true) {
                    longest_idle = Some((index, since));
                }
            }

            if evict_index.is_none() {
                if let Some((index, since)) = longest_idle {
                    let idle_for = now.saturating_duration_since(since);
                    if idle_for >= self.inner.config.keep_alive
                        || idle_count > self.inner.config.max_idle_connections
                    {
                        evict_index = Some(index);
                    } else if state.connections.is_empty() {
                        return None;
                    } else {
                        return Some(self.inner.config.keep_alive - idle_for);
                    }
                } else if state.connections.is_empty() {
                    return None;
                } else {
                    // Only in-use connections; check again in a while.
                    return Some(self.inner.config.keep_alive);
                }
            }

            evict_index.map(|index| state.connections.remove(index))
        };

        if let Some(conn) = evicted {
            debug!("evicting connection to {}", conn.address());
            conn.no_new_exchanges();
            let h2 = conn.h2.clone();
            tokio::spawn(async move {
                h2.close(proto::Reason::NO_ERROR).await;
            });
            return Some(Duration::ZERO);
        }

        Some(Duration::ZERO)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner.state.lock().expect("pool state poisoned")
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("connections", &self.connection_count())
            .finish()
    }
}
