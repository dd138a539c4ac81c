use crate::{
    Config, Connection, Driver, EngineError, Error, Result, util::lock, wait_until_alive,
};
use anyhow::Context;
use std::{
    collections::VecDeque,
    mem,
    ops::{Deref, DerefMut},
    pin::pin,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Notify, watch},
    time::{Instant, timeout_at},
};

/// Connection counts at a point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    /// Checked out by callers.
    pub outstanding: usize,
    /// Being opened, either by an acquire or by the background refill.
    pub pending: usize,
    pub target_size: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.outstanding + self.pending
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    outstanding: usize,
    pending: usize,
    target_size: usize,
    refilling: bool,
    closed: bool,
    /// Bumped by every reconfiguration, a refill only serves the generation it started in.
    generation: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.outstanding + self.pending
    }
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    released: Notify,
}

/// Gives back a reserved slot when a connection attempt fails or its future is dropped.
struct PendingSlot<'a, C> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<C> Drop for PendingSlot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.shared.state).pending -= 1;
            self.shared.released.notify_one();
        }
    }
}

const CHECKED_OUT: &str = "PooledConnection holds its connection until dropped or released";

/// Connection checked out of a [`ConnectionPool`].
///
/// Dropping it without [`ConnectionPool::release`], as happens when the
/// caller's future is cancelled, still gives its slot back. The connection is
/// then closed on a background task, its slot stays reserved until that ends.
pub struct PooledConnection<C: Connection> {
    connection: Option<C>,
    shared: Arc<Shared<C>>,
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.connection.as_ref().expect(CHECKED_OUT)
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.connection.as_mut().expect(CHECKED_OUT)
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        log::debug!("Connection dropped without being released, closing it");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let mut state = lock(&self.shared.state);
            state.outstanding = state.outstanding.saturating_sub(1);
            drop(state);
            self.shared.released.notify_one();
            return;
        };
        {
            let mut state = lock(&self.shared.state);
            state.outstanding = state.outstanding.saturating_sub(1);
            state.pending += 1;
        }
        let shared = self.shared.clone();
        runtime.spawn(async move {
            let _slot = PendingSlot {
                shared: &shared,
                armed: true,
            };
            if let Err(e) = connection.close().await {
                log::warn!("Error while closing a dropped connection: {:#}", e);
            }
        });
    }
}

/// Bounded set of live connections.
///
/// Releasing a connection closes it instead of putting it back: idle supply is
/// kept warm by the background refill, so an acquire only pays the connection
/// setup when the refill could not keep up.
pub struct ConnectionPool<D: Driver> {
    driver: Arc<D>,
    config: RwLock<Arc<Config>>,
    shared: Arc<Shared<D::Connection>>,
    closing: AtomicBool,
}

impl<D: Driver> ConnectionPool<D> {
    /// Create an empty pool, [`ConnectionPool::start`] opens the first connections.
    pub fn new(driver: Arc<D>, config: Arc<Config>) -> Self {
        let target_size = config.initial_pool_size;
        Self {
            driver,
            config: RwLock::new(config),
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    outstanding: 0,
                    pending: 0,
                    target_size,
                    refilling: false,
                    closed: false,
                    generation: 0,
                }),
                released: Notify::new(),
            }),
            closing: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            idle: state.idle.len(),
            outstanding: state.outstanding,
            pending: state.pending,
            target_size: state.target_size,
        }
    }

    /// Pass the health gate, then open `initial_pool_size` connections.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.config();
        wait_until_alive(self.driver.as_ref(), &config, shutdown).await?;
        for _ in 0..config.initial_pool_size {
            {
                let mut state = lock(&self.shared.state);
                if state.total() >= config.max_pool_size {
                    break;
                }
                state.pending += 1;
            }
            let mut slot = PendingSlot {
                shared: &self.shared,
                armed: true,
            };
            let connection = self.driver.connect(&config).await.with_context(|| {
                format!("While opening the initial connections to `{}`", config.endpoint())
            })?;
            slot.armed = false;
            let mut state = lock(&self.shared.state);
            state.pending -= 1;
            state.idle.push_back(connection);
        }
        log::info!(
            "Connection pool to `{}` started with {} connection(s)",
            config.endpoint(),
            config.initial_pool_size
        );
        Ok(())
    }

    /// Swap the connectivity settings once the new endpoint passes the health gate.
    ///
    /// Idle connections to the previous endpoint are closed, checked out ones
    /// are closed when released as usual.
    pub async fn reconfigure(&self, config: Arc<Config>, shutdown: watch::Receiver<bool>) -> Result<()> {
        config.validate()?;
        wait_until_alive(self.driver.as_ref(), &config, shutdown.clone()).await?;
        let stale = {
            let mut state = lock(&self.shared.state);
            *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
            state.target_size = config.initial_pool_size;
            state.closed = false;
            // A refill still running for the previous endpoint discards what it opens
            state.generation += 1;
            state.refilling = false;
            mem::take(&mut state.idle)
        };
        self.closing.store(false, Ordering::SeqCst);
        close_connections(stale).await;
        log::info!("Connection pool reconfigured to `{}`", config.endpoint());
        self.refill();
        Ok(())
    }

    /// Take a connection, opening one when none is idle.
    ///
    /// At capacity the call waits for a release, up to `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<D::Connection>> {
        let config = self.config();
        let deadline = Instant::now() + config.acquire_timeout;
        loop {
            enum Next<C> {
                Ready(C),
                Open,
                Wait,
            }
            // Registered before looking at the state, so neither a release nor
            // close_all can slip in between the check and the wait
            let mut notified = pin!(self.shared.released.notified());
            notified.as_mut().enable();
            let next = {
                let mut state = lock(&self.shared.state);
                if state.closed {
                    return Err(Error::new(EngineError::PoolClosed));
                }
                if let Some(connection) = state.idle.pop_front() {
                    state.outstanding += 1;
                    Next::Ready(connection)
                } else {
                    if config.expansion_allowed && state.target_size < config.max_pool_size {
                        let expanded =
                            (state.target_size + config.expansion_step).min(config.max_pool_size);
                        log::debug!(
                            "No idle connection, expanding the pool target from {} to {}",
                            state.target_size,
                            expanded
                        );
                        state.target_size = expanded;
                    }
                    if state.total() < config.max_pool_size {
                        state.pending += 1;
                        Next::Open
                    } else {
                        Next::Wait
                    }
                }
            };
            match next {
                Next::Ready(connection) => {
                    self.refill_if_low(&config);
                    return Ok(self.checked_out(connection));
                }
                Next::Open => {
                    let mut slot = PendingSlot {
                        shared: &self.shared,
                        armed: true,
                    };
                    let connection = self.driver.connect(&config).await.map_err(|e| {
                        let e = e.context(EngineError::Connectivity {
                            endpoint: config.endpoint().into(),
                        });
                        log::error!("{:#}", e);
                        e
                    })?;
                    slot.armed = false;
                    {
                        let mut state = lock(&self.shared.state);
                        state.pending -= 1;
                        state.outstanding += 1;
                    }
                    self.refill_if_low(&config);
                    return Ok(self.checked_out(connection));
                }
                Next::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        let e = Error::new(EngineError::AcquireTimeout(config.acquire_timeout));
                        log::error!("{:#}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    fn checked_out(&self, connection: D::Connection) -> PooledConnection<D::Connection> {
        PooledConnection {
            connection: Some(connection),
            shared: self.shared.clone(),
        }
    }

    /// Close a connection previously returned by [`ConnectionPool::acquire`].
    ///
    /// The slot is freed once the connection is closed.
    pub async fn release(&self, mut connection: PooledConnection<D::Connection>) {
        let Some(connection) = connection.connection.take() else {
            return;
        };
        {
            let mut state = lock(&self.shared.state);
            state.outstanding = state.outstanding.saturating_sub(1);
            state.pending += 1;
        }
        let _slot = PendingSlot {
            shared: &self.shared,
            armed: true,
        };
        if let Err(e) = connection.close().await {
            log::warn!("Error while closing a released connection: {:#}", e);
        }
    }

    /// Close every idle connection. Further calls are no-ops until a reconfiguration.
    pub async fn close_all_connections(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let idle = {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            mem::take(&mut state.idle)
        };
        let count = idle.len();
        close_connections(idle).await;
        self.shared.released.notify_waiters();
        log::info!("Closed {} idle connection(s)", count);
    }

    fn refill_if_low(&self, config: &Config) {
        let low = lock(&self.shared.state).idle.len() < config.refill_threshold;
        if low {
            self.refill();
        }
    }

    /// Top the pool up to its target size in the background.
    fn refill(&self) {
        let (generation, config) = {
            let mut state = lock(&self.shared.state);
            if state.refilling || state.closed {
                return;
            }
            state.refilling = true;
            (state.generation, self.config())
        };
        let driver = self.driver.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut opened = 0;
            loop {
                {
                    let mut state = lock(&shared.state);
                    if state.generation != generation {
                        break;
                    }
                    if state.closed
                        || state.total() >= state.target_size
                        || state.total() >= config.max_pool_size
                    {
                        state.refilling = false;
                        break;
                    }
                    state.pending += 1;
                }
                let mut slot = PendingSlot {
                    shared: &shared,
                    armed: true,
                };
                match driver.connect(&config).await {
                    Ok(connection) => {
                        let rejected = {
                            let mut state = lock(&shared.state);
                            if state.closed || state.generation != generation {
                                Some(connection)
                            } else {
                                slot.armed = false;
                                state.pending -= 1;
                                state.idle.push_back(connection);
                                opened += 1;
                                None
                            }
                        };
                        match rejected {
                            // Keeps its slot until closed, the next round stops the refill
                            Some(connection) => {
                                if let Err(e) = connection.close().await {
                                    log::warn!("Error while closing a stale connection: {:#}", e);
                                }
                            }
                            None => shared.released.notify_one(),
                        }
                    }
                    Err(e) => {
                        drop(slot);
                        log::warn!("Background refill could not open a connection: {:#}", e);
                        let mut state = lock(&shared.state);
                        if state.generation == generation {
                            state.refilling = false;
                        }
                        break;
                    }
                }
            }
            if opened > 0 {
                log::debug!("Background refill opened {} connection(s)", opened);
            }
        });
    }
}

async fn close_connections<C: Connection>(connections: impl IntoIterator<Item = C>) {
    for connection in connections {
        if let Err(e) = connection.close().await {
            log::warn!("Error while closing an idle connection: {:#}", e);
        }
    }
}
