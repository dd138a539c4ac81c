use crate::{
    AsValue, AsyncWorkers, BatchCollector, BatchStats, Clock, Config, ConnectionPool, Driver,
    Entity, IdentityProvider, MethodNameParser, PoolSink, PoolStats, QueryExecutor, QueryOutput,
    Result, ReturnShape, RowLabeled, RowsAffected, SaveHandle, SequentialIdentity, SpillWriter,
    SystemClock, Value, util::lock,
};
use anyhow::Context;
use std::sync::{Arc, Mutex};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

struct EngineInner<D: Driver> {
    executor: QueryExecutor<D>,
    identity: Arc<dyn IdentityProvider>,
    workers: AsyncWorkers,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point of the data layer, cheap to clone and share across tasks.
pub struct Engine<D: Driver> {
    inner: Arc<EngineInner<D>>,
}

impl<D: Driver> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Optional collaborators of an [`Engine`].
pub struct EngineBuilder<D: Driver> {
    driver: D,
    config: Config,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    parser: MethodNameParser,
}

impl<D: Driver> EngineBuilder<D> {
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    /// Clock used to name spill files.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn parser(mut self, parser: MethodNameParser) -> Self {
        self.parser = parser;
        self
    }

    /// Pass the health gate, open the pool and start the flush timer.
    pub async fn connect(self) -> Result<Engine<D>> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let (shutdown, receiver) = watch::channel(false);
        let pool = Arc::new(ConnectionPool::new(Arc::new(self.driver), config.clone()));
        pool.start(receiver.clone())
            .await
            .with_context(|| format!("While connecting to `{}`", config.endpoint()))?;
        let batches = Arc::new(BatchCollector::new(
            PoolSink::new(pool.clone()),
            self.identity.clone(),
            SpillWriter::new(&config.spill_directory, self.clock),
            &config,
        ));
        let timer = batches
            .clone()
            .spawn_flush_timer(config.batch_flush_interval, receiver);
        let executor = QueryExecutor::new(pool, batches).with_parser(self.parser);
        log::info!("{} engine connected to `{}`", D::NAME, config.endpoint());
        Ok(Engine {
            inner: Arc::new(EngineInner {
                executor,
                identity: self.identity,
                workers: AsyncWorkers::new(config.async_workers, config.async_queue_capacity),
                shutdown,
                timer: Mutex::new(Some(timer)),
            }),
        })
    }
}

impl<D: Driver> Engine<D> {
    pub fn builder(driver: D, config: Config) -> EngineBuilder<D> {
        EngineBuilder {
            driver,
            config,
            identity: Arc::new(SequentialIdentity::default()),
            clock: Arc::new(SystemClock),
            parser: MethodNameParser::new(),
        }
    }

    /// Connect with the default collaborators.
    pub async fn connect(driver: D, config: Config) -> Result<Self> {
        Self::builder(driver, config).connect().await
    }

    pub fn executor(&self) -> &QueryExecutor<D> {
        &self.inner.executor
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.executor.pool().stats()
    }

    pub fn batch_stats(&self) -> &BatchStats {
        self.inner.executor.batches().stats()
    }

    /// Make `E` known to the engine, required before any operation on it.
    pub fn register<E: Entity>(&self) -> Result<()> {
        self.inner.executor.registry().register::<E>()?;
        Ok(())
    }

    /// Persist `entity`, assigning its identifier when missing.
    ///
    /// Entities declaring a batch size are only queued, they reach the store
    /// with the next flush of their batch.
    pub async fn save<E: Entity>(&self, mut entity: E) -> Result<E> {
        let model = self.inner.executor.model::<E>()?;
        if model.identity(&entity).is_null() {
            let id = self.inner.identity.next_id(model.descriptor())?;
            model
                .set_identity(&mut entity, Value::Int64(Some(id)))
                .with_context(|| {
                    format!(
                        "While assigning identifier {} to `{}`",
                        id,
                        model.descriptor().entity_name
                    )
                })?;
        }
        self.inner.executor.insert(&model, &entity).await?;
        Ok(entity)
    }

    /// Hand `entity` to the async workers, the save runs here when their queue is full.
    pub async fn save_async<E: Entity>(&self, entity: E) -> SaveHandle<E> {
        let (sender, receiver) = oneshot::channel();
        let engine = self.clone();
        self.inner
            .workers
            .submit(async move {
                let _ = sender.send(engine.save(entity).await);
            })
            .await;
        SaveHandle::new(receiver)
    }

    pub async fn find_by_id<E: Entity>(&self, id: impl AsValue) -> Result<Option<E>> {
        self.inner.executor.find_by_id::<E>(id.as_value()).await
    }

    pub async fn find_all<E: Entity>(&self) -> Result<Vec<E>> {
        self.inner.executor.find_all::<E>().await
    }

    pub async fn count<E: Entity>(&self) -> Result<u64> {
        self.inner.executor.count::<E>().await
    }

    pub async fn delete<E: Entity>(&self, entity: &E) -> Result<RowsAffected> {
        self.inner.executor.delete(entity).await
    }

    pub async fn delete_all<E: Entity>(&self) -> Result<RowsAffected> {
        self.inner.executor.delete_all::<E>().await
    }

    /// Run a repository method: derived from `method` when `template` is `None`,
    /// otherwise the template text verbatim.
    pub async fn execute_query<E: Entity>(
        &self,
        method: &str,
        shape: ReturnShape,
        template: Option<&str>,
        args: Vec<Value>,
    ) -> Result<QueryOutput<E>> {
        self.inner
            .executor
            .process_query::<E>(method, shape, template, args)
            .await
    }

    /// Derived query returning only `fields` of the matching records.
    pub async fn find_projection<E: Entity>(
        &self,
        method: &str,
        fields: &[&str],
        args: Vec<Value>,
    ) -> Result<Vec<RowLabeled>> {
        self.inner
            .executor
            .process_projection::<E>(method, fields, args)
            .await
    }

    /// Force the pending batch of `E` to the store.
    pub async fn save_batch<E: Entity>(&self) -> Result<()> {
        let model = self.inner.executor.model::<E>()?;
        self.inner
            .executor
            .batches()
            .flush_entity(model.descriptor())
            .await
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.inner.executor.batches().flush_all().await
    }

    /// Switch to new connectivity settings once the new endpoint is alive.
    pub async fn reconfigure(&self, config: Config) -> Result<()> {
        self.inner
            .executor
            .pool()
            .reconfigure(Arc::new(config), self.inner.shutdown.subscribe())
            .await
    }

    /// Stop the flush timer, write every pending batch and close the connections.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        let timer = lock(&self.inner.timer).take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                log::error!("Batch flush timer terminated abnormally: {:#}", e);
            }
        }
        self.inner.workers.shutdown().await;
        let flushed = self.flush_all().await;
        self.inner.executor.pool().close_all_connections().await;
        log::info!("{} engine shut down", D::NAME);
        flushed
    }
}
