use crate::{
    Config, EngineError, EntityDescriptor, IdentityProvider, Result, Row, RowsAffected,
    SpillWriter, truncate_long,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};

/// Identifies one list of pending rows: the single-row insert and its entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub sql: Arc<str>,
    pub entity: Arc<EntityDescriptor>,
}

impl BatchKey {
    pub fn new(sql: impl Into<Arc<str>>, entity: Arc<EntityDescriptor>) -> Self {
        Self {
            sql: sql.into(),
            entity,
        }
    }
}

#[derive(Debug)]
pub struct PendingBatch {
    pub key: BatchKey,
    /// Bound values of every pending insert, in insertion order.
    pub rows: Vec<Row>,
}

/// Writes a whole batch as one statement.
pub trait BatchSink: Send + Sync + 'static {
    fn write_batch(
        &self,
        key: &BatchKey,
        rows: &[Row],
    ) -> impl Future<Output = Result<RowsAffected>> + Send;
}

/// Monotonic counters of the collector activity.
#[derive(Debug, Default)]
pub struct BatchStats {
    flushes: AtomicU64,
    rows_flushed: AtomicU64,
    failed_batches: AtomicU64,
    retries: AtomicU64,
}

impl BatchStats {
    /// Successful flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
    pub fn rows_flushed(&self) -> u64 {
        self.rows_flushed.load(Ordering::Relaxed)
    }
    /// Batches that exhausted their attempts and were spilled.
    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Accumulates inserts per [`BatchKey`] and writes them in bulk.
///
/// Every mutation of the batch map and every flush runs under one lock, a
/// flush holds it for its whole retry loop.
pub struct BatchCollector<S: BatchSink> {
    sink: S,
    identity: Arc<dyn IdentityProvider>,
    spill: SpillWriter,
    batches: Mutex<HashMap<BatchKey, PendingBatch>>,
    default_batch_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    stats: BatchStats,
}

impl<S: BatchSink> BatchCollector<S> {
    pub fn new(
        sink: S,
        identity: Arc<dyn IdentityProvider>,
        spill: SpillWriter,
        config: &Config,
    ) -> Self {
        Self {
            sink,
            identity,
            spill,
            batches: Default::default(),
            default_batch_size: config.batch_size.max(1),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay,
            stats: Default::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Rows flushed at once for `entity`.
    pub fn threshold(&self, entity: &EntityDescriptor) -> usize {
        match entity.batch_size {
            Some(size) if size > 0 => size,
            _ => self.default_batch_size,
        }
    }

    /// Append `row` to the batch of `key`, flushing it once the threshold is met.
    pub async fn put(&self, key: BatchKey, row: Row) -> Result<()> {
        let mut batches = self.batches.lock().await;
        let batch = batches
            .entry(key.clone())
            .or_insert_with(|| PendingBatch {
                key,
                rows: Vec::new(),
            });
        let threshold = self.threshold(&batch.key.entity);
        if batch.rows.is_empty() {
            self.identity.reserve(&batch.key.entity, threshold)?;
        }
        batch.rows.push(row);
        if batch.rows.len() >= threshold {
            self.flush_batch(batch).await?;
        }
        Ok(())
    }

    /// Flush the batch of `key`, if any.
    pub async fn save_and_flush(&self, key: &BatchKey) -> Result<()> {
        let mut batches = self.batches.lock().await;
        match batches.get_mut(key) {
            Some(batch) => self.flush_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Flush every batch belonging to `entity`.
    pub async fn flush_entity(&self, entity: &EntityDescriptor) -> Result<()> {
        let mut batches = self.batches.lock().await;
        let mut result = Ok(());
        for batch in batches
            .values_mut()
            .filter(|b| *b.key.entity == *entity && !b.rows.is_empty())
        {
            let flushed = self.flush_batch(batch).await;
            if result.is_ok() {
                result = flushed;
            }
        }
        result
    }

    /// Flush every non empty batch. All batches are attempted, the first failure is returned.
    pub async fn flush_all(&self) -> Result<()> {
        let mut batches = self.batches.lock().await;
        let mut result = Ok(());
        for batch in batches.values_mut().filter(|b| !b.rows.is_empty()) {
            let flushed = self.flush_batch(batch).await;
            if result.is_ok() {
                result = flushed;
            }
        }
        result
    }

    pub async fn is_not_empty(&self) -> bool {
        self.batches
            .lock()
            .await
            .values()
            .any(|b| !b.rows.is_empty())
    }

    /// Rows waiting in the batch of `key`.
    pub async fn pending_rows(&self, key: &BatchKey) -> usize {
        self.batches
            .lock()
            .await
            .get(key)
            .map(|b| b.rows.len())
            .unwrap_or_default()
    }

    /// Flush on every `period` tick until `shutdown` flips or its sender is gone.
    pub fn spawn_flush_timer(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.is_not_empty().await {
                            // Failures are logged and spilled by the flush itself
                            let _ = self.flush_all().await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Batch flush timer stopped");
        })
    }

    async fn flush_batch(&self, batch: &mut PendingBatch) -> Result<()> {
        if batch.rows.is_empty() {
            return Ok(());
        }
        let table = batch.key.entity.table_name.clone();
        let rows = batch.rows.len();
        let mut attempt = 0;
        let written = loop {
            attempt += 1;
            match self.sink.write_batch(&batch.key, &batch.rows).await {
                Ok(affected) => break Ok(affected),
                Err(e) if attempt >= self.retry_attempts => break Err(e),
                Err(e) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Flush attempt {}/{} of {} row(s) into `{}` failed, retrying in {:?}: {:#}",
                        attempt,
                        self.retry_attempts,
                        rows,
                        table,
                        self.retry_delay,
                        e
                    );
                    sleep(self.retry_delay).await;
                }
            }
        };
        let result = match written {
            Ok(..) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_flushed
                    .fetch_add(rows as u64, Ordering::Relaxed);
                log::debug!(
                    "Flushed {} row(s) into `{}` using `{}`",
                    rows,
                    table,
                    truncate_long!(batch.key.sql)
                );
                Ok(())
            }
            Err(e) => {
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                let e = match self.spill.write(&table, &batch.rows).await {
                    Ok(path) => e.context(format!("Rows spilled to `{}`", path.display())),
                    Err(spill) => {
                        log::error!("Could not spill the failed batch of `{}`: {:#}", table, spill);
                        e
                    }
                };
                let e = e.context(EngineError::BatchExhausted {
                    table: table.to_string(),
                    attempts: attempt,
                    rows,
                });
                log::error!("{:#}", e);
                Err(e)
            }
        };
        batch.rows.clear();
        if let Err(e) = self.identity.reconcile(&batch.key.entity) {
            log::warn!("Could not reconcile identifiers of `{}`: {:#}", table, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ErrorKind, FieldDescriptor, FixedClock, SequentialIdentity, Value, error_kind};
    use std::{
        path::PathBuf,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicU32, AtomicUsize},
        },
    };
    use time::macros::datetime;

    #[derive(Default)]
    struct RecordingSink {
        fail_first: AtomicU32,
        calls: AtomicUsize,
        written: StdMutex<Vec<Vec<Row>>>,
    }

    impl BatchSink for RecordingSink {
        async fn write_batch(&self, _key: &BatchKey, rows: &[Row]) -> Result<RowsAffected> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(Error::msg("connection reset by peer"));
            }
            self.written.lock().unwrap().push(rows.to_vec());
            Ok(RowsAffected {
                rows_affected: rows.len() as u64,
                last_affected_id: None,
            })
        }
    }

    fn person(batch_size: usize) -> Arc<EntityDescriptor> {
        Arc::new(EntityDescriptor {
            entity_name: "Person".into(),
            table_name: "person".into(),
            fields: [
                FieldDescriptor::new("id", "id", Value::Int64(None)),
                FieldDescriptor::new("name", "name", Value::Varchar(None)),
            ]
            .into(),
            identity: 0,
            batch_size: Some(batch_size),
        })
    }

    fn spill_dir(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tessera-batch-{}-{}", test, std::process::id()))
    }

    fn collector(sink: RecordingSink, test: &str) -> BatchCollector<RecordingSink> {
        let config = Config {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        BatchCollector::new(
            sink,
            Arc::new(SequentialIdentity::default()),
            SpillWriter::new(
                spill_dir(test),
                Arc::new(FixedClock(datetime!(2024-01-01 12:00:00))),
            ),
            &config,
        )
    }

    fn row(id: i64, name: &'static str) -> Row {
        [Value::Int64(Some(id)), name.into()].into()
    }

    #[tokio::test]
    async fn flushes_at_threshold() {
        let collector = collector(RecordingSink::default(), "threshold");
        let key = BatchKey::new("INSERT INTO person (id, name) VALUES (?, ?)", person(3));
        collector.put(key.clone(), row(1, "a")).await.unwrap();
        collector.put(key.clone(), row(2, "b")).await.unwrap();
        assert_eq!(collector.sink().calls.load(Ordering::SeqCst), 0);
        assert_eq!(collector.pending_rows(&key).await, 2);
        assert!(collector.is_not_empty().await);
        collector.put(key.clone(), row(3, "c")).await.unwrap();
        assert_eq!(collector.sink().calls.load(Ordering::SeqCst), 1);
        assert_eq!(collector.pending_rows(&key).await, 0);
        assert!(!collector.is_not_empty().await);
        assert_eq!(collector.stats().rows_flushed(), 3);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let sink = RecordingSink {
            fail_first: AtomicU32::new(2),
            ..Default::default()
        };
        let collector = collector(sink, "third-attempt");
        let key = BatchKey::new("INSERT INTO person (id, name) VALUES (?, ?)", person(10));
        collector.put(key.clone(), row(1, "a")).await.unwrap();
        collector.save_and_flush(&key).await.expect("The third attempt succeeds");
        assert_eq!(collector.sink().calls.load(Ordering::SeqCst), 3);
        assert_eq!(collector.stats().retries(), 2);
        assert_eq!(collector.stats().failed_batches(), 0);
        assert!(!spill_dir("third-attempt").exists());
    }

    #[tokio::test]
    async fn exhausted_batch_is_spilled() {
        let directory = spill_dir("exhausted");
        let _ = tokio::fs::remove_dir_all(&directory).await;
        let sink = RecordingSink {
            fail_first: AtomicU32::new(u32::MAX),
            ..Default::default()
        };
        let collector = collector(sink, "exhausted");
        let key = BatchKey::new("INSERT INTO person (id, name) VALUES (?, ?)", person(10));
        collector.put(key.clone(), row(1, "Doe, John")).await.unwrap();
        collector.put(key.clone(), row(2, "plain")).await.unwrap();
        let error = collector
            .flush_entity(&person(10))
            .await
            .expect_err("Every attempt fails");
        assert_eq!(error_kind(&error), Some(ErrorKind::Batch));
        assert_eq!(collector.sink().calls.load(Ordering::SeqCst), 3);
        assert_eq!(collector.pending_rows(&key).await, 0);
        assert_eq!(collector.stats().failed_batches(), 1);
        let content = tokio::fs::read_to_string(directory.join("person_20240101_120000.csv"))
            .await
            .unwrap();
        assert_eq!(content, "1,\"Doe, John\"\n2,plain\n");
        tokio::fs::remove_dir_all(&directory).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_lose_nothing() {
        let collector = Arc::new(collector(RecordingSink::default(), "concurrent"));
        let key = BatchKey::new("INSERT INTO person (id, name) VALUES (?, ?)", person(100));
        let tasks = (0..8)
            .map(|task| {
                let collector = collector.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let count = 62 + usize::from(task < 4);
                    for i in 0..count {
                        collector
                            .put(key.clone(), row((task * 1000 + i) as i64, "x"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        let sink = collector.sink();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 5);
        let written = sink.written.lock().unwrap();
        assert!(written.iter().all(|rows| rows.len() == 100));
        assert_eq!(written.iter().map(Vec::len).sum::<usize>(), 500);
        assert_eq!(collector.stats().flushes(), 5);
    }
}
