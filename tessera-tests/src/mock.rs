use async_stream::try_stream;
use std::{
    env,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tessera_core::{
    Config, Connection, Driver, Error, GenericSqlWriter, Query, QueryResult, Result, RowLabeled,
    RowsAffected, Value, stream::Stream,
};

type Responder = dyn Fn(&Query) -> Result<Vec<QueryResult>> + Send + Sync;

#[derive(Default)]
struct MockState {
    queries: Mutex<Vec<Query>>,
    responder: Mutex<Option<Arc<Responder>>>,
    failing_pings: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_executions: AtomicUsize,
    hanging_executions: AtomicUsize,
    connect_delay: Mutex<Duration>,
    endpoints: Mutex<Vec<String>>,
    pings: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Decrement `counter` unless already zero, true when it was decremented.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

/// In-memory driver recording every query it receives.
///
/// Without a responder, `SELECT COUNT(*)` yields `0`, other selects yield no
/// rows and modify statements report one affected row per `VALUES` tuple.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Default::default()
    }

    /// Answer every query through `responder`.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Query) -> Result<Vec<QueryResult>> + Send + Sync + 'static,
    {
        *self.state.responder.lock().unwrap() = Some(Arc::new(responder));
    }

    /// Fail the next `count` liveness checks.
    pub fn fail_pings(&self, count: usize) {
        self.state.failing_pings.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` queries.
    pub fn fail_executions(&self, count: usize) {
        self.state.failing_executions.store(count, Ordering::SeqCst);
    }

    /// Never answer the next `count` queries.
    pub fn hang_executions(&self, count: usize) {
        self.state.hanging_executions.store(count, Ordering::SeqCst);
    }

    /// Take `delay` to open every following connection.
    pub fn delay_connects(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    /// Url of every connection attempt, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.state.endpoints.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<Query> {
        self.state.queries.lock().unwrap().clone()
    }

    /// Text of every query received, in order.
    pub fn sql(&self) -> Vec<String> {
        self.state
            .queries
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.sql.to_string())
            .collect()
    }

    pub fn clear_queries(&self) {
        self.state.queries.lock().unwrap().clear();
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    type Connection = MockConnection;
    type SqlWriter = GenericSqlWriter;

    const NAME: &'static str = "mock";

    fn sql_writer(&self) -> GenericSqlWriter {
        GenericSqlWriter::new()
    }

    async fn connect(&self, config: &Config) -> Result<MockConnection> {
        self.state.endpoints.lock().unwrap().push(config.url.clone());
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.state.failing_connects) {
            return Err(Error::msg(format!(
                "Connection to `{}` refused",
                config.endpoint()
            )));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: self.state.clone(),
            endpoint: config.url.clone(),
        })
    }

    async fn ping(&self, config: &Config) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_pings) {
            return Err(Error::msg(format!("`{}` is not ready", config.endpoint())));
        }
        Ok(())
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    endpoint: String,
}

impl MockConnection {
    /// Url this connection was opened against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Connection for MockConnection {
    fn run(&mut self, query: Query) -> impl Stream<Item = Result<QueryResult>> + Send {
        let state = self.state.clone();
        try_stream! {
            state.queries.lock().unwrap().push(query.clone());
            if take_one(&state.hanging_executions) {
                std::future::pending::<()>().await;
            }
            if take_one(&state.failing_executions) {
                Err::<(), _>(Error::msg(format!("Execution of `{}` failed", query)))?;
            }
            let responder = state.responder.lock().unwrap().clone();
            let results = match responder {
                Some(responder) => responder(&query)?,
                None => default_response(&query),
            };
            for result in results {
                yield result;
            }
        }
    }

    async fn close(self) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn default_response(query: &Query) -> Vec<QueryResult> {
    let sql = query.sql.trim_start();
    if sql.starts_with("SELECT COUNT(*)") {
        vec![row(&["COUNT(*)"], [Value::Int64(Some(0))])]
    } else if sql.starts_with("SELECT") {
        Vec::new()
    } else {
        let rows = sql
            .rfind(" VALUES ")
            .map(|i| sql[i..].matches('(').count())
            .unwrap_or_default();
        vec![
            RowsAffected {
                rows_affected: rows as u64,
                last_affected_id: None,
            }
            .into(),
        ]
    }
}

/// Labeled result row.
pub fn row(labels: &[&str], values: impl Into<Box<[Value]>>) -> QueryResult {
    RowLabeled::new(
        labels.iter().map(|v| v.to_string()).collect::<Vec<_>>().into(),
        values.into(),
    )
    .into()
}

/// Settings with fast retries and health checks, no periodic flush in practice
/// and spill files under the temporary directory.
pub fn mock_config(test: &str) -> Config {
    Config {
        url: format!("mock://localhost/{}", test),
        acquire_timeout: Duration::from_secs(5),
        batch_flush_interval: Duration::from_secs(3600),
        spill_directory: env::temp_dir().join(format!("tessera-{}-{}", test, std::process::id())),
        retry_delay: Duration::from_millis(10),
        health_check_delay: Duration::from_millis(10),
        ..Default::default()
    }
}
