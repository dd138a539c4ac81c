use crate::{Config, Connection, Result, SqlWriter};
use std::future::Future;

/// Backend entry point: opens connections, checks liveness and renders SQL.
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;
    type SqlWriter: SqlWriter + Send + Sync;

    const NAME: &'static str;

    fn sql_writer(&self) -> Self::SqlWriter;

    /// Open a new connection to the endpoint described by `config`.
    fn connect(&self, config: &Config) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Lightweight liveness check over the same transport as the connections.
    fn ping(&self, config: &Config) -> impl Future<Output = Result<()>> + Send;
}
