mod as_value;
mod batch;
mod config;
mod connection;
mod driver;
mod engine;
mod entity;
mod error;
mod executor;
mod health;
mod identity;
mod method_name;
mod plan_cache;
mod pool;
mod query;
mod query_builder;
mod spill;
mod sql_writer;
mod util;
mod value;
mod workers;

pub use ::anyhow::Context;
pub use as_value::*;
pub use batch::*;
pub use config::*;
pub use connection::*;
pub use driver::*;
pub use engine::*;
pub use entity::*;
pub use error::*;
pub use executor::*;
pub use health::*;
pub use identity::*;
pub use method_name::*;
pub use plan_cache::*;
pub use pool::*;
pub use query::*;
pub use query_builder::*;
pub use spill::*;
pub use sql_writer::*;
pub use util::*;
pub use value::*;
pub use workers::*;
pub mod stream {
    pub use ::futures::stream::*;
}
pub use ::futures::future;

pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;
