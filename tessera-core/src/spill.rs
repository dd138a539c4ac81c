use crate::{Result, Row, Value};
use anyhow::Context;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::{OffsetDateTime, PrimitiveDateTime, macros::format_description};
use tokio::{fs, io::AsyncWriteExt};

macro_rules! write_integer {
    ($out:ident, $value:expr) => {{
        let mut buffer = itoa::Buffer::new();
        $out.push_str(buffer.format($value));
    }};
}
macro_rules! write_float {
    ($out:ident, $value:expr) => {{
        let mut buffer = ryu::Buffer::new();
        $out.push_str(buffer.format($value));
    }};
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc();
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub PrimitiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> PrimitiveDateTime {
        self.0
    }
}

/// Persists batches that could not be written, one CSV file per failed flush.
#[derive(Clone)]
pub struct SpillWriter {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SpillWriter {
    pub fn new(directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory: directory.into(),
            clock,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<table>_<yyyyMMdd_HHmmss>.csv`
    pub fn file_name(&self, table: &str) -> Result<String> {
        let timestamp = self
            .clock
            .now()
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .context("Could not format the spill timestamp")?;
        Ok(format!("{}_{}.csv", table, timestamp))
    }

    /// Write `rows` in insertion order and return the created file.
    pub async fn write(&self, table: &str, rows: &[Row]) -> Result<PathBuf> {
        let mut content = String::with_capacity(rows.len() * 64);
        for row in rows {
            write_csv_row(&mut content, row);
        }
        fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("Could not create `{}`", self.directory.display()))?;
        let name = self.file_name(table)?;
        let stem = name.trim_end_matches(".csv");
        let mut attempt = 0;
        loop {
            let path = if attempt == 0 {
                self.directory.join(&name)
            } else {
                self.directory.join(format!("{}_{}.csv", stem, attempt))
            };
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .await
                        .with_context(|| format!("Could not write `{}`", path.display()))?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Could not create `{}`", path.display()));
                }
            }
        }
    }
}

pub fn write_csv_row(out: &mut String, row: &[Value]) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_csv_value(out, value);
    }
    out.push('\n');
}

/// RFC 4180 field: quoted when it contains a comma, quote or line break.
pub fn write_csv_value(out: &mut String, value: &Value) {
    match value {
        Value::Int8(Some(v)) => write_integer!(out, *v),
        Value::Int16(Some(v)) => write_integer!(out, *v),
        Value::Int32(Some(v)) => write_integer!(out, *v),
        Value::Int64(Some(v)) => write_integer!(out, *v),
        Value::UInt8(Some(v)) => write_integer!(out, *v),
        Value::UInt16(Some(v)) => write_integer!(out, *v),
        Value::UInt32(Some(v)) => write_integer!(out, *v),
        Value::UInt64(Some(v)) => write_integer!(out, *v),
        Value::Float32(Some(v)) => write_float!(out, *v),
        Value::Float64(Some(v)) => write_float!(out, *v),
        v => {
            let text = v.to_string();
            if text.contains([',', '"', '\n', '\r']) {
                out.push('"');
                out.push_str(&text.replace('"', r#""""#));
                out.push('"');
            } else {
                out.push_str(&text);
            }
        }
    }
}
