//! [`RecordStore`] over PostgreSQL / TimescaleDB.
//!
//! Bulk loads go through `COPY ... FROM STDIN` in text format. Staged rows
//! are merged by the `decompress_backfill` procedure, which skips rows
//! whose natural key already exists in the hypertable.

use std::str::FromStr;
use std::time::Instant;

use chrono::SecondsFormat;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolCopyExt, PgPoolOptions};

use kis_core::config::DatabaseSection;
use kis_core::{CopyTarget, Record, RecordStore, StoreError, StoreFuture};

pub struct TimescaleStore {
    pool: PgPool,
    table: String,
    staging_table: String,
    columns: Vec<String>,
}

impl TimescaleStore {
    pub async fn connect(config: &DatabaseSection) -> Result<Self, StoreError> {
        if config.column_names.len() != 3 {
            return Err(StoreError::config(format!(
                "expected 3 column names, got {}",
                config.column_names.len()
            )));
        }
        let options = PgConnectOptions::from_str(&config.connection_string)
            .map_err(|e| StoreError::config(format!("connection string: {e}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(map_err)?;

        tracing::info!(table = %config.table, "connected to database");
        Ok(Self::with_pool(pool, config))
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool, config: &DatabaseSection) -> Self {
        Self {
            pool,
            table: config.table.clone(),
            staging_table: config.staging_table(),
            columns: config.column_names.clone(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table_for(&self, target: CopyTarget) -> &str {
        match target {
            CopyTarget::Live => &self.table,
            CopyTarget::Staging => &self.staging_table,
        }
    }
}

impl RecordStore for TimescaleStore {
    fn copy_records<'a>(&'a self, target: CopyTarget, records: &'a [Record]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(0);
            }
            let started = Instant::now();
            let table = self.table_for(target);
            let statement = copy_statement(table, &self.columns);

            let mut data = String::with_capacity(records.iter().map(|r| r.raw.len() + 96).sum());
            for record in records {
                encode_copy_row(&mut data, record);
            }

            let mut copy = self.pool.copy_in_raw(&statement).await.map_err(map_err)?;
            let sent = copy.send(data.as_bytes()).await.map(|_| ());
            if let Err(e) = sent {
                let _ = copy.abort(e.to_string()).await;
                return Err(map_err(e));
            }
            let rows = copy.finish().await.map_err(map_err)?;

            tracing::debug!(
                %table,
                rows,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "copied"
            );
            Ok(rows)
        })
    }

    fn merge_staging(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let started = Instant::now();
            sqlx::query(&merge_statement(&self.table, &self.staging_table))
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
            tracing::info!(
                table = %self.table,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "merged staging"
            );
            Ok(())
        })
    }

    fn check(&self, deep: bool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_err)?;
            if deep {
                sqlx::query(&probe_statement(&self.table, &self.columns))
                    .execute(&self.pool)
                    .await
                    .map_err(map_err)?;
            }
            Ok(())
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  SQL
// ════════════════════════════════════════════════════════════════

/// `"schema"."table"`: each dot-separated part quoted.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

pub fn copy_statement(table: &str, columns: &[String]) -> String {
    format!("COPY {} ({}) FROM STDIN", quote_ident(table), column_list(columns))
}

pub fn merge_statement(table: &str, staging_table: &str) -> String {
    format!(
        "CALL decompress_backfill(staging_table=>{}, destination_hypertable=>{}, \
         on_conflict_action=>'NOTHING', delete_from_staging=>true, cols=>'*')",
        quote_literal(staging_table),
        quote_literal(table),
    )
}

pub fn probe_statement(table: &str, columns: &[String]) -> String {
    format!("SELECT {} FROM {} LIMIT 0", column_list(columns), quote_ident(table))
}

/// Append one COPY text-format row: timestamp, bytea fingerprint, payload.
pub fn encode_copy_row(out: &mut String, record: &Record) {
    out.push_str(&record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));
    out.push('\t');
    // `\x` bytea prefix with the backslash escaped for COPY.
    out.push_str("\\\\x");
    out.push_str(&hex::encode(record.fingerprint));
    out.push('\t');
    escape_copy_text(out, &record.raw);
    out.push('\n');
}

fn escape_copy_text(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}

fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Configuration(_) => StoreError::config(e.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::connect(e.to_string()),
        _ => StoreError::query(e.to_string()),
    }
}
