// =============================================================================
// TimescaleDB Store — multi-row inserts into the raw trade table
// =============================================================================

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder};
use tracing::{info, warn};

use super::{TradeRow, TradeStore};
use crate::error::{PipelineError, PipelineResult};

/// Parameters bound per row by [`build_insert`].
const BINDS_PER_ROW: usize = 7;

/// Postgres refuses statements with more bind parameters than this.
const MAX_BINDS_PER_STATEMENT: usize = 65_535;

/// Largest batch a single multi-row INSERT can carry.
pub const MAX_BATCH_ROWS: usize = MAX_BINDS_PER_STATEMENT / BINDS_PER_ROW;

#[derive(Clone)]
pub struct TimescaleStore {
    pool: Pool<Postgres>,
    table: String,
}

impl TimescaleStore {
    /// Open a pool against `url`.  `table` must already be validated as a
    /// plain identifier.
    pub async fn connect(url: &str, table: &str) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| PipelineError::ConnectionFailure {
                target: "timescale".into(),
                message: e.to_string(),
            })?;

        info!(table = %table, "connected to TimescaleDB");
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the trade table (and hypertable, when the extension exists).
    pub async fn ensure_schema(&self) -> PipelineResult<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                time    TIMESTAMPTZ NOT NULL,
                symbol  TEXT        NOT NULL,
                price   BIGINT      NOT NULL,
                high    BIGINT      NOT NULL,
                low     BIGINT      NOT NULL,
                open    BIGINT      NOT NULL,
                close   BIGINT      NOT NULL
            );
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::ConnectionFailure {
            target: "timescale".into(),
            message: e.to_string(),
        })?;

        if let Err(e) = sqlx::query(&format!(
            "SELECT create_hypertable('{table}', 'time', if_not_exists => TRUE);"
        ))
        .execute(&self.pool)
        .await
        {
            warn!(
                table = %table,
                error = %e,
                "could not create hypertable (TimescaleDB extension missing?)"
            );
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Build the single INSERT statement covering `rows`.
fn build_insert<'a>(table: &str, rows: &'a [TradeRow]) -> QueryBuilder<'a, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {table} (time, symbol, price, high, low, open, close) "
    ));
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.time)
            .push_bind(&row.symbol)
            .push_bind(row.price)
            .push_bind(row.high)
            .push_bind(row.low)
            .push_bind(row.open)
            .push_bind(row.close);
    });
    builder
}

#[async_trait]
impl TradeStore for TimescaleStore {
    async fn insert_batch(&self, rows: &[TradeRow]) -> PipelineResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query = build_insert(&self.table, rows);
        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::StoreWriteFailure {
                rows: rows.len(),
                message: e.to_string(),
            })?;
        Ok(result.rows_affected())
    }
}
