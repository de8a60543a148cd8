//! Result persistence.
//!
//! Every planning cycle writes its per-device result series (powers,
//! temperatures, state of charge, setpoints) to the time-series store,
//! tagged by entity and device kind on the horizon step grid. The store
//! is Postgres/Timescale behind a small repository; the trait seam keeps
//! cycles runnable without a database (results are then only logged).

use crate::error::ControlError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

/// One result measurement series for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSeries {
    pub entity_id: String,
    pub kind: &'static str,
    /// Field name: `power_w`, `temperature_c`, `setpoint_c` or `soc_wh`.
    pub field: &'static str,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

#[async_trait]
pub trait ResultsSink: Send + Sync {
    async fn write_series(&self, series: &[ResultSeries]) -> Result<(), ControlError>;
}

const CREATE_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS mpc_results (
    time        TIMESTAMPTZ      NOT NULL,
    entity_id   TEXT             NOT NULL,
    kind        TEXT             NOT NULL,
    field       TEXT             NOT NULL,
    value       DOUBLE PRECISION NOT NULL
)
"#;

const INSERT_RESULT_ROW: &str =
    "INSERT INTO mpc_results (time, entity_id, kind, field, value) VALUES ($1, $2, $3, $4, $5)";

pub struct PgResultsSink {
    pool: PgPool,
}

impl PgResultsSink {
    pub async fn connect(url: &str) -> Result<Self, ControlError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| ControlError::ConfigInvalid(format!("tsdb connect: {e}")))?;
        sqlx::query(CREATE_RESULTS_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| ControlError::ConfigInvalid(format!("tsdb schema: {e}")))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ResultsSink for PgResultsSink {
    async fn write_series(&self, series: &[ResultSeries]) -> Result<(), ControlError> {
        if series.is_empty() {
            debug!("no result series to persist");
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ControlError::WriteFailed(format!("tsdb begin: {e}")))?;
        let mut rows = 0usize;
        for s in series {
            for (time, value) in &s.points {
                sqlx::query(INSERT_RESULT_ROW)
                    .bind(time)
                    .bind(&s.entity_id)
                    .bind(s.kind)
                    .bind(s.field)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| ControlError::WriteFailed(format!("tsdb insert: {e}")))?;
                rows += 1;
            }
        }
        tx.commit()
            .await
            .map_err(|e| ControlError::WriteFailed(format!("tsdb commit: {e}")))?;
        info!(rows, series = series.len(), "planner results persisted");
        Ok(())
    }
}

/// Fallback sink used when no TSDB is configured.
pub struct LogResultsSink;

#[async_trait]
impl ResultsSink for LogResultsSink {
    async fn write_series(&self, series: &[ResultSeries]) -> Result<(), ControlError> {
        for s in series {
            info!(
                entity_id = %s.entity_id,
                kind = s.kind,
                field = s.field,
                points = s.points.len(),
                "result series (no tsdb configured)"
            );
        }
        Ok(())
    }
}
