//! Postgres ledger store
//!
//! Each trait method opens its own transaction and commits before returning.
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! instances never block on each other and never claim the same row.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{
    AllocatedBundle, BundleErrorRecord, FileType, LeaseTimeouts, LoadOutcome, LoaderInstance,
    LogicalIdRecord, PathFilter, RegisterSummary, ScannedObject,
};
use super::LedgerStore;

/// Ledger store backed by a Postgres pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the ledger schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("Failed to run ledger migrations")?;
        info!("Ledger migrations applied");
        Ok(())
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

async fn clear_stale_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    timeouts: &LeaseTimeouts,
) -> Result<u64> {
    sqlx::query(
        r#"
        UPDATE loader_instances
        SET status = 'stale'
        WHERE status = 'running'
          AND heartbeat_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(secs(timeouts.heartbeat_timeout))
    .execute(&mut **tx)
    .await
    .context("Failed to mark stale loader instances")?;

    let result = sqlx::query(
        r#"
        UPDATE resource_bundles rb
        SET status = 'ready',
            loader_instance_id = NULL,
            allocated_at = NULL
        FROM loader_instances li
        WHERE rb.status = 'claimed'
          AND li.loader_instance_id = rb.loader_instance_id
          AND li.heartbeat_at < NOW() - make_interval(secs => $1)
          AND rb.allocated_at < NOW() - make_interval(secs => $2)
        "#,
    )
    .bind(secs(timeouts.heartbeat_timeout))
    .bind(secs(timeouts.recycle_after))
    .execute(&mut **tx)
    .await
    .context("Failed to clear stale allocations")?;

    Ok(result.rows_affected())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn register_instance(&self, instance: &LoaderInstance) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO loader_instances (loader_instance_key, hostname, pid)
            VALUES ($1, $2, $3)
            RETURNING loader_instance_id
            "#,
        )
        .bind(instance.key)
        .bind(&instance.hostname)
        .bind(instance.pid as i32)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert loader instance")?;

        Ok(row.try_get("loader_instance_id")?)
    }

    async fn heartbeat(&self, instance_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE loader_instances
            SET heartbeat_at = NOW(), status = 'running'
            WHERE loader_instance_id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .context("Failed to update heartbeat")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("Unknown loader instance {}", instance_id));
        }
        Ok(())
    }

    async fn clear_stale_allocations(&self, timeouts: &LeaseTimeouts) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let cleared = clear_stale_in(&mut tx, timeouts).await?;
        tx.commit().await?;
        Ok(cleared)
    }

    async fn allocate_jobs(
        &self,
        instance_id: i64,
        file_type: FileType,
        max: usize,
        filter: &PathFilter,
        timeouts: &LeaseTimeouts,
    ) -> Result<Vec<AllocatedBundle>> {
        let mut tx = self.pool.begin().await?;

        let cleared = clear_stale_in(&mut tx, timeouts).await?;
        if cleared > 0 {
            info!(cleared, "Reclaimed stale bundle allocations");
        }

        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT resource_bundle_id
                FROM resource_bundles
                WHERE status = 'ready'
                  AND file_type = $2
                  AND (cardinality($3::text[]) = 0 OR object_name LIKE ANY($3::text[]))
                ORDER BY resource_bundle_id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE resource_bundles rb
            SET status = 'claimed',
                loader_instance_id = $1,
                allocated_at = NOW()
            FROM candidates c, bucket_paths bp
            WHERE rb.resource_bundle_id = c.resource_bundle_id
              AND bp.bucket_path_id = rb.bucket_path_id
            RETURNING rb.resource_bundle_id, bp.bucket_name, rb.object_name,
                      rb.version, rb.object_size
            "#,
        )
        .bind(instance_id)
        .bind(file_type.as_str())
        .bind(filter.like_patterns())
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to claim resource bundles")?;

        let mut allocated = Vec::with_capacity(rows.len());
        for row in rows {
            let resource_bundle_id: i64 = row.try_get("resource_bundle_id")?;
            let version: i32 = row.try_get("version")?;

            let load_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO resource_bundle_loads (resource_bundle_id, loader_instance_id, version)
                VALUES ($1, $2, $3)
                RETURNING resource_bundle_load_id
                "#,
            )
            .bind(resource_bundle_id)
            .bind(instance_id)
            .bind(version)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to create bundle load")?;

            allocated.push(AllocatedBundle {
                resource_bundle_id,
                load_id,
                bucket: row.try_get("bucket_name")?,
                key: row.try_get("object_name")?,
                file_type,
                version,
                size: row.try_get("object_size")?,
            });
        }

        tx.commit().await?;

        allocated.sort_by_key(|a| a.resource_bundle_id);
        debug!(instance_id, count = allocated.len(), "Claimed resource bundles");
        Ok(allocated)
    }

    async fn mark_done(&self, instance_id: i64, outcome: &LoadOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let load = sqlx::query(
            r#"
            UPDATE resource_bundle_loads
            SET load_completed = NOW(), row_count = $2, failure_count = $3
            WHERE resource_bundle_load_id = $1
            "#,
        )
        .bind(outcome.load_id)
        .bind(outcome.row_count)
        .bind(outcome.failure_count)
        .execute(&mut *tx)
        .await
        .context("Failed to close bundle load")?;

        if load.rows_affected() == 0 {
            return Err(anyhow!("Unknown bundle load {}", outcome.load_id));
        }

        // A reclaimed lease belongs to someone else now; leave their claim alone.
        sqlx::query(
            r#"
            UPDATE resource_bundles
            SET status = 'done', done_at = NOW()
            WHERE resource_bundle_id = $1
              AND status = 'claimed'
              AND loader_instance_id = $2
            "#,
        )
        .bind(outcome.resource_bundle_id)
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark bundle done")?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_logical_ids(&self, records: &[LogicalIdRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let load_ids: Vec<i64> = records.iter().map(|r| r.load_id).collect();
        let lines: Vec<i64> = records.iter().map(|r| r.line_number).collect();
        let type_ids: Vec<i32> = records.iter().map(|r| r.resource_type_id).collect();
        let logical_ids: Vec<String> = records.iter().map(|r| r.logical_id.clone()).collect();
        let times: Vec<i64> = records.iter().map(|r| r.response_time_ms).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO logical_resources
                (resource_bundle_load_id, line_number, resource_type_id, logical_id, response_time_ms)
            SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::int[], $4::text[], $5::bigint[])
            "#,
        )
        .bind(load_ids)
        .bind(lines)
        .bind(type_ids)
        .bind(logical_ids)
        .bind(times)
        .execute(&mut *tx)
        .await
        .context("Failed to record logical ids")?;
        tx.commit().await?;

        Ok(())
    }

    async fn record_errors(&self, records: &[BundleErrorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let load_ids: Vec<i64> = records.iter().map(|r| r.load_id).collect();
        let lines: Vec<i64> = records.iter().map(|r| r.line_number).collect();
        let codes: Vec<Option<i32>> = records.iter().map(|r| r.status_code).collect();
        let messages: Vec<String> = records.iter().map(|r| r.message.clone()).collect();
        let times: Vec<i64> = records.iter().map(|r| r.response_time_ms).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO resource_bundle_errors
                (resource_bundle_load_id, line_number, http_status_code, error_text, response_time_ms)
            SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::int[], $4::text[], $5::bigint[])
            "#,
        )
        .bind(load_ids)
        .bind(lines)
        .bind(codes)
        .bind(messages)
        .bind(times)
        .execute(&mut *tx)
        .await
        .context("Failed to record bundle errors")?;
        tx.commit().await?;

        Ok(())
    }

    async fn last_processed_line(
        &self,
        resource_bundle_id: i64,
        version: i32,
        current_load_id: i64,
    ) -> Result<Option<i64>> {
        let line: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(line_number) FROM (
                SELECT lr.line_number
                FROM logical_resources lr
                JOIN resource_bundle_loads l
                  ON l.resource_bundle_load_id = lr.resource_bundle_load_id
                WHERE l.resource_bundle_id = $1
                  AND l.version = $2
                  AND l.resource_bundle_load_id <> $3
                UNION ALL
                SELECT e.line_number
                FROM resource_bundle_errors e
                JOIN resource_bundle_loads l
                  ON l.resource_bundle_load_id = e.resource_bundle_load_id
                WHERE l.resource_bundle_id = $1
                  AND l.version = $2
                  AND l.resource_bundle_load_id <> $3
            ) recorded
            "#,
        )
        .bind(resource_bundle_id)
        .bind(version)
        .bind(current_load_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to query last processed line")?;

        Ok(line)
    }

    async fn resource_types(&self) -> Result<HashMap<String, i32>> {
        let rows = sqlx::query("SELECT resource_type, resource_type_id FROM resource_types")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load resource types")?;

        rows.into_iter()
            .map(|r| -> Result<(String, i32)> {
                Ok((r.try_get("resource_type")?, r.try_get("resource_type_id")?))
            })
            .collect()
    }

    async fn ensure_resource_type(&self, name: &str) -> Result<i32> {
        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO resource_types (resource_type)
            VALUES ($1)
            ON CONFLICT (resource_type) DO UPDATE SET resource_type = EXCLUDED.resource_type
            RETURNING resource_type_id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to add resource type {}", name))?;

        Ok(id)
    }

    async fn register_bucket_path(&self, bucket: &str, path: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO bucket_paths (bucket_name, bucket_path)
            VALUES ($1, $2)
            ON CONFLICT (bucket_name, bucket_path) DO UPDATE SET bucket_name = EXCLUDED.bucket_name
            RETURNING bucket_path_id
            "#,
        )
        .bind(bucket)
        .bind(path)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to register bucket path {}/{}", bucket, path))?;

        Ok(id)
    }

    async fn register_bundles(
        &self,
        bucket_path_id: i64,
        objects: &[ScannedObject],
    ) -> Result<RegisterSummary> {
        let mut summary = RegisterSummary::default();
        let mut tx = self.pool.begin().await?;

        for object in objects {
            // xmax is zero only for a freshly inserted tuple
            let inserted: Option<bool> = sqlx::query_scalar(
                r#"
                INSERT INTO resource_bundles
                    (bucket_path_id, object_name, object_size, file_type, etag)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (bucket_path_id, object_name) DO UPDATE
                SET etag = EXCLUDED.etag,
                    object_size = EXCLUDED.object_size,
                    version = resource_bundles.version + 1,
                    status = 'ready',
                    loader_instance_id = NULL,
                    allocated_at = NULL,
                    done_at = NULL,
                    scanned_at = NOW()
                WHERE resource_bundles.etag IS DISTINCT FROM EXCLUDED.etag
                RETURNING (xmax = 0)
                "#,
            )
            .bind(bucket_path_id)
            .bind(&object.key)
            .bind(object.size)
            .bind(object.file_type.as_str())
            .bind(&object.etag)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("Failed to register bundle {}", object.key))?;

            match inserted {
                Some(true) => summary.inserted += 1,
                Some(false) => summary.changed += 1,
                None => summary.unchanged += 1,
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}
