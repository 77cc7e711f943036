use anyhow::Context;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous},
};
use std::path::Path;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info};

use super::HistorySink;
use crate::models::{BoundingBox, Session, SessionRecord};

/// Fused detection row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDetection {
    pub session_id: String,
    pub pill_type: String,
    pub confidence: f64,
    pub detection_count: i64,
    pub bbox: BoundingBox,
    pub image_count: i64,
}

#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open (or create) the history database and apply migrations
    pub async fn open<P: AsRef<Path>>(db_file: P) -> anyhow::Result<Self> {
        let db_file = db_file.as_ref();
        if let Some(parent) = db_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        let connect_opts = SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_opts)
            .await
            .with_context(|| format!("Failed to open history database {:?}", db_file))?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(path = %db_file.display(), "History database initialized");
        Ok(Self { pool })
    }

    /// Latest sessions, newest first
    pub async fn recent_sessions(&self, limit: i64) -> anyhow::Result<Vec<SessionRecord>> {
        sqlx::query(
            r#"SELECT session_id, timestamp, trigger_source, images_captured,
                      detections_count, processing_time, success
               FROM detection_sessions ORDER BY id DESC LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> anyhow::Result<SessionRecord> {
            let timestamp: String = row.try_get("timestamp")?;
            Ok(SessionRecord {
                session_id: row.try_get("session_id")?,
                timestamp: OffsetDateTime::parse(&timestamp, &Rfc3339)?,
                trigger_source: row.try_get("trigger_source")?,
                images_captured: row.try_get("images_captured")?,
                detections_count: row.try_get("detections_count")?,
                processing_time: row.try_get("processing_time")?,
                success: row.try_get("success")?,
            })
        })
        .collect()
    }

    pub async fn detections_for(&self, session_id: &str) -> anyhow::Result<Vec<StoredDetection>> {
        sqlx::query(
            r#"SELECT session_id, pill_type, confidence, detection_count,
                      bbox_x1, bbox_y1, bbox_x2, bbox_y2, image_count
               FROM detections WHERE session_id = $1 ORDER BY id ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> anyhow::Result<StoredDetection> {
            Ok(StoredDetection {
                session_id: row.try_get("session_id")?,
                pill_type: row.try_get("pill_type")?,
                confidence: row.try_get("confidence")?,
                detection_count: row.try_get("detection_count")?,
                bbox: BoundingBox::new(
                    row.try_get("bbox_x1")?,
                    row.try_get("bbox_y1")?,
                    row.try_get("bbox_x2")?,
                    row.try_get("bbox_y2")?,
                ),
                image_count: row.try_get("image_count")?,
            })
        })
        .collect()
    }

    pub async fn session_count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM detection_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl HistorySink for SqliteHistory {
    async fn record_session(&self, session: &Session) -> anyhow::Result<()> {
        let record = session.record();
        let timestamp = record.timestamp.format(&Rfc3339)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO detection_sessions
               (session_id, timestamp, trigger_source, images_captured,
                detections_count, processing_time, success)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&record.session_id)
        .bind(&timestamp)
        .bind(&record.trigger_source)
        .bind(record.images_captured)
        .bind(record.detections_count)
        .bind(record.processing_time)
        .bind(record.success)
        .execute(&mut *tx)
        .await?;

        for detection in &session.final_detections {
            sqlx::query(
                r#"INSERT INTO detections
                   (session_id, timestamp, pill_type, confidence, detection_count,
                    bbox_x1, bbox_y1, bbox_x2, bbox_y2, image_count, ensemble_used, trigger_source)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            )
            .bind(&record.session_id)
            .bind(detection.timestamp.format(&Rfc3339)?)
            .bind(&detection.class_label)
            .bind(detection.confidence as f64)
            .bind(detection.support_count as i64)
            .bind(detection.bbox.x1)
            .bind(detection.bbox.y1)
            .bind(detection.bbox.x2)
            .bind(detection.bbox.y2)
            .bind(record.images_captured)
            .bind(record.images_captured > 1)
            .bind(&record.trigger_source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(session = %record.session_id, "Session recorded");
        Ok(())
    }
}
