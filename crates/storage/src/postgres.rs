//! PostgreSQL store

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};
use wxpush_protocol::{Code, FieldList, SequenceId, Timestamp};

use crate::{
    ArchiveStore, ImageRow, ImageSourceRecord, LiveRow, RegistryStore, ReplicationState,
    ReplicationStatus, ReplicationSummary, SampleRow, StationRecord, StationStore, StorageError,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS stations (
        code VARCHAR(5) PRIMARY KEY,
        hardware VARCHAR(16) NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS station_access (
        auth_code BIGINT NOT NULL,
        station_code VARCHAR(5) NOT NULL REFERENCES stations(code),
        PRIMARY KEY (auth_code, station_code)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS image_types (
        code VARCHAR(5) PRIMARY KEY
    )"#,
    r#"CREATE TABLE IF NOT EXISTS image_sources (
        code VARCHAR(5) PRIMARY KEY,
        station_code VARCHAR(5) NOT NULL REFERENCES stations(code)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS samples (
        station_code VARCHAR(5) NOT NULL,
        time_stamp BIGINT NOT NULL,
        download_time_stamp BIGINT NOT NULL,
        field_list BIGINT NOT NULL,
        field_data BYTEA NOT NULL,
        PRIMARY KEY (station_code, time_stamp)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS live_data (
        station_code VARCHAR(5) PRIMARY KEY,
        sequence_id INT NOT NULL,
        field_list BIGINT NOT NULL,
        field_data BYTEA NOT NULL,
        received_at BIGINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images (
        id BIGSERIAL PRIMARY KEY,
        source_code VARCHAR(5) NOT NULL,
        type_code VARCHAR(5) NOT NULL,
        time_stamp BIGINT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        metadata TEXT NOT NULL,
        data BYTEA NOT NULL,
        UNIQUE (source_code, type_code, time_stamp)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS replication_status (
        image_id BIGINT NOT NULL REFERENCES images(id),
        site_id INT NOT NULL,
        status VARCHAR(24) NOT NULL DEFAULT 'pending',
        retries INT NOT NULL DEFAULT 0,
        status_time BIGINT NOT NULL,
        PRIMARY KEY (image_id, site_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sample_watermarks (
        site_id INT NOT NULL,
        station_code VARCHAR(5) NOT NULL,
        time_stamp BIGINT NOT NULL,
        PRIMARY KEY (site_id, station_code)
    )"#,
];

/// Notification channel raised when a station's live reading changes
pub const LIVE_CHANNEL: &str = "live_data_updated";

/// Notification channel raised when a sample is archived
pub const SAMPLE_CHANNEL: &str = "new_sample";

/// Notification channel raised when an image is inserted
pub const IMAGE_CHANNEL: &str = "new_image";

/// Notify functions and triggers. Payloads are the station code, or the image
/// id for images.
const TRIGGERS: &[&str] = &[
    r#"CREATE OR REPLACE FUNCTION wxpush_notify_live() RETURNS trigger AS $$
       BEGIN
         PERFORM pg_notify('live_data_updated', NEW.station_code);
         RETURN NEW;
       END;
       $$ LANGUAGE plpgsql"#,
    r#"CREATE OR REPLACE FUNCTION wxpush_notify_sample() RETURNS trigger AS $$
       BEGIN
         PERFORM pg_notify('new_sample', NEW.station_code);
         RETURN NEW;
       END;
       $$ LANGUAGE plpgsql"#,
    r#"CREATE OR REPLACE FUNCTION wxpush_notify_image() RETURNS trigger AS $$
       BEGIN
         PERFORM pg_notify('new_image', NEW.id::TEXT);
         RETURN NEW;
       END;
       $$ LANGUAGE plpgsql"#,
    "DROP TRIGGER IF EXISTS live_data_notify ON live_data",
    r#"CREATE TRIGGER live_data_notify AFTER INSERT OR UPDATE ON live_data
       FOR EACH ROW EXECUTE FUNCTION wxpush_notify_live()"#,
    "DROP TRIGGER IF EXISTS samples_notify ON samples",
    r#"CREATE TRIGGER samples_notify AFTER INSERT ON samples
       FOR EACH ROW EXECUTE FUNCTION wxpush_notify_sample()"#,
    "DROP TRIGGER IF EXISTS images_notify ON images",
    r#"CREATE TRIGGER images_notify AFTER INSERT ON images
       FOR EACH ROW EXECUTE FUNCTION wxpush_notify_image()"#,
];

/// Postgres-backed store implementing both store contracts
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Create missing tables and the change notification triggers
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA.iter().chain(TRIGGERS) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    /// Listener subscribed to the live, sample and image channels
    pub async fn listen(&self) -> Result<PgListener, StorageError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([LIVE_CHANNEL, SAMPLE_CHANNEL, IMAGE_CHANNEL])
            .await?;
        Ok(listener)
    }
}

fn code_column(row: &PgRow, column: &str) -> Result<Code, StorageError> {
    let raw: String = row.try_get(column)?;
    Code::new(raw.trim()).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn timestamp_column(row: &PgRow, column: &str) -> Result<Timestamp, StorageError> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw)
        .map(Timestamp::from_unix)
        .map_err(|_| StorageError::Corrupt(format!("{column} out of range: {raw}")))
}

fn station_row(row: &PgRow) -> Result<StationRecord, StorageError> {
    let hardware: String = row.try_get("hardware")?;
    Ok(StationRecord {
        code: code_column(row, "code")?,
        hardware: hardware.parse().map_err(StorageError::Corrupt)?,
    })
}

fn sample_row(row: &PgRow) -> Result<SampleRow, StorageError> {
    let field_list: i64 = row.try_get("field_list")?;
    let field_data: Vec<u8> = row.try_get("field_data")?;
    Ok(SampleRow {
        station_code: code_column(row, "station_code")?,
        timestamp: timestamp_column(row, "time_stamp")?,
        download_timestamp: timestamp_column(row, "download_time_stamp")?,
        field_list: FieldList::from_bits(field_list as u32),
        field_data: Bytes::from(field_data),
    })
}

fn live_row(row: &PgRow) -> Result<LiveRow, StorageError> {
    let sequence_id: i32 = row.try_get("sequence_id")?;
    let field_list: i64 = row.try_get("field_list")?;
    let field_data: Vec<u8> = row.try_get("field_data")?;
    Ok(LiveRow {
        station_code: code_column(row, "station_code")?,
        sequence_id: SequenceId::try_from(sequence_id as i64)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?,
        field_list: FieldList::from_bits(field_list as u32),
        field_data: Bytes::from(field_data),
        received_at: timestamp_column(row, "received_at")?,
    })
}

fn status_row(row: &PgRow) -> Result<ReplicationStatus, StorageError> {
    let status: String = row.try_get("status")?;
    let retries: i32 = row.try_get("retries")?;
    Ok(ReplicationStatus {
        image_id: row.try_get("image_id")?,
        site_id: row.try_get("site_id")?,
        status: status.parse().map_err(StorageError::Corrupt)?,
        retries: retries.max(0) as u32,
        status_time: timestamp_column(row, "status_time")?.as_unix(),
    })
}

#[async_trait]
impl RegistryStore for PgStore {
    async fn register_station(&self, station: &StationRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO stations (code, hardware) VALUES ($1, $2)
               ON CONFLICT (code) DO UPDATE SET hardware = EXCLUDED.hardware"#,
        )
        .bind(station.code.as_str())
        .bind(station.hardware.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn grant_access(&self, auth_code: u64, station: &Code) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO station_access (auth_code, station_code) VALUES ($1, $2)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(auth_code as i64)
        .bind(station.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_image_type(&self, code: &Code) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO image_types (code) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(code.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_image_source(
        &self,
        source: &ImageSourceRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO image_sources (code, station_code) VALUES ($1, $2)
               ON CONFLICT (code) DO UPDATE SET station_code = EXCLUDED.station_code"#,
        )
        .bind(source.code.as_str())
        .bind(source.station_code.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for PgStore {
    async fn authorise(&self, auth_code: u64) -> Result<bool, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM station_access WHERE auth_code = $1")
                .bind(auth_code as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn stations_for(&self, auth_code: u64) -> Result<Vec<StationRecord>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT s.code, s.hardware FROM stations s
               INNER JOIN station_access a ON a.station_code = s.code
               WHERE a.auth_code = $1
               ORDER BY s.code"#,
        )
        .bind(auth_code as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(station_row).collect()
    }

    async fn image_types(&self) -> Result<Vec<Code>, StorageError> {
        let rows = sqlx::query("SELECT code FROM image_types ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| code_column(r, "code")).collect()
    }

    async fn image_sources_for(
        &self,
        auth_code: u64,
    ) -> Result<Vec<ImageSourceRecord>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT i.code, i.station_code FROM image_sources i
               INNER JOIN station_access a ON a.station_code = i.station_code
               WHERE a.auth_code = $1
               ORDER BY i.code"#,
        )
        .bind(auth_code as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(ImageSourceRecord {
                    code: code_column(r, "code")?,
                    station_code: code_column(r, "station_code")?,
                })
            })
            .collect()
    }

    async fn sample(
        &self,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<SampleRow>, StorageError> {
        let row = sqlx::query(
            r#"SELECT station_code, time_stamp, download_time_stamp, field_list, field_data
               FROM samples
               WHERE station_code = $1 AND time_stamp = $2"#,
        )
        .bind(station.as_str())
        .bind(timestamp.as_unix() as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sample_row).transpose()
    }

    async fn store_samples(&self, samples: &[SampleRow]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for sample in samples {
            let result = sqlx::query(
                r#"INSERT INTO samples
                   (station_code, time_stamp, download_time_stamp, field_list, field_data)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (station_code, time_stamp) DO NOTHING"#,
            )
            .bind(sample.station_code.as_str())
            .bind(sample.timestamp.as_unix() as i64)
            .bind(sample.download_timestamp.as_unix() as i64)
            .bind(sample.field_list.bits() as i64)
            .bind(sample.field_data.as_ref())
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected();
        }
        tx.commit().await?;
        debug!(added, received = samples.len(), "Stored samples");
        Ok(added)
    }

    async fn store_live(&self, live: &LiveRow) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO live_data (station_code, sequence_id, field_list, field_data, received_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (station_code) DO UPDATE SET
                 sequence_id = EXCLUDED.sequence_id,
                 field_list = EXCLUDED.field_list,
                 field_data = EXCLUDED.field_data,
                 received_at = EXCLUDED.received_at"#,
        )
        .bind(live.station_code.as_str())
        .bind(live.sequence_id.get() as i32)
        .bind(live.field_list.bits() as i64)
        .bind(live.field_data.as_ref())
        .bind(live.received_at.as_unix() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_image(&self, image: &ImageRow) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"INSERT INTO images
               (source_code, type_code, time_stamp, title, description, mime_type, metadata, data)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (source_code, type_code, time_stamp) DO NOTHING"#,
        )
        .bind(image.source_code.as_str())
        .bind(image.type_code.as_str())
        .bind(image.timestamp.as_unix() as i64)
        .bind(&image.title)
        .bind(&image.description)
        .bind(&image.mime_type)
        .bind(&image.metadata)
        .bind(image.data.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StationStore for PgStore {
    async fn local_stations(&self) -> Result<Vec<StationRecord>, StorageError> {
        let rows = sqlx::query("SELECT code, hardware FROM stations ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(station_row).collect()
    }

    async fn samples_after(
        &self,
        station: &Code,
        after: Timestamp,
        limit: usize,
    ) -> Result<Vec<SampleRow>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT station_code, time_stamp, download_time_stamp, field_list, field_data
               FROM samples
               WHERE station_code = $1 AND time_stamp > $2
               ORDER BY time_stamp
               LIMIT $3"#,
        )
        .bind(station.as_str())
        .bind(after.as_unix() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sample_row).collect()
    }

    async fn latest_live(&self, station: &Code) -> Result<Option<LiveRow>, StorageError> {
        let row = sqlx::query(
            r#"SELECT station_code, sequence_id, field_list, field_data, received_at
               FROM live_data WHERE station_code = $1"#,
        )
        .bind(station.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(live_row).transpose()
    }

    async fn load_watermark(
        &self,
        site_id: i32,
        station: &Code,
    ) -> Result<Option<Timestamp>, StorageError> {
        let row = sqlx::query(
            "SELECT time_stamp FROM sample_watermarks WHERE site_id = $1 AND station_code = $2",
        )
        .bind(site_id)
        .bind(station.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|r| timestamp_column(r, "time_stamp"))
            .transpose()
    }

    async fn save_watermark(
        &self,
        site_id: i32,
        station: &Code,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO sample_watermarks (site_id, station_code, time_stamp)
               VALUES ($1, $2, $3)
               ON CONFLICT (site_id, station_code) DO UPDATE
               SET time_stamp = GREATEST(sample_watermarks.time_stamp, EXCLUDED.time_stamp)"#,
        )
        .bind(site_id)
        .bind(station.as_str())
        .bind(timestamp.as_unix() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_image(&self, image: &ImageRow, sites: &[i32]) -> Result<i64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO images
               (source_code, type_code, time_stamp, title, description, mime_type, metadata, data)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id"#,
        )
        .bind(image.source_code.as_str())
        .bind(image.type_code.as_str())
        .bind(image.timestamp.as_unix() as i64)
        .bind(&image.title)
        .bind(&image.description)
        .bind(&image.mime_type)
        .bind(&image.metadata)
        .bind(image.data.as_ref())
        .fetch_one(&mut *tx)
        .await?;

        let now = Timestamp::now().as_unix() as i64;
        for site_id in sites {
            sqlx::query(
                r#"INSERT INTO replication_status (image_id, site_id, status, retries, status_time)
                   VALUES ($1, $2, 'pending', 0, $3)"#,
            )
            .bind(id)
            .bind(site_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn image(&self, image_id: i64) -> Result<Option<ImageRow>, StorageError> {
        let row = sqlx::query(
            r#"SELECT id, source_code, type_code, time_stamp, title, description,
                      mime_type, metadata, data
               FROM images WHERE id = $1"#,
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: Vec<u8> = row.try_get("data")?;
        Ok(Some(ImageRow {
            id: row.try_get("id")?,
            source_code: code_column(&row, "source_code")?,
            type_code: code_column(&row, "type_code")?,
            timestamp: timestamp_column(&row, "time_stamp")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            mime_type: row.try_get("mime_type")?,
            metadata: row.try_get("metadata")?,
            data: Bytes::from(data),
        }))
    }

    async fn find_image(
        &self,
        source: &Code,
        image_type: &Code,
        timestamp: Timestamp,
    ) -> Result<Option<i64>, StorageError> {
        Ok(sqlx::query_scalar(
            r#"SELECT id FROM images
               WHERE source_code = $1 AND type_code = $2 AND time_stamp = $3"#,
        )
        .bind(source.as_str())
        .bind(image_type.as_str())
        .bind(timestamp.as_unix() as i64)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn select_pending(
        &self,
        site_id: i32,
        retry_limit: u32,
        limit: usize,
    ) -> Result<Vec<ReplicationStatus>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT image_id, site_id, status, retries, status_time
               FROM replication_status
               WHERE site_id = $1 AND status = 'pending' AND retries < $2
               ORDER BY status_time, image_id
               LIMIT $3"#,
        )
        .bind(site_id)
        .bind(retry_limit as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_row).collect()
    }

    async fn set_status(
        &self,
        site_id: i32,
        image_id: i64,
        status: ReplicationState,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"UPDATE replication_status SET status = $1, status_time = $2
               WHERE site_id = $3 AND image_id = $4"#,
        )
        .bind(status.as_str())
        .bind(now.as_unix() as i64)
        .bind(site_id)
        .bind(image_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "image {image_id} for site {site_id}"
            )));
        }
        Ok(())
    }

    async fn expire_awaiting(
        &self,
        site_id: i32,
        cutoff: Timestamp,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"UPDATE replication_status
               SET status = 'pending', retries = retries + 1, status_time = $1
               WHERE site_id = $2 AND status = 'awaiting_confirmation' AND status_time < $3"#,
        )
        .bind(now.as_unix() as i64)
        .bind(site_id)
        .bind(cutoff.as_unix() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_retries(
        &self,
        site_id: i32,
        image_id: Option<i64>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"UPDATE replication_status SET retries = 0
               WHERE site_id = $1 AND ($2::BIGINT IS NULL OR image_id = $2)"#,
        )
        .bind(site_id)
        .bind(image_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn parked(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<Vec<ReplicationStatus>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT image_id, site_id, status, retries, status_time
               FROM replication_status
               WHERE site_id = $1 AND status <> 'done' AND retries >= $2
               ORDER BY image_id"#,
        )
        .bind(site_id)
        .bind(retry_limit as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_row).collect()
    }

    async fn summary(
        &self,
        site_id: i32,
        retry_limit: u32,
    ) -> Result<ReplicationSummary, StorageError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE status = 'awaiting_confirmation') AS awaiting,
                 COUNT(*) FILTER (WHERE status = 'done') AS done,
                 COUNT(*) FILTER (WHERE status <> 'done' AND retries >= $2) AS parked
               FROM replication_status WHERE site_id = $1"#,
        )
        .bind(site_id)
        .bind(retry_limit as i32)
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, StorageError> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };
        Ok(ReplicationSummary {
            site_id,
            pending: count("pending")?,
            awaiting_confirmation: count("awaiting")?,
            done: count("done")?,
            parked: count("parked")?,
        })
    }
}
