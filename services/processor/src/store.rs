use crate::config::DatabaseConfig;
use crate::record::{
    BoundingBox, DetectionRecord, Keypoint, KeypointName, StoredDetection, KEYPOINT_COUNT,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Number of positional values in a result row
pub const ROW_VALUE_COUNT: usize = 33;

/// Positional columns of a result row, in bind order
pub const ROW_COLUMNS: [&str; ROW_VALUE_COUNT] = [
    "user_id",
    "image_id",
    "file_timestamp",
    "bbox_x1",
    "bbox_y1",
    "bbox_x2",
    "bbox_y2",
    "bbox_conf",
    "head_x",
    "head_y",
    "head_conf",
    "neck_x",
    "neck_y",
    "neck_conf",
    "rhand_x",
    "rhand_y",
    "rhand_conf",
    "lhand_x",
    "lhand_y",
    "lhand_conf",
    "back_x",
    "back_y",
    "back_conf",
    "lfoot_x",
    "lfoot_y",
    "lfoot_conf",
    "rfoot_x",
    "rfoot_y",
    "rfoot_conf",
    "tail_x",
    "tail_y",
    "tail_conf",
    "created_at",
];

/// Errors from the result store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record {0} already exists")]
    Conflict(String),

    #[error("Invalid result row: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Connection(#[from] sqlx::Error),
}

impl StoreError {
    /// Conflicts and rejected rows only affect the record at hand
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Validation(_))
    }
}

/// One positional value of a result row
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Text(Option<String>),
    Real(Option<f32>),
    Timestamp(DateTime<Utc>),
}

/// Validated row of exactly [`ROW_VALUE_COUNT`] values
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    values: Vec<RowValue>,
}

impl RecordRow {
    /// Assemble the positional row for a record
    pub fn assemble(
        user_id: &str,
        record: &DetectionRecord,
        created_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let builder = RowBuilder::new()
            .text(user_id)
            .text(record.image_id.as_str())
            .optional_text(record.timestamp.clone())
            .bounding_box(record.bounding_box.as_ref());

        record
            .keypoints
            .iter()
            .fold(builder, |builder, slot| builder.keypoint(slot.as_ref()))
            .timestamp(created_at)
            .finish()
    }

    pub fn values(&self) -> &[RowValue] {
        &self.values
    }
}

/// Incremental assembly of a [`RecordRow`]
#[derive(Debug, Default)]
pub struct RowBuilder {
    values: Vec<RowValue>,
}

impl RowBuilder {
    pub fn new() -> Self {
        Self {
            values: Vec::with_capacity(ROW_VALUE_COUNT),
        }
    }

    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.values.push(RowValue::Text(Some(value.into())));
        self
    }

    pub fn optional_text(mut self, value: Option<String>) -> Self {
        self.values.push(RowValue::Text(value));
        self
    }

    pub fn real(mut self, value: Option<f32>) -> Self {
        self.values.push(RowValue::Real(value));
        self
    }

    pub fn timestamp(mut self, value: DateTime<Utc>) -> Self {
        self.values.push(RowValue::Timestamp(value));
        self
    }

    /// Five values: x1, y1, x2, y2, confidence
    pub fn bounding_box(self, bbox: Option<&BoundingBox>) -> Self {
        self.real(bbox.map(|b| b.x1))
            .real(bbox.map(|b| b.y1))
            .real(bbox.map(|b| b.x2))
            .real(bbox.map(|b| b.y2))
            .real(bbox.map(|b| b.confidence))
    }

    /// Three values: x, y, confidence
    pub fn keypoint(self, keypoint: Option<&Keypoint>) -> Self {
        self.real(keypoint.map(|k| k.x))
            .real(keypoint.map(|k| k.y))
            .real(keypoint.map(|k| k.confidence))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Validate the value count
    pub fn finish(self) -> Result<RecordRow, StoreError> {
        if self.values.len() != ROW_VALUE_COUNT {
            return Err(StoreError::Validation(format!(
                "expected {} values, got {}",
                ROW_VALUE_COUNT,
                self.values.len()
            )));
        }

        Ok(RecordRow {
            values: self.values,
        })
    }
}

/// Per-record result of a batch insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Stored(StoredDetection),
    Conflict { image_id: String },
    Rejected { image_id: String, reason: String },
}

/// Persistence for detection records. There is no update or delete path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert all records in one transaction, committed at the end.
    ///
    /// Conflicts and invalid rows are reported per record; any other failure
    /// rolls back the whole batch.
    async fn insert_batch(
        &self,
        records: &[DetectionRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError>;

    /// Fetch a stored record by image id
    async fn get(&self, image_id: &str) -> Result<Option<StoredDetection>, StoreError>;

    /// Check connectivity
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a single record
    async fn insert(&self, record: &DetectionRecord) -> Result<StoredDetection, StoreError> {
        let outcome = self
            .insert_batch(std::slice::from_ref(record))
            .await?
            .pop();

        match outcome {
            Some(InsertOutcome::Stored(stored)) => Ok(stored),
            Some(InsertOutcome::Conflict { image_id }) => Err(StoreError::Conflict(image_id)),
            Some(InsertOutcome::Rejected { reason, .. }) => Err(StoreError::Validation(reason)),
            None => Err(StoreError::Validation("no outcome for record".to_string())),
        }
    }
}

fn insert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let placeholders: Vec<String> = (1..=ROW_VALUE_COUNT + 2).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO detection_results (device_serial, capture_date, {}) VALUES ({}) \
             ON CONFLICT (image_id) DO NOTHING RETURNING created_at",
            ROW_COLUMNS.join(", "),
            placeholders.join(", ")
        )
    })
}

fn select_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        format!(
            "SELECT device_serial, capture_date, {} FROM detection_results WHERE image_id = $1",
            ROW_COLUMNS.join(", ")
        )
    })
}

/// Stored row as read back from PostgreSQL
#[derive(Debug, Clone, FromRow)]
pub struct DetectionRow {
    pub device_serial: String,
    pub capture_date: NaiveDate,
    pub user_id: String,
    pub image_id: String,
    pub file_timestamp: Option<String>,
    pub bbox_x1: Option<f32>,
    pub bbox_y1: Option<f32>,
    pub bbox_x2: Option<f32>,
    pub bbox_y2: Option<f32>,
    pub bbox_conf: Option<f32>,
    pub head_x: Option<f32>,
    pub head_y: Option<f32>,
    pub head_conf: Option<f32>,
    pub neck_x: Option<f32>,
    pub neck_y: Option<f32>,
    pub neck_conf: Option<f32>,
    pub rhand_x: Option<f32>,
    pub rhand_y: Option<f32>,
    pub rhand_conf: Option<f32>,
    pub lhand_x: Option<f32>,
    pub lhand_y: Option<f32>,
    pub lhand_conf: Option<f32>,
    pub back_x: Option<f32>,
    pub back_y: Option<f32>,
    pub back_conf: Option<f32>,
    pub lfoot_x: Option<f32>,
    pub lfoot_y: Option<f32>,
    pub lfoot_conf: Option<f32>,
    pub rfoot_x: Option<f32>,
    pub rfoot_y: Option<f32>,
    pub rfoot_conf: Option<f32>,
    pub tail_x: Option<f32>,
    pub tail_y: Option<f32>,
    pub tail_conf: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl DetectionRow {
    fn keypoint_columns(&self, name: KeypointName) -> (Option<f32>, Option<f32>, Option<f32>) {
        match name {
            KeypointName::Head => (self.head_x, self.head_y, self.head_conf),
            KeypointName::Neck => (self.neck_x, self.neck_y, self.neck_conf),
            KeypointName::RightHand => (self.rhand_x, self.rhand_y, self.rhand_conf),
            KeypointName::LeftHand => (self.lhand_x, self.lhand_y, self.lhand_conf),
            KeypointName::Back => (self.back_x, self.back_y, self.back_conf),
            KeypointName::LeftFoot => (self.lfoot_x, self.lfoot_y, self.lfoot_conf),
            KeypointName::RightFoot => (self.rfoot_x, self.rfoot_y, self.rfoot_conf),
            KeypointName::Tail => (self.tail_x, self.tail_y, self.tail_conf),
        }
    }
}

impl From<DetectionRow> for StoredDetection {
    fn from(row: DetectionRow) -> Self {
        let bounding_box = match (row.bbox_x1, row.bbox_y1, row.bbox_x2, row.bbox_y2) {
            (Some(x1), Some(y1), Some(x2), Some(y2)) => Some(BoundingBox {
                x1,
                y1,
                x2,
                y2,
                confidence: row.bbox_conf.unwrap_or(0.0),
            }),
            _ => None,
        };

        let mut keypoints = [None; KEYPOINT_COUNT];
        for (slot, name) in keypoints.iter_mut().zip(KeypointName::ALL) {
            if let (Some(x), Some(y), confidence) = row.keypoint_columns(name) {
                *slot = Some(Keypoint {
                    x,
                    y,
                    confidence: confidence.unwrap_or(0.0),
                });
            }
        }

        StoredDetection {
            user_id: row.user_id,
            record: DetectionRecord {
                image_id: row.image_id,
                device_serial: row.device_serial,
                capture_date: row.capture_date,
                timestamp: row.file_timestamp,
                bounding_box,
                keypoints,
            },
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed result store
pub struct PgResultStore {
    pool: PgPool,
    user_id: String,
}

impl PgResultStore {
    /// Create a new result store with connection pool
    pub async fn new(config: &DatabaseConfig, user_id: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self::with_pool(pool, user_id))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool, user_id: impl Into<String>) -> Self {
        Self {
            pool,
            user_id: user_id.into(),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.into()))?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn insert_batch(
        &self,
        records: &[DetectionRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut tx = self.pool.begin().await?;

        for record in records {
            let row = match RecordRow::assemble(&self.user_id, record, Utc::now()) {
                Ok(row) => row,
                Err(e) => {
                    warn!(image_id = %record.image_id, error = %e, "Rejected result row");
                    outcomes.push(InsertOutcome::Rejected {
                        image_id: record.image_id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut query = sqlx::query_scalar::<_, DateTime<Utc>>(insert_sql())
                .bind(record.device_serial.clone())
                .bind(record.capture_date);

            for value in row.values() {
                query = match value {
                    RowValue::Text(text) => query.bind(text.clone()),
                    RowValue::Real(real) => query.bind(*real),
                    RowValue::Timestamp(ts) => query.bind(*ts),
                };
            }

            match query.fetch_optional(&mut *tx).await? {
                Some(created_at) => {
                    debug!(image_id = %record.image_id, "Record inserted");
                    outcomes.push(InsertOutcome::Stored(StoredDetection {
                        user_id: self.user_id.clone(),
                        record: record.clone(),
                        created_at,
                    }));
                }
                None => {
                    warn!(image_id = %record.image_id, "Record already exists, not overwritten");
                    outcomes.push(InsertOutcome::Conflict {
                        image_id: record.image_id.clone(),
                    });
                }
            }
        }

        tx.commit().await?;

        let stored = outcomes
            .iter()
            .filter(|o| matches!(o, InsertOutcome::Stored(_)))
            .count();
        metrics::counter!("keypose.records.inserted").increment(stored as u64);

        Ok(outcomes)
    }

    async fn get(&self, image_id: &str) -> Result<Option<StoredDetection>, StoreError> {
        let row = sqlx::query_as::<_, DetectionRow>(select_sql())
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(StoredDetection::from))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_record(keypoints: usize) -> DetectionRecord {
        let mut slots = [None; KEYPOINT_COUNT];
        for (i, slot) in slots.iter_mut().take(keypoints).enumerate() {
            *slot = Some(Keypoint {
                x: i as f32 * 10.0,
                y: i as f32 * 20.0,
                confidence: 0.5,
            });
        }

        DetectionRecord {
            image_id: "SFRXC12515GF00001_20250417_170454".to_string(),
            device_serial: "SFRXC12515GF00001".to_string(),
            capture_date: NaiveDate::from_ymd_opt(2025, 4, 17).unwrap(),
            timestamp: Some("20250417_170454".to_string()),
            bounding_box: Some(BoundingBox {
                x1: 10.0,
                y1: 20.0,
                x2: 110.0,
                y2: 220.0,
                confidence: 0.9,
            }),
            keypoints: slots,
        }
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 17, 8, 4, 54).unwrap()
    }

    fn real(value: &RowValue) -> Option<f32> {
        match value {
            RowValue::Real(v) => *v,
            other => panic!("expected real, got {:?}", other),
        }
    }

    fn text(value: &RowValue) -> Option<String> {
        match value {
            RowValue::Text(v) => v.clone(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    /// Rebuild a database row from the bind values, in column order
    fn row_from_values(record: &DetectionRecord, row: &RecordRow) -> DetectionRow {
        let v = row.values();
        let created_at = match &v[32] {
            RowValue::Timestamp(ts) => *ts,
            other => panic!("expected timestamp, got {:?}", other),
        };

        DetectionRow {
            device_serial: record.device_serial.clone(),
            capture_date: record.capture_date,
            user_id: text(&v[0]).unwrap(),
            image_id: text(&v[1]).unwrap(),
            file_timestamp: text(&v[2]),
            bbox_x1: real(&v[3]),
            bbox_y1: real(&v[4]),
            bbox_x2: real(&v[5]),
            bbox_y2: real(&v[6]),
            bbox_conf: real(&v[7]),
            head_x: real(&v[8]),
            head_y: real(&v[9]),
            head_conf: real(&v[10]),
            neck_x: real(&v[11]),
            neck_y: real(&v[12]),
            neck_conf: real(&v[13]),
            rhand_x: real(&v[14]),
            rhand_y: real(&v[15]),
            rhand_conf: real(&v[16]),
            lhand_x: real(&v[17]),
            lhand_y: real(&v[18]),
            lhand_conf: real(&v[19]),
            back_x: real(&v[20]),
            back_y: real(&v[21]),
            back_conf: real(&v[22]),
            lfoot_x: real(&v[23]),
            lfoot_y: real(&v[24]),
            lfoot_conf: real(&v[25]),
            rfoot_x: real(&v[26]),
            rfoot_y: real(&v[27]),
            rfoot_conf: real(&v[28]),
            tail_x: real(&v[29]),
            tail_y: real(&v[30]),
            tail_conf: real(&v[31]),
            created_at,
        }
    }

    #[test]
    fn test_assemble_has_33_values() {
        let row = RecordRow::assemble("default", &test_record(3), created_at()).unwrap();

        assert_eq!(row.values().len(), ROW_VALUE_COUNT);
        assert_eq!(row.values()[0], RowValue::Text(Some("default".to_string())));
        assert_eq!(row.values()[7], RowValue::Real(Some(0.9)));
        // Slot 3 (left hand) onwards are null triples
        assert!(row.values()[17..32]
            .iter()
            .all(|v| *v == RowValue::Real(None)));
        assert_eq!(row.values()[32], RowValue::Timestamp(created_at()));
    }

    #[test]
    fn test_assemble_without_box() {
        let mut record = test_record(2);
        record.bounding_box = None;

        let row = RecordRow::assemble("default", &record, created_at()).unwrap();
        assert!(row.values()[3..8].iter().all(|v| *v == RowValue::Real(None)));
    }

    #[test]
    fn test_missing_box_field_rejected() {
        // conf omitted: only four box values
        let builder = RowBuilder::new()
            .text("default")
            .text("SFRXC12515GF00001_20250417_170454")
            .optional_text(None)
            .real(Some(10.0))
            .real(Some(20.0))
            .real(Some(110.0))
            .real(Some(220.0));

        let builder = (0..KEYPOINT_COUNT).fold(builder, |b, _| b.keypoint(None));
        let builder = builder.timestamp(created_at());
        assert_eq!(builder.len(), ROW_VALUE_COUNT - 1);

        assert!(matches!(builder.finish(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_extra_value_rejected() {
        let builder = RowBuilder::new()
            .text("default")
            .text("id")
            .optional_text(None)
            .bounding_box(None);
        let builder = (0..KEYPOINT_COUNT).fold(builder, |b, _| b.keypoint(None));
        let builder = builder.timestamp(created_at()).real(None);

        assert!(matches!(builder.finish(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_row_round_trip_preserves_record() {
        let record = test_record(5);
        let row = RecordRow::assemble("tenant-a", &record, created_at()).unwrap();

        let stored = StoredDetection::from(row_from_values(&record, &row));

        assert_eq!(stored.record, record);
        assert_eq!(stored.user_id, "tenant-a");
        assert_eq!(stored.created_at, created_at());
    }

    #[test]
    fn test_insert_sql_shape() {
        let sql = insert_sql();
        assert!(sql.contains("$35)"));
        assert!(!sql.contains("$36"));
        assert!(sql.contains("ON CONFLICT (image_id) DO NOTHING"));
        assert_eq!(ROW_COLUMNS.len(), ROW_VALUE_COUNT);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(StoreError::Conflict("a".to_string()).is_recoverable());
        assert!(StoreError::Validation("a".to_string()).is_recoverable());
        assert!(!StoreError::Connection(sqlx::Error::PoolTimedOut).is_recoverable());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at KEYPOSE_TEST_DATABASE_URL"]
    async fn test_postgres_round_trip_and_conflict() {
        let url = std::env::var("KEYPOSE_TEST_DATABASE_URL").unwrap();
        let pool = PgPoolOptions::new().connect(&url).await.unwrap();
        let store = PgResultStore::with_pool(pool, "default");
        store.run_migrations().await.unwrap();

        let mut record = test_record(3);
        record.image_id = format!("ROUNDTRIP_20250417_{}", Utc::now().timestamp_micros());

        let stored = store.insert(&record).await.unwrap();
        let fetched = store.get(&record.image_id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.record, record);

        let conflict = store.insert(&record).await;
        assert!(matches!(conflict, Err(StoreError::Conflict(id)) if id == record.image_id));
    }
}
