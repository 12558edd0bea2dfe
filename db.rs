use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::models::{DetectionRecord, DetectionStats, FaceBox, NewDetection, RecordPage};
use crate::schema;
use chrono::Local;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::time::Duration;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

pub const DEFAULT_LIMIT: i64 = 100;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const RECORD_COLUMNS: &str =
    "id, timestamp, face_count, faces_data, image_width, image_height";

/// Persistence for detection events.
///
/// Every call is blocking; async callers should go through
/// [`blocking_with_timeout`].
pub trait DetectionStore: Send + Sync {
    /// Stores a detection and returns its newly assigned id.
    fn insert(&self, detection: &NewDetection) -> Result<i64>;

    /// Most recent records first. `limit` is clamped to the store's page size cap.
    fn list(&self, limit: i64, offset: i64) -> Result<RecordPage>;

    fn get(&self, id: i64) -> Result<DetectionRecord>;

    fn stats(&self) -> Result<DetectionStats>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    max_page_size: i64,
    timeout: Duration,
}

/// Initializes the database connection pool and runs migrations.
pub fn init_database(config: &StorageConfig) -> Result<SqliteStore> {
    let db_path = config.db_path.clone();
    log::info!("Database path: {}", db_path.display());

    open_pool(config)
        .map(|pool| SqliteStore {
            pool,
            max_page_size: config.max_page_size,
            timeout: config.timeout(),
        })
        .map_err(|e| Error::StorageInit {
            path: db_path,
            message: e.to_string(),
        })
}

fn open_pool(config: &StorageConfig) -> Result<DbPool> {
    // Ensure the parent directory exists
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let busy_timeout = config.timeout();
    let manager = SqliteConnectionManager::file(&config.db_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")
    });
    let pool = r2d2::Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.timeout())
        .build(manager)?;

    run_migrations(&pool.get()?)?;

    Ok(pool)
}

/// Applies all pending database migrations.
fn run_migrations(connection: &DbConnection) -> Result<()> {
    let connection: &Connection = connection;

    log::info!("Running database migrations...");
    connection.execute_batch(schema::MIGRATION_0001)?;
    log::info!("Migrations applied successfully.");
    Ok(())
}

/// Validates a requested page window and clamps `limit` to `max_limit`.
pub fn page_window(limit: Option<i64>, offset: Option<i64>, max_limit: i64) -> Result<(i64, i64)> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    let offset = offset.unwrap_or(0);
    if limit < 0 {
        return Err(Error::BadRequest(format!("limit must be >= 0, got {limit}")));
    }
    if offset < 0 {
        return Err(Error::BadRequest(format!("offset must be >= 0, got {offset}")));
    }
    Ok((limit.min(max_limit), offset))
}

impl SqliteStore {
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Checks out a pooled connection. r2d2 only fails a checkout once
    /// `connection_timeout` has elapsed.
    fn conn(&self) -> Result<DbConnection> {
        self.pool.get().map_err(|e| {
            log::debug!("Connection checkout failed: {e}");
            Error::StorageTimeout(self.timeout)
        })
    }

    /// Lock contention that outlasted `busy_timeout` is reported as a timeout.
    fn lock_timeouts(&self, err: Error) -> Error {
        match err {
            Error::Database(rusqlite::Error::SqliteFailure(ref e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Error::StorageTimeout(self.timeout)
            }
            other => other,
        }
    }

    fn insert_row(&self, detection: &NewDetection) -> Result<i64> {
        validate_new_detection(detection)?;
        let faces_json = serde_json::to_string(&detection.faces)?;
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO detection_records (timestamp, face_count, faces_data, image_width, image_height)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                timestamp,
                detection.face_count,
                faces_json,
                detection.image_width,
                detection.image_height
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn read_page(&self, limit: i64, offset: i64) -> Result<RecordPage> {
        let (limit, offset) = page_window(Some(limit), Some(offset), self.max_page_size)?;

        let mut conn = self.conn()?;
        // Page and total come from the same snapshot.
        let tx = conn.transaction()?;
        let records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM detection_records ORDER BY id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit, offset], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(RawRecord::into_record)
                .collect::<Result<Vec<_>>>()?
        };
        let total: i64 = tx.query_row("SELECT COUNT(*) FROM detection_records", [], |row| {
            row.get(0)
        })?;
        tx.commit()?;

        Ok(RecordPage {
            records,
            total,
            limit,
            offset,
        })
    }

    fn read_record(&self, id: i64) -> Result<DetectionRecord> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM detection_records WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_record(),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    fn read_stats(&self) -> Result<DetectionStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let (total_records, total_faces): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(face_count), 0) FROM detection_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let last_detection_time: Option<String> = tx
            .query_row(
                "SELECT timestamp FROM detection_records ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;

        Ok(DetectionStats::from_totals(
            total_records,
            total_faces,
            last_detection_time,
        ))
    }
}

impl DetectionStore for SqliteStore {
    fn insert(&self, detection: &NewDetection) -> Result<i64> {
        self.insert_row(detection)
            .map_err(|e| match self.lock_timeouts(e) {
                e @ (Error::InvalidRecord(_) | Error::StorageTimeout(_)) => e,
                other => Error::StorageWrite(other.to_string()),
            })
    }

    fn list(&self, limit: i64, offset: i64) -> Result<RecordPage> {
        self.read_page(limit, offset).map_err(|e| self.lock_timeouts(e))
    }

    fn get(&self, id: i64) -> Result<DetectionRecord> {
        self.read_record(id).map_err(|e| self.lock_timeouts(e))
    }

    fn stats(&self) -> Result<DetectionStats> {
        self.read_stats().map_err(|e| self.lock_timeouts(e))
    }
}

fn validate_new_detection(detection: &NewDetection) -> Result<()> {
    if detection.face_count < 0 || detection.face_count as usize != detection.faces.len() {
        return Err(Error::InvalidRecord(format!(
            "face_count {} does not match {} faces",
            detection.face_count,
            detection.faces.len()
        )));
    }
    if detection.image_width <= 0 || detection.image_height <= 0 {
        return Err(Error::InvalidRecord(format!(
            "image dimensions must be positive, got {}x{}",
            detection.image_width, detection.image_height
        )));
    }
    Ok(())
}

struct RawRecord {
    id: i64,
    timestamp: String,
    face_count: i64,
    faces_data: Option<String>,
    image_width: Option<i64>,
    image_height: Option<i64>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        face_count: row.get(2)?,
        faces_data: row.get(3)?,
        image_width: row.get(4)?,
        image_height: row.get(5)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<DetectionRecord> {
        let faces: Vec<FaceBox> = match self.faces_data.as_deref() {
            Some(data) if !data.trim().is_empty() => serde_json::from_str(data)?,
            _ => Vec::new(),
        };
        Ok(DetectionRecord {
            id: self.id,
            timestamp: self.timestamp,
            face_count: self.face_count,
            faces,
            image_width: self.image_width,
            image_height: self.image_height,
        })
    }
}

/// Runs a blocking storage call on the blocking pool and waits for it to finish.
///
/// Writes go through here: the store bounds them itself, so the result the
/// caller sees is the result that was committed.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

/// Runs a blocking read on the blocking pool, bounded by `timeout`.
///
/// The task is not cancelled on expiry, so this is only for calls without
/// side effects.
pub async fn blocking_with_timeout<T, F>(timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => Err(Error::Task(e.to_string())),
        Err(_) => Err(Error::StorageTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteStore {
        init_database(&StorageConfig::at(dir.path().join("faces.db"))).unwrap()
    }

    fn face(x: i64, score: f64) -> FaceBox {
        FaceBox {
            x1: x,
            y1: x + 1,
            x2: x + 50,
            y2: x + 60,
            score,
        }
    }

    fn detection_with(count: usize) -> NewDetection {
        let faces: Vec<FaceBox> = (0..count).map(|i| face(i as i64 * 10, 0.9)).collect();
        NewDetection {
            face_count: faces.len() as i64,
            faces,
            image_width: 640,
            image_height: 480,
        }
    }

    #[test]
    fn init_is_idempotent_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("faces.db");
        let config = StorageConfig::at(&path);

        let first = init_database(&config).unwrap();
        first.insert(&detection_with(1)).unwrap();
        drop(first);

        let second = init_database(&config).unwrap();
        assert!(path.exists());
        assert_eq!(second.stats().unwrap().total_records, 1);
    }

    #[test]
    fn init_fails_when_location_unusable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = init_database(&StorageConfig::at(blocker.join("faces.db"))).err().unwrap();
        assert!(matches!(err, Error::StorageInit { .. }));
    }

    #[test]
    fn sequential_ids_increase_and_list_reverses_them() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let ids: Vec<i64> = (0..5).map(|_| store.insert(&detection_with(1)).unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let page = store.list(100, 0).unwrap();
        let listed: Vec<i64> = page.records.iter().map(|r| r.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);
    }

    #[test]
    fn concurrent_inserts_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..10)
                        .map(|_| store.insert(&detection_with(t % 3)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            let per_thread = handle.join().unwrap();
            assert!(per_thread.windows(2).all(|w| w[0] < w[1]));
            ids.extend(per_thread);
        }
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 80);
        assert_eq!(store.stats().unwrap().total_records, 80);
    }

    #[test]
    fn get_round_trips_inserted_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let detection = NewDetection {
            face_count: 2,
            faces: vec![face(3, 0.875), face(100, 0.5)],
            image_width: 1920,
            image_height: 1080,
        };

        let id = store.insert(&detection).unwrap();
        let record = store.get(id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.face_count, 2);
        assert_eq!(record.faces, detection.faces);
        assert_eq!(record.image_width, Some(1920));
        assert_eq!(record.image_height, Some(1080));
        assert_eq!(record.timestamp.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.get(42), Err(Error::NotFound(id)) if id == "42"));
    }

    #[test]
    fn pages_cover_every_record_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for _ in 0..7 {
            store.insert(&detection_with(0)).unwrap();
        }

        let limit = 3;
        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = store.list(limit, offset).unwrap();
            assert_eq!(page.total, 7);
            let expected_len = limit.min(7 - offset).max(0) as usize;
            assert_eq!(page.records.len(), expected_len);
            if page.records.is_empty() {
                break;
            }
            seen.extend(page.records.iter().map(|r| r.id));
            offset += limit;
        }
        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn list_and_stats_work_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let page = store.list(DEFAULT_LIMIT, 0).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total, 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.total_faces_detected, 0);
        assert_eq!(stats.average_faces_per_detection, 0.0);
        assert_eq!(stats.last_detection_time, None);
    }

    #[test]
    fn stats_aggregate_face_counts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for count in [2, 0, 3] {
            store.insert(&detection_with(count)).unwrap();
        }
        let last = store.list(1, 0).unwrap().records.remove(0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.total_faces_detected, 5);
        assert_eq!(stats.average_faces_per_detection, 1.67);
        assert_eq!(stats.last_detection_time, Some(last.timestamp));
    }

    #[test]
    fn page_window_policy() {
        assert_eq!(page_window(None, None, 1000).unwrap(), (100, 0));
        assert_eq!(page_window(Some(5000), Some(10), 1000).unwrap(), (1000, 10));
        assert_eq!(page_window(Some(0), None, 1000).unwrap(), (0, 0));
        assert!(matches!(page_window(Some(-1), None, 1000), Err(Error::BadRequest(_))));
        assert!(matches!(page_window(None, Some(-3), 1000), Err(Error::BadRequest(_))));
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::at(dir.path().join("faces.db"));
        config.max_page_size = 2;
        let store = init_database(&config).unwrap();
        for _ in 0..4 {
            store.insert(&detection_with(1)).unwrap();
        }
        let page = store.list(50, 0).unwrap();
        assert_eq!(page.limit, 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total, 4);
    }

    #[test]
    fn mismatched_face_count_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut detection = detection_with(2);
        detection.face_count = 3;
        assert!(matches!(store.insert(&detection), Err(Error::InvalidRecord(_))));

        let mut detection = detection_with(0);
        detection.image_width = 0;
        assert!(matches!(store.insert(&detection), Err(Error::InvalidRecord(_))));
        assert_eq!(store.stats().unwrap().total_records, 0);
    }

    #[test]
    fn null_faces_data_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conn = store.pool().get().unwrap();
        conn.execute(
            "INSERT INTO detection_records (timestamp, face_count, faces_data, image_width, image_height)
             VALUES ('2024-05-01 12:00:00', 0, NULL, 10, 10)",
            [],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        drop(conn);

        let record = store.get(id).unwrap();
        assert!(record.faces.is_empty());
        assert_eq!(record.face_count, 0);
    }

    #[tokio::test]
    async fn slow_storage_call_times_out() {
        let res: Result<()> = blocking_with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::StorageTimeout(_))));
    }

    fn contended_config(dir: &TempDir) -> StorageConfig {
        let mut config = StorageConfig::at(dir.path().join("faces.db"));
        config.pool_size = 1;
        config.timeout_ms = 100;
        config
    }

    #[test]
    fn exhausted_pool_reports_timeout() {
        let dir = TempDir::new().unwrap();
        let store = init_database(&contended_config(&dir)).unwrap();

        let held = store.pool().get().unwrap();
        assert!(matches!(store.stats(), Err(Error::StorageTimeout(_))));
        assert!(matches!(store.get(1), Err(Error::StorageTimeout(_))));
        assert!(matches!(
            store.insert(&detection_with(1)),
            Err(Error::StorageTimeout(_))
        ));
        drop(held);

        assert_eq!(store.stats().unwrap().total_records, 0);
    }

    #[test]
    fn busy_writer_times_out_insert_without_committing() {
        let dir = TempDir::new().unwrap();
        let config = contended_config(&dir);
        let store = init_database(&config).unwrap();

        let other = Connection::open(&config.db_path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();
        assert!(matches!(
            store.insert(&detection_with(2)),
            Err(Error::StorageTimeout(_))
        ));
        other.execute_batch("COMMIT").unwrap();

        assert_eq!(store.stats().unwrap().total_records, 0);
        assert_eq!(store.insert(&detection_with(2)).unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_write_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let writer = store.clone();
        let inserted = run_blocking(move || {
            thread::sleep(Duration::from_millis(100));
            writer.insert(&detection_with(1))
        })
        .await
        .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.stats().unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn blocking_read_returns_store_result() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert(&detection_with(3)).unwrap();
        let stats = blocking_with_timeout(Duration::from_secs(5), move || store.stats())
            .await
            .unwrap();
        assert_eq!(stats.total_faces_detected, 3);
    }
}
