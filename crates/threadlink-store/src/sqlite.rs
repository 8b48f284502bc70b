//! SQLite-backed mapping store

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use threadlink_core::error::StoreError;
use threadlink_core::store::MappingStore;
use threadlink_core::types::{BindingKey, RoutingFlags, ThreadBinding};

/// Thread names kept in memory when no capacity is configured
pub const DEFAULT_NAME_CACHE_CAPACITY: usize = 1024;

/// How long a writer waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts from a one-shot legacy database import
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub bindings_imported: usize,
    /// Legacy rows whose thread or channel was already bound
    pub bindings_skipped: usize,
    pub names_imported: usize,
}

/// Mapping store on a single SQLite file (thread-safe via Arc<Mutex>).
///
/// Bindings are always read from the database, since the CLI may change
/// routing flags from another process while the daemon runs. Thread
/// names sit behind an LRU read-through cache.
pub struct SqliteMappingStore {
    conn: Arc<Mutex<Connection>>,
    names: Mutex<LruCache<String, String>>,
}

impl SqliteMappingStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P, cache_capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(sql_error)?;
        info!("Opened mapping store at {:?}", path);
        Self::init(conn, cache_capacity)
    }

    /// Private store that disappears with the process
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        Self::init(conn, DEFAULT_NAME_CACHE_CAPACITY)
    }

    fn init(conn: Connection, cache_capacity: usize) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        init_tables(&conn).map_err(sql_error)?;

        let capacity = NonZeroUsize::new(cache_capacity)
            .or(NonZeroUsize::new(DEFAULT_NAME_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            names: Mutex::new(LruCache::new(capacity)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task panicked: {}", e)))?
    }

    fn name_cache(&self) -> MutexGuard<'_, LruCache<String, String>> {
        self.names.lock().unwrap_or_else(|poisoned| {
            warn!("Name cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Copy bindings and thread names out of a legacy bridge database.
    ///
    /// Rows that collide with existing bindings are skipped, so running the
    /// import twice is harmless.
    pub async fn import_legacy<P: AsRef<Path>>(&self, legacy_path: P) -> Result<ImportReport, StoreError> {
        let legacy_path = legacy_path.as_ref().to_path_buf();
        let report = self
            .with_conn(move |conn| {
                let legacy =
                    Connection::open_with_flags(&legacy_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                        .map_err(sql_error)?;
                import_from(&legacy, conn)
            })
            .await?;
        self.name_cache().clear();
        info!(
            "Legacy import: {} bindings imported, {} skipped, {} thread names",
            report.bindings_imported, report.bindings_skipped, report.names_imported
        );
        Ok(report)
    }
}

fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS thread_bindings (
            external_thread_id TEXT PRIMARY KEY,
            local_channel_id TEXT NOT NULL UNIQUE,
            routing_flags TEXT NOT NULL,
            delivery_endpoint TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS thread_names (
            external_thread_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

fn sql_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::DuplicateKey(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

fn key_clause(key: &BindingKey) -> (&'static str, &str) {
    match key {
        BindingKey::Thread(id) => ("external_thread_id", id),
        BindingKey::Channel(id) => ("local_channel_id", id),
    }
}

/// Columns of one binding row before the flags JSON is decoded
struct BindingRow {
    thread_id: String,
    channel_id: String,
    flags: String,
    endpoint: Option<String>,
    created_at: String,
}

impl BindingRow {
    const COLUMNS: &'static str =
        "external_thread_id, local_channel_id, routing_flags, delivery_endpoint, created_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get(0)?,
            channel_id: row.get(1)?,
            flags: row.get(2)?,
            endpoint: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<ThreadBinding, StoreError> {
        let routing_flags: RoutingFlags =
            serde_json::from_str(&self.flags).map_err(|e| StoreError::Corrupt {
                key: format!("thread {}", self.thread_id),
                message: e.to_string(),
            })?;
        Ok(ThreadBinding {
            external_thread_id: self.thread_id,
            local_channel_id: self.channel_id,
            routing_flags,
            delivery_endpoint: self.endpoint,
            created_at: self.created_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

fn encode_flags(flags: &RoutingFlags) -> Result<String, StoreError> {
    serde_json::to_string(flags).map_err(|e| StoreError::Backend(format!("cannot encode flags: {}", e)))
}

fn import_from(legacy: &Connection, conn: &Connection) -> Result<ImportReport, StoreError> {
    let mut report = ImportReport::default();
    let now = Utc::now().to_rfc3339();

    let mut stmt = legacy
        .prepare("SELECT channelID, threadID, allow, webhookURL FROM ChannelMaps")
        .map_err(sql_error)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<bool>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(sql_error)?;

    for row in rows {
        let (channel_id, thread_id, allow, webhook) = row.map_err(sql_error)?;
        let Some(thread_id) = thread_id.filter(|t| !t.is_empty()) else {
            debug!("Skipping legacy channel {} without thread", channel_id);
            report.bindings_skipped += 1;
            continue;
        };
        let flags = encode_flags(&RoutingFlags::allowing(allow.unwrap_or(true)))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO thread_bindings
                 (external_thread_id, local_channel_id, routing_flags, delivery_endpoint, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![thread_id, channel_id, flags, webhook.filter(|w| !w.is_empty()), now],
            )
            .map_err(sql_error)?;
        if inserted > 0 {
            report.bindings_imported += 1;
        } else {
            report.bindings_skipped += 1;
        }
    }

    let mut stmt = legacy
        .prepare("SELECT threadID, threadName FROM Threads WHERE threadName IS NOT NULL")
        .map_err(sql_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(sql_error)?;

    for row in rows {
        let (thread_id, name) = row.map_err(sql_error)?;
        report.names_imported += conn
            .execute(
                "INSERT OR IGNORE INTO thread_names (external_thread_id, display_name, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![thread_id, name, now],
            )
            .map_err(sql_error)?;
    }

    Ok(report)
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn get_binding(&self, key: &BindingKey) -> Result<Option<ThreadBinding>, StoreError> {
        let (column, id) = key_clause(key);
        let sql = format!(
            "SELECT {} FROM thread_bindings WHERE {} = ?1",
            BindingRow::COLUMNS,
            column
        );
        let id = id.to_owned();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(&sql, params![id], BindingRow::from_row)
                    .optional()
                    .map_err(sql_error)
            })
            .await?;
        row.map(BindingRow::decode).transpose()
    }

    async fn create_binding(&self, binding: &ThreadBinding) -> Result<ThreadBinding, StoreError> {
        let flags = encode_flags(&binding.routing_flags)?;
        let record = binding.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO thread_bindings
                 (external_thread_id, local_channel_id, routing_flags, delivery_endpoint, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.external_thread_id,
                    record.local_channel_id,
                    flags,
                    record.delivery_endpoint,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match sql_error(e) {
                StoreError::DuplicateKey(_) => StoreError::DuplicateKey(format!(
                    "thread {} or channel {}",
                    record.external_thread_id, record.local_channel_id
                )),
                other => other,
            })?;
            Ok(record)
        })
        .await
    }

    async fn update_flags(&self, key: &BindingKey, flags: &RoutingFlags) -> Result<bool, StoreError> {
        let (column, id) = key_clause(key);
        let sql = format!("UPDATE thread_bindings SET routing_flags = ?1 WHERE {} = ?2", column);
        let flags = encode_flags(flags)?;
        let id = id.to_owned();
        let changed = self
            .with_conn(move |conn| conn.execute(&sql, params![flags, id]).map_err(sql_error))
            .await?;
        Ok(changed > 0)
    }

    async fn destroy_binding(&self, key: &BindingKey) -> Result<(), StoreError> {
        let (column, id) = key_clause(key);
        let sql = format!("DELETE FROM thread_bindings WHERE {} = ?1", column);
        let id = id.to_owned();
        let removed = self
            .with_conn(move |conn| conn.execute(&sql, params![id]).map_err(sql_error))
            .await?;
        debug!("Destroyed {} binding(s) for {}", removed, key);
        Ok(())
    }

    async fn list_bindings(&self) -> Result<Vec<ThreadBinding>, StoreError> {
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM thread_bindings ORDER BY created_at, external_thread_id",
                    BindingRow::COLUMNS
                );
                let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
                let rows = stmt
                    .query_map([], BindingRow::from_row)
                    .map_err(sql_error)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql_error)?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(BindingRow::decode).collect()
    }

    async fn get_thread_name(&self, thread_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(name) = self.name_cache().get(thread_id) {
            return Ok(Some(name.clone()));
        }

        let id = thread_id.to_owned();
        let name: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT display_name FROM thread_names WHERE external_thread_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_error)
            })
            .await?;

        if let Some(name) = &name {
            self.name_cache().put(thread_id.to_owned(), name.clone());
        }
        Ok(name)
    }

    async fn put_thread_name(&self, thread_id: &str, name: &str) -> Result<(), StoreError> {
        let (id, display) = (thread_id.to_owned(), name.to_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO thread_names (external_thread_id, display_name, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(external_thread_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    updated_at = excluded.updated_at",
                params![id, display, Utc::now().to_rfc3339()],
            )
            .map_err(sql_error)
        })
        .await?;
        self.name_cache().put(thread_id.to_owned(), name.to_owned());
        Ok(())
    }

    async fn destroy_thread_name(&self, thread_id: &str) -> Result<(), StoreError> {
        let id = thread_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM thread_names WHERE external_thread_id = ?1",
                params![id],
            )
            .map_err(sql_error)
        })
        .await?;
        // Only after the row is gone, so a concurrent read cannot re-cache it
        self.name_cache().pop(thread_id);
        Ok(())
    }
}
