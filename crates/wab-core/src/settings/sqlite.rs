use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    domain::PhoneNumber,
    errors::Error,
    settings::{BackendKind, SettingsBackend, SettingsPatch, UserSettings},
    Result,
};

const COLUMNS: &str = "phone_number, session_id, display_name, auto_read, auto_typing, \
     auto_recording, always_online, anti_call, anti_link, status_read_enabled, \
     auto_react_enabled, status_react_notify, prefix, status_read_message, vcf_file_name, \
     last_vcf_update, created_at, updated_at";

/// Primary backend: a `users` table in SQLite.
///
/// The connection is shared behind a mutex and driven from blocking threads.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Database("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::External(format!("sqlite task failed: {e}")))?
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            phone_number TEXT NOT NULL UNIQUE,
            session_id TEXT,
            display_name TEXT,
            auto_read INTEGER NOT NULL DEFAULT 0,
            auto_typing INTEGER NOT NULL DEFAULT 0,
            auto_recording INTEGER NOT NULL DEFAULT 0,
            always_online INTEGER NOT NULL DEFAULT 0,
            anti_call INTEGER NOT NULL DEFAULT 0,
            anti_link INTEGER NOT NULL DEFAULT 0,
            status_read_enabled INTEGER NOT NULL DEFAULT 1,
            auto_react_enabled INTEGER NOT NULL DEFAULT 0,
            status_react_notify INTEGER NOT NULL DEFAULT 1,
            prefix TEXT NOT NULL DEFAULT '.',
            status_read_message TEXT NOT NULL DEFAULT 'Your Status has been read',
            vcf_file_name TEXT,
            last_vcf_update TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_created_at ON users(created_at DESC);
        ",
    )?;
    Ok(())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_settings(row: &Row<'_>) -> rusqlite::Result<UserSettings> {
    let phone: String = row.get(0)?;
    let phone_number = PhoneNumber::parse(&phone).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_vcf_update = match row.get::<_, Option<String>>(15)? {
        Some(raw) => Some(parse_ts(15, raw)?),
        None => None,
    };

    Ok(UserSettings {
        phone_number,
        session_id: row.get(1)?,
        display_name: row.get(2)?,
        auto_read: row.get(3)?,
        auto_typing: row.get(4)?,
        auto_recording: row.get(5)?,
        always_online: row.get(6)?,
        anti_call: row.get(7)?,
        anti_link: row.get(8)?,
        status_read_enabled: row.get(9)?,
        auto_react_enabled: row.get(10)?,
        status_react_notify: row.get(11)?,
        prefix: row.get(12)?,
        status_read_message: row.get(13)?,
        vcf_file_name: row.get(14)?,
        last_vcf_update,
        created_at: parse_ts(16, row.get(16)?)?,
        updated_at: parse_ts(17, row.get(17)?)?,
    })
}

fn select_one(conn: &Connection, phone: &str) -> Result<Option<UserSettings>> {
    let sql = format!("SELECT {COLUMNS} FROM users WHERE phone_number = ?1");
    Ok(conn.query_row(&sql, params![phone], row_to_settings).optional()?)
}

fn write_row(conn: &Connection, s: &UserSettings) -> Result<()> {
    let sql = format!(
        "INSERT INTO users ({COLUMNS}) VALUES \
         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
         ON CONFLICT(phone_number) DO UPDATE SET \
           session_id = excluded.session_id, \
           display_name = excluded.display_name, \
           auto_read = excluded.auto_read, \
           auto_typing = excluded.auto_typing, \
           auto_recording = excluded.auto_recording, \
           always_online = excluded.always_online, \
           anti_call = excluded.anti_call, \
           anti_link = excluded.anti_link, \
           status_read_enabled = excluded.status_read_enabled, \
           auto_react_enabled = excluded.auto_react_enabled, \
           status_react_notify = excluded.status_react_notify, \
           prefix = excluded.prefix, \
           status_read_message = excluded.status_read_message, \
           vcf_file_name = excluded.vcf_file_name, \
           last_vcf_update = excluded.last_vcf_update, \
           updated_at = excluded.updated_at"
    );
    conn.execute(
        &sql,
        params![
            s.phone_number.as_str(),
            s.session_id,
            s.display_name,
            s.auto_read,
            s.auto_typing,
            s.auto_recording,
            s.always_online,
            s.anti_call,
            s.anti_link,
            s.status_read_enabled,
            s.auto_react_enabled,
            s.status_react_notify,
            s.prefix,
            s.status_read_message,
            s.vcf_file_name,
            s.last_vcf_update.as_ref().map(ts),
            ts(&s.created_at),
            ts(&s.updated_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl SettingsBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn get(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        let phone = phone.clone();
        self.call(move |conn| select_one(conn, phone.as_str()))
            .await
    }

    async fn upsert(&self, phone: &PhoneNumber, patch: &SettingsPatch) -> Result<UserSettings> {
        let phone = phone.clone();
        let patch = patch.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut record = select_one(&tx, phone.as_str())?
                .unwrap_or_else(|| UserSettings::defaults(phone.clone()));
            record.apply(&patch);
            record.updated_at = Utc::now();
            write_row(&tx, &record)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn update(
        &self,
        phone: &PhoneNumber,
        patch: &SettingsPatch,
    ) -> Result<Option<UserSettings>> {
        let phone = phone.clone();
        let patch = patch.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut record) = select_one(&tx, phone.as_str())? else {
                return Ok(None);
            };
            record.apply(&patch);
            record.updated_at = Utc::now();
            write_row(&tx, &record)?;
            tx.commit()?;
            Ok(Some(record))
        })
        .await
    }

    async fn delete(&self, phone: &PhoneNumber) -> Result<Option<UserSettings>> {
        let phone = phone.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let existing = select_one(&tx, phone.as_str())?;
            if existing.is_some() {
                tx.execute(
                    "DELETE FROM users WHERE phone_number = ?1",
                    params![phone.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    async fn put(&self, record: &UserSettings) -> Result<()> {
        let record = record.clone();
        self.call(move |conn| write_row(conn, &record)).await
    }

    async fn list_all(&self) -> Result<Vec<UserSettings>> {
        self.call(|conn| {
            let sql =
                format!("SELECT {COLUMNS} FROM users ORDER BY created_at DESC, phone_number ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_settings)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
