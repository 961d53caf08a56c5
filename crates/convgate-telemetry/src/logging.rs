//! Persisted WARN+ records, keyed by job and session.
//!
//! The layer writes every warning or error with the `job_id` and
//! `session_id` it was logged under, so the history of one failed job can be
//! pulled back out later (`convgate --logs <jobId>`).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS job_logs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at   TEXT NOT NULL,
        level       TEXT NOT NULL,
        target      TEXT NOT NULL,
        message     TEXT NOT NULL,
        job_id      TEXT,
        session_id  TEXT,
        fields      TEXT
    );
    CREATE INDEX IF NOT EXISTS job_logs_by_job ON job_logs(job_id, id);
    CREATE INDEX IF NOT EXISTS job_logs_by_session ON job_logs(session_id, id);
";

const SELECT: &str = "
    SELECT id, logged_at, level, target, message, job_id, session_id, fields
    FROM job_logs
    WHERE (?1 IS NULL OR level = ?1)
      AND (?2 IS NULL OR job_id = ?2)
      AND (?3 IS NULL OR session_id = ?3)
      AND (?4 IS NULL OR logged_at >= ?4)
    ORDER BY id DESC
    LIMIT ?5";

/// One persisted record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Remaining event fields as a JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

/// Filter for [`JobLogStore::query`]. Unset fields match everything;
/// results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Upper-case level name, e.g. `ERROR`.
    pub level: Option<String>,
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    /// RFC 3339 lower bound on `logged_at`.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }
}

/// SQLite-backed store of WARN+ records.
pub struct JobLogStore {
    conn: Mutex<Connection>,
}

impl JobLogStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::with_connection(Connection::open(path)?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, entry: &Entry) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO job_logs (logged_at, level, target, message, job_id, session_id, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
            entry.logged_at,
            entry.level,
            entry.target,
            entry.message,
            entry.job_id,
            entry.session_id,
            entry.fields,
        ])?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> rusqlite::Result<Vec<LogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SELECT)?;
        let rows = stmt.query_map(
            params![
                q.level,
                q.job_id,
                q.session_id,
                q.since,
                q.limit.unwrap_or(DEFAULT_LIMIT),
            ],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    logged_at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    job_id: row.get(5)?,
                    session_id: row.get(6)?,
                    fields: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM job_logs", [], |row| row.get(0))
    }
}

struct Entry {
    logged_at: String,
    level: &'static str,
    target: String,
    message: String,
    job_id: Option<String>,
    session_id: Option<String>,
    fields: Option<String>,
}

/// Job and session ids found on an event or span.
#[derive(Default)]
struct Ids {
    job_id: Option<String>,
    session_id: Option<String>,
}

impl Ids {
    fn fill_from(&mut self, other: &Ids) {
        if self.job_id.is_none() {
            self.job_id.clone_from(&other.job_id);
        }
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
    }

    fn is_complete(&self) -> bool {
        self.job_id.is_some() && self.session_id.is_some()
    }
}

#[derive(Default)]
struct Collector {
    ids: Ids,
    message: String,
    fields: Map<String, Value>,
}

impl Collector {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(s)) => self.message = s,
            ("job_id", Value::String(s)) => self.ids.job_id = Some(s),
            ("session_id", Value::String(s)) => self.ids.session_id = Some(s),
            (name, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Collector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    // `%display` and `?debug` values, including the message.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }
}

/// `tracing` layer feeding a [`JobLogStore`].
pub struct JobLogLayer {
    store: Arc<JobLogStore>,
}

impl JobLogLayer {
    pub fn new(store: Arc<JobLogStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for JobLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.ids.job_id.is_none() && collector.ids.session_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.ids);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut collector = Collector::default();
        event.record(&mut collector);

        // Innermost span wins.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if collector.ids.is_complete() {
                    break;
                }
                if let Some(ids) = span.extensions().get::<Ids>() {
                    collector.ids.fill_from(ids);
                }
            }
        }

        let fields = (!collector.fields.is_empty())
            .then(|| Value::Object(collector.fields).to_string());
        // Write errors are dropped; logging them here would recurse.
        let _ = self.store.append(&Entry {
            logged_at: Utc::now().to_rfc3339(),
            level: meta.level().as_str(),
            target: meta.target().to_string(),
            message: collector.message,
            job_id: collector.ids.job_id,
            session_id: collector.ids.session_id,
            fields,
        });
    }
}
