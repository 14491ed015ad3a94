//! DuckDB-backed storage for checkpoints, run history, quotas and leases.

use crate::history::{RunRecorder, RunStatus, SyncRun, SyncedItem};
use crate::lease::{Lease, LeaseStore};
use crate::ratelimit::{QuotaDecision, QuotaStore, QuotaWindow};
use crate::state::CheckpointStore;
use crate::types::{Checkpoint, Direction};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use duckdb::{params, Connection, OptionalExt};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    user_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    server_knowledge BIGINT,
    since_ts TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, direction)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    trigger_kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    error TEXT
);

CREATE TABLE IF NOT EXISTS synced_items (
    run_id TEXT NOT NULL,
    seq BIGINT NOT NULL,
    item_type TEXT NOT NULL,
    external_id TEXT NOT NULL,
    amount BIGINT NOT NULL,
    description TEXT NOT NULL,
    item_date TEXT NOT NULL,
    direction TEXT NOT NULL,
    outcome TEXT NOT NULL,
    error TEXT,
    error_kind TEXT,
    created_id TEXT,
    PRIMARY KEY (run_id, seq)
);

CREATE TABLE IF NOT EXISTS rate_limits (
    user_id TEXT NOT NULL,
    window_key TEXT NOT NULL,
    hits BIGINT NOT NULL,
    PRIMARY KEY (user_id, window_key)
);

CREATE TABLE IF NOT EXISTS run_leases (
    user_id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{raw}' in database"))?
        .with_timezone(&Utc))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow!(e))
}

/// Single-file store shared by every component that needs durable state.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
}

impl Persistence {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to apply database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn load_items(conn: &Connection, run_id: &str) -> Result<Vec<SyncedItem>> {
        let mut stmt = conn.prepare(
            "SELECT item_type, external_id, amount, description, item_date, direction, \
             outcome, error, error_kind, created_id \
             FROM synced_items WHERE run_id = ? ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (
                item_type,
                external_id,
                amount,
                description,
                date,
                direction,
                outcome,
                error,
                error_kind,
                created_id,
            ) = row?;
            items.push(SyncedItem {
                item_type: parse_enum(&item_type)?,
                external_id,
                amount,
                description,
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .with_context(|| format!("invalid item date '{date}'"))?,
                direction: parse_enum(&direction)?,
                outcome: parse_enum(&outcome)?,
                error,
                error_kind,
                created_id,
            });
        }
        Ok(items)
    }

    fn load_runs(conn: &Connection, sql: &str, args: &[&dyn duckdb::ToSql]) -> Result<Vec<SyncRun>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, user_id, trigger, started_at, completed_at, status, error) = row?;
            let items = Self::load_items(conn, &id)?;
            runs.push(SyncRun {
                id,
                user_id,
                trigger: parse_enum(&trigger)?,
                started_at: parse_ts(&started_at)?,
                completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
                status: parse_enum(&status)?,
                error,
                items,
            });
        }
        Ok(runs)
    }

    fn run_status(conn: &Connection, run_id: &str) -> Result<Option<RunStatus>> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM sync_runs WHERE id = ?",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        status.as_deref().map(parse_enum).transpose()
    }
}

impl CheckpointStore for Persistence {
    fn get(&self, user_id: &str, direction: Direction) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let row: Option<(Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT server_knowledge, since_ts FROM checkpoints \
                 WHERE user_id = ? AND direction = ?",
                params![user_id, direction.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((Some(knowledge), _)) => Ok(Some(Checkpoint::ServerKnowledge(knowledge))),
            Some((None, Some(since))) => Ok(Some(Checkpoint::Since(parse_ts(&since)?))),
            Some((None, None)) => bail!("empty checkpoint row for {user_id}/{direction}"),
        }
    }

    fn set(&self, user_id: &str, direction: Direction, checkpoint: Checkpoint) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints \
             (user_id, direction, server_knowledge, since_ts, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                user_id,
                direction.as_str(),
                checkpoint.server_knowledge(),
                checkpoint.since().map(ts),
                ts(Utc::now()),
            ],
        )
        .with_context(|| format!("Failed to save checkpoint for {user_id}/{direction}"))?;
        Ok(())
    }
}

impl RunRecorder for Persistence {
    fn create_run(&self, run: &SyncRun) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sync_runs (id, user_id, trigger_kind, started_at, completed_at, status, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                run.id,
                run.user_id,
                run.trigger.as_str(),
                ts(run.started_at),
                run.completed_at.map(ts),
                run.status.as_str(),
                run.error,
            ],
        )
        .with_context(|| format!("Failed to create run {}", run.id))?;
        for (seq, item) in run.items.iter().enumerate() {
            insert_item(&tx, &run.id, seq as i64, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn append_item(&self, run_id: &str, item: &SyncedItem) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match Self::run_status(&tx, run_id)? {
            None => bail!("run {run_id} not found"),
            Some(status) if status.is_terminal() => bail!("run {run_id} is already {status}"),
            Some(_) => {}
        }
        let seq: i64 = tx.query_row(
            "SELECT COUNT(*) FROM synced_items WHERE run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        insert_item(&tx, run_id, seq, item)?;
        tx.commit()?;
        Ok(())
    }

    fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("cannot finish run {run_id} as {status}");
        }
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_runs SET status = ?, completed_at = ?, error = ? \
             WHERE id = ? AND status = 'in_progress'",
            params![status.as_str(), ts(completed_at), error, run_id],
        )?;
        if updated == 0 {
            match Self::run_status(&conn, run_id)? {
                None => bail!("run {run_id} not found"),
                Some(current) => bail!("run {run_id} is already {current}"),
            }
        }
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let conn = self.conn()?;
        let mut runs = Self::load_runs(
            &conn,
            "SELECT id, user_id, trigger_kind, started_at, completed_at, status, error \
             FROM sync_runs WHERE id = ?",
            &[&run_id],
        )?;
        Ok(runs.pop())
    }

    fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let conn = self.conn()?;
        let limit = limit as i64;
        Self::load_runs(
            &conn,
            "SELECT id, user_id, trigger_kind, started_at, completed_at, status, error \
             FROM sync_runs WHERE user_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
            &[&user_id, &limit],
        )
    }
}

fn insert_item(conn: &Connection, run_id: &str, seq: i64, item: &SyncedItem) -> Result<()> {
    conn.execute(
        "INSERT INTO synced_items (run_id, seq, item_type, external_id, amount, description, \
         item_date, direction, outcome, error, error_kind, created_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            run_id,
            seq,
            item.item_type.as_str(),
            item.external_id,
            item.amount,
            item.description,
            item.date.format("%Y-%m-%d").to_string(),
            item.direction.as_str(),
            item.outcome.as_str(),
            item.error,
            item.error_kind,
            item.created_id,
        ],
    )
    .with_context(|| format!("Failed to record item {} for run {run_id}", item.external_id))?;
    Ok(())
}

impl QuotaStore for Persistence {
    fn try_consume(&self, user_id: &str, windows: &[QuotaWindow]) -> Result<QuotaDecision> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut current = Vec::with_capacity(windows.len());
        for window in windows {
            let hits: Option<i64> = tx
                .query_row(
                    "SELECT hits FROM rate_limits WHERE user_id = ? AND window_key = ?",
                    params![user_id, window.key],
                    |row| row.get(0),
                )
                .optional()?;
            if hits.unwrap_or(0) >= i64::from(window.limit) {
                return Ok(QuotaDecision::Denied {
                    window: window.name,
                });
            }
            current.push(hits);
        }

        for (window, hits) in windows.iter().zip(current) {
            match hits {
                Some(_) => tx.execute(
                    "UPDATE rate_limits SET hits = hits + 1 WHERE user_id = ? AND window_key = ?",
                    params![user_id, window.key],
                )?,
                None => tx.execute(
                    "INSERT INTO rate_limits (user_id, window_key, hits) VALUES (?, ?, 1)",
                    params![user_id, window.key],
                )?,
            };
        }
        tx.commit()?;
        Ok(QuotaDecision::Allowed)
    }
}

impl LeaseStore for Persistence {
    fn try_acquire(
        &self,
        user_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM run_leases WHERE user_id = ?",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let expires_at = ts(now + ttl);
        match existing {
            Some((holder, expires)) if holder != owner && parse_ts(&expires)? > now => {
                return Ok(false);
            }
            Some(_) => {
                tx.execute(
                    "UPDATE run_leases SET owner = ?, expires_at = ? WHERE user_id = ?",
                    params![owner, expires_at, user_id],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO run_leases (user_id, owner, expires_at) VALUES (?, ?, ?)",
                    params![user_id, owner, expires_at],
                )?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn release(&self, user_id: &str, owner: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM run_leases WHERE user_id = ? AND owner = ?",
            params![user_id, owner],
        )?;
        Ok(())
    }

    fn current(&self, user_id: &str) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT owner, expires_at FROM run_leases WHERE user_id = ?",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(owner, expires_at)| {
            Ok(Lease {
                user_id: user_id.to_string(),
                owner,
                expires_at: parse_ts(&expires_at)?,
            })
        })
        .transpose()
    }
}
