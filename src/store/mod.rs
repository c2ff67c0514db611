//! SQLite persistence for targets, action history, quota grants and scheduler state.

pub mod types;

pub use types::{
    ActionKind, ActionOutcome, ActionRecord, NewAction, Target, TargetState, TaskRow, Transition,
};

use crate::error::{BotError, BotResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA_VERSION: i32 = 2;

/// Thread-safe handle over one SQLite connection.
///
/// Every target transition runs in a transaction that re-checks the prior
/// state, so concurrent writers can never apply a transition twice.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> BotResult<Self> {
        info!("Opening store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> BotResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- targets ---

    /// Insert handles as Imported. Blank lines and duplicates are skipped.
    /// Returns the number of new targets.
    pub fn import_targets<S: AsRef<str>>(&self, handles: &[S], now: DateTime<Utc>) -> BotResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO targets (handle, state, retries, imported_at)
                 VALUES (?1, 'imported', 0, ?2)",
            )?;
            for handle in handles {
                let handle = normalize_handle(handle.as_ref());
                if handle.is_empty() {
                    continue;
                }
                inserted += stmt.execute(params![handle, to_millis(now)])?;
            }
        }
        tx.commit()?;
        debug!(inserted, "targets imported");
        Ok(inserted)
    }

    /// Import a handle list, one target per line. A line may carry a profile
    /// reference after a comma or tab, e.g. `alice, https://instagram.com/alice`.
    pub fn import_lines(&self, content: &str, now: DateTime<Utc>) -> BotResult<usize> {
        let rows: Vec<(&str, Option<&str>)> = content
            .lines()
            .map(|line| match line.split_once(|c| c == ',' || c == '\t') {
                Some((handle, rest)) => (handle, Some(rest.trim()).filter(|r| !r.is_empty())),
                None => (line, None),
            })
            .collect();
        let handles: Vec<&str> = rows.iter().map(|(handle, _)| *handle).collect();
        let inserted = self.import_targets(&handles, now)?;
        for (handle, profile_ref) in rows {
            if let Some(profile_ref) = profile_ref {
                self.set_profile_ref(handle, profile_ref)?;
            }
        }
        Ok(inserted)
    }

    pub fn set_profile_ref(&self, handle: &str, profile_ref: &str) -> BotResult<()> {
        self.conn().execute(
            "UPDATE targets SET profile_ref = ?1 WHERE handle = ?2",
            params![profile_ref, normalize_handle(handle)],
        )?;
        Ok(())
    }

    pub fn target(&self, handle: &str) -> BotResult<Option<Target>> {
        let conn = self.conn();
        let target = conn
            .query_row(
                &format!("{} WHERE handle = ?1", TARGET_SELECT),
                params![normalize_handle(handle)],
                target_from_row,
            )
            .optional()?;
        Ok(target)
    }

    pub fn target_by_id(&self, id: i64) -> BotResult<Option<Target>> {
        let conn = self.conn();
        let target = conn
            .query_row(&format!("{} WHERE id = ?1", TARGET_SELECT), params![id], target_from_row)
            .optional()?;
        Ok(target)
    }

    /// Imported targets, least-retried first, then import order.
    pub fn follow_candidates(&self, limit: u32) -> BotResult<Vec<Target>> {
        self.query_targets(
            &format!(
                "{} WHERE state = 'imported' ORDER BY retries ASC, id ASC LIMIT ?1",
                TARGET_SELECT
            ),
            params![limit],
        )
    }

    /// Followed targets whose follow happened at or before `cutoff`, oldest first.
    pub fn matured_followed(&self, cutoff: DateTime<Utc>, limit: u32) -> BotResult<Vec<Target>> {
        self.query_targets(
            &format!(
                "{} WHERE state = 'followed' AND followed_at <= ?1 ORDER BY followed_at ASC LIMIT ?2",
                TARGET_SELECT
            ),
            params![to_millis(cutoff), limit],
        )
    }

    /// Every target, most recently imported first.
    pub fn all_targets(&self) -> BotResult<Vec<Target>> {
        self.query_targets(&format!("{} ORDER BY id DESC", TARGET_SELECT), [])
    }

    pub fn targets_in_state(&self, state: TargetState, limit: u32) -> BotResult<Vec<Target>> {
        self.query_targets(
            &format!("{} WHERE state = ?1 ORDER BY id ASC LIMIT ?2", TARGET_SELECT),
            params![state.as_str(), limit],
        )
    }

    fn query_targets(&self, sql: &str, params: impl rusqlite::Params) -> BotResult<Vec<Target>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, target_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Compare-and-set a target from `from` to `to`, appending to the audit trail.
    ///
    /// Entering Followed stamps `followed_at`; entering a terminal state stamps
    /// `resolved_at`. Fails with `InvalidTransition` if the stored state is not `from`.
    pub fn transition(
        &self,
        target_id: i64,
        from: TargetState,
        to: TargetState,
        now: DateTime<Utc>,
    ) -> BotResult<Target> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (handle, current): (String, String) = tx.query_row(
            "SELECT handle, state FROM targets WHERE id = ?1",
            params![target_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if current != from.as_str() {
            return Err(BotError::InvalidTransition {
                handle,
                from: current,
                to: to.as_str().to_string(),
            });
        }

        let ms = to_millis(now);
        match to {
            TargetState::Followed => {
                tx.execute(
                    "UPDATE targets SET state = ?1, followed_at = ?2 WHERE id = ?3",
                    params![to.as_str(), ms, target_id],
                )?;
            }
            t if t.is_terminal() => {
                tx.execute(
                    "UPDATE targets SET state = ?1, resolved_at = ?2 WHERE id = ?3",
                    params![to.as_str(), ms, target_id],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE targets SET state = ?1 WHERE id = ?2",
                    params![to.as_str(), target_id],
                )?;
            }
        }
        tx.execute(
            "INSERT INTO target_transitions (target_id, from_state, to_state, at)
             VALUES (?1, ?2, ?3, ?4)",
            params![target_id, from.as_str(), to.as_str(), ms],
        )?;
        let target = tx.query_row(
            &format!("{} WHERE id = ?1", TARGET_SELECT),
            params![target_id],
            target_from_row,
        )?;
        tx.commit()?;
        debug!(handle = %target.handle, from = %from, to = %to, "target transitioned");
        Ok(target)
    }

    /// Increment and return the retry counter.
    pub fn bump_retries(&self, target_id: i64) -> BotResult<u32> {
        let conn = self.conn();
        conn.execute(
            "UPDATE targets SET retries = retries + 1 WHERE id = ?1",
            params![target_id],
        )?;
        let retries: u32 =
            conn.query_row("SELECT retries FROM targets WHERE id = ?1", params![target_id], |r| r.get(0))?;
        Ok(retries)
    }

    pub fn transitions_for(&self, target_id: i64) -> BotResult<Vec<Transition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target_id, from_state, to_state, at FROM target_transitions
             WHERE target_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![target_id], |r| {
            Ok(Transition {
                target_id: r.get(0)?,
                from: parse_col(r, 1)?,
                to: parse_col(r, 2)?,
                at: from_millis(r.get(3)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn state_counts(&self) -> BotResult<Vec<(TargetState, u32)>> {
        let conn = self.conn();
        let mut out = Vec::new();
        for state in TargetState::ALL {
            let n: u32 = conn.query_row(
                "SELECT COUNT(*) FROM targets WHERE state = ?1",
                params![state.as_str()],
                |r| r.get(0),
            )?;
            out.push((state, n));
        }
        Ok(out)
    }

    // --- action records ---

    pub fn record_action(&self, action: &NewAction) -> BotResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO actions (target_id, kind, at, outcome, latency_ms, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                action.target_id,
                action.kind.as_str(),
                to_millis(action.at),
                action.outcome.as_str(),
                action.latency_ms as i64,
                action.detail,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn actions_for(&self, target_id: i64) -> BotResult<Vec<ActionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE target_id = ?1 ORDER BY id ASC",
            ACTION_SELECT
        ))?;
        let rows = stmt.query_map(params![target_id], action_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn last_action(&self, target_id: i64, kind: ActionKind) -> BotResult<Option<ActionRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "{} WHERE target_id = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1",
                    ACTION_SELECT
                ),
                params![target_id, kind.as_str()],
                action_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn recent_actions(&self, limit: u32) -> BotResult<Vec<ActionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC LIMIT ?1", ACTION_SELECT))?;
        let rows = stmt.query_map(params![limit], action_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_actions(
        &self,
        kind: ActionKind,
        outcome: Option<ActionOutcome>,
        since: DateTime<Utc>,
    ) -> BotResult<u32> {
        let conn = self.conn();
        let n: u32 = match outcome {
            Some(o) => conn.query_row(
                "SELECT COUNT(*) FROM actions WHERE kind = ?1 AND outcome = ?2 AND at >= ?3",
                params![kind.as_str(), o.as_str(), to_millis(since)],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM actions WHERE kind = ?1 AND at >= ?2",
                params![kind.as_str(), to_millis(since)],
                |r| r.get(0),
            )?,
        };
        Ok(n)
    }

    /// Non-success attempts since `since`, grouped by detail message.
    pub fn failure_reasons(&self, since: DateTime<Utc>) -> BotResult<Vec<(String, u32)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(detail, outcome), COUNT(*) FROM actions
             WHERE outcome != 'success' AND at >= ?1
             GROUP BY 1 ORDER BY 2 DESC",
        )?;
        let rows = stmt.query_map(params![to_millis(since)], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Targets confirmed since `since` (from the audit trail).
    pub fn confirmations_since(&self, since: DateTime<Utc>) -> BotResult<u32> {
        let n: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM target_transitions WHERE to_state = 'backfill_confirmed' AND at >= ?1",
            params![to_millis(since)],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn expirations_since(&self, since: DateTime<Utc>) -> BotResult<u32> {
        let n: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM target_transitions WHERE to_state = 'expired' AND at >= ?1",
            params![to_millis(since)],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // --- quota grants ---

    pub fn record_grant(&self, kind: ActionKind, at: DateTime<Utc>) -> BotResult<()> {
        self.conn().execute(
            "INSERT INTO quota_grants (kind, at) VALUES (?1, ?2)",
            params![kind.as_str(), to_millis(at)],
        )?;
        Ok(())
    }

    pub fn grants_since(&self, since: DateTime<Utc>) -> BotResult<Vec<(ActionKind, DateTime<Utc>)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT kind, at FROM quota_grants WHERE at >= ?1 ORDER BY at ASC")?;
        let rows = stmt.query_map(params![to_millis(since)], |r| {
            Ok((parse_col(r, 0)?, from_millis(r.get(1)?)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn prune_grants(&self, before: DateTime<Utc>) -> BotResult<usize> {
        let n = self
            .conn()
            .execute("DELETE FROM quota_grants WHERE at < ?1", params![to_millis(before)])?;
        Ok(n)
    }

    // --- scheduler ---

    pub fn save_task(&self, task: &TaskRow) -> BotResult<()> {
        self.conn().execute(
            "INSERT INTO scheduled_tasks (name, enabled, last_run, next_eligible, last_status, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                enabled = excluded.enabled,
                last_run = excluded.last_run,
                next_eligible = excluded.next_eligible,
                last_status = excluded.last_status,
                last_error = excluded.last_error",
            params![
                task.name,
                task.enabled,
                task.last_run.map(to_millis),
                task.next_eligible.map(to_millis),
                task.last_status,
                task.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn load_tasks(&self) -> BotResult<Vec<TaskRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, enabled, last_run, next_eligible, last_status, last_error
             FROM scheduled_tasks ORDER BY name",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(TaskRow {
                name: r.get(0)?,
                enabled: r.get(1)?,
                last_run: r.get::<_, Option<i64>>(2)?.map(from_millis),
                next_eligible: r.get::<_, Option<i64>>(3)?.map(from_millis),
                last_status: r.get(4)?,
                last_error: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const TARGET_SELECT: &str = "SELECT id, handle, profile_ref, state, followed_at, resolved_at, retries, imported_at FROM targets";
const ACTION_SELECT: &str =
    "SELECT id, target_id, kind, at, outcome, latency_ms, detail FROM actions";

fn target_from_row(r: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        id: r.get(0)?,
        handle: r.get(1)?,
        profile_ref: r.get(2)?,
        state: parse_col(r, 3)?,
        followed_at: r.get::<_, Option<i64>>(4)?.map(from_millis),
        resolved_at: r.get::<_, Option<i64>>(5)?.map(from_millis),
        retries: r.get(6)?,
        imported_at: from_millis(r.get(7)?),
    })
}

fn action_from_row(r: &Row<'_>) -> rusqlite::Result<ActionRecord> {
    Ok(ActionRecord {
        id: r.get(0)?,
        target_id: r.get(1)?,
        kind: parse_col(r, 2)?,
        at: from_millis(r.get(3)?),
        outcome: parse_col(r, 4)?,
        latency_ms: r.get::<_, i64>(5)?.max(0) as u64,
        detail: r.get(6)?,
    })
}

fn parse_col<T: std::str::FromStr<Err = String>>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = r.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })
}

/// Handles are stored without a leading '@' and lowercased.
pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .optional()?
        .unwrap_or(0);
    debug!("Current schema version: {}", version);

    if version < 1 {
        info!("Running migration v1");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                handle TEXT NOT NULL UNIQUE,
                profile_ref TEXT,
                state TEXT NOT NULL,
                followed_at INTEGER,
                resolved_at INTEGER,
                retries INTEGER NOT NULL DEFAULT 0,
                imported_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_targets_state ON targets(state);

            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id INTEGER NOT NULL REFERENCES targets(id),
                kind TEXT NOT NULL,
                at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_actions_kind_at ON actions(kind, at);

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                last_run INTEGER,
                next_eligible INTEGER,
                last_status TEXT,
                last_error TEXT
            );
            "#,
        )?;
    }
    if version < 2 {
        info!("Running migration v2");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS target_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id INTEGER NOT NULL REFERENCES targets(id),
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS quota_grants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quota_grants_at ON quota_grants(at);
            "#,
        )?;
    }
    if version < SCHEMA_VERSION {
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
    }
    Ok(())
}
