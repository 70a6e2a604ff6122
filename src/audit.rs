//! Append-only audit trail.
//!
//! Every request attempt produces exactly one record, written before the
//! outcome is returned to the caller. Records are immutable once appended;
//! the table's rowid sequence gives readers a total order consistent with
//! append completion time.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;

/// Final disposition of a request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    PolicyDenied,
    RateLimited,
    BudgetDenied,
    Failed,
    TimedOut,
    Canceled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PolicyDenied => "policy_denied",
            Self::RateLimited => "rate_limited",
            Self::BudgetDenied => "budget_denied",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

/// A single usage event to be recorded in the audit trail.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub request_id: String,
    pub identity: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub attempts: u32,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

/// A persisted audit record as read back from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub request_id: String,
    pub identity: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub attempts: u32,
    pub outcome: String,
    pub reason: Option<String>,
    pub created_at: String,
}

/// Aggregate usage for one identity (or the whole log).
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub average_latency_ms: f64,
}

/// Append-only audit log backed by the shared database handle.
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record. The write is serialized by the database handle, so
    /// concurrent appends land in a single total order and readers never
    /// observe a partial row.
    ///
    /// A failed write is reported via tracing rather than failing the
    /// request that produced it.
    pub fn append(&self, entry: &AuditEntry) {
        if let Err(e) = self.write_entry(entry) {
            tracing::error!(
                request_id = %entry.request_id,
                identity = %entry.identity,
                error = %e,
                "Failed to append audit record"
            );
        }
    }

    fn write_entry(&self, entry: &AuditEntry) -> Result<(), rusqlite::Error> {
        let id = Uuid::new_v4().to_string();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO audit_log (id, request_id, identity, provider, model, \
                 tokens_in, tokens_out, cost, latency_ms, attempts, outcome, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            stmt.execute(params![
                id,
                entry.request_id,
                entry.identity,
                entry.provider,
                entry.model,
                entry.tokens_in,
                entry.tokens_out,
                entry.cost,
                entry.latency_ms as i64,
                entry.attempts,
                entry.outcome.as_str(),
                entry.reason,
            ])?;
            Ok(())
        })
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>, rusqlite::Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM audit_log ORDER BY seq DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], row_to_record)?;
            rows.collect()
        })
    }

    /// Most recent records for one identity, newest first.
    pub fn for_identity(
        &self,
        identity: &str,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, rusqlite::Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM audit_log WHERE identity = ?1 ORDER BY seq DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![identity, limit], row_to_record)?;
            rows.collect()
        })
    }

    /// Aggregate usage for one identity.
    pub fn summary(&self, identity: &str) -> Result<UsageSummary, rusqlite::Error> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), \
                        COALESCE(SUM(outcome = 'completed'), 0), \
                        COALESCE(SUM(outcome != 'completed'), 0), \
                        COALESCE(SUM(tokens_in), 0), \
                        COALESCE(SUM(tokens_out), 0), \
                        COALESCE(SUM(cost), 0.0), \
                        COALESCE(AVG(latency_ms), 0.0) \
                 FROM audit_log WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok(UsageSummary {
                        requests: row.get::<_, i64>(0)? as u64,
                        completed: row.get::<_, i64>(1)? as u64,
                        failed: row.get::<_, i64>(2)? as u64,
                        tokens_in: row.get::<_, i64>(3)? as u64,
                        tokens_out: row.get::<_, i64>(4)? as u64,
                        cost: row.get(5)?,
                        average_latency_ms: row.get(6)?,
                    })
                },
            )
        })
    }

    /// Number of records with the given outcome.
    pub fn count_outcome(&self, outcome: Outcome) -> Result<u64, rusqlite::Error> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE outcome = ?1",
                params![outcome.as_str()],
                |row| row.get::<_, i64>(0).map(|n| n as u64),
            )
        })
    }
}

const COLUMNS: &str = "id, request_id, identity, provider, model, tokens_in, tokens_out, \
                       cost, latency_ms, attempts, outcome, reason, created_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<AuditRecord, rusqlite::Error> {
    Ok(AuditRecord {
        id: row.get(0)?,
        request_id: row.get(1)?,
        identity: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        tokens_in: row.get(5)?,
        tokens_out: row.get(6)?,
        cost: row.get(7)?,
        latency_ms: row.get::<_, i64>(8)? as u64,
        attempts: row.get(9)?,
        outcome: row.get(10)?,
        reason: row.get(11)?,
        created_at: row.get(12)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
