use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. Timestamps are RFC 3339 UTC text with fixed microsecond
/// precision, so string comparison orders them chronologically.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS searches (
            id                   TEXT NOT NULL PRIMARY KEY,
            user_id              TEXT,
            medication_name      TEXT NOT NULL,
            dosage               TEXT,
            status               TEXT NOT NULL,
            selected_pharmacies  TEXT NOT NULL,   -- JSON array
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS queue_jobs (
            id                     TEXT    NOT NULL PRIMARY KEY,
            search_id              TEXT    NOT NULL,
            pharmacy_id            TEXT    NOT NULL,
            pharmacy_name          TEXT    NOT NULL,
            pharmacy_phone         TEXT    NOT NULL,
            pharmacy_address       TEXT    NOT NULL,
            medication_name        TEXT    NOT NULL,
            dosage                 TEXT,
            user_id                TEXT,
            status                 TEXT    NOT NULL DEFAULT 'pending',
            attempt_count          INTEGER NOT NULL DEFAULT 1,
            max_attempts           INTEGER NOT NULL,
            scheduled_for          TEXT,
            started_at             TEXT,
            completed_at           TEXT,
            error_message          TEXT,
            result                 TEXT,       -- JSON ExtractedData
            dispatcher_message_id  TEXT,
            created_at             TEXT    NOT NULL,
            updated_at             TEXT    NOT NULL
        ) STRICT;

        -- One job per (search, pharmacy); makes job creation idempotent.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_search_pharmacy
            ON queue_jobs (search_id, pharmacy_id);

        CREATE TABLE IF NOT EXISTS calls (
            id                TEXT    NOT NULL PRIMARY KEY,
            job_id            TEXT    NOT NULL REFERENCES queue_jobs (id),
            attempt           INTEGER NOT NULL,
            provider          TEXT    NOT NULL,
            status            TEXT    NOT NULL,
            duration_secs     INTEGER NOT NULL DEFAULT 0,
            transcript        TEXT,
            result            TEXT,
            confidence        REAL,
            provider_call_id  TEXT,
            error_message     TEXT,
            created_at        TEXT    NOT NULL,
            ended_at          TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_calls_job ON calls (job_id, attempt);

        CREATE TABLE IF NOT EXISTS pharmacy_call_markers (
            pharmacy_id     TEXT NOT NULL PRIMARY KEY,
            last_called_at  TEXT NOT NULL,
            last_job_id     TEXT            -- job that placed the call, if known
        ) STRICT;
        ",
    )?;
    Ok(())
}
