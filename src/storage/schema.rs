//! Database schema constants.
//!
//! Job snapshots live in `srm_jobs`, one row per job. The transition log lives
//! in `srm_job_history` keyed by `(job_id, seq)`, so re-saving a job never
//! duplicates or reorders its history.

/// SQL schema for creating the jobs table.
///
/// `state` holds the numeric state id, `payload` the per-type request data
/// as JSON. `history_length` is the snapshot version used to reject stale
/// writes.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS srm_jobs (
    id BIGINT PRIMARY KEY,
    job_type VARCHAR(32) NOT NULL,
    parent_id BIGINT,
    state SMALLINT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    creation_time TIMESTAMPTZ NOT NULL,
    lifetime_ms BIGINT NOT NULL,
    last_state_transition_time TIMESTAMPTZ NOT NULL,
    scheduler_id VARCHAR(255),
    scheduler_timestamp BIGINT NOT NULL DEFAULT 0,
    number_of_retries INTEGER NOT NULL DEFAULT 0,
    max_number_of_retries INTEGER NOT NULL DEFAULT 0,
    submitter VARCHAR(255) NOT NULL,
    credential_id BIGINT,
    payload JSONB NOT NULL,
    history_length INTEGER NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the job history table.
pub const CREATE_JOB_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS srm_job_history (
    job_id BIGINT NOT NULL REFERENCES srm_jobs(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    transition_time TIMESTAMPTZ NOT NULL,
    from_state SMALLINT NOT NULL,
    to_state SMALLINT NOT NULL,
    description TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
)
"#;

pub const CREATE_JOBS_STATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_srm_jobs_state ON srm_jobs(state)";

pub const CREATE_JOBS_TYPE_STATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_srm_jobs_type_state ON srm_jobs(job_type, state)";

pub const CREATE_JOBS_PARENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_srm_jobs_parent_id ON srm_jobs(parent_id)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_JOB_HISTORY_TABLE,
        CREATE_JOBS_STATE_INDEX,
        CREATE_JOBS_TYPE_STATE_INDEX,
        CREATE_JOBS_PARENT_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const JOBS: &str = "srm_jobs";
    pub const JOB_HISTORY: &str = "srm_job_history";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 5);
        // Jobs must come first (history references it)
        assert!(statements[0].contains(tables::JOBS));
        assert!(statements[1].contains(tables::JOB_HISTORY));
        assert!(statements[2..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_history_is_keyed_by_job_and_seq() {
        assert!(CREATE_JOB_HISTORY_TABLE.contains("PRIMARY KEY (job_id, seq)"));
    }
}
