//! Read-only access to the external job registry (spec.md 1. PURPOSE &
//! SCOPE: "out of scope... the supervisor reads it read-only to produce
//! diagnostics before killing"). The registry itself -- where workers
//! advertise their current job, hostname and pid -- is owned by the
//! job-worker system; this module only knows how to look an entry up.

use chrono::Utc;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A single worker's advertised state, as written by the (out of scope)
/// job-worker process. Only the fields the resource monitor's diagnostic
/// needs are modeled.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistryEntry {
    pub hostname: String,
    pub pid: i32,
    /// A human-readable description of the job currently being worked,
    /// e.g. "SendWelcomeEmail (user_id=42)".
    pub job_description: Option<String>,
    /// RFC 3339 timestamp of when the current job started.
    pub run_at: Option<String>,
}

/// Looks up `(hostname, pid)` in the job registry file at `path`. Failures
/// of any kind (missing file, malformed entries, lock contention the real
/// registry might have) are swallowed and reported as `None`: per spec.md
/// 7. ERROR HANDLING DESIGN, "job-registry lookup failure while preparing a
/// kill diagnostic" never blocks the kill itself.
pub fn lookup(path: &Path, hostname: &str, pid: i32) -> Option<JobRegistryEntry> {
    let contents = fs::read_to_string(path)
        .map_err(|e| log!(LogLevel::Debug, "Job registry unavailable at {}: {}", path.display(), e))
        .ok()?;

    let entries: Vec<JobRegistryEntry> = serde_json::from_str(&contents)
        .map_err(|e| log!(LogLevel::Debug, "Job registry at {} is malformed: {}", path.display(), e))
        .ok()?;

    entries.into_iter().find(|entry| entry.hostname == hostname && entry.pid == pid)
}

/// Default location of the job registry file, overridable by the embedding
/// application.
pub fn default_path() -> PathBuf {
    PathBuf::from("/tmp/.job_registry.json")
}

/// Elapsed runtime, in seconds, of the job recorded in `entry`, parsed from
/// its `run_at` timestamp. On parse failure this is `0`, per spec.md 4.F:
/// "elapsed runtime (parsed from a `run_at` timestamp; on parse failure,
/// 0)".
pub fn elapsed_run_time_seconds(entry: &JobRegistryEntry) -> i64 {
    let Some(run_at) = entry.run_at.as_deref() else {
        return 0;
    };
    match chrono::DateTime::parse_from_rfc3339(run_at) {
        Ok(started) => (Utc::now() - started.with_timezone(&Utc)).num_seconds().max(0),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_none() {
        assert!(lookup(Path::new("/nonexistent/path/registry.json"), "host", 1).is_none());
    }

    #[test]
    fn finds_matching_entry_by_hostname_and_pid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"hostname":"worker-1","pid":123,"job_description":"SendEmail","run_at":"2020-01-01T00:00:00Z"}}]"#
        )
        .unwrap();

        let entry = lookup(file.path(), "worker-1", 123).expect("entry should be found");
        assert_eq!(entry.job_description.as_deref(), Some("SendEmail"));
        assert!(elapsed_run_time_seconds(&entry) > 0);
    }

    #[test]
    fn unparseable_run_at_yields_zero_elapsed() {
        let entry = JobRegistryEntry {
            hostname: "h".into(),
            pid: 1,
            job_description: None,
            run_at: Some("not-a-timestamp".into()),
        };
        assert_eq!(elapsed_run_time_seconds(&entry), 0);
    }

    #[test]
    fn missing_run_at_yields_zero_elapsed() {
        let entry = JobRegistryEntry {
            hostname: "h".into(),
            pid: 1,
            job_description: None,
            run_at: None,
        };
        assert_eq!(elapsed_run_time_seconds(&entry), 0);
    }
}
