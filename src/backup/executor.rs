use crate::backup::backup_type::BackupType;
use crate::backup::engine::{BackupEngine, BackupRequest};
use crate::backup::planner::{BackupKind, BackupPlan};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::Local;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

static REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Size and write speed of a finished backup.
#[derive(Copy, Clone, Debug, PartialEq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Throughput {
    bytes: u64,
    total_mb: f64,
    kb_per_sec: f64,
}

impl Throughput {
    /// A zero elapsed time reports a speed of zero.
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let kb_per_sec = if secs > 0.0 {
            bytes as f64 / secs / 1024.0
        } else {
            0.0
        };
        Self {
            bytes,
            total_mb: bytes as f64 / (1024.0 * 1024.0),
            kb_per_sec,
        }
    }
}

/// Why a database backup failed, with every nested cause.
#[derive(Clone, Debug, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct FailureReport {
    message: String,
    causes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutcomeStatus {
    Succeeded(Throughput),
    Failed(FailureReport),
}

/// Result of backing up one database.
#[derive(Clone, Debug, PartialEq, Getters, CopyGetters)]
pub struct BackupOutcome {
    #[getset(get = "pub")]
    database: Arc<str>,
    #[getset(get_copy = "pub")]
    kind: Option<BackupKind>,
    #[getset(get_copy = "pub")]
    elapsed: Duration,
    #[getset(get = "pub")]
    status: OutcomeStatus,
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded(_))
    }

    /// Outcome of a database whose backup failed before or while running.
    pub fn failed<S: Into<Arc<str>>>(
        database: S,
        kind: Option<BackupKind>,
        elapsed: Duration,
        report: FailureReport,
    ) -> Self {
        Self {
            database: database.into(),
            kind,
            elapsed,
            status: OutcomeStatus::Failed(report),
        }
    }
}

/// Composes the failure report logged when the backup of `database` failed.
pub fn failure_report(
    request_type: BackupType,
    database: &str,
    server_name: &str,
    error: &Error,
) -> FailureReport {
    let causes = error.cause_chain();
    let message = format!(
        "{} Error performing {} backup of {} on {}. {}",
        Local::now().format(REPORT_TIME_FORMAT),
        request_type,
        database,
        server_name,
        causes.join("\n")
    );
    FailureReport { message, causes }
}

/// Runs planned backups on the engine, one at a time.
pub struct BackupExecutor<'a, E: BackupEngine + ?Sized> {
    engine: &'a E,
    server_name: &'a str,
    request_type: BackupType,
}

impl<'a, E: BackupEngine + ?Sized> BackupExecutor<'a, E> {
    pub fn new(engine: &'a E, server_name: &'a str, request_type: BackupType) -> Self {
        Self {
            engine,
            server_name,
            request_type,
        }
    }

    pub fn request_type(&self) -> BackupType {
        self.request_type
    }

    pub fn server_name(&self) -> &str {
        self.server_name
    }

    /// Compression is only asked for when the engine version supports it.
    pub fn request(&self, plan: &BackupPlan) -> BackupRequest {
        BackupRequest::builder()
            .database(plan.database().clone())
            .action(plan.action())
            .incremental(plan.is_incremental())
            .devices(plan.files().clone())
            .backup_set_name(plan.backup_set_name().clone())
            .backup_set_description(plan.backup_set_description().clone())
            .compression(self.engine.version().supports_compression())
            .build()
    }

    /// Runs `plan` and reports how it went, failures included.
    pub fn execute(&self, plan: &BackupPlan) -> BackupOutcome {
        let request = self.request(plan);
        let timer = Instant::now();
        let res = self
            .engine
            .backup(&request)
            .map(|_| timer.elapsed())
            .and_then(|elapsed| total_size(plan.files()).map(|bytes| (bytes, elapsed)));

        match res {
            Ok((bytes, elapsed)) => {
                let throughput = Throughput::new(bytes, elapsed);
                info!(
                    "Complete\tTotal Size: {:.2} MB\tSpeed: {:.2} KB/s",
                    throughput.total_mb(),
                    throughput.kb_per_sec()
                );
                BackupOutcome {
                    database: plan.database().clone(),
                    kind: Some(plan.kind()),
                    elapsed,
                    status: OutcomeStatus::Succeeded(throughput),
                }
            }
            Err(e) => {
                let report = failure_report(self.request_type, plan.database(), self.server_name, &e);
                error!("{}", report.message());
                BackupOutcome::failed(plan.database().clone(), Some(plan.kind()), timer.elapsed(), report)
            }
        }
    }
}

fn total_size(files: &[PathBuf]) -> Result<u64> {
    files
        .iter()
        .map(|f| std::fs::metadata(f).map(|md| md.len()).map_err(Error::from))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::engine::fake::{database, FakeServer};
    use crate::backup::engine::{BackupAction, EngineVersion};
    use crate::backup::planner::BackupPlanner;
    use chrono::Utc;
    use tempfile::TempDir;

    fn big(name: &str) -> crate::backup::engine::DatabaseInfo {
        crate::backup::engine::DatabaseInfo::builder()
            .name(name)
            .size_mb(50000.0)
            .last_backup(Utc::now())
            .build()
    }

    #[test]
    fn test_throughput() {
        let t = Throughput::new(2 * 1024 * 1024, Duration::from_secs(2));
        assert_eq!(t.bytes(), 2 * 1024 * 1024);
        assert!((t.total_mb() - 2.0).abs() < f64::EPSILON);
        assert!((t.kb_per_sec() - 1024.0).abs() < 1e-9);
        assert_eq!(Throughput::new(10, Duration::ZERO).kb_per_sec(), 0.0);
    }

    #[test]
    fn test_request_built_from_plan() {
        let tmp = TempDir::new().unwrap();
        let server = FakeServer::new("NODE1", vec![]);
        let plan = BackupPlanner::new(tmp.path())
            .plan_full(&big("Sales"), BackupType::Full, &Utc::now())
            .unwrap();

        let request = BackupExecutor::new(&server, "NODE1", BackupType::Full).request(&plan);
        assert_eq!(request.database().as_ref(), "Sales");
        assert_eq!(request.action(), BackupAction::Database);
        assert!(!request.incremental());
        assert_eq!(request.devices(), plan.files());
        assert_eq!(request.devices().len(), 2);
        assert_eq!(request.media_description().as_ref(), "Disk");
        assert_eq!(request.backup_set_name().as_ref(), "Full Database Backup");
    }

    #[test]
    fn test_compression_gated_by_version() {
        let tmp = TempDir::new().unwrap();
        let plan = BackupPlanner::new(tmp.path())
            .plan_log(&database("Sales"), &Utc::now())
            .unwrap();

        let mut server = FakeServer::new("NODE1", vec![]);
        server.version = EngineVersion { major: 10, minor: 50 };
        assert!(BackupExecutor::new(&server, "NODE1", BackupType::TransactionLog)
            .request(&plan)
            .compression());

        server.version = EngineVersion { major: 10, minor: 0 };
        assert!(!BackupExecutor::new(&server, "NODE1", BackupType::TransactionLog)
            .request(&plan)
            .compression());
    }

    #[test]
    fn test_execute_success_sums_file_sizes() {
        let tmp = TempDir::new().unwrap();
        let server = FakeServer::new("NODE1", vec![]);
        let plan = BackupPlanner::new(tmp.path())
            .plan_full(&big("Sales"), BackupType::Full, &Utc::now())
            .unwrap();

        let outcome = BackupExecutor::new(&server, "NODE1", BackupType::Full).execute(&plan);
        assert!(outcome.is_success());
        assert_eq!(outcome.kind(), Some(BackupKind::Full));
        match outcome.status() {
            OutcomeStatus::Succeeded(t) => assert_eq!(t.bytes(), 2048),
            other => panic!("Expected success, got {other:?}"),
        }
        assert_eq!(server.requests.borrow().len(), 1);
    }

    #[test]
    fn test_execute_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        let server = FakeServer::new("NODE1\\SQL", vec![]).failing_on("Sales");
        let plan = BackupPlanner::new(tmp.path())
            .plan_full(&database("Sales"), BackupType::Differential, &Utc::now())
            .unwrap();

        let outcome =
            BackupExecutor::new(&server, "NODE1\\SQL", BackupType::Differential).execute(&plan);
        assert!(!outcome.is_success());
        match outcome.status() {
            OutcomeStatus::Failed(report) => {
                assert_eq!(
                    report.causes(),
                    &vec![
                        "BACKUP DATABASE is terminating abnormally".to_string(),
                        "media failure".to_string()
                    ]
                );
                assert!(report
                    .message()
                    .contains("Error performing Differential backup of Sales on NODE1\\SQL. "));
                assert!(report.message().ends_with("media failure"));
            }
            other => panic!("Expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_execute_missing_output_is_failure() {
        struct NoopEngine;
        impl BackupEngine for NoopEngine {
            fn version(&self) -> EngineVersion {
                EngineVersion { major: 3, minor: 0 }
            }
            fn backup(&self, _request: &BackupRequest) -> Result<()> {
                Ok(())
            }
        }

        let tmp = TempDir::new().unwrap();
        let plan = BackupPlanner::new(tmp.path())
            .plan_log(&database("Sales"), &Utc::now())
            .unwrap();
        let outcome = BackupExecutor::new(&NoopEngine, "NODE1", BackupType::TransactionLog).execute(&plan);
        assert!(!outcome.is_success());
    }
}
