//! Backs up every eligible database of one server.
//!
//! A run takes the run lock of the server's backup directory, backs up the full
//! phase targets, then the log phase targets, and releases the lock whatever
//! happened in between. A failing database is logged and recorded, the run goes
//! on with the next one.

use crate::backup::backup_type::BackupType;
use crate::backup::disk::verify_directory;
use crate::backup::engine::{BackupEngine, DatabaseInfo, MetadataProvider};
use crate::backup::executor::{failure_report, BackupExecutor, BackupOutcome};
use crate::backup::planner::{server_directory, BackupPlanner};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::run_lock::RunLock;
use crate::backup::selector::select;
use chrono::Local;
use derive_more::Display;
use getset::Getters;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Outcomes of one run, full phase first, each phase in selection order.
#[derive(Clone, Debug, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct RunReport {
    outcomes: Vec<BackupOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
enum Phase {
    #[display("full")]
    Full,
    #[display("log")]
    Log,
}

pub struct RunController<'a, S: MetadataProvider + BackupEngine + ?Sized> {
    server: &'a S,
    root: PathBuf,
}

impl<'a, S: MetadataProvider + BackupEngine + ?Sized> RunController<'a, S> {
    pub fn new<P: Into<PathBuf>>(server: &'a S, root: P) -> Self {
        Self {
            server,
            root: root.into(),
        }
    }

    /// Directory of this server's backups and its run lock.
    pub fn server_dir(&self) -> PathBuf {
        server_directory(&self.root, self.server.server_name())
    }

    /// Backs up all eligible databases with `backup_type`.
    ///
    /// Fails without touching any database when another run holds the lock.
    /// Failures of single databases are part of the report, not an error.
    pub fn backup(&self, backup_type: BackupType) -> Result<RunReport> {
        let server_dir = self.server_dir();
        verify_directory(&server_dir)?;
        let lock = RunLock::acquire(&server_dir)?;

        let res = self.run_phases(&server_dir, backup_type);

        match lock.release() {
            Ok(()) => res,
            Err(e) => {
                let e = e.with_msg("Failed to release run lock");
                match res {
                    Ok(report) => {
                        warn!("{e}");
                        Ok(report)
                    }
                    Err(run_err) => Err(run_err.chain(e)),
                }
            }
        }
    }

    fn run_phases(&self, server_dir: &Path, backup_type: BackupType) -> Result<RunReport> {
        let selection = select(self.server.databases()?, backup_type);
        if selection.is_empty() {
            info!("No database to back up on {}", self.server.server_name());
            return Ok(RunReport::default());
        }
        info!(
            "Backing up {} on {}: {} full target(s), {} log target(s)",
            backup_type,
            self.server.server_name(),
            selection.full_targets().len(),
            selection.log_targets().len()
        );

        let planner = BackupPlanner::new(server_dir);
        let executor = BackupExecutor::new(self.server, self.server.server_name(), backup_type);
        let mut report = RunReport::default();

        for database in selection.full_targets() {
            let outcome = self.backup_database(&planner, &executor, Phase::Full, database)?;
            report.outcomes.push(outcome);
        }

        if backup_type == BackupType::TransactionLog {
            for database in selection.log_targets() {
                let outcome = self.backup_database(&planner, &executor, Phase::Log, database)?;
                report.outcomes.push(outcome);
            }
        }

        info!(
            "Backup of {} finished: {} succeeded, {} failed",
            self.server.server_name(),
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    /// Plans and runs the backup of one database.
    ///
    /// Target problems found while planning fail this database only, any
    /// other planning error aborts the run.
    fn backup_database(
        &self,
        planner: &BackupPlanner,
        executor: &BackupExecutor<'_, S>,
        phase: Phase,
        database: &DatabaseInfo,
    ) -> Result<BackupOutcome> {
        let now = Local::now();
        info!(
            "Starting {} backup of {} {}",
            phase,
            database.name(),
            now.format("%Y-%m-%d %H:%M:%S")
        );

        let plan = match phase {
            Phase::Full => planner.plan_full(database, executor.request_type(), &now),
            Phase::Log => planner.plan_log(database, &now),
        };
        match plan {
            Ok(plan) => Ok(executor.execute(&plan)),
            Err(
                e @ (Error::UnwritableTarget { .. }
                | Error::NotAFile { .. }
                | Error::InvalidName { .. }),
            ) => {
                let report = failure_report(
                    executor.request_type(),
                    database.name(),
                    executor.server_name(),
                    &e,
                );
                warn!("{}", report.message());
                Ok(BackupOutcome::failed(
                    database.name().clone(),
                    None,
                    Duration::ZERO,
                    report,
                ))
            }
            Err(e) => Err(e.with_msg(format!(
                "Planning {} backup of {} in {:?} failed",
                phase,
                database.name(),
                planner.server_dir()
            ))),
        }
    }
}
