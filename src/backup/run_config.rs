use crate::backup::backup_type::BackupType;
use crate::backup::controller::{RunController, RunReport};
use crate::backup::engine::sqlite::SqliteInstance;
use crate::backup::engine::Maintenance;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::validate::{validate_dir_exist, validate_writable_dir};
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use validator::Validate;

/// Backup history older than this is pruned by maintenance.
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(35 * 24 * 60 * 60);

fn default_history_retention() -> Duration {
    DEFAULT_HISTORY_RETENTION
}

/// Settings of one backup run.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Server instance address, for sqlite instances the directory of the databases.
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    #[getset(get = "pub")]
    server: String,
    /// Root directory of the backups.
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    #[getset(get = "pub")]
    location: PathBuf,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    backup_type: BackupType,
    /// Prune backup history after the run.
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    maintenance: bool,
    #[serde(default = "default_history_retention", with = "humantime_serde")]
    #[builder(default = DEFAULT_HISTORY_RETENTION)]
    #[getset(get_copy = "pub")]
    history_retention: Duration,
}

impl RunConfig {
    /// Connects to the server, backs it up and runs maintenance when enabled.
    pub fn run(&self) -> Result<RunReport> {
        let instance = SqliteInstance::connect(self.server.as_str())
            .with_msg(format!("Connecting to {} failed", self.server))?;
        let report = RunController::new(&instance, &self.location).backup(self.backup_type)?;
        if self.maintenance {
            self.perform_maintenance(&instance, Utc::now())?;
        }
        Ok(report)
    }

    /// Deletes backup history older than the retention, counted back from `now`.
    pub fn perform_maintenance<M: Maintenance + ?Sized>(
        &self,
        server: &M,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.history_retention).map_err(|e| {
            Error::engine(format!(
                "history retention {:?} is out of range: {e}",
                self.history_retention
            ))
        })?;
        let older_than = now - retention;
        let deleted = server
            .delete_backup_history(older_than)
            .with_msg("Backup history cleanup failed")?;
        info!("Deleted {deleted} backup history entries older than {older_than}");
        Ok(deleted)
    }
}
