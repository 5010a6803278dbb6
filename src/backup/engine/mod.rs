//! Interfaces to the database server: enumerating databases, running backups and
//! pruning backup history.
//!
//! The backup orchestration only ever talks to a server through these traits, so
//! the selector, planner, executor and controller work the same over any engine.

pub mod history;
pub mod page_diff;
pub mod sqlite;

use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;
use std::sync::Arc;

/// Recovery model of a database, controls whether log backups are possible.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum RecoveryModel {
    Full,
    BulkLogged,
    Simple,
}

/// Status flags of a database as reported by the server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DatabaseStatus(u32);

impl DatabaseStatus {
    pub const NORMAL: DatabaseStatus = DatabaseStatus(0x1);
    pub const RESTORING: DatabaseStatus = DatabaseStatus(0x2);
    pub const SUSPECT: DatabaseStatus = DatabaseStatus(0x4);
    pub const OFFLINE: DatabaseStatus = DatabaseStatus(0x8);

    pub fn contains(self, other: DatabaseStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_offline(self) -> bool {
        self.contains(Self::OFFLINE)
    }
}

impl std::ops::BitOr for DatabaseStatus {
    type Output = DatabaseStatus;

    fn bitor(self, rhs: DatabaseStatus) -> DatabaseStatus {
        DatabaseStatus(self.0 | rhs.0)
    }
}

/// Snapshot of one database's metadata, taken once per run.
#[derive(Clone, Debug, Builder, Getters, CopyGetters, PartialEq)]
pub struct DatabaseInfo {
    #[builder(into)]
    #[getset(get = "pub")]
    name: Arc<str>,
    /// Size in megabytes.
    #[builder(default)]
    #[getset(get_copy = "pub")]
    size_mb: f64,
    #[builder(default = DatabaseStatus::NORMAL)]
    #[getset(get_copy = "pub")]
    status: DatabaseStatus,
    #[builder(default = RecoveryModel::Full)]
    #[getset(get_copy = "pub")]
    recovery_model: RecoveryModel,
    /// Finish time of the latest full backup, `None` when the database was never backed up.
    #[getset(get_copy = "pub")]
    last_backup: Option<DateTime<Utc>>,
}

impl DatabaseInfo {
    pub fn never_backed_up(&self) -> bool {
        self.last_backup.is_none()
    }

    /// Case-insensitive comparison, server database names are not case sensitive.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// What the engine backs up.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum BackupAction {
    /// Full or differential backup of the database files.
    Database,
    /// Backup of the transaction log.
    Log,
}

/// Engine version, used to gate optional backup features.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{major}.{minor}")]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
}

impl EngineVersion {
    /// Backup compression is available from version 10.50 on.
    pub fn supports_compression(&self) -> bool {
        self.major >= 10 && self.minor >= 50
    }
}

pub static MEDIA_DESCRIPTION_DISK: &str = "Disk";

/// A single request to the backup engine.
#[derive(Clone, Debug, Builder, Getters, CopyGetters, PartialEq)]
pub struct BackupRequest {
    #[builder(into)]
    #[getset(get = "pub")]
    database: Arc<str>,
    #[getset(get_copy = "pub")]
    action: BackupAction,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    incremental: bool,
    #[builder(into)]
    #[getset(get = "pub")]
    devices: Vec<PathBuf>,
    #[builder(default = Arc::<str>::from(MEDIA_DESCRIPTION_DISK), into)]
    #[getset(get = "pub")]
    media_description: Arc<str>,
    #[builder(default = Arc::<str>::from(""), into)]
    #[getset(get = "pub")]
    backup_set_name: Arc<str>,
    #[builder(default = Arc::<str>::from(""), into)]
    #[getset(get = "pub")]
    backup_set_description: Arc<str>,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    compression: bool,
}

/// Enumerates the databases of a server.
pub trait MetadataProvider {
    fn server_name(&self) -> &str;

    fn databases(&self) -> Result<Vec<DatabaseInfo>>;
}

/// Runs backups on a server.
pub trait BackupEngine {
    fn version(&self) -> EngineVersion;

    /// Blocks until the backup described by `request` completed or failed.
    fn backup(&self, request: &BackupRequest) -> Result<()>;
}

/// Housekeeping of the server side backup history.
pub trait Maintenance {
    /// Deletes history entries that finished before `older_than`, returns the number deleted.
    fn delete_backup_history(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory server used by the orchestration tests.

    use super::*;
    use crate::backup::result_error::error::Error;
    use crate::backup::result_error::WithMsg;
    use std::cell::RefCell;
    use std::collections::HashSet;

    pub struct FakeServer {
        pub name: String,
        pub databases: Vec<DatabaseInfo>,
        pub version: EngineVersion,
        pub failing: HashSet<String>,
        pub unavailable: bool,
        pub requests: RefCell<Vec<BackupRequest>>,
    }

    impl FakeServer {
        pub fn new<S: Into<String>>(name: S, databases: Vec<DatabaseInfo>) -> Self {
            Self {
                name: name.into(),
                databases,
                version: EngineVersion { major: 16, minor: 0 },
                failing: HashSet::new(),
                unavailable: false,
                requests: RefCell::new(Vec::new()),
            }
        }

        pub fn failing_on(mut self, database: &str) -> Self {
            self.failing.insert(database.to_string());
            self
        }
    }

    impl MetadataProvider for FakeServer {
        fn server_name(&self) -> &str {
            &self.name
        }

        fn databases(&self) -> Result<Vec<DatabaseInfo>> {
            if self.unavailable {
                return Err(Error::engine("catalog unavailable"));
            }
            Ok(self.databases.clone())
        }
    }

    impl BackupEngine for FakeServer {
        fn version(&self) -> EngineVersion {
            self.version
        }

        fn backup(&self, request: &BackupRequest) -> Result<()> {
            self.requests.borrow_mut().push(request.clone());
            if self.failing.contains(request.database().as_ref()) {
                return Err(Error::engine("media failure")
                    .with_msg("BACKUP DATABASE is terminating abnormally"));
            }
            for device in request.devices() {
                std::fs::write(device, vec![0u8; 1024])?;
            }
            Ok(())
        }
    }

    pub fn database(name: &str) -> DatabaseInfo {
        DatabaseInfo::builder()
            .name(name)
            .last_backup(Utc::now())
            .build()
    }
}
