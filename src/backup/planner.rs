//! Decides what to back up for one database and where the backup files go.
//!
//! Files are laid out as
//! `{root}/{server}/{database}/{database}_{yyyy-MM-dd-HHmm-ss}[_{NN}]{ext}`
//! where `{server}` has its path separators replaced by `^`.

use crate::backup::backup_type::BackupType;
use crate::backup::disk::{verify_directory, verify_writable};
use crate::backup::engine::{BackupAction, DatabaseInfo};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, TimeZone};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use sanitize_filename::sanitize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Differential backups are refused for the system catalog database.
pub static MASTER_DATABASE_NAME: &str = "master";

/// Databases larger than this (in MB) are split over several files.
pub const SPLIT_THRESHOLD_MB: f64 = 10240.0;
/// Size (in MB) that each part of a split backup covers.
pub const SPLIT_PART_SIZE_MB: f64 = 20240.0;

static TIME_FORMAT: &str = "%Y-%m-%d-%H%M-%S";

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Full,
    Differential,
    Log,
}

impl FileExtProvider for BackupKind {
    fn file_ext(&self) -> &'static str {
        match self {
            BackupKind::Full => ".full.bak",
            BackupKind::Differential => ".diff.bak",
            BackupKind::Log => ".trn",
        }
    }
}

/// Resolved backup of one database, consumed once by the executor.
#[derive(Clone, Debug, PartialEq, Getters, CopyGetters)]
pub struct BackupPlan {
    #[getset(get = "pub")]
    database: Arc<str>,
    #[getset(get_copy = "pub")]
    kind: BackupKind,
    #[getset(get = "pub")]
    backup_set_name: Arc<str>,
    #[getset(get = "pub")]
    backup_set_description: Arc<str>,
    #[getset(get = "pub")]
    files: Vec<PathBuf>,
}

impl BackupPlan {
    pub fn action(&self) -> BackupAction {
        match self.kind {
            BackupKind::Log => BackupAction::Log,
            BackupKind::Full | BackupKind::Differential => BackupAction::Database,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.kind == BackupKind::Differential
    }
}

/// Directory holding every backup of `server_name` under `root`.
pub fn server_directory<P: AsRef<Path>>(root: P, server_name: &str) -> PathBuf {
    root.as_ref().join(server_name.replace(['\\', '/'], "^"))
}

/// Whether a database backup for `request` should only contain changes since the last full backup.
pub fn is_incremental(database: &DatabaseInfo, request: BackupType) -> bool {
    request == BackupType::Differential
        && !database.is_named(MASTER_DATABASE_NAME)
        && !database.never_backed_up()
}

/// Number of files a database backup is split into.
///
/// Only full backups of databases above [`SPLIT_THRESHOLD_MB`] are split, one
/// file per [`SPLIT_PART_SIZE_MB`], never fewer than one.
pub fn split_count(size_mb: f64, incremental: bool) -> usize {
    if size_mb > SPLIT_THRESHOLD_MB && !incremental {
        ((size_mb / SPLIT_PART_SIZE_MB).floor() as usize).max(1)
    } else {
        1
    }
}

/// Whether `name` can be used as-is for a single directory below the server directory.
pub fn is_directory_name(name: &str) -> bool {
    if name.chars().any(|c| c == '\0' || std::path::is_separator(c)) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// File names, without directory, for a backup split into `count` files.
pub fn file_names(base_name: &str, count: usize, ext: &str) -> Vec<String> {
    if count <= 1 {
        vec![format!("{base_name}{ext}")]
    } else {
        (1..=count)
            .map(|i| format!("{base_name}_{i:02}{ext}"))
            .collect_vec()
    }
}

pub struct BackupPlanner {
    server_dir: PathBuf,
}

impl BackupPlanner {
    pub fn new<P: Into<PathBuf>>(server_dir: P) -> Self {
        Self {
            server_dir: server_dir.into(),
        }
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    /// Plans the full or differential backup of `database` for a run of type `request`.
    pub fn plan_full<Tz: TimeZone>(
        &self,
        database: &DatabaseInfo,
        request: BackupType,
        now: &DateTime<Tz>,
    ) -> Result<BackupPlan>
    where
        Tz::Offset: std::fmt::Display,
    {
        let incremental = is_incremental(database, request);
        let kind = if incremental {
            BackupKind::Differential
        } else {
            BackupKind::Full
        };
        let count = split_count(database.size_mb(), incremental);
        self.plan(
            database,
            kind,
            count,
            "Full Database Backup",
            format!("Full backup of {}", database.name()),
            now,
        )
    }

    /// Plans the transaction log backup of `database`.
    pub fn plan_log<Tz: TimeZone>(&self, database: &DatabaseInfo, now: &DateTime<Tz>) -> Result<BackupPlan>
    where
        Tz::Offset: std::fmt::Display,
    {
        self.plan(
            database,
            BackupKind::Log,
            1,
            "Log Database Backup",
            format!("Log backup of {}", database.name()),
            now,
        )
    }

    fn plan<Tz: TimeZone>(
        &self,
        database: &DatabaseInfo,
        kind: BackupKind,
        count: usize,
        set_name: &str,
        set_description: String,
        now: &DateTime<Tz>,
    ) -> Result<BackupPlan>
    where
        Tz::Offset: std::fmt::Display,
    {
        let name = database.name().as_ref();
        if !is_directory_name(name) {
            return Err(Error::InvalidName {
                name: name.to_string(),
                suggestion: sanitize(name),
            });
        }

        let database_dir = self.server_dir.join(name);
        verify_directory(&database_dir)?;

        let base_name = format!("{}_{}", name, now.format(TIME_FORMAT));
        let files = file_names(&base_name, count, kind.file_ext())
            .into_iter()
            .map(|file_name| database_dir.join(file_name))
            .collect_vec();
        for file in &files {
            verify_writable(file)?;
        }

        debug!("Planned {kind} backup of {name} to {} file(s)", files.len());
        Ok(BackupPlan {
            database: database.name().clone(),
            kind,
            backup_set_name: set_name.into(),
            backup_set_description: set_description.into(),
            files,
        })
    }
}
