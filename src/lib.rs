//! # sql_backup
//!
//! Backs up every eligible database of a server instance into a per-server,
//! per-database directory tree.
//!
//! ## Features
//!
//! - **Backup Types**: Full, differential and transaction log runs
//! - **Run Lock**: A pid lock file keeps two runs off the same backup location
//! - **Striping**: Large full backups are split across several files
//! - **Failure Isolation**: A failing database is reported and the run goes on
//! - **Maintenance**: Old backup history entries are pruned after the run
//!
//! ## Quick Start
//!
//! ```no_run
//! use sql_backup::backup::backup_type::BackupType;
//! use sql_backup::backup::run_config::RunConfig;
//!
//! let config = RunConfig::builder()
//!     .server("/var/lib/sqlite")
//!     .location("/backups")
//!     .backup_type(BackupType::Differential)
//!     .build();
//! let report = config.run()?;
//! println!("{} succeeded, {} failed", report.succeeded(), report.failed());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
