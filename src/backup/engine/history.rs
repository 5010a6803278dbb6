//! Backup history catalog kept next to the databases of a SQLite server instance.

use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, SecondsFormat, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub static HISTORY_DB_FILE_NAME: &str = "msdb.sqlite";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS backup_set (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_name TEXT NOT NULL COLLATE NOCASE,
    backup_type TEXT NOT NULL,
    finish_date TEXT NOT NULL,
    devices TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    backup_size INTEGER NOT NULL
)";

/// Fixed width, so text ordering in the catalog is time ordering.
fn format_date(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Kind of a recorded backup set, stored as a single letter.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum BackupSetType {
    #[display("D")]
    Database,
    #[display("I")]
    Differential,
    #[display("L")]
    Log,
}

#[derive(Clone, Debug, Builder, Getters, CopyGetters, PartialEq)]
pub struct BackupSet {
    #[builder(into)]
    #[getset(get = "pub")]
    database: Arc<str>,
    #[getset(get_copy = "pub")]
    set_type: BackupSetType,
    #[getset(get_copy = "pub")]
    finish_date: DateTime<Utc>,
    #[builder(into)]
    #[getset(get = "pub")]
    devices: Vec<PathBuf>,
    #[builder(default = Arc::<str>::from(""), into)]
    #[getset(get = "pub")]
    name: Arc<str>,
    #[builder(default = Arc::<str>::from(""), into)]
    #[getset(get = "pub")]
    description: Arc<str>,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    size: u64,
}

/// Open connection to the history catalog.
pub struct BackupHistory {
    conn: Connection,
}

impl BackupHistory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self { conn })
    }

    pub fn record(&self, set: &BackupSet) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backup_set
                (database_name, backup_type, finish_date, devices, name, description, backup_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                set.database.as_ref(),
                set.set_type.to_string(),
                format_date(set.finish_date),
                set.devices.iter().map(|d| d.to_string_lossy()).join("\n"),
                set.name.as_ref(),
                set.description.as_ref(),
                set.size as i64,
            ],
        )?;
        Ok(())
    }

    /// Finish time of the newest full backup of `database`.
    pub fn last_full_backup_date(&self, database: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .last_full_backup(database)?
            .map(|set| set.finish_date))
    }

    /// Newest full backup set of `database`.
    pub fn last_full_backup(&self, database: &str) -> Result<Option<BackupSet>> {
        let row = self
            .conn
            .query_row(
                "SELECT database_name, finish_date, devices, name, description, backup_size
                 FROM backup_set
                 WHERE database_name = ?1 AND backup_type = ?2
                 ORDER BY finish_date DESC, id DESC
                 LIMIT 1",
                params![database, BackupSetType::Database.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, finish_date, devices, set_name, description, size)) = row else {
            return Ok(None);
        };
        Ok(Some(
            BackupSet::builder()
                .database(name)
                .set_type(BackupSetType::Database)
                .finish_date(DateTime::parse_from_rfc3339(&finish_date)?.to_utc())
                .devices(devices.lines().map(PathBuf::from).collect_vec())
                .name(set_name)
                .description(description)
                .size(size.max(0) as u64)
                .build(),
        ))
    }

    /// Deletes every entry that finished before `older_than`.
    pub fn delete_older_than(&self, older_than: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM backup_set WHERE finish_date < ?1",
            params![format_date(older_than)],
        )?)
    }
}
