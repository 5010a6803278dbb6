//! A server instance made of a directory of SQLite databases.
//!
//! Every `*.db`, `*.sqlite` or `*.sqlite3` file in the directory is a database
//! named after its file stem. Databases in WAL journal mode are treated as full
//! recovery (their write-ahead log can be backed up), anything else as simple.
//! Backup history lives in `msdb.sqlite` in the same directory.

use crate::backup::engine::history::{BackupHistory, BackupSet, BackupSetType, HISTORY_DB_FILE_NAME};
use crate::backup::engine::page_diff::write_diff;
use crate::backup::engine::{
    BackupAction, BackupEngine, BackupRequest, DatabaseInfo, DatabaseStatus, EngineVersion,
    Maintenance, MetadataProvider, RecoveryModel,
};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use chrono::{DateTime, Utc};
use function_name::named;
use itertools::Itertools;
use rusqlite::{Connection, OpenFlags, MAIN_DB};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

static DATABASE_FILE_EXTS: [&str; 3] = ["db", "sqlite", "sqlite3"];

/// Lock waits never time out in practice.
const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

pub struct SqliteInstance {
    name: Arc<str>,
    dir: PathBuf,
    history: BackupHistory,
}

impl SqliteInstance {
    /// Opens the instance at `address`, a directory holding the database files.
    pub fn connect<S: Into<Arc<str>>>(address: S) -> Result<Self> {
        let name = address.into();
        let dir = PathBuf::from(name.as_ref());
        if !dir.is_dir() {
            return Err(Error::engine(format!(
                "server instance {:?} is not a directory",
                dir
            )));
        }
        let history = BackupHistory::open(dir.join(HISTORY_DB_FILE_NAME))?;
        info!("Connected to sqlite instance {:?}", dir);
        Ok(Self { name, dir, history })
    }

    fn database_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let is_database = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| DATABASE_FILE_EXTS.iter().any(|ext| e.eq_ignore_ascii_case(ext)));
            if !is_database {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((stem.to_string(), path.clone()));
            }
        }

        Ok(files
            .into_iter()
            .sorted_by_key(|(name, _)| name.to_lowercase())
            .collect())
    }

    fn database_path(&self, database: &str) -> Result<PathBuf> {
        self.database_files()?
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(database))
            .map(|(_, path)| path)
            .ok_or_else(|| Error::engine(format!("database {database:?} not found")))
    }

    fn describe(&self, name: String, path: &Path) -> Result<DatabaseInfo> {
        let size_mb = std::fs::metadata(path)?.len() as f64 / (1024.0 * 1024.0);
        let (status, recovery_model) = match probe(path) {
            Ok(journal_mode) => (DatabaseStatus::NORMAL, recovery_model(&journal_mode)),
            Err(e) => {
                debug!("Database {:?} is not readable, marking offline: {e}", path);
                (DatabaseStatus::OFFLINE, RecoveryModel::Simple)
            }
        };
        let last_backup = self.history.last_full_backup_date(&name)?;

        Ok(DatabaseInfo::builder()
            .name(name)
            .size_mb(size_mb)
            .status(status)
            .recovery_model(recovery_model)
            .maybe_last_backup(last_backup)
            .build())
    }

    /// Snapshots the database through the online backup API.
    fn snapshot(&self, path: &Path) -> Result<(NamedTempFile, usize)> {
        let src = open(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let page_size: i64 = src.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let snapshot = NamedTempFile::new()?;
        src.backup(MAIN_DB, snapshot.path(), None)?;
        Ok((snapshot, page_size.max(1) as usize))
    }

    /// Stripes the snapshot over `devices` in equal contiguous parts.
    fn backup_full(&self, path: &Path, devices: &[PathBuf]) -> Result<u64> {
        if devices.is_empty() {
            return Err(Error::engine("no backup device given"));
        }
        let (snapshot, _) = self.snapshot(path)?;
        let len = snapshot.as_file().metadata()?.len();
        let part_len = len.div_ceil(devices.len() as u64).max(1);

        let mut reader = File::open(snapshot.path())?;
        let mut written = 0;
        for device in devices {
            let mut writer = BufWriter::new(File::create(device)?);
            written += std::io::copy(&mut (&mut reader).take(part_len), &mut writer)?;
            writer.flush()?;
        }
        Ok(written)
    }

    /// Writes the pages changed since the newest full backup.
    fn backup_differential(&self, database: &str, path: &Path, devices: &[PathBuf]) -> Result<u64> {
        let [device] = devices else {
            return Err(Error::engine(format!(
                "differential backup needs exactly one device, got {}",
                devices.len()
            )));
        };
        let base_set = self.history.last_full_backup(database)?.ok_or_else(|| {
            Error::engine(format!(
                "cannot perform a differential backup of {database:?}, no full backup exists"
            ))
        })?;
        let mut base = Vec::new();
        for base_device in base_set.devices() {
            File::open(base_device)
                .map_err(Error::from)
                .with_debug_object_and_fn_name(base_device.clone(), "open base backup")?
                .read_to_end(&mut base)?;
        }

        let (snapshot, page_size) = self.snapshot(path)?;
        let new = std::fs::read(snapshot.path())?;
        write_diff(&base, &new, page_size, BufWriter::new(File::create(device)?))
    }

    /// Copies the write-ahead log to the device and truncates it.
    ///
    /// The copy runs under an immediate transaction, but SQLite refuses to
    /// checkpoint on a connection with an open transaction, so the truncating
    /// checkpoint only starts after `COMMIT`. A commit landing between the two
    /// is checkpointed into the database file without reaching any log backup,
    /// it is only captured by the next full or differential backup.
    fn backup_log(&self, path: &Path, devices: &[PathBuf]) -> Result<u64> {
        let [device] = devices else {
            return Err(Error::engine(format!(
                "log backup needs exactly one device, got {}",
                devices.len()
            )));
        };
        let conn = open(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        if recovery_model(&journal_mode) == RecoveryModel::Simple {
            return Err(Error::engine(format!(
                "log backup requires WAL journal mode, {:?} uses {journal_mode}",
                path
            )));
        }

        // writers are held off until the log is copied
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let copied = copy_wal(&wal_path(path), device);
        conn.execute_batch("COMMIT")?;
        let copied = copied?;

        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(copied)
    }
}

fn open(path: &Path, flags: OpenFlags) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
    conn.busy_timeout(MAX_BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Reads the journal mode, failing when the file is not a usable database.
fn probe(path: &Path) -> Result<String> {
    let conn = open(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.query_row("PRAGMA schema_version", [], |r| r.get::<_, i64>(0))?;
    Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?)
}

fn recovery_model(journal_mode: &str) -> RecoveryModel {
    if journal_mode.eq_ignore_ascii_case("wal") {
        RecoveryModel::Full
    } else {
        RecoveryModel::Simple
    }
}

fn wal_path(path: &Path) -> PathBuf {
    let mut wal = OsString::from(path.as_os_str());
    wal.push("-wal");
    wal.into()
}

fn copy_wal(wal: &Path, device: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(device)?);
    let copied = match File::open(wal) {
        Ok(mut reader) => std::io::copy(&mut reader, &mut writer)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    writer.flush()?;
    Ok(copied)
}

impl MetadataProvider for SqliteInstance {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        self.database_files()?
            .into_iter()
            .map(|(name, path)| self.describe(name, &path))
            .collect()
    }
}

impl BackupEngine for SqliteInstance {
    fn version(&self) -> EngineVersion {
        let n = rusqlite::version_number().max(0) as u32;
        EngineVersion {
            major: n / 1_000_000,
            minor: (n / 1000) % 1000,
        }
    }

    #[named]
    fn backup(&self, request: &BackupRequest) -> Result<()> {
        let database = request.database().as_ref();
        let devices = request.devices().as_slice();
        let res = self.database_path(database).and_then(|path| {
            if request.compression() {
                debug!("Compression is not available for sqlite backups, writing uncompressed");
            }
            match (request.action(), request.incremental()) {
                (BackupAction::Database, false) => self
                    .backup_full(&path, devices)
                    .map(|size| (BackupSetType::Database, size)),
                (BackupAction::Database, true) => self
                    .backup_differential(database, &path, devices)
                    .map(|size| (BackupSetType::Differential, size)),
                (BackupAction::Log, _) => self
                    .backup_log(&path, devices)
                    .map(|size| (BackupSetType::Log, size)),
            }
        });

        res.and_then(|(set_type, size)| {
            self.history.record(
                &BackupSet::builder()
                    .database(database)
                    .set_type(set_type)
                    .finish_date(Utc::now())
                    .devices(devices.to_vec())
                    .name(request.backup_set_name().clone())
                    .description(request.backup_set_description().clone())
                    .size(size)
                    .build(),
            )
        })
        .with_debug_object_and_fn_name(request.clone(), function_path!())
    }
}

impl Maintenance for SqliteInstance {
    fn delete_backup_history(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.history.delete_older_than(older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::engine::page_diff::apply_diff;
    use tempfile::TempDir;

    fn create_database(path: &Path, wal: bool, rows: usize) -> Connection {
        let conn = Connection::open(path).unwrap();
        if wal {
            let mode: String = conn
                .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
                .unwrap();
            assert_eq!(mode, "wal");
        }
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, payload TEXT)")
            .unwrap();
        insert_rows(&conn, rows);
        conn
    }

    fn insert_rows(conn: &Connection, rows: usize) {
        for _ in 0..rows {
            conn.execute("INSERT INTO t (payload) VALUES (?1)", ["x".repeat(500)])
                .unwrap();
        }
    }

    fn count_rows(image: &[u8]) -> i64 {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), image).unwrap();
        let conn = Connection::open(tmp.path()).unwrap();
        conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap()
    }

    fn setup() -> (TempDir, SqliteInstance) {
        let tmp = TempDir::new().unwrap();
        create_database(&tmp.path().join("Sales.db"), true, 200);
        create_database(&tmp.path().join("Simple.sqlite"), false, 5);
        std::fs::write(tmp.path().join("Broken.db"), b"definitely not a database file").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"ignored").unwrap();
        let instance = SqliteInstance::connect(tmp.path().to_string_lossy().to_string()).unwrap();
        (tmp, instance)
    }

    fn request(database: &str, action: BackupAction, incremental: bool, devices: Vec<PathBuf>) -> BackupRequest {
        BackupRequest::builder()
            .database(database)
            .action(action)
            .incremental(incremental)
            .devices(devices)
            .build()
    }

    #[test]
    fn test_connect_requires_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"").unwrap();
        assert!(SqliteInstance::connect(file.to_string_lossy().to_string()).is_err());
    }

    #[test]
    fn test_databases_enumeration() {
        let (_tmp, instance) = setup();
        let dbs = instance.databases().unwrap();
        let names = dbs.iter().map(|d| d.name().to_string()).collect_vec();
        assert_eq!(names, vec!["Broken", "msdb", "Sales", "Simple"]);

        let by_name = |n: &str| dbs.iter().find(|d| d.is_named(n)).unwrap();
        assert!(by_name("Broken").status().is_offline());
        assert_eq!(by_name("Sales").recovery_model(), RecoveryModel::Full);
        assert_eq!(by_name("Simple").recovery_model(), RecoveryModel::Simple);
        assert!(by_name("Sales").never_backed_up());
        assert!(by_name("Sales").size_mb() > 0.0);
    }

    #[test]
    fn test_version_is_sqlite_3() {
        let (_tmp, instance) = setup();
        let version = instance.version();
        assert_eq!(version.major, 3);
        assert!(!version.supports_compression());
    }

    #[test]
    fn test_full_backup_striped_over_devices() {
        let (tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        let devices = vec![out.path().join("Sales_01.full.bak"), out.path().join("Sales_02.full.bak")];

        instance
            .backup(&request("sales", BackupAction::Database, false, devices.clone()))
            .unwrap();

        let image = devices
            .iter()
            .flat_map(|d| std::fs::read(d).unwrap())
            .collect_vec();
        assert_eq!(count_rows(&image), 200);
        let first = std::fs::metadata(&devices[0]).unwrap().len();
        let second = std::fs::metadata(&devices[1]).unwrap().len();
        assert!(first >= second && second > 0);

        let sales = instance
            .databases()
            .unwrap()
            .into_iter()
            .find(|d| d.is_named("Sales"))
            .unwrap();
        assert!(!sales.never_backed_up());
        drop(tmp);
    }

    #[test]
    fn test_differential_backup_contains_new_rows() {
        let (tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        let full = out.path().join("Sales.full.bak");
        instance
            .backup(&request("Sales", BackupAction::Database, false, vec![full.clone()]))
            .unwrap();

        let writer = Connection::open(tmp.path().join("Sales.db")).unwrap();
        insert_rows(&writer, 10);
        let diff = out.path().join("Sales.diff.bak");
        instance
            .backup(&request("Sales", BackupAction::Database, true, vec![diff.clone()]))
            .unwrap();

        let base = std::fs::read(&full).unwrap();
        let image = apply_diff(&base, File::open(&diff).unwrap()).unwrap();
        assert_eq!(count_rows(&image), 210);
        assert!(std::fs::metadata(&diff).unwrap().len() < base.len() as u64);
    }

    #[test]
    fn test_differential_without_full_backup_fails() {
        let (_tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        let res = instance.backup(&request(
            "Sales",
            BackupAction::Database,
            true,
            vec![out.path().join("Sales.diff.bak")],
        ));
        let err = res.unwrap_err();
        assert!(err.cause_chain().iter().any(|m| m.contains("no full backup exists")));
    }

    #[test]
    fn test_log_backup_copies_and_truncates_wal() {
        let (tmp, instance) = setup();
        let db = tmp.path().join("Sales.db");
        let writer = Connection::open(&db).unwrap();
        insert_rows(&writer, 5);
        let wal = wal_path(&db);
        assert!(std::fs::metadata(&wal).unwrap().len() > 0);

        let out = TempDir::new().unwrap();
        let trn = out.path().join("Sales.trn");
        instance
            .backup(&request("Sales", BackupAction::Log, false, vec![trn.clone()]))
            .unwrap();

        assert!(std::fs::metadata(&trn).unwrap().len() > 0);
        assert_eq!(std::fs::metadata(&wal).unwrap().len(), 0);
        drop(writer);
    }

    #[test]
    fn test_log_backups_continue_the_chain() {
        let (tmp, instance) = setup();
        let db = tmp.path().join("Sales.db");
        let writer = Connection::open(&db).unwrap();
        insert_rows(&writer, 5);

        let out = TempDir::new().unwrap();
        let first = out.path().join("Sales_1.trn");
        instance
            .backup(&request("Sales", BackupAction::Log, false, vec![first.clone()]))
            .unwrap();

        // nothing was written since, the next log backup is empty
        let empty = out.path().join("Sales_2.trn");
        instance
            .backup(&request("Sales", BackupAction::Log, false, vec![empty.clone()]))
            .unwrap();
        assert_eq!(std::fs::metadata(&empty).unwrap().len(), 0);

        insert_rows(&writer, 5);
        let next = out.path().join("Sales_3.trn");
        instance
            .backup(&request("Sales", BackupAction::Log, false, vec![next.clone()]))
            .unwrap();
        assert!(std::fs::metadata(&next).unwrap().len() > 0);
        assert_eq!(std::fs::metadata(wal_path(&db)).unwrap().len(), 0);

        let count: i64 = writer
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 210);
    }

    #[test]
    fn test_log_backup_of_simple_database_fails() {
        let (_tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        let res = instance.backup(&request(
            "Simple",
            BackupAction::Log,
            false,
            vec![out.path().join("Simple.trn")],
        ));
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_database_fails() {
        let (_tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        let res = instance.backup(&request(
            "Missing",
            BackupAction::Database,
            false,
            vec![out.path().join("Missing.full.bak")],
        ));
        assert!(res.is_err());
    }

    #[test]
    fn test_delete_backup_history() {
        let (_tmp, instance) = setup();
        let out = TempDir::new().unwrap();
        instance
            .backup(&request(
                "Simple",
                BackupAction::Database,
                false,
                vec![out.path().join("Simple.full.bak")],
            ))
            .unwrap();

        let deleted = instance
            .delete_backup_history(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(instance
            .databases()
            .unwrap()
            .iter()
            .all(|d| d.never_backed_up()));
    }
}
