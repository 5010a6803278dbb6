use crate::backup::backup_type::BackupType;
use crate::backup::engine::{DatabaseInfo, RecoveryModel};
use getset::Getters;

/// Database holding temporary objects, it is recreated on every server start.
pub static TEMP_DATABASE_NAME: &str = "tempdb";

/// Databases to back up in one run, split by phase.
#[derive(Clone, Debug, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct Selection {
    full_targets: Vec<DatabaseInfo>,
    log_targets: Vec<DatabaseInfo>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.full_targets.is_empty() && self.log_targets.is_empty()
    }
}

/// Whether `database` can be backed up at all.
pub fn is_eligible(database: &DatabaseInfo) -> bool {
    !database.is_named(TEMP_DATABASE_NAME) && !database.status().is_offline()
}

/// Splits the server's databases into full and log backup targets, keeping their order.
///
/// For log backups, databases never backed up get a full backup instead since
/// a log backup needs a full backup to start its chain. Simple recovery
/// databases have no log to back up and are skipped for the log phase.
pub fn select(databases: Vec<DatabaseInfo>, backup_type: BackupType) -> Selection {
    let eligible = databases.into_iter().filter(is_eligible);

    match backup_type {
        BackupType::Full | BackupType::Differential => Selection {
            full_targets: eligible.collect(),
            log_targets: Vec::new(),
        },
        BackupType::TransactionLog => {
            let (full_targets, rest): (Vec<_>, Vec<_>) =
                eligible.partition(DatabaseInfo::never_backed_up);
            Selection {
                full_targets,
                log_targets: rest
                    .into_iter()
                    .filter(|db| db.recovery_model() != RecoveryModel::Simple)
                    .collect(),
            }
        }
    }
}
