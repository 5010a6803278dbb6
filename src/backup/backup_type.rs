use clap::ValueEnum;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The backup type requested for a whole run.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    Full,
    #[value(alias = "diff")]
    Differential,
    #[value(alias = "log")]
    #[serde(alias = "log")]
    TransactionLog,
}
