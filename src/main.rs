use clap::Parser;
use sql_backup::backup::backup_type::BackupType;
use sql_backup::backup::result_error::error::Error;
use sql_backup::backup::result_error::result::Result;
use sql_backup::backup::result_error::WithMsg;
use sql_backup::backup::run_config::{RunConfig, DEFAULT_HISTORY_RETENTION};
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::{error, info};
use validator::Validate;

/// Back up every database of a server instance
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The server's address
    #[arg(short, long, required_unless_present = "config")]
    server: Option<String>,
    /// Specify the backup location
    #[arg(short = 'l', long, required_unless_present = "config")]
    location: Option<PathBuf>,
    /// Specify the backup type
    #[arg(short = 't', long = "type", value_enum, ignore_case = true)]
    backup_type: Option<BackupType>,
    /// Prune old backup history after the run
    #[arg(long)]
    maintenance: bool,
    /// Age of the backup history entries kept by maintenance, e.g. "35days"
    #[arg(long, value_parser = humantime::parse_duration)]
    history_retention: Option<Duration>,
    /// Location of config file, explicit flags take precedence over it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let base = args
        .config
        .as_ref()
        .map(|path| {
            File::open(path).map_err(Error::from).and_then(|f| {
                serde_yml::from_reader::<_, RunConfig>(f)
                    .map_err(Error::from)
                    .with_msg(format!("Parse YAML config failed: {:?}", path))
            })
        })
        .transpose()?;

    let server = args
        .server
        .clone()
        .or_else(|| base.as_ref().map(|c| c.server().clone()))
        .ok_or(Error::MissingConfig("server"))?;
    let location = args
        .location
        .clone()
        .or_else(|| base.as_ref().map(|c| c.location().clone()))
        .ok_or(Error::MissingConfig("location"))?;

    Ok(RunConfig::builder()
        .server(server)
        .location(location)
        .backup_type(
            args.backup_type
                .or_else(|| base.as_ref().map(RunConfig::backup_type))
                .unwrap_or_default(),
        )
        .maintenance(args.maintenance || base.as_ref().is_some_and(RunConfig::maintenance))
        .history_retention(
            args.history_retention
                .or_else(|| base.as_ref().map(RunConfig::history_retention))
                .unwrap_or(DEFAULT_HISTORY_RETENTION),
        )
        .build())
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = load_config(&args)
        .and_then(|rc| {
            rc.validate()
                .map_err(Error::from)
                .map(|_| rc)
                .with_msg("Config validation failed")
        })
        .and_then(|rc| {
            println!(
                "Server: {}  BackupLocation: {}  BackupType: {}",
                rc.server(),
                rc.location().display(),
                rc.backup_type()
            );
            rc.run()
        });

    match res {
        Ok(report) => info!(
            "Backup run finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        ),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
