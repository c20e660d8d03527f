//! Command line surface: one module per subcommand, each with an `XArgs`
//! struct and an `execute` entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::compression::CompressionRegistry;
use crate::config::Settings;
use crate::storage::StorageFolder;
use crate::Result;

pub mod backup_fetch;
pub mod backup_list;
pub mod backup_push;
pub mod wal_push;
pub mod wal_verify;

/// Options shared by every command that touches storage.
#[derive(Debug, Clone, Args)]
pub struct StorageArgs {
    /// Root directory of the backup storage.
    #[arg(short = 's', long = "storage", env = "PGDELTA_STORAGE")]
    pub storage: PathBuf,

    /// Optional JSON settings file; `PGDELTA_*` variables override it.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// Resolved collaborators for one command run.
pub struct Context {
    pub storage: StorageFolder,
    pub registry: Arc<CompressionRegistry>,
    pub settings: Settings,
}

impl StorageArgs {
    pub fn context(&self) -> Result<Context> {
        Ok(Context {
            storage: StorageFolder::fs(self.storage.clone()),
            registry: Arc::new(CompressionRegistry::new()),
            settings: Settings::load(self.config.as_deref())?,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    BackupPush(backup_push::BackupPushArgs),
    BackupFetch(backup_fetch::BackupFetchArgs),
    BackupList(backup_list::BackupListArgs),
    WalPush(wal_push::WalPushArgs),
    WalVerify(wal_verify::WalVerifyArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::BackupPush(a) => backup_push::execute(a),
        Command::BackupFetch(a) => backup_fetch::execute(a),
        Command::BackupList(a) => backup_list::execute(a),
        Command::WalPush(a) => wal_push::execute(a),
        Command::WalVerify(a) => wal_verify::execute(a),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "pgdelta",
    version,
    about = "Incremental PostgreSQL backups driven by WAL delta tracking"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Upload a data directory as a full backup, or as a delta of an earlier one.
    BackupPush(backup_push::BackupPushArgs),
    /// Restore a backup and its base chain into an empty directory.
    BackupFetch(backup_fetch::BackupFetchArgs),
    /// List backups in storage, oldest first.
    BackupList(backup_list::BackupListArgs),
    /// Archive one WAL file, recording its changed blocks when enabled.
    WalPush(wal_push::WalPushArgs),
    /// Check archived WAL for gaps and timeline mismatches.
    WalVerify(wal_verify::WalVerifyArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return Err(crate::Error::Cli(e.to_string()).into()),
    };
    let command = match cli.command {
        Some(Subcommands::BackupPush(args)) => Command::BackupPush(args),
        Some(Subcommands::BackupFetch(args)) => Command::BackupFetch(args),
        Some(Subcommands::BackupList(args)) => Command::BackupList(args),
        Some(Subcommands::WalPush(args)) => Command::WalPush(args),
        Some(Subcommands::WalVerify(args)) => Command::WalVerify(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
