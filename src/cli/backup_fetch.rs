//! Implementation of `pgdelta backup-fetch`.

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::backup::metadata::TablespaceSpec;
use crate::backup::{fetch_backup, fetch_backup_old, FetchOptions};
use crate::Result;

use super::StorageArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum FetchMode {
    /// Newest backup first; older pages never overwrite newer ones.
    #[default]
    Reverse,
    /// Oldest backup first, applying each increment on top.
    Forward,
}

#[derive(Debug, Clone, Args)]
pub struct BackupFetchArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Backup name, or `LATEST`.
    pub backup_name: String,

    /// Empty directory to restore into.
    pub destination: PathBuf,

    #[arg(long = "mode", value_enum, default_value = "reverse")]
    pub mode: FetchMode,

    /// Skip tars of older backups with nothing left to restore.
    #[arg(long = "skip-redundant-tars", default_value_t = false)]
    pub skip_redundant_tars: bool,

    /// JSON tablespace spec overriding the locations recorded in the backup.
    #[arg(long = "restore-spec")]
    pub restore_spec: Option<PathBuf>,
}

pub fn execute(args: BackupFetchArgs) -> Result<()> {
    let ctx = args.storage.context()?;
    let restore_spec = args
        .restore_spec
        .as_deref()
        .map(TablespaceSpec::read_restore_spec)
        .transpose()?;
    match args.mode {
        FetchMode::Reverse => fetch_backup(
            &ctx.storage,
            &ctx.registry,
            &args.backup_name,
            &args.destination,
            FetchOptions {
                skip_redundant_tars: args.skip_redundant_tars,
                restore_spec,
            },
        )?,
        FetchMode::Forward => fetch_backup_old(
            &ctx.storage,
            &ctx.registry,
            &args.backup_name,
            &args.destination,
            restore_spec,
        )?,
    };
    Ok(())
}
