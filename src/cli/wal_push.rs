//! Implementation of `pgdelta wal-push`, meant for `archive_command`.

use std::path::PathBuf;

use clap::Args;

use crate::wal::push_wal_file;
use crate::Result;

use super::StorageArgs;

#[derive(Debug, Clone, Args)]
pub struct WalPushArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Path of the WAL file to archive (`%p`).
    pub wal_path: PathBuf,
}

pub fn execute(args: WalPushArgs) -> Result<()> {
    let ctx = args.storage.context()?;
    push_wal_file(&ctx.storage, ctx.registry, &ctx.settings, &args.wal_path)?;
    Ok(())
}
