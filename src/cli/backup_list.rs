//! Implementation of `pgdelta backup-list`.

use clap::Args;
use time::format_description::well_known::Rfc3339;

use crate::backup::list_backups;
use crate::storage::BASEBACKUPS_FOLDER;
use crate::Result;

use super::StorageArgs;

#[derive(Debug, Clone, Args)]
pub struct BackupListArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
}

pub fn execute(args: BackupListArgs) -> Result<()> {
    let ctx = args.storage.context()?;
    let backups = list_backups(&ctx.storage.sub_folder(BASEBACKUPS_FOLDER))?;
    let mut table = comfy_table::Table::new();
    table.set_header(["Name", "Modified"]);
    for (name, modified) in backups {
        table.add_row([name, modified.format(&Rfc3339).unwrap_or_default()]);
    }
    println!("{table}");
    Ok(())
}
