//! Implementation of `pgdelta backup-push`.

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::info;

use crate::backup::{push_backup, BackupPushRequest, RelFileStatistics, RelationStat};
use crate::pg::{Lsn, RelFileNode};
use crate::Result;

use super::StorageArgs;

#[derive(Debug, Clone, Args)]
pub struct BackupPushArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Data directory of the cluster.
    #[arg(short = 'D', long = "data-dir")]
    pub data_dir: PathBuf,

    /// LSN returned by pg_backup_start, as `X/Y`.
    #[arg(long = "start-lsn")]
    pub start_lsn: Lsn,

    /// LSN returned by pg_backup_stop, as `X/Y`.
    #[arg(long = "finish-lsn")]
    pub finish_lsn: Lsn,

    #[arg(long = "timeline", default_value_t = 1)]
    pub timeline: u32,

    /// Make a delta of this backup (`LATEST` for the newest one).
    #[arg(long = "delta-from")]
    pub delta_from: Option<String>,

    /// Keep the backup and its WAL out of retention.
    #[arg(long = "permanent", default_value_t = false)]
    pub permanent: bool,

    #[arg(long = "pg-version")]
    pub pg_version: Option<u32>,

    /// JSON list of `{spc_node, db_node, rel_node, inserted_tuples,
    /// updated_tuples, deleted_tuples}` used for per-file update counts.
    #[arg(long = "rel-stats")]
    pub rel_stats: Option<PathBuf>,
}

#[derive(serde::Deserialize)]
struct RelStatRow {
    spc_node: u32,
    db_node: u32,
    rel_node: u32,
    #[serde(flatten)]
    stat: RelationStat,
}

fn read_rel_stats(path: &Path) -> Result<RelFileStatistics> {
    let rows: Vec<RelStatRow> = serde_json::from_slice(&std::fs::read(path)?)?;
    Ok(rows
        .into_iter()
        .map(|r| (RelFileNode::new(r.spc_node, r.db_node, r.rel_node), r.stat))
        .collect())
}

pub fn execute(args: BackupPushArgs) -> Result<()> {
    let ctx = args.storage.context()?;
    let rel_stats = args.rel_stats.as_deref().map(read_rel_stats).transpose()?;
    let request = BackupPushRequest {
        data_dir: args.data_dir,
        start_lsn: args.start_lsn,
        finish_lsn: args.finish_lsn,
        timeline: args.timeline,
        delta_from: args.delta_from,
        is_permanent: args.permanent,
        rel_stats,
        pg_version: args.pg_version,
    };
    let result = push_backup(&ctx.storage, ctx.registry, &ctx.settings, request)?;
    info!(backup = %result.name, "backup_push_complete");
    println!("{}", result.name);
    Ok(())
}
