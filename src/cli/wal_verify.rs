//! Implementation of `pgdelta wal-verify`.

use clap::{Args, ValueEnum};

use crate::pg::WalSegmentDescription;
use crate::verify::{render_json, render_plain_text, verify_wal, WalVerifyCheckType};
use crate::{Error, Result};

use super::StorageArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckArg {
    Integrity,
    Timeline,
}

impl From<CheckArg> for WalVerifyCheckType {
    fn from(check: CheckArg) -> Self {
        match check {
            CheckArg::Integrity => WalVerifyCheckType::Integrity,
            CheckArg::Timeline => WalVerifyCheckType::Timeline,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct WalVerifyArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// WAL segment the cluster is currently writing, e.g. `000000010000000000000009`.
    #[arg(long = "current-segment")]
    pub current_segment: String,

    /// Checks to run; defaults to all of them.
    #[arg(value_enum)]
    pub checks: Vec<CheckArg>,

    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

pub fn execute(args: WalVerifyArgs) -> Result<()> {
    let ctx = args.storage.context()?;
    let current = WalSegmentDescription::parse(&args.current_segment)
        .map_err(|_| Error::Cli(format!("invalid current segment {}", args.current_segment)))?;
    let checks: Vec<WalVerifyCheckType> = if args.checks.is_empty() {
        vec![WalVerifyCheckType::Integrity, WalVerifyCheckType::Timeline]
    } else {
        args.checks.into_iter().map(Into::into).collect()
    };
    let report = verify_wal(
        &ctx.storage,
        &ctx.registry,
        &checks,
        current,
        ctx.settings.upload_concurrency,
        ctx.settings.max_delayed_segments_count,
    )?;
    if args.json {
        println!("{}", render_json(&report)?);
    } else {
        print!("{}", render_plain_text(&report));
    }
    Ok(())
}
