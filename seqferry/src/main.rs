#![deny(unsafe_code)]

use clap::Parser;
use seqferry_common::prelude::*;

mod cmd;

/// Command-line options, parsed using `clap`.
#[derive(Debug, Parser)]
#[command(
    name = "seqferry",
    version,
    about = "Replicates completed sequencing runs from local directories into S3."
)]
enum Opt {
    /// Run one scheduled sweep of the monitored directories, uploading any
    /// newly completed or partially uploaded runs.
    #[command(name = "monitor")]
    Monitor {
        #[command(flatten)]
        cmd: cmd::monitor::Opt,
    },

    /// Upload a single run directory to a given location in S3.
    #[command(name = "upload")]
    Upload {
        #[command(flatten)]
        cmd: cmd::upload::Opt,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    match opt {
        Opt::Monitor { ref cmd } => cmd::monitor::run(cmd).await,
        Opt::Upload { ref cmd } => cmd::upload::run(cmd).await,
    }
}
