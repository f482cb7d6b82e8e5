mod cli;
mod commands;

use crate::{
    cli::options::{Command, Options},
    commands::{handle_check_config, handle_standalone},
};
use clap::Parser;
use mpf_cluster::util::logging::init_logging;

fn main() -> eyre::Result<()> {
    // Parse options before tracing so --verbose can shape the subscriber
    let opts = Options::parse();
    init_logging(opts.command.verbose());

    match &opts.command {
        Command::Standalone(args) => handle_standalone(args)?,
        Command::CheckConfig(args) => handle_check_config(args)?,
    }

    Ok(())
}
