use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Run a master and node managers that supervise service processes
#[derive(Parser)]
#[command(name = "mpf_cluster")]
#[command(version)]
#[command(about = "Run a master and node managers that supervise service processes")]
#[command(after_help = "Examples:\n  \
    mpf_cluster standalone --nodes nodes.yaml\n  \
    mpf_cluster standalone --nodes nodes.json --config runtime.yaml --verbose\n  \
    mpf_cluster check-config --nodes nodes.yaml")]
#[command(arg_required_else_help = true)]
pub struct Options {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the master and one node manager per configured host in this process
    #[command(after_help = "Examples:\n  \
        mpf_cluster standalone --nodes nodes.yaml\n  \
        mpf_cluster standalone --nodes nodes.yaml --no-launch\n  \
        mpf_cluster standalone --nodes nodes.yaml --run-for 30")]
    Standalone(StandaloneArgs),

    /// Validate a cluster config and print the services it expands to
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

impl Command {
    pub fn verbose(&self) -> bool {
        match self {
            Command::Standalone(args) => args.common.verbose,
            Command::CheckConfig(args) => args.common.verbose,
        }
    }
}

/// Options shared by all subcommands
#[derive(Args)]
pub struct CommonOptions {
    /// Runtime configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log per-service lifecycle details
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[derive(Args)]
pub struct StandaloneArgs {
    /// Cluster config with node-manager targets and service templates (YAML or JSON)
    #[arg(long)]
    pub nodes: PathBuf,

    /// Configure services but do not launch them
    #[arg(long)]
    pub no_launch: bool,

    /// Shut down gracefully after this many seconds
    #[arg(long)]
    pub run_for: Option<f64>,

    #[command(flatten)]
    pub common: CommonOptions,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Cluster config to check (YAML or JSON)
    #[arg(long)]
    pub nodes: PathBuf,

    #[command(flatten)]
    pub common: CommonOptions,
}
