use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pe-cli")]
#[command(about = "Run and check stored procedures from JSON definitions")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Mode,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Mode {
    Run(RunArgs),
    Check(CheckArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// Definition file, or a directory searched for `*.json` files.
    #[arg(long = "definitions")]
    pub(crate) definitions: String,
    #[arg(long = "procedure")]
    pub(crate) procedure: String,
    /// Positional argument as JSON; repeat for each argument.
    #[arg(long = "arg")]
    pub(crate) args: Vec<String>,
    /// Named argument as `name=<json>`.
    #[arg(long = "named", conflicts_with = "args")]
    pub(crate) named: Vec<String>,
    #[arg(long = "max-depth")]
    pub(crate) max_depth: Option<usize>,
    #[arg(long = "no-log")]
    pub(crate) no_log: bool,
}

#[derive(Debug, Args)]
pub(crate) struct CheckArgs {
    #[arg(long = "definitions")]
    pub(crate) definitions: String,
}

#[derive(Debug, Args)]
pub(crate) struct ListArgs {
    #[arg(long = "definitions")]
    pub(crate) definitions: String,
}
