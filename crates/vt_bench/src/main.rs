mod cli;
mod pack;
mod run;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Pack(args) => pack::pack(&args),
        Command::Run(args) => run::run(&args),
    }
}
