use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    trace_weaver_cli::init_tracing();
    let cli = trace_weaver_cli::Cli::parse();
    trace_weaver_cli::run_cli(cli)
}
