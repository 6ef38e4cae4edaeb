//! Baton CLI - operator tooling for locks and sessions
//!
//! Binary name: `baton`
//!
//! Exit codes: 0 success, 1 contention or configuration problem, 2 store failure.

use std::process;

use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();

    match commands::run(cli).await {
        Ok(outcome) => {
            let code = outcome.exit_code();
            if code != 0 {
                #[allow(clippy::exit)]
                process::exit(code);
            }
        }
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Error: {err:#}");
            }

            let code = err
                .downcast_ref::<baton_core::Error>()
                .map_or(2, baton_core::Error::exit_code);

            #[allow(clippy::exit)]
            process::exit(code);
        }
    }
}
