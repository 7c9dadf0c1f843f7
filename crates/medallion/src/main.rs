//! medallion CLI: run the bronze/silver/gold pipeline, report on it, or
//! tear it down.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use medallion::report::{render_chart, render_history, render_table};
use medallion::{
    Medallion, PipelineConfig, PipelineError, Trigger, init_metrics, init_tracing,
    shutdown_signal,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// Path to the pipeline configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every stage and run until interrupted
    Run {
        /// Process everything available, then exit
        #[arg(long)]
        available_now: bool,
    },
    /// Print the current gold counts
    Report {
        /// Also draw a bar chart
        #[arg(long)]
        chart: bool,
    },
    /// Print the commit history of a table
    History {
        /// Table name
        table: String,
    },
    /// Remove every table and checkpoint the pipeline created
    Teardown,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(&args.log_level);

    let config = match PipelineConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match execute(config, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(config: PipelineConfig, command: Command) -> Result<(), PipelineError> {
    let mut medallion = Medallion::open(config).await?;

    match command {
        Command::Run { available_now } => {
            let metrics = &medallion.config().metrics;
            if metrics.enabled {
                init_metrics(&metrics.address)?;
            }

            let shutdown = medallion.shutdown_token();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            let trigger = if available_now {
                Trigger::AvailableNow
            } else {
                medallion.default_trigger()
            };
            medallion.start_all(trigger).await?;
            info!(?trigger, "All stages started");

            if trigger == Trigger::AvailableNow {
                medallion.await_termination().await?;
                return medallion.stop().await;
            }

            let failure = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = medallion.await_any_termination() => result.err(),
            };
            let stopped = medallion.stop().await;
            match failure {
                Some(e) => Err(e),
                None => stopped,
            }
        }
        Command::Report { chart } => {
            let counts = medallion.report().await?;
            let aggregate = &medallion.config().aggregate;
            print!(
                "{}",
                render_table(&aggregate.group_by, &aggregate.count_column, &counts)
            );
            if chart {
                println!();
                print!("{}", render_chart(&counts));
            }
            Ok(())
        }
        Command::History { table } => {
            match medallion.catalog().table(&table).history().await {
                Ok(history) => print!("{}", render_history(&table, &history)),
                Err(e) => {
                    let e = PipelineError::from(e);
                    if !e.is_not_found() {
                        return Err(e);
                    }
                    println!("{e}");
                }
            }
            Ok(())
        }
        Command::Teardown => {
            let summary = medallion.teardown().await?;
            println!(
                "Dropped {} table(s), removed {} checkpoint file(s)",
                summary.tables_dropped, summary.checkpoint_files_removed
            );
            Ok(())
        }
    }
}
