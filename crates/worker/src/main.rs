use std::process::ExitCode;

use clap::Parser;
use tracing::{Instrument, error, info};

use changefeed_worker::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    changefeed_observability::init();

    let span = changefeed_observability::worker_span(&args.stream, &args.job, args.env.as_deref());

    async move {
        match changefeed_worker::app::run_from_args(args).await {
            Ok(exit) => {
                info!(
                    restarts = exit.restarts,
                    dispatched = exit.stats.events_dispatched,
                    dead_lettered = exit.stats.events_dead_lettered,
                    "worker stopped"
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "worker failed");
                ExitCode::FAILURE
            }
        }
    }
    .instrument(span)
    .await
}
