mod chain;
mod cli;
mod logging;
mod metrics;
mod p2p;
mod sim;
mod sync;
#[cfg(test)]
mod test_utils;

use cli::NodeConfig;
use eyre::{Result, WrapErr};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    let guards = logging::init_tracing(&config);

    info!(
        blocks = config.sim_blocks,
        peers = config.sim_peers,
        stalling_peers = config.sim_stalling_peers,
        initial_block_download = config.initial_block_download,
        "starting block puller node"
    );

    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => warn!("shutdown signal received"),
            Err(err) => {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };
    let outcome = sim::run(&config, interrupt).await;

    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            let _ = guards.finish();
            return Err(err);
        }
    };
    let json = serde_json::to_string_pretty(&report).wrap_err("failed to encode run report")?;
    println!("{json}");

    if let Some(counts) = guards.finish().wrap_err("failed to flush json log")? {
        info!(
            written = counts.written,
            dropped = counts.dropped,
            "json log closed"
        );
    }
    Ok(())
}
