use std::{env, io};

use log::{error, info, warn};
use machine_learning::TokenMlp;
use tokio::signal;

use worker::{ConfigLoader, LogSink, Result, bootstrap, distributed::WorkerTopology};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    run().await.inspect_err(|e| error!("{e}"))?;
    Ok(())
}

async fn run() -> Result<()> {
    let config = ConfigLoader::new().with_args(env::args().skip(1))?.build()?;
    let topology = WorkerTopology::from_env()?;

    info!(
        rank = topology.rank(),
        world_size = topology.world_size();
        "starting worker, init_from={}", config.init_from
    );

    let mut training = bootstrap::build::<TokenMlp, _>(&config, topology, LogSink).await?;

    let finished = tokio::select! {
        ret = training.run() => Some(ret?),
        _ = signal::ctrl_c() => None,
    };

    match finished {
        Some(metrics) => info!(
            iterations = metrics.iterations,
            evals = metrics.evals,
            checkpoints = metrics.checkpoints_written;
            "training finished"
        ),
        None => {
            warn!("received SIGINT, leaving the process group");
            training.abort("interrupted").await;
        }
    }

    Ok(())
}
