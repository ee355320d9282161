#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod commands;
mod config;
mod startup_health;

use config::{
    cli::{self, Parser},
    trace,
};
use external_api::{ExternalApi, Health};
use jetstream_core::{ClientMetrics, Connection};
use prometheus::Registry;
use startup_health::verify_background_task_running;
use tokio::{runtime::Builder, signal};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    let dotenv_result = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config =
        trace::Config::parse(&config.jsclient_log, &config.log_format, config.tracing)?;
    if let Err(err) = dotenv_result {
        debug!(?err, ".env file not loaded");
    }
    debug!(
        servers = ?config.nats_servers,
        consumer_id = %config.consumer_id,
        command = ?config.command,
        log_format = %trace_config.log_frmt
    );

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    let outcome = rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start client");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(_) => {
                debug!("exiting...");
                Ok(())
            }
        }
    });

    trace_config.shutdown();
    outcome
}

async fn start(config: cli::Config) -> Result<()> {
    // the registry lives for the whole process and is shared with the api
    let registry = Registry::new();
    let metrics = ClientMetrics::register(&registry)?;

    let api = ExternalApi::new(config.external_api, registry.clone())?;
    let client_config = config.client_config(Arc::new(api.dependencies()))?;

    let token = CancellationToken::new();
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());
    tokio::spawn(shutdown_signal(token.clone()));

    // Keep health BAD until the api and the connection are up.
    if let Err(err) = verify_background_task_running("external API", &mut api_task).await {
        token.cancel();
        return Err(err);
    }
    let conn = match Connection::connect(client_config, metrics, token.clone()).await {
        Ok(conn) => conn,
        Err(err) => {
            let _ = api_sender.send(Health::Bad).await;
            token.cancel();
            return Err(err).context("NATS connection failed");
        }
    };

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let result = commands::run(&conn, config.command, token.clone()).await;
    if result.is_err() {
        let _ = api_sender.send(Health::Bad).await;
    }

    if let Err(err) = conn.close().await {
        error!(?err, "error closing NATS connection");
    }
    token.cancel();
    if let Err(err) = api_task.await {
        error!(?err, "error waiting for web server API");
    }
    result
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
