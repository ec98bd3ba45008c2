use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[macro_use]
extern crate tracing;

mod config;
mod preset;
mod protocol;
mod registry;
mod router;
mod sequencer;
mod server;
mod session;
mod state;
mod task;

use crate::task::Task;

#[derive(Debug, Parser)]
struct MainArgs {
    /// The path to the config file for the gateway
    #[clap(long, short)]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // setup colorful backtraces
    color_backtrace::install();

    let mut targets = Targets::new().with_default(LevelFilter::INFO);

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    }

    let (writer, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::hourly(
        "logs",
        "gimbal-gateway",
    ));

    tracing_subscriber::registry()
        // writer that outputs to console
        .with(tracing_subscriber::fmt::layer().with_filter(targets))
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(
                    Targets::new().with_targets(vec![("gimbal_gateway", LevelFilter::DEBUG)]),
                ),
        )
        .init();

    let main_args = MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = crate::config::GatewayConfig::read_from_path(&main_args.config)
        .context("failed to read config file")?;

    run_tasks(config).await
}

async fn run_tasks(config: crate::config::GatewayConfig) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    ctrlc::set_handler({
        let cancellation_token = cancellation_token.clone();
        move || {
            info!("received interrupt, shutting down");
            cancellation_token.cancel();
        }
    })
    .expect("could not set ctrl+c handler");

    let registry = Arc::new(registry::Registry::new());
    let catalog = Arc::new(preset::PresetCatalog::new());
    let session = Arc::new(session::DeviceSession::new());

    debug!("initializing router task");
    let router_task = router::create_task(registry.clone(), session.clone());
    let router_tx = router_task.cmd();

    debug!("initializing sequencer task");
    let sequencer_task = sequencer::create_task(catalog.clone(), session, router_tx.clone());
    let sequencer_tx = sequencer_task.cmd();

    let tasks: Vec<Box<dyn Task>> = vec![Box::new(router_task), Box::new(sequencer_task)];

    let mut join_set = JoinSet::new();

    join_set.spawn(server::serve(
        config.server,
        registry,
        catalog,
        router_tx,
        sequencer_tx,
        cancellation_token.clone(),
    ));

    for task in tasks {
        debug!("starting {} task", task.name());
        join_set.spawn(task.run(cancellation_token.clone()));
    }

    while let Some(res) = join_set.join_next().await {
        // if task panicked, then will be Some(Err)
        // if task terminated w/ error, then will be Some(Ok(Err))
        // need to propagate errors in both cases

        match res {
            Err(err) => {
                cancellation_token.cancel();
                return Err(err).context("task failed");
            }
            Ok(Err(err)) => {
                cancellation_token.cancel();
                return Err(err).context("task terminated with error");
            }
            _ => {
                info!("exited task");
            }
        }
    }

    Ok(())
}
