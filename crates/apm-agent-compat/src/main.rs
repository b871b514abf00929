// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use apm_agent::{
    agent::AgentService,
    collector::{connection::ConnectionNotice, http::HttpCollector},
    config::Config,
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid agent configuration")?;

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let collector = Arc::new(
        HttpCollector::new(&config).context("failed to build the collector client")?,
    );
    info!(
        "Reporting {} to {}",
        config.app_names.join(";"),
        config.collector_url()
    );

    let (mut service, handle) = AgentService::new(config, collector);
    let mut notices = service.notices();
    let mut agent = tokio::spawn(service.run());

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                ConnectionNotice::Connected { run_id } => info!("Session {run_id} established"),
                ConnectionNotice::Failed => error!("Collector session failed"),
                notice => debug!("Connection notice: {notice:?}"),
            }
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!("Unable to listen for shutdown signal: {err}");
            }
            info!("Received shutdown signal");
            handle.shutdown().await;
            agent.await.context("agent service panicked")?;
        }
        result = &mut agent => {
            result.context("agent service panicked")?;
            error!("Agent service stopped, exiting");
        }
    }
    Ok(())
}
