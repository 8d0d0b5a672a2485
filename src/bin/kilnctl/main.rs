mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kiln::{Config, JobState, Queue, QueueEvent};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::{Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation on ctrl-c.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = Config {
        url: args.url,
        prefix: args.prefix,
        ..Config::default()
    };
    let queue = Queue::connect(config)
        .await
        .context("connecting to store")?;

    match args.command {
        Command::Stats => stats(&queue).await,
        Command::Watch => watch(&queue, cancel).await,
        Command::Promote { interval } => promote(&queue, interval, cancel).await,
    }
}

#[derive(Serialize)]
struct Stats {
    inactive: u64,
    active: u64,
    delayed: u64,
    complete: u64,
    failed: u64,
    #[serde(rename = "work-time")]
    work_time: u64,
    types: Vec<String>,
}

async fn stats(queue: &Queue) -> Result<()> {
    let stats = Stats {
        inactive: queue.card(JobState::Inactive).await?,
        active: queue.card(JobState::Active).await?,
        delayed: queue.card(JobState::Delayed).await?,
        complete: queue.card(JobState::Complete).await?,
        failed: queue.card(JobState::Failed).await?,
        work_time: queue.work_time().await?,
        types: queue.kinds().await?,
    };
    print!("{}", serde_yaml::to_string(&stats)?);
    Ok(())
}

async fn watch(queue: &Queue, cancel: CancellationToken) -> Result<()> {
    let mut feed = queue.activity().await?;
    info!("watching activity feed");
    loop {
        let event = select! {
            _ = cancel.cancelled() => return Ok(()),
            event = feed.recv() => event,
        };
        match event {
            Ok(QueueEvent::Job { id, event }) => println!("job {event} {id}"),
            Ok(QueueEvent::Error(error)) => warn!(%error, "queue error"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(n, "dropped activity events");
            },
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn promote(
    queue: &Queue,
    interval: u64,
    cancel: CancellationToken,
) -> Result<()> {
    queue.promote(Some(Duration::from_millis(interval)));
    info!(interval_ms = interval, "promoting delayed jobs");
    cancel.cancelled().await;
    queue.stop_promotion();
    Ok(())
}
