// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::{Args, Parser, Subcommand};
use rabbitmq_broker::{
    config::DEFAULT_CONFIRM_TIMEOUT,
    errors::AmqpError,
    forward::{copy_queue, retry_error_queue, ForwardSettings},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shovel")]
#[command(about = "Move messages between RabbitMQ queues and exchanges")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay dead-lettered messages, stripping the `error.` routing key prefix
    RetryErrors(ForwardArgs),
    /// Copy messages keeping their routing key
    Copy(ForwardArgs),
}

#[derive(Args)]
struct ForwardArgs {
    /// Source broker URL
    #[arg(long)]
    src_url: String,
    /// Destination broker URL, defaults to the source
    #[arg(long)]
    dst_url: Option<String>,
    /// Queue to drain
    #[arg(long)]
    queue: String,
    /// Exchange to publish into
    #[arg(long)]
    exchange: String,
    /// Number of messages to move
    #[arg(long, default_value_t = 1)]
    count: usize,
    /// Destination confirm timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONFIRM_TIMEOUT.as_secs())]
    confirm_timeout: u64,
}

impl From<ForwardArgs> for ForwardSettings {
    fn from(args: ForwardArgs) -> Self {
        ForwardSettings {
            dst_url: args.dst_url.unwrap_or_else(|| args.src_url.clone()),
            src_url: args.src_url,
            src_queue: args.queue,
            dst_exchange: args.exchange,
            count: args.count,
            confirm_timeout: std::time::Duration::from_secs(args.confirm_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let report = match Cli::parse().command {
        Commands::RetryErrors(args) => retry_error_queue(&args.into()).await?,
        Commands::Copy(args) => copy_queue(&args.into()).await?,
    };

    info!(
        forwarded = report.forwarded,
        rejected = report.rejected,
        "shovel finished"
    );

    Ok(())
}
