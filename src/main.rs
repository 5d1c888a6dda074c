use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use humantime_serde::re::humantime::parse_duration;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trafficctl::{Algorithm, ExecutionPolicy, RateLimitConfig, RateLimiter, RequestCoordinator, Settings};

#[derive(Parser)]
#[command(name = "trafficctl", version, about = "Client-side traffic control toolkit")]
struct Cli {
    /// JSON settings file; TRAFFICCTL_* environment variables are used otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a rate limiter with a steady stream of requests
    Simulate {
        #[arg(long, value_enum, default_value_t = AlgorithmArg::TokenBucket)]
        algorithm: AlgorithmArg,

        #[arg(long, default_value_t = 10)]
        max_requests: u32,

        #[arg(long, value_parser = parse_duration, default_value = "1s")]
        window: Duration,

        #[arg(long, default_value_t = 20)]
        requests: u32,

        #[arg(long, value_parser = parse_duration, default_value = "50ms")]
        interval: Duration,
    },
    /// Fire concurrent calls at one key and report how they were coalesced
    Coalesce {
        #[arg(long, default_value_t = 10)]
        callers: usize,

        #[arg(long, value_parser = parse_duration, default_value = "200ms")]
        latency: Duration,
    },
    /// Print the effective settings
    Settings,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::TokenBucket => Algorithm::TokenBucket,
            AlgorithmArg::SlidingWindow => Algorithm::SlidingWindow,
            AlgorithmArg::FixedWindow => Algorithm::FixedWindow,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::from_env(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load settings: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("trafficctl={}", settings.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Simulate {
            algorithm,
            max_requests,
            window,
            requests,
            interval,
        } => simulate(algorithm.into(), max_requests, window, requests, interval).await,
        Command::Coalesce { callers, latency } => coalesce(&settings, callers, latency).await,
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn simulate(algorithm: Algorithm, max_requests: u32, window: Duration, requests: u32, interval: Duration) -> Result<()> {
    let limiter = RateLimiter::new();
    let config = RateLimitConfig::new(algorithm, max_requests, window);
    tracing::info!(%algorithm, max_requests, window_ms = window.as_millis() as u64, "Simulating");

    for request in 1..=requests {
        let status = limiter.check_and_consume("simulate", &config)?;
        println!("{}", serde_json::json!({ "request": request, "status": status }));
        tokio::time::sleep(interval).await;
    }

    println!("{}", serde_json::to_string_pretty(&limiter.stats()?)?);
    Ok(())
}

async fn coalesce(settings: &Settings, callers: usize, latency: Duration) -> Result<()> {
    let coordinator = RequestCoordinator::<u64>::new();
    let executions = Arc::new(AtomicU64::new(0));
    let policy = ExecutionPolicy {
        cache_ttl: Duration::ZERO,
        ..settings.default_policy.clone()
    };

    let calls = (0..callers).map(|_| {
        let executions = Arc::clone(&executions);
        let coordinator = coordinator.clone();
        let policy = policy.clone();
        async move {
            coordinator
                .execute(
                    "coalesce",
                    move |_signal| {
                        let n = executions.fetch_add(1, Ordering::SeqCst) + 1;
                        async move {
                            tokio::time::sleep(latency).await;
                            Ok(n)
                        }
                    },
                    &policy,
                )
                .await
        }
    });

    let results = join_all(calls).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    tracing::info!(callers, succeeded, executions = executions.load(Ordering::SeqCst), "Calls settled");

    println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);
    Ok(())
}
