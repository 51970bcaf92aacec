use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use montime_agent::{
    AGENT_VERSION,
    cloud::{CloudDetector, CloudInformation},
    collector::SystemCollector,
    config::{AgentConfig, Overrides},
    connectivity::PingProbe,
    delivery::IngestClient,
    reporter::{Reporter, ReporterHandle},
    util::{AGENT_LOG, env_lookup},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Reports host CPU, memory and disk usage to the Montime ingest endpoint
#[derive(Debug, Clone, Parser)]
#[command(version)]
struct Args {
    /// JSON config file holding the api_key (defaults to ./config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between two reports
    #[arg(short, long)]
    interval: Option<u64>,

    /// Send a single report and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let level = env_lookup(AGENT_LOG)
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);

    let filter = filter::Targets::new().with_target("montime_agent", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let overrides = Overrides {
        config_file: args.config.clone(),
        interval_secs: args.interval,
    };
    let config = AgentConfig::load(&overrides)
        .inspect_err(|e| error!("refusing to start: {e}"))
        .context("invalid agent configuration")?;

    info!("Montime agent {AGENT_VERSION} started");
    info!("ingest URL: {}", config.credential.ingest_url);
    info!("interval: {}s", config.interval.as_secs());

    let client = IngestClient::new(&config)?;

    let host = SystemCollector::host_information();
    info!(
        os_type = ?host.os_type,
        os_name = ?host.os_name,
        os_version = ?host.os_version,
        "detected host"
    );

    let cloud = if config.detect_cloud {
        CloudDetector::new()?
            .detect(SystemCollector::host_shape())
            .await
    } else {
        debug!("cloud detection disabled");
        CloudInformation::default()
    };

    let mut reporter = Reporter::new(&config, SystemCollector::new(config.cpu_window), client)
        .with_host(host)
        .with_cloud(cloud);
    if let Some(ping_host) = &config.ping_host {
        reporter = reporter.with_probe(PingProbe::new(ping_host.clone()));
    }

    if args.once {
        let outcome = reporter.tick().await;
        info!(outcome = outcome.kind(), "single report finished");
        return Ok(if outcome.is_delivered() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    // installed before the first tick so an early SIGTERM is not lost
    let mut shutdown = shutdown::Signals::install()?;

    let (handle, mut task) = ReporterHandle::spawn(reporter);

    tokio::select! {
        signal = shutdown.recv() => {
            info!("received {signal}, finishing current tick");
            handle.shutdown().await?;
        }
        result = &mut task => {
            let stats = result.context("reporter task failed")?;
            anyhow::bail!("reporter stopped unexpectedly after {} ticks", stats.ticks);
        }
    }

    let stats = task.await.context("reporter task failed")?;
    info!(
        ticks = stats.ticks,
        delivered = stats.delivered,
        "agent stopped"
    );

    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
mod shutdown {
    use anyhow::Context;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    pub struct Signals {
        terminate: Signal,
        interrupt: Signal,
    }

    impl Signals {
        pub fn install() -> anyhow::Result<Self> {
            Ok(Self {
                terminate: signal(SignalKind::terminate())
                    .context("failed to install SIGTERM handler")?,
                interrupt: signal(SignalKind::interrupt())
                    .context("failed to install SIGINT handler")?,
            })
        }

        /// Wait for SIGTERM or SIGINT and return its name.
        pub async fn recv(&mut self) -> &'static str {
            tokio::select! {
                _ = self.terminate.recv() => "SIGTERM",
                _ = self.interrupt.recv() => "SIGINT",
            }
        }
    }
}

#[cfg(not(unix))]
mod shutdown {
    pub struct Signals;

    impl Signals {
        pub fn install() -> anyhow::Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) -> &'static str {
            match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                Err(_) => std::future::pending().await,
            }
        }
    }
}
