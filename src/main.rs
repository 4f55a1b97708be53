use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tunsocks::{Config, Router};

#[derive(Parser)]
#[command(
    name = "tunsocks",
    version,
    about = "Userspace packet router: TUN to SOCKS5"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,

    /// Pre-opened tun device file descriptor. Device acquisition and
    /// routing setup stay with the caller (VPN service, netns script, ...).
    #[arg(long, global = true)]
    tun_fd: Option<i32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router (default when no subcommand given)
    Run,

    /// Validate config file syntax and semantics
    Check,

    /// Print a sample config file
    GenerateConfig {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::GenerateConfig { output }) => cmd_generate(output.as_deref()),
        Some(Commands::Run) | None => cmd_run(&cli.config, cli.tun_fd).await,
    }
}

fn cmd_generate(output: Option<&str>) -> Result<()> {
    let sample = Config::sample_yaml();
    match output {
        Some(path) => {
            std::fs::write(path, sample).with_context(|| format!("cannot write {path}"))?;
            println!("sample config written to {path}");
        }
        None => print!("{sample}"),
    }
    Ok(())
}

fn cmd_check(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("config check failed for {config_path}"))?;
    println!("config ok: socks5 upstream {}", config.socks);
    Ok(())
}

async fn cmd_run(config_path: &str, tun_fd: Option<i32>) -> Result<()> {
    let config = Config::load(config_path)?;

    // RUST_LOG wins over the config file's log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone())),
        )
        .init();

    let device = open_device(tun_fd)?;

    let router = Arc::new(Router::new(config, device));

    {
        let cancel = router.cancel_token().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    {
        let router = router.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = router.cancel_token().cancelled() => break,
                    _ = interval.tick() => {
                        let s = router.snapshot();
                        info!(
                            active_tcp = s.active_tcp,
                            active_udp_associate = s.active_udp_associate,
                            total_tcp = s.total_tcp,
                            bytes_sent = s.bytes_sent,
                            bytes_received = s.bytes_received,
                            "transfer stats"
                        );
                        for flow in router.list_flows().await {
                            tracing::debug!(
                                kind = %flow.kind,
                                flow = %flow.key,
                                state = ?flow.tcp_state,
                                idle_ms = flow.idle.as_millis() as u64,
                                sent = flow.bytes_sent,
                                received = flow.bytes_received,
                                "live flow"
                            );
                        }
                    }
                }
            }
        });
    }

    router.run().await
}

#[cfg(unix)]
fn open_device(tun_fd: Option<i32>) -> Result<Arc<dyn tunsocks::tun::TunDevice>> {
    let fd = tun_fd.context("pass --tun-fd: the router does not open tun devices itself")?;
    Ok(Arc::new(tunsocks::tun::FdTun::from_raw_fd(fd)?))
}

#[cfg(not(unix))]
fn open_device(_tun_fd: Option<i32>) -> Result<Arc<dyn tunsocks::tun::TunDevice>> {
    anyhow::bail!("no tun device adapter for this platform");
}
