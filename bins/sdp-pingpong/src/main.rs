use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use sdp_config::{Config, ConfigManager};
use sdp_core::{recv_frame, send_frame, SdpConfig, SdpListener, SdpStack};
use sdp_logging::LogConfig;
use sdp_verbs::{DeviceCaps, LoopbackNetwork};

/// SDP ping-pong
///
/// Connects two stacks over an in-memory fabric, bounces framed messages
/// between them and reports round-trip latency and throughput.
#[derive(Parser, Debug)]
#[command(name = "sdp-pingpong", version, about)]
struct Args {
    /// Path to an engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Message size in bytes
    #[arg(short, long, default_value_t = 65536)]
    size: usize,

    /// Number of round trips
    #[arg(short = 'n', long, default_value_t = 1000)]
    count: u64,

    /// Override the zero-copy threshold
    #[arg(long)]
    zcopy_thresh: Option<u64>,

    /// Disable remote-read transfers
    #[arg(long)]
    no_zcopy: bool,

    /// Send without Nagle coalescing
    #[arg(long)]
    nodelay: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", SdpConfig::default().render());
        return Ok(());
    }

    let _log_guard = sdp_logging::init_logging(&LogConfig {
        level: args.log_level.clone(),
        log_dir: args.log_dir.clone(),
        file_prefix: "sdp-pingpong".into(),
        ..Default::default()
    })?;

    let mut config = match &args.config {
        Some(path) => ConfigManager::<SdpConfig>::load(path)
            .with_context(|| format!("loading {}", path.display()))?
            .snapshot(),
        None => SdpConfig::default(),
    };
    if let Some(thresh) = args.zcopy_thresh {
        config.zcopy_thresh = thresh;
    }
    if args.no_zcopy {
        config.zcopy_enabled = false;
    }
    config.nodelay |= args.nodelay;
    config.check().context("invalid configuration")?;

    let net = LoopbackNetwork::new();
    let server_dev = net.add_device("lo-srv", [10, 0, 0, 1].into(), DeviceCaps::default());
    let client_dev = net.add_device("lo-cli", [10, 0, 0, 2].into(), DeviceCaps::default());
    let server = SdpStack::new(server_dev, config.clone())?;
    let client = SdpStack::new(client_dev, config)?;

    let bind: SocketAddr = "10.0.0.1:0".parse()?;
    let listener = server.listen(bind, 16)?;
    let addr = listener.local_addr();
    tracing::info!(%addr, size = args.size, count = args.count, "starting ping-pong");

    let echo = tokio::spawn(echo(listener));

    let socket = client.connect(addr).await?;
    let payload: Vec<u8> = (0..args.size).map(|i| i as u8).collect();

    let start = Instant::now();
    for i in 0..args.count {
        send_frame(&socket, &payload).await?;
        let Some(reply) = recv_frame(&socket).await? else {
            bail!("server closed after {i} round trips");
        };
        if reply.len() != payload.len() || reply[..] != payload[..] {
            bail!("round trip {i} returned corrupted data");
        }
    }
    let elapsed = start.elapsed();

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let bytes = 2.0 * args.size as f64 * args.count as f64;
    let rtt_us = elapsed.as_micros() as f64 / args.count.max(1) as f64;
    tracing::info!(
        round_trips = args.count,
        elapsed_ms = elapsed.as_millis() as u64,
        rtt_us = format!("{rtt_us:.1}"),
        mib_per_sec = format!("{:.1}", bytes / secs / (1024.0 * 1024.0)),
        "ping-pong finished"
    );
    println!("{}", serde_json::to_string_pretty(&socket.stats())?);

    socket.close();
    let echoed = echo.await??;
    tracing::info!(echoed, "server done");

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// Accept one connection and echo frames until the peer closes.
async fn echo(listener: SdpListener) -> anyhow::Result<u64> {
    let socket = listener.accept().await?;
    let mut frames = 0;
    while let Some(frame) = recv_frame(&socket).await? {
        send_frame(&socket, &frame).await?;
        frames += 1;
    }
    Ok(frames)
}
