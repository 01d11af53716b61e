//! D2DP Receiver
//!
//! Receives a stream from a D2DP peer and writes it to stdout or a file.

use clap::Parser;
use d2dp::{Role, Session, SessionOption};
use d2dp_cli::stats::{display_compact_stats, display_session_stats};
use d2dp_cli::{open_link, read_message, CliConfig, FramingError, Message};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "d2dp-recv")]
#[command(about = "D2DP stream receiver", long_about = None)]
struct Args {
    /// Output: file path or '-' for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local bind address
    #[arg(short, long)]
    local: Option<SocketAddr>,

    /// Peer address
    #[arg(short, long)]
    peer: Option<SocketAddr>,

    /// Shared secret; overrides the configuration file
    #[arg(long)]
    secret: Option<String>,

    /// Give up when nothing arrives for this many seconds, 0 waits forever
    #[arg(long, default_value = "0")]
    idle_timeout: u64,

    /// Statistics interval in seconds, 0 disables
    #[arg(long, default_value = "0")]
    stats: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        tracing::info!("Writing to {}", output);
        Ok(Box::new(BufWriter::new(File::create(output)?)))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = CliConfig::load(args.config.as_deref())?;
    if args.secret.is_some() {
        config.crypto.secret = args.secret.clone();
    }

    let link = open_link(&config, args.local, args.peer)?;
    let security = config.security(Role::Responder)?;
    let session = Session::with_config(link, security, config.session_config()?)?;
    if args.idle_timeout > 0 {
        let millis = i32::try_from(args.idle_timeout.saturating_mul(1000)).unwrap_or(i32::MAX);
        session.set_option(SessionOption::RecvTimeout(millis))?;
    }

    let mut writer = open_output(&args.output)?;
    let max_message = session.window_size();
    let mut total_bytes = 0u64;
    let start_time = Instant::now();
    let mut last_stats = Instant::now();
    let stats_interval = Duration::from_secs(args.stats);

    tracing::info!("Waiting for data...");
    loop {
        match read_message(&session, max_message) {
            Ok(Message::Data(data)) => {
                writer.write_all(&data)?;
                total_bytes += data.len() as u64;
            }
            Ok(Message::KeyUpdate) => {
                tracing::debug!(total_bytes, "peer rotated its key");
            }
            Ok(Message::End) => {
                tracing::info!("End of stream");
                break;
            }
            Err(FramingError::Session(d2dp::Error::TimedOut)) => {
                tracing::warn!("No data for {}s, giving up", args.idle_timeout);
                break;
            }
            Err(e) => {
                writer.flush()?;
                return Err(e.into());
            }
        }

        if args.stats > 0 && last_stats.elapsed() >= stats_interval {
            display_compact_stats(&session.stats(), total_bytes, start_time.elapsed());
            last_stats = Instant::now();
        }
    }

    writer.flush()?;
    let stats = session.stats();
    let elapsed = start_time.elapsed();
    session.close()?;

    if args.stats > 0 {
        display_session_stats(&stats, total_bytes, elapsed);
    }
    Ok(())
}
