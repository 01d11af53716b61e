//! D2DP Sender
//!
//! Reads from stdin or a file and streams it to a peer over a D2DP session.

use clap::Parser;
use d2dp::{Role, Session};
use d2dp_cli::stats::{display_compact_stats, display_session_stats};
use d2dp_cli::{open_link, write_message, CliConfig, Message};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "d2dp-send")]
#[command(about = "D2DP stream sender", long_about = None)]
struct Args {
    /// Input: file path or '-' for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

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

    /// Rotate the transmit key after this many payload bytes
    #[arg(long)]
    rekey_bytes: Option<u64>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Statistics interval in seconds, 0 disables
    #[arg(long, default_value = "1")]
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

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read>> {
    if input == "-" {
        tracing::info!("Reading from stdin");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Reading from {}", input);
        Ok(Box::new(BufReader::new(File::open(input)?)))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.write_config {
        CliConfig::example().to_file(path)?;
        println!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let mut config = CliConfig::load(args.config.as_deref())?;
    if args.secret.is_some() {
        config.crypto.secret = args.secret.clone();
    }
    if args.rekey_bytes.is_some() {
        config.crypto.rekey_bytes = args.rekey_bytes;
    }

    let link = open_link(&config, args.local, args.peer)?;
    let security = config.security(Role::Initiator)?;
    let rekey_bytes = match (&security, config.crypto.rekey_bytes) {
        (Some(_), Some(bytes)) if bytes > 0 => Some(bytes),
        _ => None,
    };
    let session = Session::with_config(link, security, config.session_config()?)?;

    let mut reader = open_input(&args.input)?;
    // leave room for the message header inside the window
    let chunk_size = (session.window_size() / 4).min(64 * 1024);
    let mut buffer = vec![0u8; chunk_size];
    let mut total_bytes = 0u64;
    let mut since_rekey = 0u64;
    let start_time = Instant::now();
    let mut last_stats = Instant::now();
    let stats_interval = Duration::from_secs(args.stats);

    tracing::info!(chunk_size, "Entering main send loop...");
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::info!("End of input reached");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        write_message(&session, &Message::Data(buffer[..n].to_vec()))?;
        total_bytes += n as u64;
        since_rekey += n as u64;

        if let Some(limit) = rekey_bytes {
            if since_rekey >= limit {
                write_message(&session, &Message::KeyUpdate)?;
                since_rekey = 0;
            }
        }

        if args.stats > 0 && last_stats.elapsed() >= stats_interval {
            display_compact_stats(&session.stats(), total_bytes, start_time.elapsed());
            last_stats = Instant::now();
        }
    }

    write_message(&session, &Message::End)?;
    let stats = session.stats();
    let elapsed = start_time.elapsed();
    session.close()?;

    if args.stats > 0 {
        display_session_stats(&stats, total_bytes, elapsed);
    }
    Ok(())
}
