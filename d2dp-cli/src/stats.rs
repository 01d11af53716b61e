//! Statistics display and formatting

use d2dp::SessionStats;
use std::io::Write;
use std::time::Duration;

/// Scale `value` to the largest unit it reaches
fn scaled(value: u64, base: u64, units: [&str; 4]) -> String {
    let mut unit = 0;
    let mut divisor = 1;
    while unit + 1 < units.len() && value >= divisor * base {
        divisor *= base;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, units[0])
    } else {
        format!("{:.2} {}", value as f64 / divisor as f64, units[unit])
    }
}

fn format_bytes(bytes: u64) -> String {
    scaled(bytes, 1024, ["B", "KB", "MB", "GB"])
}

fn format_bandwidth(bps: u64) -> String {
    scaled(bps, 1000, ["bps", "Kbps", "Mbps", "Gbps"])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s:02}s"),
        (h, m, s) => format!("{h}h {m:02}m {s:02}s"),
    }
}

/// Payload bits per second over `elapsed`, zero before the first full millisecond
fn throughput_bps(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis() as u64;
    if millis == 0 {
        return 0;
    }
    bytes.saturating_mul(8).saturating_mul(1000) / millis
}

/// Display a session summary
pub fn display_session_stats(stats: &SessionStats, bytes: u64, elapsed: Duration) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SESSION STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Duration:   {}", format_duration(elapsed));
    println!(
        "│ Payload:    {} ({})",
        format_bytes(bytes),
        format_bandwidth(throughput_bps(bytes, elapsed))
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ DATA:       {} sent / {} received",
        stats.data_sent, stats.data_received
    );
    println!(
        "│ ACK:        {} sent / {} received ({} forced)",
        stats.acks_sent, stats.acks_received, stats.forced_acks
    );
    println!(
        "│ Dropped:    {}    RTO fires: {}",
        stats.dropped, stats.rto_fires
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &SessionStats, bytes: u64, elapsed: Duration) {
    print!(
        "\r[{:8}] {} | Rate: {} | DATA: {}/{} | RTO: {}         ",
        format_duration(elapsed),
        format_bytes(bytes),
        format_bandwidth(throughput_bps(bytes, elapsed)),
        stats.data_sent,
        stats.data_received,
        stats.rto_fires
    );

    let _ = std::io::stdout().flush();
}
