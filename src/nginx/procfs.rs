//! /proc readers for nginx process metrics
//!
//! Every reader degrades gracefully: missing or malformed files yield
//! `None`/zeroed fields, never errors.

use std::path::Path;

use crate::models::NetCounters;

/// Jiffies per second. Fixed at 100 on this platform; when the derived
/// uptime would be nonsense we report unknown instead.
const TICKS_PER_SECOND: f64 = 100.0;

pub fn read_pid(pidfile: &Path) -> Option<u32> {
    std::fs::read_to_string(pidfile)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Whether the pid from the pidfile maps to a live process.
pub fn pid_alive(pidfile: &Path) -> bool {
    match read_pid(pidfile) {
        Some(pid) => Path::new(&format!("/proc/{}", pid)).exists(),
        None => false,
    }
}

/// Seconds since the nginx master started: system uptime minus the
/// process start time from `/proc/<pid>/stat` field 22.
pub fn process_uptime_secs(pidfile: &Path) -> Option<u64> {
    let pid = read_pid(pidfile)?;
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;

    // comm (field 2) may contain spaces; fields 3+ start after the last ')'.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let start_ticks: u64 = fields.get(19)?.parse().ok()?;

    let uptime_content = std::fs::read_to_string("/proc/uptime").ok()?;
    let system_uptime: f64 = uptime_content.split_whitespace().next()?.parse().ok()?;

    let uptime = system_uptime - start_ticks as f64 / TICKS_PER_SECOND;
    if uptime < 0.0 {
        return None;
    }
    Some(uptime as u64)
}

/// RX/TX byte and packet totals for one interface from `/proc/net/dev`.
pub fn interface_counters(interface: &str) -> NetCounters {
    let content = std::fs::read_to_string("/proc/net/dev").unwrap_or_default();
    parse_net_dev(&content, interface)
}

pub(crate) fn parse_net_dev(content: &str, interface: &str) -> NetCounters {
    for line in content.lines().skip(2) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 11 {
            let name = parts[0].trim_end_matches(':');
            if name == interface {
                return NetCounters {
                    rx_bytes: parts[1].parse().unwrap_or(0),
                    rx_packets: parts[2].parse().unwrap_or(0),
                    tx_bytes: parts[9].parse().unwrap_or(0),
                    tx_packets: parts[10].parse().unwrap_or(0),
                };
            }
        }
    }
    NetCounters::default()
}

/// Render seconds as `1d 2h 3m` for the metrics event.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  140400    1850    0    0    0     0          0         0   140400    1850    0    0    0     0       0          0
  eth0: 9876543   12345    0    0    0     0          0         0  1234567    5432    0    0    0     0       0          0
";

    #[test]
    fn test_parse_net_dev_finds_interface() {
        let counters = parse_net_dev(NET_DEV, "eth0");
        assert_eq!(counters.rx_bytes, 9_876_543);
        assert_eq!(counters.rx_packets, 12_345);
        assert_eq!(counters.tx_bytes, 1_234_567);
        assert_eq!(counters.tx_packets, 5_432);
    }

    #[test]
    fn test_parse_net_dev_missing_interface_is_zeroed() {
        let counters = parse_net_dev(NET_DEV, "wlan0");
        assert_eq!(counters, NetCounters::default());
    }

    #[test]
    fn test_missing_pidfile_degrades() {
        let path = Path::new("/nonexistent/nginx.pid");
        assert_eq!(read_pid(path), None);
        assert!(!pid_alive(path));
        assert_eq!(process_uptime_secs(path), None);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(59), "0m");
        assert_eq!(format_uptime(3_660), "1h 1m");
        assert_eq!(format_uptime(90_061), "1d 1h 1m");
    }
}
