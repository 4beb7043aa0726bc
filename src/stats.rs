use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Process-wide OS packet counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketStats {
    pub packets_send: i64,
    pub packets_received: i64,
    pub packets_dropped_in: i64,
    pub packets_dropped_out: i64,
}

impl PacketStats {
    /// Samples the counters. Unreadable counters are reported as zeros.
    pub fn sample() -> Self {
        match std::fs::read_to_string(PROC_NET_DEV)
            .context("reading /proc/net/dev")
            .and_then(|s| parse_net_dev(&s))
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "packet counters unavailable, using zeros");
                Self::default()
            }
        }
    }
}

/// Field-wise `b - a`. Wrapped counters give negative values.
pub fn diff(a: &PacketStats, b: &PacketStats) -> PacketStats {
    PacketStats {
        packets_send: b.packets_send.wrapping_sub(a.packets_send),
        packets_received: b.packets_received.wrapping_sub(a.packets_received),
        packets_dropped_in: b.packets_dropped_in.wrapping_sub(a.packets_dropped_in),
        packets_dropped_out: b.packets_dropped_out.wrapping_sub(a.packets_dropped_out),
    }
}

/// Sums every interface of a `/proc/net/dev` dump.
pub fn parse_net_dev(contents: &str) -> Result<PacketStats> {
    let mut stats = PacketStats::default();
    // two header lines
    for line in contents.lines().skip(2) {
        let Some((_iface, counters)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<i64> = counters
            .split_whitespace()
            .map(|f| f.parse::<i64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("bad counter line {:?}", line))?;
        if fields.len() < 12 {
            return Err(anyhow!("short counter line {:?}", line));
        }
        stats.packets_received += fields[1];
        stats.packets_dropped_in += fields[3];
        stats.packets_send += fields[9];
        stats.packets_dropped_out += fields[11];
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    1    0     0          0         0   123456     100    0    2    0     0       0          0
  eth0: 9999999    2000    0    5    0     0          0         0  8888888    1500    0    7    0     0       0          0
";

    #[test]
    fn test_parse_net_dev() {
        let stats = parse_net_dev(SAMPLE).unwrap();
        assert_eq!(
            stats,
            PacketStats {
                packets_send: 1600,
                packets_received: 2100,
                packets_dropped_in: 6,
                packets_dropped_out: 9,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let bad = "h1\nh2\n  eth0: 1 2 x\n";
        assert!(parse_net_dev(bad).is_err());
    }

    #[test]
    fn test_diff_allows_negative() {
        let a = PacketStats {
            packets_send: 10,
            packets_received: 5,
            packets_dropped_in: 0,
            packets_dropped_out: 3,
        };
        let b = PacketStats {
            packets_send: 4,
            packets_received: 9,
            packets_dropped_in: 1,
            packets_dropped_out: 3,
        };
        let d = diff(&a, &b);
        assert_eq!(d.packets_send, -6);
        assert_eq!(d.packets_received, 4);
        assert_eq!(d.packets_dropped_in, 1);
        assert_eq!(d.packets_dropped_out, 0);
    }
}
