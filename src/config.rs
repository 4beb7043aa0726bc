use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, value_parser};
use core::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const ZOOKEEPER_CLIENT_PORT: u16 = 2181;
pub const DEFAULT_BUS_ROOT: &str = "/testbench";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default for both the UDP boot port and the streaming TCP ports.
pub const DEFAULT_PORT: u16 = 8081;
pub const FIRST_BOOT_TIMEOUT: Duration = Duration::from_secs(20);
pub const RESET_BOOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BusSettings {
    /// `host:port` of a ZooKeeper server.
    pub zookeeper: String,
    pub root: String,
    pub poll_interval: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            zookeeper: format!("127.0.0.1:{}", ZOOKEEPER_CLIENT_PORT),
            root: DEFAULT_BUS_ROOT.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl BusSettings {
    pub fn args() -> Vec<Arg> {
        vec![
            Arg::new("zookeeper")
                .long("zookeeper")
                .env("TESTBENCH_ZOOKEEPER")
                .help("ZooKeeper address (host:port) backing the message bus"),
            Arg::new("bus-root")
                .long("bus-root")
                .env("TESTBENCH_BUS_ROOT")
                .help("ZooKeeper path under which topics live"),
            Arg::new("poll-ms")
                .long("poll-ms")
                .value_parser(value_parser!(u64))
                .help("How often subscriptions poll for new messages"),
        ]
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        let mut settings = Self::default();
        if let Some(zk) = matches.get_one::<String>("zookeeper") {
            settings.zookeeper = zk.clone();
        }
        if let Some(root) = matches.get_one::<String>("bus-root") {
            settings.root = root.clone();
        }
        if let Some(ms) = matches.get_one::<u64>("poll-ms") {
            settings.poll_interval = Duration::from_millis(*ms);
        }
        settings
    }
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// UDP address the boot beacon is expected on.
    pub boot_listen: SocketAddr,
    pub first_boot_timeout: Duration,
    pub reset_boot_timeout: Duration,
    /// Prepended to VM instance names when non-empty.
    pub instance_prefix: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            boot_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            first_boot_timeout: FIRST_BOOT_TIMEOUT,
            reset_boot_timeout: RESET_BOOT_TIMEOUT,
            instance_prefix: String::new(),
        }
    }
}

impl ControlSettings {
    pub fn args() -> Vec<Arg> {
        vec![
            Arg::new("boot-listen")
                .long("boot-listen")
                .value_parser(value_parser!(SocketAddr))
                .help("UDP address to wait for the boot beacon on"),
            Arg::new("first-boot-timeout")
                .long("first-boot-timeout")
                .value_parser(value_parser!(f64))
                .help("Seconds to wait for the first boot beacon"),
            Arg::new("reset-boot-timeout")
                .long("reset-boot-timeout")
                .value_parser(value_parser!(f64))
                .help("Seconds to wait for the boot beacon after a reset"),
            Arg::new("instance-prefix")
                .long("instance-prefix")
                .env("TESTBENCH_INSTANCE_PREFIX")
                .help("Prefix for VM instance names"),
        ]
    }

    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(addr) = matches.get_one::<SocketAddr>("boot-listen") {
            settings.boot_listen = *addr;
        }
        if let Some(secs) = matches.get_one::<f64>("first-boot-timeout") {
            settings.first_boot_timeout =
                Duration::try_from_secs_f64(*secs).context("bad --first-boot-timeout")?;
        }
        if let Some(secs) = matches.get_one::<f64>("reset-boot-timeout") {
            settings.reset_boot_timeout =
                Duration::try_from_secs_f64(*secs).context("bad --reset-boot-timeout")?;
        }
        if let Some(prefix) = matches.get_one::<String>("instance-prefix") {
            settings.instance_prefix = prefix.clone();
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// TCP address the unit under test connects to.
    pub listen: SocketAddr,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        }
    }
}

impl StreamSettings {
    pub fn args() -> Vec<Arg> {
        vec![
            Arg::new("listen")
                .long("listen")
                .value_parser(value_parser!(SocketAddr))
                .help("TCP address to accept the unit under test on"),
        ]
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        let mut settings = Self::default();
        if let Some(addr) = matches.get_one::<SocketAddr>("listen") {
            settings.listen = *addr;
        }
        settings
    }
}

pub fn store_arg() -> Arg {
    Arg::new("store")
        .long("store")
        .env("TESTBENCH_STORE")
        .value_parser(value_parser!(PathBuf))
        .default_value("./testbench-data")
        .help("Directory holding datasets/ and results/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Command;

    fn command() -> Command {
        Command::new("test")
            .args(BusSettings::args())
            .args(ControlSettings::args())
    }

    #[test]
    fn test_defaults() {
        let matches = command().try_get_matches_from(["test"]).unwrap();
        let control = ControlSettings::from_matches(&matches).unwrap();
        assert_eq!(control.first_boot_timeout, Duration::from_secs(20));
        assert_eq!(control.reset_boot_timeout, Duration::from_secs(10));
        assert_eq!(control.boot_listen.port(), DEFAULT_PORT);
        assert_eq!(StreamSettings::default().listen.port(), 8081);
    }

    #[test]
    fn test_overrides() {
        let matches = command()
            .try_get_matches_from([
                "test",
                "--zookeeper",
                "10.0.0.1:2181",
                "--poll-ms",
                "5",
                "--reset-boot-timeout",
                "2.5",
            ])
            .unwrap();
        let bus = BusSettings::from_matches(&matches);
        assert_eq!(bus.zookeeper, "10.0.0.1:2181");
        assert_eq!(bus.poll_interval, Duration::from_millis(5));
        let control = ControlSettings::from_matches(&matches).unwrap();
        assert_eq!(control.reset_boot_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let matches = command()
            .try_get_matches_from(["test", "--first-boot-timeout=-1"])
            .unwrap();
        assert!(ControlSettings::from_matches(&matches).is_err());
    }
}
