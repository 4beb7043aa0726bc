use anyhow::{Context, Result, anyhow};
use core::net::SocketAddr;
use hostname;
use tokio::net::lookup_host;

pub fn my_name() -> Result<String> {
    Ok(hostname::get()?.to_string_lossy().to_string())
}

/// `host:port`, bracketing bare IPv6 hosts.
pub fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Resolves `host:port` to the first address returned.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let target = endpoint(host, port);
    lookup_host(&target)
        .await
        .with_context(|| format!("resolving {}", target))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no addresses", target))
}

/// Label-safe form of an address: dots and colons become dashes.
pub fn encode_ip(addr: &str) -> String {
    addr.replace(['.', ':'], "-")
}
