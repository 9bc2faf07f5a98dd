//! Peer addressing and the shared HTTP client.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    #[error("address cannot be empty")]
    Empty,

    #[error("address '{0}' is missing a port")]
    MissingPort(String),

    #[error("port '{port}' out of range (0, 65535] in '{addr}'")]
    InvalidPort { addr: String, port: String },

    #[error("host '{0}' contains invalid characters")]
    InvalidHost(String),
}

/// Validate a `host:port` string, as supplied for peers and targets.
pub fn validate_host_port(addr: &str) -> Result<(), AddressError> {
    let (host, port) = split_host_port(addr)?;
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => {
            return Err(AddressError::InvalidPort {
                addr: addr.to_string(),
                port: port.to_string(),
            })
        }
    }
    validate_host(host)
}

/// Host part of `addr`, accepting bare hosts as well as `host:port`.
///
/// IPv6 literals come back without brackets.
pub fn host_of(addr: &str) -> Result<&str, AddressError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(AddressError::Empty);
    }
    let host = match split_host_port(addr) {
        Ok((host, _)) => host,
        // A bare IPv6 literal has colons but no port.
        Err(_) if addr.parse::<IpAddr>().is_ok() => addr,
        Err(_) if !addr.contains(':') => addr,
        Err(e) => return Err(e),
    };
    validate_host(host)?;
    Ok(host)
}

/// URL for `path` on the probe server of the node at `addr`.
///
/// Peer traffic always goes to the fixed `peer_port`; only the host of `addr`
/// is used.
pub fn peer_url(addr: &str, peer_port: u16, path: &str) -> Result<String, AddressError> {
    let host = host_of(addr)?;
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => host.to_string(),
    };
    Ok(format!(
        "http://{}:{}/{}",
        host,
        peer_port,
        path.trim_start_matches('/')
    ))
}

fn split_host_port(addr: &str) -> Result<(&str, &str), AddressError> {
    if addr.is_empty() {
        return Err(AddressError::Empty);
    }
    let split = addr.rsplit_once(':');
    if addr.parse::<SocketAddr>().is_ok() {
        // Bracketed IPv6 or plain IPv4.
        if let Some((host, port)) = split {
            return Ok((host.trim_start_matches('[').trim_end_matches(']'), port));
        }
    }
    match split {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => Ok((host, port)),
        Some((host, _)) if host.is_empty() => Err(AddressError::InvalidHost(addr.to_string())),
        _ => Err(AddressError::MissingPort(addr.to_string())),
    }
}

fn validate_host(host: &str) -> Result<(), AddressError> {
    if host.is_empty() {
        return Err(AddressError::Empty);
    }
    if host.starts_with('-') {
        return Err(AddressError::InvalidHost(host.to_string()));
    }
    // Allow alphanumeric, dot, hyphen, colon (IPv6)
    if host
        .chars()
        .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(AddressError::InvalidHost(host.to_string()));
    }
    Ok(())
}

/// Build the pooled client used for flood trials and dispatch calls.
///
/// System proxies are ignored: probe traffic must cross the fabric directly.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .tcp_keepalive(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .no_proxy()
        .build()
        .context("failed to build HTTP client")
}
