//! Jail network resolution
//!
//! A jail keeps the address warden already has for it. A jail without one
//! gets the first free IPv4 address of the configured jail range.

use super::warden::{JailAddress, Warden};
use super::JailError;
use crate::store::JailsConfig;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Addresses a jail will come up with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JailNetwork {
    pub ipv4: JailAddress,
    pub ipv6: JailAddress,
    /// Set when `ipv4` was picked from the jail range and is not yet known to warden
    pub allocated: bool,
}

/// Strip an optional `/prefix` and parse the address
fn parse_v4(s: &str) -> Result<Ipv4Addr, JailError> {
    let addr = s.split('/').next().unwrap_or("").trim();
    addr.parse()
        .map_err(|_| JailError::InvalidAddress(s.to_string()))
}

/// Network address and prefix length of `a.b.c.d/nn`
fn parse_network(s: &str) -> Result<(Ipv4Addr, u8), JailError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| JailError::InvalidAddress(s.to_string()))?;
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .map_err(|_| JailError::InvalidAddress(s.to_string()))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .ok()
        .filter(|&p| p <= 32)
        .ok_or_else(|| JailError::InvalidAddress(s.to_string()))?;
    Ok((addr, prefix))
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

/// Pick the lowest address of the configured range that is not in `used`
///
/// Returns `Ok(None)` when no IPv4 jail network is configured.
pub fn allocate_ipv4(config: &JailsConfig, used: &[Ipv4Addr]) -> Result<Option<JailAddress>, JailError> {
    let Some(network) = config.ipv4_network.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let (net_addr, prefix) = parse_network(network)?;
    let net = u32::from(net_addr) & mask(prefix);
    let broadcast = net | !mask(prefix);

    // Host range excludes network and broadcast addresses on ordinary subnets
    let (first_host, last_host) = if prefix >= 31 {
        (net, broadcast)
    } else {
        (net + 1, broadcast - 1)
    };

    let start = match config.ipv4_network_start.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(s) => u32::from(parse_v4(s)?).max(first_host),
        None => first_host,
    };
    let end = match config.ipv4_network_end.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(s) => u32::from(parse_v4(s)?).min(last_host),
        None => last_host,
    };

    let used: Vec<u32> = used.iter().map(|a| u32::from(*a)).collect();
    if start <= end {
        for candidate in start..=end {
            if !used.contains(&candidate) {
                let addr = Ipv4Addr::from(candidate);
                debug!("Allocated {} from {}", addr, network);
                return Ok(Some(JailAddress::Static {
                    addr: IpAddr::V4(addr),
                    prefix,
                }));
            }
        }
    }

    Err(JailError::NoFreeAddress {
        start: Ipv4Addr::from(start).to_string(),
        end: Ipv4Addr::from(end).to_string(),
    })
}

/// Work out the addresses `jail` should use
pub async fn resolve_network(
    warden: &Warden,
    config: &JailsConfig,
    jail: &str,
) -> Result<JailNetwork, JailError> {
    let ipv6 = warden.get_ipv6(jail).await?;
    let own = warden.get_ipv4(jail).await?;
    if own != JailAddress::None {
        return Ok(JailNetwork {
            ipv4: own,
            ipv6,
            allocated: false,
        });
    }

    let mut used = Vec::new();
    for other in warden.list().await? {
        if other.name == jail {
            continue;
        }
        if let JailAddress::Static {
            addr: IpAddr::V4(v4),
            ..
        } = warden.get_ipv4(&other.name).await?
        {
            used.push(v4);
        }
    }

    match allocate_ipv4(config, &used)? {
        Some(ipv4) => Ok(JailNetwork {
            ipv4,
            ipv6,
            allocated: true,
        }),
        None => Ok(JailNetwork {
            ipv4: JailAddress::None,
            ipv6,
            allocated: false,
        }),
    }
}
