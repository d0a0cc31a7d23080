//! Derives a node's network placement from its reported address.

use std::net::{IpAddr, SocketAddr};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::config::NetworkPrefixConfig;
use crate::error::{OverlayError, OverlayResult};

/// Resolved placement of an address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedNetwork {
    /// `ip:port`, or just the IP when the address carried no port.
    pub last_ip_port: String,

    /// Address truncated to the configured prefix.
    pub last_net: String,
}

/// Resolves `address` (an `ip:port`, a bare IP, or a `host:port`) and masks
/// the IP down to its network.
///
/// # Errors
///
/// Returns a validation error when the address is empty or cannot be
/// resolved, and a configuration error when a prefix length is out of range.
pub async fn resolve_network(
    address: &str,
    prefix: NetworkPrefixConfig,
) -> OverlayResult<ResolvedNetwork> {
    let address = address.trim();
    if address.is_empty() {
        return Err(OverlayError::Validation("empty node address".to_string()));
    }

    let (ip, last_ip_port) = if let Ok(socket) = address.parse::<SocketAddr>() {
        (socket.ip(), socket.to_string())
    } else if let Ok(ip) = address.parse::<IpAddr>() {
        (ip, ip.to_string())
    } else {
        let socket = tokio::net::lookup_host(address)
            .await
            .map_err(|e| OverlayError::Validation(format!("malformed address '{address}': {e}")))?
            .next()
            .ok_or_else(|| {
                OverlayError::Validation(format!("address '{address}' resolved to nothing"))
            })?;
        (socket.ip(), socket.to_string())
    };

    Ok(ResolvedNetwork {
        last_ip_port,
        last_net: mask(ip, prefix)?,
    })
}

fn mask(ip: IpAddr, prefix: NetworkPrefixConfig) -> OverlayResult<String> {
    let bad_prefix = |e| OverlayError::Configuration(format!("network prefix: {e}"));
    Ok(match ip.to_canonical() {
        IpAddr::V4(v4) => Ipv4Net::new(v4, prefix.ipv4)
            .map_err(bad_prefix)?
            .network()
            .to_string(),
        IpAddr::V6(v6) => Ipv6Net::new(v6, prefix.ipv6)
            .map_err(bad_prefix)?
            .network()
            .to_string(),
    })
}
