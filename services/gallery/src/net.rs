//! Local network address discovery for the startup banner.

use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// First IPv4 address of a non-loopback interface, if any
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!(error = %e, "Failed to enumerate network interfaces");
            return None;
        }
    };

    first_external_ipv4(interfaces.iter().map(|iface| iface.ip()))
}

fn first_external_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
        _ => None,
    })
}

/// URL other machines on the network can use to reach the gallery
pub fn reachable_url(port: u16) -> String {
    match local_ipv4() {
        Some(ip) => format!("http://{ip}:{port}"),
        None => format!("http://localhost:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_skips_loopback_and_ipv6() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        ];
        assert_eq!(
            first_external_ipv4(addrs),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn test_only_loopback_yields_none() {
        assert_eq!(first_external_ipv4([IpAddr::V4(Ipv4Addr::LOCALHOST)]), None);
    }

    #[test]
    fn test_reachable_url_shape() {
        let url = reachable_url(19992);
        assert!(url.starts_with("http://"));
        assert!(url.ends_with(":19992"));
    }
}
