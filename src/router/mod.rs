//! Routing and target address validation
//!
//! Decides, per destination host, whether a request goes straight to the
//! target (direct) or through the encrypted tunnel, and guards the tunnel
//! path against requests that would loop back into the proxy itself or leak
//! into private address space.

use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;

/// Address validation failures; all map to a SOCKS5 general-failure reply
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("target equals the remote endpoint, refusing proxy loop")]
    DirectLoop,

    #[error("target {0} resolves to the remote endpoint, refusing proxy loop")]
    IndirectLoop(IpAddr),

    #[error("target {0} is a private or local address")]
    PrivateAddress(IpAddr),

    #[error("target {0} is IPv6 but IPv6 is disabled")]
    Ipv6Disabled(IpAddr),
}

/// Per-destination routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Dial the target from the local machine
    Direct,
    /// Carry the stream through the remote endpoint
    Tunnel,
}

/// Routes destinations and validates tunneled targets
pub struct Router {
    remote_host: String,
    remote_port: u16,
    /// Resolved at startup; used for the indirect-loop check
    remote_ip: Option<IpAddr>,
    disable_ipv6: bool,
    direct_hosts: HashSet<String>,
}

impl Router {
    pub fn new(
        remote_host: String,
        remote_port: u16,
        remote_ip: Option<IpAddr>,
        disable_ipv6: bool,
        direct_hosts: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            remote_host,
            remote_port,
            remote_ip,
            disable_ipv6,
            direct_hosts: direct_hosts.into_iter().collect(),
        }
    }

    /// Direct if the host matches the user's direct list, exactly or as a
    /// domain suffix (`example.com` also covers `www.example.com`)
    pub fn route(&self, host: &str) -> Route {
        if self.direct_hosts.contains(host) {
            return Route::Direct;
        }
        for direct in &self.direct_hosts {
            if host.len() > direct.len() + 1
                && host.ends_with(direct)
                && host.as_bytes()[host.len() - direct.len() - 1] == b'.'
            {
                return Route::Direct;
            }
        }
        Route::Tunnel
    }

    /// Reject tunneled targets that would loop or reach private space.
    ///
    /// Hostnames are only checked against the configured remote name; IP
    /// literals additionally fail on private ranges, disabled IPv6, and the
    /// remote's resolved address.
    pub fn validate(&self, host: &str, port: u16) -> Result<(), AddrError> {
        let Ok(ip) = host.parse::<IpAddr>() else {
            if host == self.remote_host && port == self.remote_port {
                return Err(AddrError::DirectLoop);
            }
            return Ok(());
        };

        if is_private_ip(&ip) {
            return Err(AddrError::PrivateAddress(ip));
        }
        if self.disable_ipv6 && ip.is_ipv6() {
            return Err(AddrError::Ipv6Disabled(ip));
        }
        if self.remote_ip == Some(ip) && port == self.remote_port {
            return Err(AddrError::IndirectLoop(ip));
        }

        Ok(())
    }
}

/// Private, loopback, link-local, or unspecified address space
/// (RFC 1918, RFC 4193, fe80::/10)
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local
            (v6.octets()[0] & 0xfe) == 0xfc
                // fe80::/10 link-local
                || (v6.octets()[0] == 0xfe && (v6.octets()[1] & 0xc0) == 0x80)
                || v6.is_loopback()
                || v6.is_unspecified()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(
            "tunnel.example".to_string(),
            8443,
            Some("203.0.113.7".parse().unwrap()),
            false,
            ["intranet.corp".to_string()],
        )
    }

    #[test]
    fn test_direct_list_matching() {
        let r = router();
        assert_eq!(r.route("intranet.corp"), Route::Direct);
        assert_eq!(r.route("wiki.intranet.corp"), Route::Direct);
        // Suffix must align on a label boundary
        assert_eq!(r.route("evilintranet.corp"), Route::Tunnel);
        assert_eq!(r.route("example.com"), Route::Tunnel);
    }

    #[test]
    fn test_direct_loop_guard() {
        let r = router();
        assert_eq!(r.validate("tunnel.example", 8443), Err(AddrError::DirectLoop));
        // Same host on another port is a legitimate target
        assert!(r.validate("tunnel.example", 443).is_ok());
        assert!(r.validate("example.com", 8443).is_ok());
    }

    #[test]
    fn test_indirect_loop_guard() {
        let r = router();
        assert!(matches!(
            r.validate("203.0.113.7", 8443),
            Err(AddrError::IndirectLoop(_))
        ));
        assert!(r.validate("203.0.113.7", 80).is_ok());
    }

    #[test]
    fn test_private_ip_rejected() {
        let r = router();
        for host in [
            "10.0.0.5",
            "172.16.1.1",
            "192.168.0.10",
            "127.0.0.1",
            "169.254.1.1",
            "0.0.0.0",
            "::1",
            "fc00::1",
            "fd12::1",
            "fe80::1",
        ] {
            assert!(
                matches!(r.validate(host, 22), Err(AddrError::PrivateAddress(_))),
                "{} should be rejected",
                host
            );
        }
        assert!(r.validate("93.184.216.34", 22).is_ok());
    }

    #[test]
    fn test_ipv6_disabled() {
        let r = Router::new("t.example".into(), 443, None, true, []);
        assert!(matches!(
            r.validate("2001:db8::1", 443),
            Err(AddrError::Ipv6Disabled(_))
        ));
        let r6 = Router::new("t.example".into(), 443, None, false, []);
        assert!(r6.validate("2001:db8::1", 443).is_ok());
    }
}
