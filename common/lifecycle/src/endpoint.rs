//! Advertised endpoints: explicit ones from configuration plus ones derived
//! from component listeners.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::component::ListenEndpoint;

/// IP of the interface that routes to the outside world. Connecting a UDP
/// socket sends no packets; it only resolves the route.
pub fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    Ok(socket.local_addr()?.ip())
}

/// `http` and `https` serve the same clients, so one covers the other.
fn scheme_family(scheme: &str) -> &str {
    match scheme {
        "https" => "http",
        other => other,
    }
}

fn endpoint_scheme(endpoint: &str) -> Option<String> {
    url::Url::parse(endpoint)
        .ok()
        .map(|u| scheme_family(u.scheme()).to_string())
}

/// Merge configured endpoints with the listeners components report.
///
/// A listener is only advertised when no configured endpoint already covers
/// its scheme family. Unspecified bind addresses (`0.0.0.0`, `::`) are
/// replaced with `host_ip`, falling back to loopback.
pub(crate) fn merge_endpoints(
    configured: &[String],
    listeners: &[ListenEndpoint],
    host_ip: impl Fn() -> Option<IpAddr>,
) -> Vec<String> {
    let mut endpoints = configured.to_vec();
    let mut covered: Vec<String> = configured.iter().filter_map(|e| endpoint_scheme(e)).collect();

    for listener in listeners {
        let family = scheme_family(&listener.scheme).to_string();
        if covered.contains(&family) {
            continue;
        }
        let ip = if listener.addr.ip().is_unspecified() {
            host_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            listener.addr.ip()
        };
        let addr = SocketAddr::new(ip, listener.addr.port());
        endpoints.push(format!("{}://{addr}", listener.scheme));
        covered.push(family);
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
    }

    fn listener(scheme: &str, addr: &str) -> ListenEndpoint {
        ListenEndpoint::new(scheme, addr.parse().unwrap())
    }

    #[test]
    fn unspecified_bind_uses_host_ip() {
        let endpoints = merge_endpoints(&[], &[listener("http", "0.0.0.0:8080")], host);
        assert_eq!(endpoints, vec!["http://10.0.0.7:8080"]);
    }

    #[test]
    fn concrete_bind_is_kept() {
        let endpoints = merge_endpoints(&[], &[listener("grpc", "192.168.1.5:9000")], host);
        assert_eq!(endpoints, vec!["grpc://192.168.1.5:9000"]);
    }

    #[test]
    fn configured_scheme_family_wins() {
        let configured = vec!["https://api.example.com:443".to_string()];
        let endpoints = merge_endpoints(
            &configured,
            &[listener("http", "0.0.0.0:8080"), listener("grpc", "0.0.0.0:9000")],
            host,
        );
        assert_eq!(
            endpoints,
            vec!["https://api.example.com:443", "grpc://10.0.0.7:9000"]
        );
    }

    #[test]
    fn one_listener_per_family() {
        let endpoints = merge_endpoints(
            &[],
            &[listener("http", "0.0.0.0:8080"), listener("http", "0.0.0.0:8081")],
            host,
        );
        assert_eq!(endpoints, vec!["http://10.0.0.7:8080"]);
    }

    #[test]
    fn missing_host_ip_falls_back_to_loopback() {
        let endpoints = merge_endpoints(&[], &[listener("http", "[::]:8080")], || None);
        assert_eq!(endpoints, vec!["http://127.0.0.1:8080"]);
    }

    #[test]
    fn ipv6_listeners_are_bracketed() {
        let endpoints = merge_endpoints(&[], &[listener("http", "[fd00::1]:8080")], host);
        assert_eq!(endpoints, vec!["http://[fd00::1]:8080"]);
    }
}
