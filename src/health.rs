use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::tunnel::Bind;

const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Address to dial when checking a listener: wildcard binds are dialed on loopback.
fn dial_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "*" => "127.0.0.1",
        "::" | "[::]" => "::1",
        "localhost" => "127.0.0.1",
        other => other,
    }
}

fn resolve(host: &str, port: u16) -> Vec<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .unwrap_or_default()
}

/// Check if a local bind is accepting connections.
pub fn check_port(bind: &Bind) -> bool {
    resolve(dial_host(&bind.host), bind.port)
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, DIAL_TIMEOUT).is_ok())
}

/// Try to bind every address of a local bind and release it again.
///
/// The error tells a port held by another process (`AddrInUse`) apart from a host
/// address this machine does not own (`AddrNotAvailable`).
pub fn try_bind(bind: &Bind) -> io::Result<()> {
    let host = match bind.host.as_str() {
        "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    };
    // unresolvable hosts are left for ssh to report
    for addr in resolve(host, bind.port) {
        TcpListener::bind(addr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_port_is_busy_and_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let bind = Bind::new("127.0.0.1", port);
        let err = try_bind(&bind).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(check_port(&bind));
        assert!(check_port(&Bind::new("0.0.0.0", port)));
    }

    #[test]
    fn released_port_is_free() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let bind = Bind::new("127.0.0.1", port);
        assert!(try_bind(&bind).is_ok());
        assert!(!check_port(&bind));
    }

    #[test]
    fn foreign_address_is_not_available() {
        // TEST-NET-1, never assigned to a local interface
        let err = try_bind(&Bind::new("192.0.2.1", 8080)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn wildcard_dials_loopback() {
        assert_eq!(dial_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(dial_host("::"), "::1");
        assert_eq!(dial_host("10.1.2.3"), "10.1.2.3");
    }
}
