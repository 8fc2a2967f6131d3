use std::str::FromStr;

use crate::error::TunnelError;

/// A single port forward: local_host:local_port -> remote_host:remote_port.
///
/// An empty `local_host` means the tunnel's default bind address applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl std::fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }
}

impl FromStr for ForwardSpec {
    type Err = TunnelError;

    /// Parse "LOCAL_HOST:LOCAL_PORT:REMOTE_HOST:REMOTE_PORT". Hosts are taken verbatim.
    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split(':').collect();
        if fields.len() != 4 {
            return Err(malformed(
                expr,
                format!("expected 4 ':'-separated fields, found {}", fields.len()),
            ));
        }

        let remote_host = fields[2];
        if remote_host.is_empty() {
            return Err(malformed(expr, "remote host is empty".to_string()));
        }

        Ok(ForwardSpec {
            local_host: fields[0].to_string(),
            local_port: parse_port(expr, fields[1])?,
            remote_host: remote_host.to_string(),
            remote_port: parse_port(expr, fields[3])?,
        })
    }
}

fn parse_port(expr: &str, field: &str) -> Result<u16, TunnelError> {
    match field.trim().parse::<u16>() {
        Ok(0) => Err(malformed(expr, "port 0 is not allowed".to_string())),
        Ok(port) => Ok(port),
        Err(_) => Err(malformed(
            expr,
            format!("'{}' is not a port number (1-65535)", field),
        )),
    }
}

fn malformed(expr: &str, reason: String) -> TunnelError {
    TunnelError::MalformedForwardSpec {
        expr: expr.to_string(),
        reason,
    }
}
