//! Port probing: check availability by attempting and immediately releasing
//! a transient bind. Catches listeners this process does not track (stale
//! servers from a previous run), which the registry alone cannot see.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::debug;

use crate::config::MIN_PORT;
use crate::error::ProbeError;

/// Check whether `port` is currently bound by anyone on this host.
///
/// Binds all interfaces, matching what server instances do, so a listener on
/// any interface counts as "in use". The transient listener is dropped before
/// returning; no side effects survive the call.
pub async fn is_port_in_use(port: u16) -> Result<bool, ProbeError> {
    if port < MIN_PORT {
        return Err(ProbeError::PortOutOfRange(port));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            Ok(false)
        }
        Err(e) => {
            // AddrInUse is the expected case; anything else still means the
            // port cannot be claimed right now, so report it as occupied.
            if e.kind() != std::io::ErrorKind::AddrInUse {
                debug!(port, error = %e, "Probe bind failed with non-AddrInUse error");
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_free_port_reports_not_in_use() {
        // Grab an ephemeral port, release it, then probe it
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_port_in_use(port).await.unwrap());
    }

    #[tokio::test]
    async fn test_bound_port_reports_in_use() {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_in_use(port).await.unwrap());
        drop(listener);
    }

    #[tokio::test]
    async fn test_probe_leaves_no_listener_behind() {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_port_in_use(port).await.unwrap());
        // Probing again must succeed; the first probe released its bind
        assert!(!is_port_in_use(port).await.unwrap());
    }

    #[tokio::test]
    async fn test_privileged_port_is_an_error() {
        assert!(is_port_in_use(80).await.is_err());
        assert!(is_port_in_use(1023).await.is_err());
    }
}
