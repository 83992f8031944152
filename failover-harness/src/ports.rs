use std::net::TcpListener;
use std::time::Duration;

use tokio::time::{sleep, Instant};

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Checks if `port` can currently be bound on the loopback interface.
pub fn test_port(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Waits for `count` consecutive ports starting at `base_port` to be free.
///
/// On timeout the ports still in use are returned.
pub async fn wait_for_free_ports(base_port: u16, count: u16, timeout: Duration) -> Result<(), Vec<u16>> {
    let ports = (0..count)
        .filter_map(|offset| base_port.checked_add(offset))
        .collect::<Vec<_>>();
    let deadline = Instant::now() + timeout;

    loop {
        let busy = ports
            .iter()
            .copied()
            .filter(|port| !test_port(*port))
            .collect::<Vec<_>>();

        if busy.is_empty() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            warn!(ports = ?busy, waited = ?timeout, "Ports are still in use.");
            return Err(busy);
        }

        debug!(ports = ?busy, "Waiting for ports to be released.");
        sleep(PORT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_busy_port_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!test_port(port));

        let busy = wait_for_free_ports(port, 1, Duration::from_millis(150))
            .await
            .expect_err("Port is held by the listener");
        assert_eq!(busy, vec![port]);

        drop(listener);
        wait_for_free_ports(port, 1, Duration::from_secs(1))
            .await
            .expect("Port is released");
        assert!(test_port(port));
    }
}
