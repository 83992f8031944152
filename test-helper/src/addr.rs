use std::net::{SocketAddr, TcpListener};

/// Gets a new socket address allocated by the OS.
pub fn get_unused_addr() -> SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

/// Gets a port the OS considers free on the loopback interface.
///
/// The port is released again before this returns, so there is a small
/// window where something else may grab it.
pub fn get_unused_port() -> u16 {
    get_unused_addr().port()
}

/// Gets `count` distinct free ports.
pub fn get_unused_ports(count: usize) -> Vec<u16> {
    // Hold every listener until all ports are picked so none repeat.
    let sockets = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect::<Vec<_>>();
    sockets
        .iter()
        .map(|s| s.local_addr().unwrap().port())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unused_addr() {
        let addr = get_unused_addr();
        TcpListener::bind(addr).expect("Connect to allocated address");
    }

    #[test]
    fn test_get_unused_ports_are_distinct() {
        let mut ports = get_unused_ports(4);
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }
}
