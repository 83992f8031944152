mod addr;

pub use addr::{get_unused_addr, get_unused_port, get_unused_ports};
