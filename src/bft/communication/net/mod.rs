//! Concrete `Transport` implementations.

pub mod loopback;
#[cfg(feature = "socket_tokio_tcp")]
pub mod tcp;

pub use loopback::{loopback_network, LoopbackTransport};
#[cfg(feature = "socket_tokio_tcp")]
pub use tcp::TcpTransport;
