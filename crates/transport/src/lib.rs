//! wxpush Transport - framing and stream connectors
//!
//! This crate provides:
//! - TCP stream framer with two-phase packet sizing
//! - UDP datagram framer with MTU-bounded record batching
//! - Plain TCP and SSH `direct-tcpip` connectors
//! - Reconnect policy that stops on fatal errors

mod connector;
mod ssh;
mod tcp_framer;
mod udp;

pub use connector::*;
pub use ssh::*;
pub use tcp_framer::*;
pub use udp::*;
