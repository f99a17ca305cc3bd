//! User-mode NAT driver core for guest VM networking.
//!
//! Bridges a guest's Ethernet link to the host network stack by
//! coordinating a single-threaded Slirp-style protocol engine: a poll
//! thread owns the engine and multiplexes its host sockets, a receive
//! thread delivers synthesized frames to the guest device, and the
//! guest-facing transmit and control surfaces submit work through
//! serialized request queues. The engine itself (TCP/IP, NAT, DHCP, DNS,
//! TFTP) lives behind the [`Engine`] trait and is supplied by the caller.

mod config;
mod driver;
mod engine;
mod error;
mod gso;

pub use config::{NatConfig, PortForwardRule};
pub use driver::{
    DnsConfig, GuestDevice, LinkState, NatDriver, SgBuf, Xmit, MAX_FRAME_SIZE,
};
pub use engine::{Engine, EngineConfig, EngineHost, PollFlags, TimerId, TimerToken};
pub use error::NatError;
pub use gso::{GsoDesc, GsoKind};
