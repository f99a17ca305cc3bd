//! The seam between the driver and the embedded protocol engine.
//!
//! The engine is a single-threaded user-mode TCP/IP + NAT state machine
//! (it owns TCP reassembly, DHCP, DNS and TFTP state and the host sockets
//! backing guest flows). The driver never looks inside it; it only drives
//! the [`Engine`] trait from the poll thread and services the callbacks the
//! engine makes through [`EngineHost`].
//!
//! Every engine call takes the host context as an explicit argument; the
//! driver outlives the engine by construction order.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::error::NatError;

bitflags! {
    /// Poll-event set exchanged with the engine.
    ///
    /// Translated to and from host `poll(2)` flags by the poll multiplexer;
    /// the engine never sees the host representation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollFlags: u32 {
        const IN  = 1 << 0;
        const OUT = 1 << 1;
        const PRI = 1 << 2;
        const ERR = 1 << 3;
        const HUP = 1 << 4;
    }
}

/// Opaque per-timer value chosen by the engine when it creates a timer.
/// Handed back verbatim in [`Engine::timer_expired`].
pub type TimerToken = u64;

/// Handle to a timer owned by the poll thread's timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Callback surface the driver exposes to the engine.
///
/// All methods are invoked on the poll thread, from inside an [`Engine`]
/// call that was handed this context.
pub trait EngineHost {
    /// Append a host socket to the poll set for this iteration.
    ///
    /// Returns the index under which the engine may later query readiness
    /// via [`EngineHost::get_revents`], or `None` when the poll set cannot
    /// grow.
    fn add_poll(&mut self, fd: RawFd, events: PollFlags) -> Option<usize>;

    /// Translated returned events for the poll-set entry at `idx`.
    fn get_revents(&self, idx: usize) -> PollFlags;

    /// Deliver a synthesized frame toward the guest.
    ///
    /// Returns the number of bytes accepted, or -1 when the frame is
    /// refused (driver shutting down, delivery queue closed).
    fn send_packet(&mut self, frame: &[u8]) -> isize;

    /// Report a guest-triggered protocol error.
    fn guest_error(&mut self, msg: &str);

    /// Wall-clock time in nanoseconds.
    fn clock_ns(&self) -> i64;

    /// Create a parked timer carrying `token`.
    fn timer_new(&mut self, token: TimerToken) -> TimerId;

    /// Release a timer. Safe on timers that have already fired.
    fn timer_free(&mut self, id: TimerId);

    /// (Re-)arm a timer. The deadline is in milliseconds on the
    /// [`EngineHost::clock_ns`] timeline; 0 parks the timer.
    fn timer_mod(&mut self, id: TimerId, deadline_ms: u64);

    /// Engine opened a host socket. Log-only.
    fn register_poll_fd(&mut self, fd: RawFd);

    /// Engine closed a host socket. Log-only.
    fn unregister_poll_fd(&mut self, fd: RawFd);

    /// Engine has deferred work; wake the poll loop.
    fn notify(&mut self);
}

/// The single-threaded protocol engine.
///
/// All methods are called on the poll thread. Cross-thread callers reach
/// `input`, the hostfwd operations and the DNS setters through the engine
/// request queue; the driver serializes them onto this thread.
pub trait Engine: Send {
    /// Inject one Ethernet frame from the guest.
    fn input(&mut self, host: &mut dyn EngineHost, frame: &[u8]);

    /// Register interest in host sockets for the coming poll and lower
    /// `timeout_ms` to the engine's nearest internal deadline.
    fn pollfds_fill(&mut self, host: &mut dyn EngineHost, timeout_ms: &mut u32);

    /// Dispatch I/O after the poll returned. `select_error` signals that the
    /// poll primitive itself failed and readiness results are unusable.
    fn pollfds_poll(&mut self, host: &mut dyn EngineHost, select_error: bool);

    /// A timer created through [`EngineHost::timer_new`] expired.
    fn timer_expired(&mut self, host: &mut dyn EngineHost, token: TimerToken);

    /// Pin a host-port listener forwarding into the guest.
    fn add_hostfwd(
        &mut self,
        udp: bool,
        host_addr: Ipv4Addr,
        host_port: u16,
        guest_addr: Ipv4Addr,
        guest_port: u16,
    ) -> Result<(), NatError>;

    /// Remove a previously pinned forward.
    fn remove_hostfwd(&mut self, udp: bool, host_addr: Ipv4Addr, host_port: u16);

    /// Set or clear the virtual domain name handed out over DHCP.
    fn set_domain_name(&mut self, name: Option<&str>);

    /// Replace the DHCP search-domain list.
    fn set_dns_search(&mut self, domains: &[String]);

    /// Human-readable connection table for the debug info surface.
    fn connection_info(&self) -> String {
        String::new()
    }

    /// Human-readable neighbor table for the debug info surface.
    fn neighbor_info(&self) -> String {
        String::new()
    }

    /// Engine version string.
    fn version(&self) -> String {
        String::from("unknown")
    }
}

/// Configuration handed to the engine factory at construction.
///
/// The virtual topology fields are derived from the `Network` CIDR by the
/// config layer; the tuning fields are passed through from the
/// configuration store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub restricted: bool,
    pub in_enabled: bool,
    pub vnetwork: Ipv4Addr,
    pub vnetmask: Ipv4Addr,
    /// Default gateway inside the virtual network (network | 2).
    pub vhost: Ipv4Addr,
    /// First DHCP lease address (network | 15).
    pub vdhcp_start: Ipv4Addr,
    /// Virtual DNS server (network | 3).
    pub vnameserver: Ipv4Addr,

    pub in6_enabled: bool,
    pub vprefix_addr6: Ipv6Addr,
    pub vprefix_len: u8,
    pub vhost6: Ipv6Addr,
    pub vnameserver6: Ipv6Addr,

    pub vhostname: String,
    pub tftp_server_name: Option<String>,
    pub tftp_path: Option<String>,
    pub bootfile: Option<String>,
    pub vdomainname: Option<String>,
    pub vdnssearch: Vec<String>,
    pub if_mtu: u32,

    pub pass_domain: bool,
    pub dns_proxy: bool,
    pub use_host_resolver: bool,
    pub bind_ip: Option<Ipv4Addr>,
    pub alias_mode: u32,
    pub sock_rcv: Option<i32>,
    pub sock_snd: Option<i32>,
    pub tcp_rcv: Option<i32>,
    pub tcp_snd: Option<i32>,
    pub icmp_cache_limit: i32,
    pub so_max_connections: i32,
    pub localhost_reachable: bool,
}
