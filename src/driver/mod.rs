//! The NAT driver core.
//!
//! Three threads cooperate around the single-threaded protocol engine:
//! the poll thread owns the engine and multiplexes its host sockets, the
//! receive thread delivers synthesized frames to the guest device, and
//! external callers (device transmit path, control plane) submit work
//! through the engine request queue. See the module docs of `poll` and
//! `recv` for the per-thread protocols.

mod poll;
mod queue;
mod recv;
mod thread;
mod timer;
mod wakeup;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread as std_thread;

use serde_json::Value;

use crate::config::NatConfig;
use crate::engine::{Engine, EngineConfig};
use crate::error::NatError;
use crate::gso::GsoDesc;
use self::poll::HostCtx;
use self::queue::{reply_pair, ReplyTx, ReqQueue};
use self::thread::{Event, ThreadCtl, ThreadState};
use self::wakeup::WakeupPipe;

/// Largest frame the driver accepts from the guest, headers included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Link state of the virtual adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    /// Link forced down across a resume until the guest renegotiates.
    DownResume,
}

impl LinkState {
    fn to_u8(self) -> u8 {
        match self {
            LinkState::Up => 0,
            LinkState::Down => 1,
            LinkState::DownResume => 2,
        }
    }

    fn from_u8(v: u8) -> LinkState {
        match v {
            1 => LinkState::Down,
            2 => LinkState::DownResume,
            _ => LinkState::Up,
        }
    }
}

/// The guest-side network device the driver delivers frames to.
///
/// `wait_receive_avail` and `receive` are called as one atomic pair, under
/// the driver's device access lock, from the receive thread only.
pub trait GuestDevice: Send + Sync {
    /// Block until the device can accept a frame. `Timeout` and
    /// `Interrupted` abandon the pending frame silently.
    fn wait_receive_avail(&self) -> Result<(), NatError>;

    /// Hand one Ethernet frame to the device.
    fn receive(&self, frame: &[u8]) -> Result<(), NatError>;
}

/// Host DNS settings pushed down by the platform notifier.
#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    /// Empty clears the engine's virtual domain name.
    pub domain_name: String,
    pub search_domains: Vec<String>,
    /// Accepted for interface completeness; nameserver promotion into the
    /// engine is not plumbed.
    pub name_servers: Vec<IpAddr>,
}

/// Frame buffer handed to the device's transmit path.
///
/// One linear segment; GSO super-frames additionally carry their
/// descriptor. Ownership moves into the engine queue on send and the frame
/// is released by the poll thread after injection.
pub struct SgBuf {
    data: Vec<u8>,
    used: usize,
    gso: Option<GsoDesc>,
}

impl SgBuf {
    /// Writable frame storage.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how much of the buffer the device filled.
    pub fn set_used(&mut self, used: usize) {
        assert!(used <= self.data.len());
        self.used = used;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.data.len()
    }

    pub fn gso(&self) -> Option<&GsoDesc> {
        self.gso.as_ref()
    }
}

/// Frame destined for the guest, queued for the receive thread.
pub(crate) struct RecvJob {
    pub frame: Vec<u8>,
}

/// Port-forward command, parsed on the poll thread (or inline when the
/// poll thread is stopped).
pub(crate) struct HostfwdCmd {
    pub remove: bool,
    pub udp: bool,
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub guest_ip: Option<String>,
    pub guest_port: u16,
}

/// Deferred call for the poll thread.
pub(crate) enum EngineJob {
    SendFrame(SgBuf),
    LinkChange(LinkState, Option<ReplyTx>),
    Hostfwd(HostfwdCmd, Option<ReplyTx>),
    DnsChange(DnsConfig, Option<ReplyTx>),
    Info(mpsc::SyncSender<String>),
}

impl EngineJob {
    pub(crate) fn run(self, engine: &mut dyn Engine, host: &mut HostCtx) {
        match self {
            EngineJob::SendFrame(sg) => send_worker(engine, host, sg),
            EngineJob::LinkChange(state, reply) => {
                link_changed_worker(&host.shared, state);
                if let Some(reply) = reply {
                    reply.complete(Ok(()));
                }
            }
            EngineJob::Hostfwd(cmd, reply) => {
                let status = apply_hostfwd(engine, host.shared.guest_ip, &cmd);
                match reply {
                    Some(reply) => reply.complete(status),
                    None => {
                        if let Err(err) = status {
                            tracing::warn!(error = %err, "port forward command failed");
                        }
                    }
                }
            }
            EngineJob::DnsChange(dns, reply) => {
                dns_changed_worker(engine, &dns);
                if let Some(reply) = reply {
                    reply.complete(Ok(()));
                }
            }
            EngineJob::Info(tx) => {
                let _ = tx.send(render_info(engine));
            }
        }
    }
}

/// Inject one outbound frame into the engine, expanding GSO super-frames
/// into wire-sized frames first. Consumes (frees) the buffer.
fn send_worker(engine: &mut dyn Engine, host: &mut HostCtx, sg: SgBuf) {
    if host.shared.link_state() != LinkState::Up {
        return;
    }

    match sg.gso {
        None => engine.input(host, &sg.data[..sg.used]),
        Some(desc) => {
            // Frames with inconsistent descriptors are dropped whole.
            if !desc.is_valid(sg.used) {
                tracing::debug!(used = sg.used, "dropping frame with invalid gso descriptor");
                return;
            }
            let count = desc.segment_count(sg.used);
            let mut wire = vec![0u8; MAX_FRAME_SIZE];
            for idx in 0..count {
                let len = desc.carve(&sg.data[..sg.used], idx, count, &mut wire);
                engine.input(host, &wire[..len]);
            }
        }
    }
}

/// Apply the new link state. Runs on the poll thread.
pub(crate) fn link_changed_worker(shared: &Shared, state: LinkState) {
    shared.set_link_state(state);
    shared.set_link_want(state);
    match state {
        LinkState::Up => tracing::info!("nat: link up"),
        LinkState::Down | LinkState::DownResume => tracing::info!("nat: link down"),
    }
}

/// Resolve addresses and apply one port-forward command to the engine.
///
/// A missing or unparseable host address binds the wildcard; a missing
/// guest address targets the configured guest (the construction-time rule
/// parser instead falls back to the wildcard).
fn apply_hostfwd(
    engine: &mut dyn Engine,
    guest_default: Ipv4Addr,
    cmd: &HostfwdCmd,
) -> Result<(), NatError> {
    let host_ip: Ipv4Addr = cmd
        .host_ip
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let guest_ip: Ipv4Addr = cmd
        .guest_ip
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(guest_default);

    if cmd.remove {
        engine.remove_hostfwd(cmd.udp, host_ip, cmd.host_port);
        Ok(())
    } else {
        engine.add_hostfwd(cmd.udp, host_ip, cmd.host_port, guest_ip, cmd.guest_port)
    }
}

fn dns_changed_worker(engine: &mut dyn Engine, dns: &DnsConfig) {
    tracing::info!("nat: dns settings changed, updating engine");
    if dns.domain_name.is_empty() {
        engine.set_domain_name(None);
    } else {
        engine.set_domain_name(Some(&dns.domain_name));
    }
    engine.set_dns_search(&dns.search_domains);
    if !dns.name_servers.is_empty() {
        tracing::debug!(
            count = dns.name_servers.len(),
            "nameserver entries not forwarded to the engine"
        );
    }
}

fn render_info(engine: &dyn Engine) -> String {
    format!(
        "Connection info:\n{}\nNeighbor info:\n{}\nVersion: {}\n",
        engine.connection_info(),
        engine.neighbor_info(),
        engine.version()
    )
}

/// State shared between the driver handle and its threads.
pub(crate) struct Shared {
    pub wakeup: WakeupPipe,
    /// The engine slot. The poll thread holds the lock for its whole
    /// RUNNING phase; control-plane calls take it inline only while the
    /// poll thread is stopped.
    pub engine: Mutex<Option<Box<dyn Engine>>>,
    pub q_engine: ReqQueue<EngineJob>,
    pub q_recv: ReqQueue<RecvJob>,
    pub recv_event: Event,
    pub poll_ctl: ThreadCtl,
    pub recv_ctl: ThreadCtl,
    /// Inbound frames handed to the receive queue but not yet delivered.
    pub c_pkts: AtomicU32,
    /// Written only by the poll thread.
    link_state: AtomicU8,
    /// Written by any thread; reconciled by the poll thread on cold start.
    link_want: AtomicU8,
    pub dev_access_lock: Mutex<()>,
    pub device: Arc<dyn GuestDevice>,
    /// Default target for runtime port-forward commands without a guest
    /// address: the first DHCP lease.
    pub guest_ip: Ipv4Addr,
}

impl Shared {
    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link_state.load(Ordering::SeqCst))
    }

    pub fn set_link_state(&self, state: LinkState) {
        self.link_state.store(state.to_u8(), Ordering::SeqCst);
    }

    pub fn link_want(&self) -> LinkState {
        LinkState::from_u8(self.link_want.load(Ordering::SeqCst))
    }

    pub fn set_link_want(&self, state: LinkState) {
        self.link_want.store(state.to_u8(), Ordering::SeqCst);
    }
}

/// The user-mode NAT driver.
///
/// Construction wires the engine, queues and threads together but leaves
/// both threads parked; [`NatDriver::start`] begins service. Dropping the
/// driver terminates both threads, draining queued inbound deliveries
/// first, then tears down the engine.
pub struct NatDriver {
    shared: Arc<Shared>,
    xmit_lock: Mutex<()>,
    poll_thread: Option<std_thread::JoinHandle<()>>,
    recv_thread: Option<std_thread::JoinHandle<()>>,
}

impl NatDriver {
    /// Build a driver from a configuration-store node.
    pub fn new<F>(cfg: &Value, engine_factory: F, device: Arc<dyn GuestDevice>) -> Result<Self, NatError>
    where
        F: FnOnce(&EngineConfig) -> Result<Box<dyn Engine>, NatError>,
    {
        let config = NatConfig::from_value(cfg)?;
        Self::with_config(&config, engine_factory, device)
    }

    /// Build a driver from an already parsed configuration.
    pub fn with_config<F>(
        config: &NatConfig,
        engine_factory: F,
        device: Arc<dyn GuestDevice>,
    ) -> Result<Self, NatError>
    where
        F: FnOnce(&EngineConfig) -> Result<Box<dyn Engine>, NatError>,
    {
        let engine_cfg = config.engine_config();
        tracing::debug!(
            network = %engine_cfg.vnetwork,
            netmask = %engine_cfg.vnetmask,
            "instantiating nat engine"
        );

        let mut engine = engine_factory(&engine_cfg)?;

        // Construction-time port forwards are applied inline; the poll
        // thread does not exist yet.
        for rule in &config.port_forwards {
            engine
                .add_hostfwd(
                    rule.udp,
                    rule.bind_ip,
                    rule.host_port as u16,
                    rule.guest_ip,
                    rule.guest_port as u16,
                )
                .map_err(|err| {
                    NatError::RedirSetup(format!(
                        "redirection of host port {} to guest port {} failed \
                         (conflict with existing services or rules?): {err}",
                        rule.host_port, rule.guest_port
                    ))
                })?;
        }

        let shared = Arc::new(Shared {
            wakeup: WakeupPipe::new()?,
            engine: Mutex::new(Some(engine)),
            q_engine: ReqQueue::new(),
            q_recv: ReqQueue::new(),
            recv_event: Event::new(),
            poll_ctl: ThreadCtl::new(),
            recv_ctl: ThreadCtl::new(),
            c_pkts: AtomicU32::new(0),
            link_state: AtomicU8::new(LinkState::Up.to_u8()),
            link_want: AtomicU8::new(LinkState::Up.to_u8()),
            dev_access_lock: Mutex::new(()),
            device,
            guest_ip: engine_cfg.vdhcp_start,
        });

        let recv_thread = std_thread::Builder::new()
            .name("vmnat-rx".into())
            .spawn({
                let shared = shared.clone();
                move || recv::recv_thread_main(shared)
            })
            .map_err(NatError::Io)?;

        let poll_thread = std_thread::Builder::new()
            .name("vmnat-poll".into())
            .spawn({
                let shared = shared.clone();
                move || poll::poll_thread_main(shared)
            })
            .map_err(NatError::Io)?;

        Ok(Self {
            shared,
            xmit_lock: Mutex::new(()),
            poll_thread: Some(poll_thread),
            recv_thread: Some(recv_thread),
        })
    }

    /// Move both threads into service.
    pub fn start(&self) {
        self.shared.recv_ctl.set(ThreadState::Running);
        self.shared.poll_ctl.set(ThreadState::Running);
        tracing::debug!("nat driver started");
    }

    /// Current link state of the virtual adapter.
    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    /// Enter the transmit path. Fails with `TryAgain` under contention; the
    /// device retries. The returned guard is the transmit lock.
    pub fn begin_xmit(&self) -> Result<Xmit<'_>, NatError> {
        match self.xmit_lock.try_lock() {
            Ok(guard) => Ok(Xmit {
                driver: self,
                _guard: guard,
            }),
            Err(TryLockError::WouldBlock) => Err(NatError::TryAgain),
            Err(TryLockError::Poisoned(_)) => Err(NatError::TryAgain),
        }
    }

    /// Promiscuous mode has no meaning behind NAT; recorded for tracing.
    pub fn set_promiscuous(&self, enabled: bool) {
        tracing::trace!(enabled, "promiscuous mode ignored");
    }

    /// Report a link-state change.
    ///
    /// While the poll thread is stopped only the wanted state is recorded;
    /// the poll thread reconciles it when it next starts. Otherwise the
    /// change trampolines to the poll thread and this call blocks until it
    /// has been applied.
    pub fn notify_link_changed(&self, state: LinkState) {
        tracing::debug!(?state, "link change requested");
        if !self.shared.poll_ctl.is_running() {
            self.shared.set_link_want(state);
            return;
        }

        let (tx, rx) = reply_pair();
        match self
            .shared
            .q_engine
            .push(EngineJob::LinkChange(state, Some(tx)))
        {
            Ok(()) => {
                self.shared.wakeup.signal();
                let _ = rx.wait();
            }
            // The poll thread stopped between the check and the enqueue.
            Err(_) => self.shared.set_link_want(state),
        }
    }

    /// Add or remove a port-forward rule at runtime.
    ///
    /// Executes inline when the poll thread is stopped, otherwise on the
    /// poll thread with this call blocking on the outcome.
    pub fn redirect_rule(
        &self,
        remove: bool,
        udp: bool,
        host_ip: Option<&str>,
        host_port: u16,
        guest_ip: Option<&str>,
        guest_port: u16,
    ) -> Result<(), NatError> {
        tracing::debug!(remove, udp, host_port, guest_port, "redirect rule command");
        let cmd = HostfwdCmd {
            remove,
            udp,
            host_ip: host_ip.map(str::to_owned),
            host_port,
            guest_ip: guest_ip.map(str::to_owned),
            guest_port,
        };

        if !self.shared.poll_ctl.is_running() {
            let mut slot = self.shared.engine.lock().expect("engine mutex poisoned");
            let Some(engine) = slot.as_mut() else {
                return Err(NatError::NetDown);
            };
            return apply_hostfwd(engine.as_mut(), self.shared.guest_ip, &cmd);
        }

        let (tx, rx) = reply_pair();
        match self.shared.q_engine.push(EngineJob::Hostfwd(cmd, Some(tx))) {
            Ok(()) => {
                self.shared.wakeup.signal();
                rx.wait()
            }
            Err(_) => Err(NatError::NetDown),
        }
    }

    /// Push updated host DNS settings into the engine.
    pub fn notify_dns_changed(&self, dns: &DnsConfig) {
        if !self.shared.poll_ctl.is_running() {
            let mut slot = self.shared.engine.lock().expect("engine mutex poisoned");
            if let Some(engine) = slot.as_mut() {
                dns_changed_worker(engine.as_mut(), dns);
            }
            return;
        }

        let (tx, rx) = reply_pair();
        if self
            .shared
            .q_engine
            .push(EngineJob::DnsChange(dns.clone(), Some(tx)))
            .is_ok()
        {
            self.shared.wakeup.signal();
            let _ = rx.wait();
        }
    }

    /// Render engine connection state, neighbor table and version for the
    /// debug info surface.
    pub fn info_string(&self) -> String {
        if self.shared.poll_ctl.is_running() {
            let (tx, rx) = mpsc::sync_channel(1);
            if self.shared.q_engine.push(EngineJob::Info(tx)).is_ok() {
                self.shared.wakeup.signal();
                if let Ok(info) = rx.recv() {
                    return info;
                }
            }
        }
        let slot = self.shared.engine.lock().expect("engine mutex poisoned");
        match slot.as_ref() {
            Some(engine) => render_info(engine.as_ref()),
            None => String::from("engine not available\n"),
        }
    }

    fn stop_threads(&mut self) {
        // Thread shutdown precedes every other teardown step: flip the
        // state, deliver the wakeup, join.
        self.shared.poll_ctl.set(ThreadState::Terminating);
        self.shared.wakeup.signal();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }

        self.shared.recv_ctl.set(ThreadState::Terminating);
        self.shared.recv_event.signal();
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }

        // Engine teardown closes all its host sockets.
        *self.shared.engine.lock().expect("engine mutex poisoned") = None;

        self.shared.q_engine.close();
        self.shared.q_recv.close();
        // Jobs the poll thread never reached: frames are freed here, reply
        // waiters (if any) read the dropped handle as interrupted.
        drop(self.shared.q_engine.drain());
        drop(self.shared.q_recv.drain());
    }
}

impl Drop for NatDriver {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

/// Active transmit section. Holds the transmit lock; dropping the guard is
/// `end_xmit`.
pub struct Xmit<'a> {
    driver: &'a NatDriver,
    _guard: MutexGuard<'a, ()>,
}

impl Xmit<'_> {
    /// Allocate a frame buffer of at least `min` bytes.
    ///
    /// Refused while the poll thread is not running. Plain frames of
    /// `MAX_FRAME_SIZE` or more are rejected outright; GSO frames are
    /// rejected when one carved segment could reach `MAX_FRAME_SIZE`.
    pub fn alloc_buf(&self, min: usize, gso: Option<&GsoDesc>) -> Result<SgBuf, NatError> {
        if !self.driver.shared.poll_ctl.is_running() {
            tracing::debug!("frame dropped, poll thread not running");
            return Err(NatError::NetDown);
        }

        if let Some(desc) = gso {
            if desc.hdrs_total + desc.max_seg >= MAX_FRAME_SIZE {
                tracing::debug!(
                    hdrs_total = desc.hdrs_total,
                    max_seg = desc.max_seg,
                    "dropping oversized gso frame"
                );
                return Err(NatError::InvalidParameter(String::from(
                    "gso segment exceeds the frame size limit",
                )));
            }
            Ok(SgBuf {
                data: vec![0; align_up(min, 128)],
                used: 0,
                gso: Some(*desc),
            })
        } else {
            if min >= MAX_FRAME_SIZE {
                tracing::debug!(min, "dropping oversized frame");
                return Err(NatError::InvalidParameter(String::from(
                    "frame exceeds the size limit",
                )));
            }
            Ok(SgBuf {
                data: vec![0; align_up(min, 128)],
                used: 0,
                gso: None,
            })
        }
    }

    /// Queue a filled buffer for injection into the engine.
    ///
    /// The buffer is consumed on every path; on failure it is freed here.
    pub fn send_buf(&self, sg: SgBuf) -> Result<(), NatError> {
        let shared = &self.driver.shared;
        if !shared.poll_ctl.is_running() || shared.link_state() != LinkState::Up {
            return Err(NatError::NetDown);
        }
        match shared.q_engine.push(EngineJob::SendFrame(sg)) {
            Ok(()) => {
                shared.wakeup.signal();
                Ok(())
            }
            Err(_sg) => Err(NatError::NoBufferSpace),
        }
    }

    /// Release an unsent buffer.
    pub fn free_buf(&self, sg: SgBuf) {
        drop(sg);
    }

    /// Leave the transmit section, releasing the transmit lock.
    pub fn end_xmit(self) {}
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineHost, TimerToken};
    use crate::gso::GsoKind;
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct EngineLog {
        inputs: Vec<Vec<u8>>,
        hostfwd_adds: Vec<(bool, Ipv4Addr, u16, Ipv4Addr, u16)>,
        hostfwd_removes: Vec<(bool, Ipv4Addr, u16)>,
        domain_name: Option<Option<String>>,
        dns_search: Vec<String>,
        timers_fired: Vec<TimerToken>,
    }

    struct MockEngine {
        log: Arc<Mutex<EngineLog>>,
        /// Echo every input frame back toward the guest.
        echo: bool,
        reject_hostfwd: bool,
        /// Arm a short timer on the first fill pass.
        arm_timer_ms: Option<u64>,
        armed: bool,
    }

    impl MockEngine {
        fn new(log: Arc<Mutex<EngineLog>>) -> Self {
            Self {
                log,
                echo: false,
                reject_hostfwd: false,
                arm_timer_ms: None,
                armed: false,
            }
        }
    }

    impl Engine for MockEngine {
        fn input(&mut self, host: &mut dyn EngineHost, frame: &[u8]) {
            self.log.lock().unwrap().inputs.push(frame.to_vec());
            if self.echo {
                host.send_packet(frame);
            }
        }

        fn pollfds_fill(&mut self, host: &mut dyn EngineHost, _timeout_ms: &mut u32) {
            if let Some(delay) = self.arm_timer_ms {
                if !self.armed {
                    self.armed = true;
                    let id = host.timer_new(42);
                    let now_ms = (host.clock_ns() / 1_000_000) as u64;
                    host.timer_mod(id, now_ms + delay);
                }
            }
        }

        fn pollfds_poll(&mut self, _host: &mut dyn EngineHost, _select_error: bool) {}

        fn timer_expired(&mut self, _host: &mut dyn EngineHost, token: TimerToken) {
            self.log.lock().unwrap().timers_fired.push(token);
        }

        fn add_hostfwd(
            &mut self,
            udp: bool,
            host_addr: Ipv4Addr,
            host_port: u16,
            guest_addr: Ipv4Addr,
            guest_port: u16,
        ) -> Result<(), NatError> {
            if self.reject_hostfwd {
                return Err(NatError::RedirSetup(String::from("listen failed")));
            }
            self.log
                .lock()
                .unwrap()
                .hostfwd_adds
                .push((udp, host_addr, host_port, guest_addr, guest_port));
            Ok(())
        }

        fn remove_hostfwd(&mut self, udp: bool, host_addr: Ipv4Addr, host_port: u16) {
            self.log
                .lock()
                .unwrap()
                .hostfwd_removes
                .push((udp, host_addr, host_port));
        }

        fn set_domain_name(&mut self, name: Option<&str>) {
            self.log.lock().unwrap().domain_name = Some(name.map(str::to_owned));
        }

        fn set_dns_search(&mut self, domains: &[String]) {
            self.log.lock().unwrap().dns_search = domains.to_vec();
        }

        fn connection_info(&self) -> String {
            String::from("0 flows")
        }

        fn version(&self) -> String {
            String::from("mock 1.0")
        }
    }

    #[derive(Default)]
    struct MockDevice {
        received: Mutex<Vec<Vec<u8>>>,
        receive_delay: Option<Duration>,
    }

    impl GuestDevice for MockDevice {
        fn wait_receive_avail(&self) -> Result<(), NatError> {
            Ok(())
        }

        fn receive(&self, frame: &[u8]) -> Result<(), NatError> {
            if let Some(delay) = self.receive_delay {
                std_thread::sleep(delay);
            }
            self.received.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std_thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn build_driver(
        customize: impl FnOnce(&mut MockEngine),
        device: Arc<MockDevice>,
    ) -> (NatDriver, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let factory_log = log.clone();
        let driver = NatDriver::new(
            &json!({ "Network": "10.0.2.0/24" }),
            move |_cfg| {
                let mut engine = MockEngine::new(factory_log);
                customize(&mut engine);
                Ok(Box::new(engine) as Box<dyn Engine>)
            },
            device,
        )
        .unwrap();
        (driver, log)
    }

    fn running_driver() -> (NatDriver, Arc<Mutex<EngineLog>>) {
        let (driver, log) = build_driver(|_| {}, Arc::new(MockDevice::default()));
        driver.start();
        (driver, log)
    }

    #[test]
    fn test_basic_outbound_frame() {
        let (driver, log) = running_driver();

        let xmit = driver.begin_xmit().unwrap();
        let mut sg = xmit.alloc_buf(64, None).unwrap();
        for (i, b) in sg.as_mut_slice()[..64].iter_mut().enumerate() {
            *b = i as u8;
        }
        sg.set_used(64);
        xmit.send_buf(sg).unwrap();
        xmit.end_xmit();

        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().inputs.len() == 1
        }));
        let log = log.lock().unwrap();
        assert_eq!(log.inputs[0].len(), 64);
        assert_eq!(log.inputs[0][3], 3);
    }

    #[test]
    fn test_outbound_frames_keep_order() {
        let (driver, log) = running_driver();

        let xmit = driver.begin_xmit().unwrap();
        for i in 0..10u8 {
            let mut sg = xmit.alloc_buf(16, None).unwrap();
            sg.as_mut_slice()[0] = i;
            sg.set_used(16);
            xmit.send_buf(sg).unwrap();
        }
        drop(xmit);

        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().inputs.len() == 10
        }));
        let log = log.lock().unwrap();
        let firsts: Vec<u8> = log.inputs.iter().map(|f| f[0]).collect();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_alloc_rejects_oversized_frame() {
        let (driver, _log) = running_driver();
        let xmit = driver.begin_xmit().unwrap();
        assert!(matches!(
            xmit.alloc_buf(MAX_FRAME_SIZE, None),
            Err(NatError::InvalidParameter(_))
        ));
        assert!(xmit.alloc_buf(MAX_FRAME_SIZE - 1, None).is_ok());
    }

    #[test]
    fn test_alloc_refused_before_start() {
        let (driver, _log) = build_driver(|_| {}, Arc::new(MockDevice::default()));
        let xmit = driver.begin_xmit().unwrap();
        assert!(matches!(xmit.alloc_buf(64, None), Err(NatError::NetDown)));
    }

    #[test]
    fn test_alloc_gso_boundary() {
        let (driver, _log) = running_driver();
        let xmit = driver.begin_xmit().unwrap();

        let mut desc = GsoDesc {
            kind: GsoKind::Tcp,
            hdrs_total: 54,
            max_seg: MAX_FRAME_SIZE - 54,
            off_ip: 14,
            off_l4: 34,
        };
        assert!(matches!(
            xmit.alloc_buf(1500, Some(&desc)),
            Err(NatError::InvalidParameter(_))
        ));

        desc.max_seg -= 1;
        assert!(xmit.alloc_buf(1500, Some(&desc)).is_ok());
    }

    #[test]
    fn test_gso_frame_is_segmented() {
        let (driver, log) = running_driver();
        let desc = GsoDesc {
            kind: GsoKind::Tcp,
            hdrs_total: 54,
            max_seg: 1446,
            off_ip: 14,
            off_l4: 34,
        };
        let total = desc.hdrs_total + 10 * desc.max_seg;

        let xmit = driver.begin_xmit().unwrap();
        let mut sg = xmit.alloc_buf(total, Some(&desc)).unwrap();
        {
            let buf = sg.as_mut_slice();
            buf[14] = 0x45;
            buf[14 + 9] = 6;
            buf[34 + 12] = 5 << 4;
        }
        sg.set_used(total);
        xmit.send_buf(sg).unwrap();
        drop(xmit);

        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().inputs.len() == 10
        }));
        for frame in log.lock().unwrap().inputs.iter() {
            assert!(frame.len() <= desc.hdrs_total + desc.max_seg);
        }
    }

    #[test]
    fn test_begin_xmit_contention() {
        let (driver, _log) = running_driver();
        let first = driver.begin_xmit().unwrap();
        assert!(matches!(driver.begin_xmit(), Err(NatError::TryAgain)));
        first.end_xmit();
        assert!(driver.begin_xmit().is_ok());
    }

    #[test]
    fn test_send_refused_after_link_down() {
        let (driver, log) = running_driver();
        driver.notify_link_changed(LinkState::Down);
        assert_eq!(driver.link_state(), LinkState::Down);

        let xmit = driver.begin_xmit().unwrap();
        let mut sg = xmit.alloc_buf(64, None).unwrap();
        sg.set_used(64);
        assert!(matches!(xmit.send_buf(sg), Err(NatError::NetDown)));
        drop(xmit);

        driver.notify_link_changed(LinkState::Up);
        let xmit = driver.begin_xmit().unwrap();
        let mut sg = xmit.alloc_buf(64, None).unwrap();
        sg.set_used(64);
        xmit.send_buf(sg).unwrap();
        drop(xmit);
        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().inputs.len() == 1
        }));
    }

    #[test]
    fn test_link_change_while_stopped_reconciles_on_start() {
        let (driver, _log) = build_driver(|_| {}, Arc::new(MockDevice::default()));

        // Must neither block nor enqueue.
        driver.notify_link_changed(LinkState::Down);
        assert_eq!(driver.shared.q_engine.len(), 0);
        assert_eq!(driver.link_state(), LinkState::Up);

        driver.start();
        assert!(wait_until(Duration::from_secs(5), || {
            driver.link_state() == LinkState::Down
        }));
    }

    #[test]
    fn test_redirect_rule_while_running() {
        let (driver, log) = running_driver();
        driver
            .redirect_rule(false, false, Some("0.0.0.0"), 2222, Some("10.0.2.15"), 22)
            .unwrap();
        let log = log.lock().unwrap();
        let adds = &log.hostfwd_adds;
        assert_eq!(adds.len(), 1);
        assert_eq!(
            adds[0],
            (
                false,
                Ipv4Addr::UNSPECIFIED,
                2222,
                Ipv4Addr::new(10, 0, 2, 15),
                22
            )
        );
    }

    #[test]
    fn test_redirect_rule_defaults_to_configured_guest() {
        let (driver, log) = running_driver();
        driver
            .redirect_rule(false, true, None, 5353, None, 53)
            .unwrap();
        let log = log.lock().unwrap();
        // Runtime rules without a guest address target the first DHCP lease.
        assert_eq!(log.hostfwd_adds[0].3, Ipv4Addr::new(10, 0, 2, 15));
    }

    #[test]
    fn test_redirect_rule_inline_while_stopped() {
        let (driver, log) = build_driver(|_| {}, Arc::new(MockDevice::default()));
        driver
            .redirect_rule(false, false, None, 8080, None, 80)
            .unwrap();
        assert_eq!(log.lock().unwrap().hostfwd_adds.len(), 1);

        driver
            .redirect_rule(true, false, None, 8080, None, 80)
            .unwrap();
        assert_eq!(log.lock().unwrap().hostfwd_removes.len(), 1);
    }

    #[test]
    fn test_construction_applies_configured_forwards() {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let factory_log = log.clone();
        let driver = NatDriver::new(
            &json!({
                "Network": "10.0.2.0/24",
                "PortForwarding": [
                    { "Protocol": "TCP", "HostPort": 2222, "GuestPort": 22,
                      "GuestIP": "10.0.2.15" },
                ],
            }),
            move |_| Ok(Box::new(MockEngine::new(factory_log)) as Box<dyn Engine>),
            Arc::new(MockDevice::default()),
        )
        .unwrap();

        let adds = log.lock().unwrap().hostfwd_adds.clone();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].2, 2222);
        drop(driver);
    }

    #[test]
    fn test_construction_surfaces_engine_rejection() {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let factory_log = log.clone();
        let err = NatDriver::new(
            &json!({
                "Network": "10.0.2.0/24",
                "PortForwarding": [
                    { "HostPort": 80, "GuestPort": 80 },
                ],
            }),
            move |_| {
                let mut engine = MockEngine::new(factory_log);
                engine.reject_hostfwd = true;
                Ok(Box::new(engine) as Box<dyn Engine>)
            },
            Arc::new(MockDevice::default()),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, NatError::RedirSetup(_)));
    }

    #[test]
    fn test_inbound_frames_reach_device() {
        let device = Arc::new(MockDevice::default());
        let (driver, _log) = build_driver(|e| e.echo = true, device.clone());
        driver.start();

        let xmit = driver.begin_xmit().unwrap();
        let mut sg = xmit.alloc_buf(64, None).unwrap();
        sg.as_mut_slice()[0] = 0xaa;
        sg.set_used(64);
        xmit.send_buf(sg).unwrap();
        drop(xmit);

        assert!(wait_until(Duration::from_secs(5), || {
            device.received.lock().unwrap().len() == 1
        }));
        assert_eq!(device.received.lock().unwrap()[0][0], 0xaa);
        assert!(wait_until(Duration::from_secs(5), || {
            driver.shared.c_pkts.load(Ordering::SeqCst) == 0
        }));
    }

    #[test]
    fn test_shutdown_drains_queued_inbound() {
        let device = Arc::new(MockDevice {
            received: Mutex::new(Vec::new()),
            receive_delay: Some(Duration::from_millis(20)),
        });
        let (driver, log) = build_driver(|e| e.echo = true, device.clone());
        driver.start();

        let xmit = driver.begin_xmit().unwrap();
        for _ in 0..5 {
            let mut sg = xmit.alloc_buf(64, None).unwrap();
            sg.set_used(64);
            xmit.send_buf(sg).unwrap();
        }
        drop(xmit);

        // All five frames echoed into the receive queue before teardown.
        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().inputs.len() == 5
        }));

        let shared = driver.shared.clone();
        drop(driver);

        assert_eq!(device.received.lock().unwrap().len(), 5);
        assert_eq!(shared.c_pkts.load(Ordering::SeqCst), 0);
        assert_eq!(shared.q_recv.len(), 0);
    }

    #[test]
    fn test_dns_change_updates_engine() {
        let (driver, log) = running_driver();
        driver.notify_dns_changed(&DnsConfig {
            domain_name: String::from("corp.example"),
            search_domains: vec![String::from("a.example"), String::from("b.example")],
            name_servers: Vec::new(),
        });
        {
            let log = log.lock().unwrap();
            assert_eq!(
                log.domain_name,
                Some(Some(String::from("corp.example")))
            );
            assert_eq!(log.dns_search.len(), 2);
        }

        // An empty domain clears the engine's setting.
        driver.notify_dns_changed(&DnsConfig::default());
        assert_eq!(log.lock().unwrap().domain_name, Some(None));
    }

    #[test]
    fn test_engine_timer_fires() {
        let (driver, log) = build_driver(
            |e| e.arm_timer_ms = Some(50),
            Arc::new(MockDevice::default()),
        );
        driver.start();
        assert!(wait_until(Duration::from_secs(5), || {
            log.lock().unwrap().timers_fired.contains(&42)
        }));
    }

    #[test]
    fn test_info_string_renders_engine_state() {
        let (driver, _log) = running_driver();
        let info = driver.info_string();
        assert!(info.contains("0 flows"));
        assert!(info.contains("mock 1.0"));
    }

    #[test]
    fn test_drop_without_start_is_clean() {
        let (driver, _log) = build_driver(|_| {}, Arc::new(MockDevice::default()));
        drop(driver);
    }
}
