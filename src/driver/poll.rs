//! The poll multiplexer.
//!
//! The poll thread owns the engine and the timer wheel. Each iteration it
//! rebuilds the poll set (entry 0 is always the wakeup pipe), sleeps in
//! `poll(2)` until a host socket is ready, a timer is due, or somebody
//! signals the wakeup channel, then dispatches engine I/O, queued requests
//! and expired timers, in that order.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::driver::thread::ThreadState;
use crate::driver::timer::TimerWheel;
use crate::driver::{link_changed_worker, RecvJob, Shared};
use crate::engine::{EngineHost, PollFlags, TimerId, TimerToken};

/// Poll timeout when no timer is due.
const DEFAULT_TIMEOUT_MS: u32 = 3_600_000;

/// Initial poll-set capacity; grows geometrically on demand.
const INITIAL_POLL_CAP: usize = 64;

/// Translate the engine's poll-event set to host `poll(2)` flags.
pub(crate) fn events_to_host(events: PollFlags) -> i16 {
    let mut out = 0i16;
    if events.contains(PollFlags::IN) {
        out |= libc::POLLIN;
    }
    if events.contains(PollFlags::OUT) {
        out |= libc::POLLOUT;
    }
    if events.contains(PollFlags::PRI) {
        out |= libc::POLLPRI;
    }
    if events.contains(PollFlags::ERR) {
        out |= libc::POLLERR;
    }
    if events.contains(PollFlags::HUP) {
        out |= libc::POLLHUP;
    }
    out
}

/// Translate host `poll(2)` returned events back to the engine's set.
pub(crate) fn events_from_host(revents: i16) -> PollFlags {
    let mut out = PollFlags::empty();
    if revents & libc::POLLIN != 0 {
        out |= PollFlags::IN;
    }
    if revents & libc::POLLOUT != 0 {
        out |= PollFlags::OUT;
    }
    if revents & libc::POLLPRI != 0 {
        out |= PollFlags::PRI;
    }
    if revents & libc::POLLERR != 0 {
        out |= PollFlags::ERR;
    }
    if revents & libc::POLLHUP != 0 {
        out |= PollFlags::HUP;
    }
    out
}

fn zeroed_pollfd() -> libc::pollfd {
    libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    }
}

/// Wall-clock nanoseconds, the engine's time base.
pub(crate) fn wall_clock_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    (wall_clock_ns() / 1_000_000) as u64
}

/// Poll-thread-local state handed to the engine as its callback context.
pub(crate) struct HostCtx {
    pub polls: Vec<libc::pollfd>,
    pub nsock: usize,
    pub timers: TimerWheel,
    pub shared: Arc<Shared>,
}

impl HostCtx {
    fn new(shared: Arc<Shared>) -> Self {
        let mut polls = vec![zeroed_pollfd(); INITIAL_POLL_CAP];
        polls[0] = libc::pollfd {
            fd: shared.wakeup.read_fd(),
            events: events_to_host(PollFlags::IN | PollFlags::HUP),
            revents: 0,
        };
        Self {
            polls,
            nsock: 1,
            timers: TimerWheel::new(),
            shared,
        }
    }
}

impl EngineHost for HostCtx {
    fn add_poll(&mut self, fd: RawFd, events: PollFlags) -> Option<usize> {
        if self.nsock + 1 >= self.polls.len() {
            let grown = self.polls.len() * 2;
            self.polls.resize(grown, zeroed_pollfd());
        }
        let idx = self.nsock;
        self.polls[idx] = libc::pollfd {
            fd,
            events: events_to_host(events),
            revents: 0,
        };
        self.nsock += 1;
        Some(idx)
    }

    fn get_revents(&self, idx: usize) -> PollFlags {
        match self.polls.get(idx) {
            Some(entry) => events_from_host(entry.revents),
            None => PollFlags::empty(),
        }
    }

    fn send_packet(&mut self, frame: &[u8]) -> isize {
        let frame_copy = frame.to_vec();

        // Refuse new deliveries once the poll thread is leaving RUNNING;
        // the engine re-drives on -1.
        if !self.shared.poll_ctl.is_running() {
            return -1;
        }

        self.shared.c_pkts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self
            .shared
            .q_recv
            .push(RecvJob { frame: frame_copy })
            .is_err()
        {
            self.shared
                .c_pkts
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return -1;
        }
        self.shared.recv_event.signal();
        self.shared.wakeup.signal();
        frame.len() as isize
    }

    fn guest_error(&mut self, msg: &str) {
        tracing::error!(msg, "guest reported protocol error");
    }

    fn clock_ns(&self) -> i64 {
        wall_clock_ns()
    }

    fn timer_new(&mut self, token: TimerToken) -> TimerId {
        self.timers.insert(token)
    }

    fn timer_free(&mut self, id: TimerId) {
        self.timers.remove(id);
    }

    fn timer_mod(&mut self, id: TimerId, deadline_ms: u64) {
        self.timers.set_deadline(id, deadline_ms);
    }

    fn register_poll_fd(&mut self, fd: RawFd) {
        tracing::trace!(fd, "engine registered poll fd");
    }

    fn unregister_poll_fd(&mut self, fd: RawFd) {
        tracing::trace!(fd, "engine unregistered poll fd");
    }

    fn notify(&mut self) {
        self.shared.wakeup.signal();
    }
}

/// Body of the poll thread.
pub(crate) fn poll_thread_main(shared: Arc<Shared>) {
    if shared.poll_ctl.wait_leave_initializing() == ThreadState::Terminating {
        return;
    }

    let mut engine_slot = shared.engine.lock().expect("engine mutex poisoned");
    let Some(engine) = engine_slot.as_mut() else {
        return;
    };
    let mut host = HostCtx::new(shared.clone());

    // A link change requested while we were not running yet is applied
    // before the first iteration.
    let want = shared.link_want();
    if want != shared.link_state() {
        link_changed_worker(&shared, want);
    }

    let mut poll_err_count = 0u32;

    while shared.poll_ctl.is_running() {
        host.nsock = 1;
        host.polls[0].revents = 0;

        let mut timeout_ms = DEFAULT_TIMEOUT_MS;
        engine.pollfds_fill(&mut host, &mut timeout_ms);
        host.timers.update_timeout(&mut timeout_ms, now_ms());

        let mut ready = unsafe {
            libc::poll(
                host.polls.as_mut_ptr(),
                host.nsock as libc::nfds_t,
                timeout_ms.min(i32::MAX as u32) as libc::c_int,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // Not an error; process queued work without sleeping again.
                tracing::trace!("poll interrupted by signal");
                ready = 0;
            } else {
                poll_err_count += 1;
                if poll_err_count > 128 {
                    tracing::warn!(error = %err, suppressed = poll_err_count, "poll failed");
                    poll_err_count = 0;
                }
            }
        }

        engine.pollfds_poll(&mut host, ready < 0);

        // Drain the wakeup pipe to the very end: senders are decoupled, so
        // any number of signals may have accumulated since the last pass.
        if host.polls[0].revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
            shared.wakeup.drain();
        }

        for job in shared.q_engine.drain() {
            job.run(engine.as_mut(), &mut host);
        }

        for token in host.timers.take_expired(now_ms()) {
            engine.timer_expired(&mut host, token);
        }
    }

    tracing::debug!("poll thread stopped");
}
