//! Receive delivery thread.
//!
//! The engine synthesizes frames on the poll thread; delivering them to the
//! guest device can block on the device's receive credit, which must never
//! stall the poll loop. Delivery jobs therefore cross to this thread, which
//! is allowed to wait indefinitely.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::driver::thread::ThreadState;
use crate::driver::{RecvJob, Shared};

/// Body of the receive thread.
pub(crate) fn recv_thread_main(shared: Arc<Shared>) {
    if shared.recv_ctl.wait_leave_initializing() == ThreadState::Terminating {
        return;
    }

    loop {
        for job in shared.q_recv.drain() {
            recv_worker(&shared, job);
        }
        // Shutdown drains: queued deliveries above complete before the
        // state check lets us leave.
        if !shared.recv_ctl.is_running() {
            break;
        }
        if shared.c_pkts.load(Ordering::SeqCst) == 0 {
            shared.recv_event.wait();
        }
    }

    tracing::debug!("receive thread stopped");
}

/// Deliver one frame to the guest device.
///
/// The wait-for-credit and the receive call form one critical section so
/// concurrent device state changes cannot interleave between them.
fn recv_worker(shared: &Shared, job: RecvJob) {
    {
        let _dev = shared
            .dev_access_lock
            .lock()
            .expect("device access mutex poisoned");
        match shared.device.wait_receive_avail() {
            Ok(()) => {
                if let Err(err) = shared.device.receive(&job.frame) {
                    tracing::debug!(error = %err, "guest receive failed");
                }
            }
            Err(err) if err.is_benign_wait() => {}
            Err(err) => {
                tracing::warn!(error = %err, "wait for guest receive buffers failed");
            }
        }
    }

    drop(job);
    shared.c_pkts.fetch_sub(1, Ordering::SeqCst);
    // Let the poll loop observe the drained in-flight count.
    shared.wakeup.signal();
}
