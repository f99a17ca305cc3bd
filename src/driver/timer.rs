//! Timer wheel for engine-owned timers.
//!
//! The engine creates, re-arms and frees timers only from the poll thread,
//! so the wheel needs no locking; it lives inside the poll thread's state.
//! Cardinality is tens of timers, so storage is a small slab with
//! generation-tagged handles. A deadline of 0 means armed-but-parked.

use crate::engine::{TimerId, TimerToken};

#[derive(Debug)]
struct Slot {
    generation: u32,
    timer: Option<Timer>,
}

#[derive(Debug)]
struct Timer {
    token: TimerToken,
    deadline_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a parked timer carrying `token`.
    pub fn insert(&mut self, token: TimerToken) -> TimerId {
        let timer = Timer {
            token,
            deadline_ms: 0,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.timer = Some(timer);
                TimerId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    timer: Some(timer),
                });
                TimerId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Release a timer. Safe on fired timers and on stale handles.
    pub fn remove(&mut self, id: TimerId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.timer = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index as usize);
        }
    }

    /// Store a new deadline; 0 parks the timer.
    pub fn set_deadline(&mut self, id: TimerId, deadline_ms: u64) {
        if let Some(slot) = self.slot_mut(id) {
            if let Some(timer) = slot.timer.as_mut() {
                timer.deadline_ms = deadline_ms;
            }
        }
    }

    /// Lower `timeout_ms` to the nearest scheduled deadline.
    pub fn update_timeout(&self, timeout_ms: &mut u32, now_ms: u64) {
        for slot in &self.slots {
            let Some(timer) = slot.timer.as_ref() else {
                continue;
            };
            if timer.deadline_ms == 0 {
                continue;
            }
            let diff = timer.deadline_ms.saturating_sub(now_ms);
            if diff < *timeout_ms as u64 {
                *timeout_ms = diff as u32;
            }
        }
    }

    /// Park every expired timer and return its token for dispatch.
    ///
    /// Deadlines are zeroed before the caller runs any handler, so handlers
    /// may re-arm their own timer or create new ones; timers created during
    /// dispatch are not visited until the next pass.
    pub fn take_expired(&mut self, now_ms: u64) -> Vec<TimerToken> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            let Some(timer) = slot.timer.as_mut() else {
                continue;
            };
            if timer.deadline_ms != 0 && timer.deadline_ms <= now_ms {
                timer.deadline_ms = 0;
                expired.push(timer.token);
            }
        }
        expired
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.timer.is_some()).count()
    }

    fn slot_mut(&mut self, id: TimerId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parked_timer_ignores_timeout() {
        let mut wheel = TimerWheel::new();
        wheel.insert(1);
        let mut timeout = 5000u32;
        wheel.update_timeout(&mut timeout, 100);
        assert_eq!(timeout, 5000);
        assert!(wheel.take_expired(u64::MAX).is_empty());
    }

    #[test]
    fn test_update_timeout_takes_minimum() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(1);
        let b = wheel.insert(2);
        wheel.set_deadline(a, 1500);
        wheel.set_deadline(b, 1200);

        let mut timeout = 3_600_000u32;
        wheel.update_timeout(&mut timeout, 1000);
        assert_eq!(timeout, 200);
    }

    #[test]
    fn test_past_deadline_clamps_to_zero() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(1);
        wheel.set_deadline(a, 50);
        let mut timeout = 100u32;
        wheel.update_timeout(&mut timeout, 200);
        assert_eq!(timeout, 0);
    }

    #[test]
    fn test_take_expired_parks_and_reports() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(7);
        let b = wheel.insert(8);
        wheel.set_deadline(a, 100);
        wheel.set_deadline(b, 300);

        let fired = wheel.take_expired(200);
        assert_eq!(fired, vec![7]);
        // Fired timer is parked, not gone; it can be re-armed.
        assert_eq!(wheel.live_count(), 2);
        assert!(wheel.take_expired(200).is_empty());

        wheel.set_deadline(a, 250);
        assert_eq!(wheel.take_expired(260), vec![7]);
    }

    #[test]
    fn test_remove_is_safe_on_fired_and_stale() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(1);
        wheel.set_deadline(a, 10);
        wheel.take_expired(20);
        wheel.remove(a);
        wheel.remove(a);
        assert_eq!(wheel.live_count(), 0);

        // The slot is recycled under a new generation; the stale handle
        // must not reach the new occupant.
        let b = wheel.insert(2);
        wheel.remove(a);
        assert_eq!(wheel.live_count(), 1);
        wheel.set_deadline(b, 5);
        assert_eq!(wheel.take_expired(10), vec![2]);
    }
}
