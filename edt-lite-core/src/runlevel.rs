use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// The discrete phases a policy domain traverses during bring-up; torn
/// down in reverse order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Runlevel {
    ConfigParse = 0,
    NetworkOk = 1,
    PdOk = 2,
    MemoryOk = 3,
    GuidOk = 4,
    ComputeOk = 5,
    UserOk = 6,
}

pub const RUNLEVELS_UP: [Runlevel; 7] = [
    Runlevel::ConfigParse,
    Runlevel::NetworkOk,
    Runlevel::PdOk,
    Runlevel::MemoryOk,
    Runlevel::GuidOk,
    Runlevel::ComputeOk,
    Runlevel::UserOk,
];

impl Runlevel {
    /// Phases this runlevel is split into (direction-independent here; the
    /// tear-down walks them highest first).
    pub fn phase_count(self) -> i8 {
        match self {
            Runlevel::ComputeOk => 2,
            _ => 1,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RlProps: u16 {
        const REQUEST     = 1 << 0;
        const RESPONSE    = 1 << 1;
        const RELEASE     = 1 << 2;
        const BRING_UP    = 1 << 3;
        const TEAR_DOWN   = 1 << 4;
        const ASYNC       = 1 << 5;
        const FROM_MSG    = 1 << 6;
        const NODE_MASTER = 1 << 7;
        const PD_MASTER   = 1 << 8;
        const BLESSED     = 1 << 9;
        const LEGACY      = 1 << 10;
    }
}

struct RlState {
    runlevel: Runlevel,
    next_phase: i8,
    properties: RlProps,
}

/// The shared switch record: the only barrier in the system. The master
/// writes the target `{runlevel, next_phase, properties, checked_in}`;
/// every participant decrements `checked_in` after finishing its part of
/// the phase; zero hands control back so the master can enter the next
/// phase (or the next runlevel).
pub struct RlSwitch {
    state: spin::Mutex<RlState>,
    checked_in: AtomicU64,
    barrier: Notify,
}

impl RlSwitch {
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(RlState {
                runlevel: Runlevel::ConfigParse,
                next_phase: 0,
                properties: RlProps::BRING_UP,
            }),
            checked_in: AtomicU64::new(0),
            barrier: Notify::new(),
        }
    }

    /// Arm a phase with `participants` expected check-ins.
    pub fn begin_phase(&self, rl: Runlevel, phase: i8, props: RlProps, participants: u64) {
        {
            let mut st = self.state.lock();
            st.runlevel = rl;
            st.next_phase = phase;
            st.properties = props;
        }
        self.checked_in.store(participants, Ordering::Release);
    }

    pub fn current(&self) -> (Runlevel, i8, RlProps) {
        let st = self.state.lock();
        (st.runlevel, st.next_phase, st.properties)
    }

    /// One participant finished its part of the phase.
    pub fn checkin(&self) {
        let prev = self.checked_in.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "runlevel check-in underflow");
        if prev == 1 {
            self.barrier.notify_waiters();
        }
    }

    /// Master side: block until every participant has checked in.
    pub async fn wait_phase(&self) {
        loop {
            // Register for the wakeup before the decisive load, or the last
            // check-in's notify_waiters can slip between check and await.
            let mut notified = std::pin::pin!(self.barrier.notified());
            notified.as_mut().enable();
            if self.checked_in.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RlSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn runlevels_are_ordered() {
        for w in RUNLEVELS_UP.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[tokio::test]
    async fn barrier_releases_at_zero() {
        let sw = Arc::new(RlSwitch::new());
        sw.begin_phase(Runlevel::ComputeOk, 0, RlProps::BRING_UP, 3);
        let waiter = {
            let sw = sw.clone();
            tokio::spawn(async move { sw.wait_phase().await })
        };
        sw.checkin();
        sw.checkin();
        assert!(!waiter.is_finished());
        sw.checkin();
        waiter.await.unwrap();
        let (rl, phase, props) = sw.current();
        assert_eq!(rl, Runlevel::ComputeOk);
        assert_eq!(phase, 0);
        assert!(props.contains(RlProps::BRING_UP));
    }
}
