// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use slog::{debug, info, Logger};

use crate::{CmdResult, NvmeError};

/// Controller-wide state gating submission, interrupt servicing and
/// doorbell writes.
///
/// The declaration order matters: states are compared to decide whether
/// health checks may run (below `InReset`) and whether async events may be
/// armed (not above `InReset`).
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
)]
pub enum CtrlrState {
    Init = 0,
    Started,
    Operational,
    Suspend,
    InReset,
    Missing,
    Quiesced,
    Detached,
    Failed,
    HealthDegraded,
}

impl CtrlrState {
    /// Whether new I/O commands may be submitted.
    ///
    /// A degraded controller is no longer watched for timeouts or task
    /// management, so it takes no new I/O.
    pub fn io_gate(self) -> CmdResult {
        match self {
            CtrlrState::Operational => Ok(()),
            CtrlrState::HealthDegraded => Err(NvmeError::FatalError),
            CtrlrState::Suspend => Err(NvmeError::Busy),
            CtrlrState::InReset => Err(NvmeError::InReset),
            CtrlrState::Quiesced => Err(NvmeError::Quiesced),
            CtrlrState::Missing => Err(NvmeError::DeviceMissing),
            CtrlrState::Failed => Err(NvmeError::Failed),
            CtrlrState::Init | CtrlrState::Started | CtrlrState::Detached => {
                Err(NvmeError::NotReady)
            }
        }
    }

    /// Whether new admin commands may be submitted.
    ///
    /// Bring-up and recovery issue admin commands before the controller is
    /// operational again, so `Started` and `Suspend` are allowed here.
    pub fn admin_gate(self) -> CmdResult {
        match self {
            CtrlrState::Started | CtrlrState::Suspend => Ok(()),
            CtrlrState::Init => Err(NvmeError::NotReady),
            other => other.io_gate(),
        }
    }

    /// A controller torn down this far must not see doorbell writes.
    pub fn doorbells_blocked(self) -> bool {
        matches!(self, CtrlrState::InReset | CtrlrState::Quiesced)
    }
}

pub struct StateMachine {
    state: AtomicU8,
    log: Logger,
}

impl StateMachine {
    pub fn new(log: Logger) -> Self {
        Self { state: AtomicU8::new(CtrlrState::Init as u8), log }
    }

    pub fn get(&self) -> CtrlrState {
        CtrlrState::from_repr(self.state.load(Ordering::Acquire))
            .unwrap_or(CtrlrState::Failed)
    }

    /// Move to `new`, returning the state it replaced.
    ///
    /// Nothing leaves `Missing`, and `Failed` may only become `Missing`.
    /// A refused transition returns the (unchanged) current state.
    pub fn transition(&self, new: CtrlrState) -> CtrlrState {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let prev = CtrlrState::from_repr(cur).unwrap_or(CtrlrState::Failed);
            let refused = prev == CtrlrState::Missing
                || (prev == CtrlrState::Failed && new != CtrlrState::Missing);
            if refused {
                debug!(self.log, "state transition refused";
                    "state" => %prev, "requested" => %new);
                return prev;
            }
            match self.state.compare_exchange_weak(
                cur,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if prev != new {
                        info!(self.log, "state transition";
                            "from" => %prev, "to" => %new);
                    }
                    return prev;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Move from `expected` to `new`, but only if nothing has moved the
    /// state since `expected` was read. On failure the current state is
    /// returned and nothing changes.
    pub fn transition_from(
        &self,
        expected: CtrlrState,
        new: CtrlrState,
    ) -> Result<(), CtrlrState> {
        let refused = expected == CtrlrState::Missing
            || (expected == CtrlrState::Failed && new != CtrlrState::Missing);
        if refused {
            return Err(self.get());
        }
        match self.state.compare_exchange(
            expected as u8,
            new as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if expected != new {
                    info!(self.log, "state transition";
                        "from" => %expected, "to" => %new);
                }
                Ok(())
            }
            Err(actual) => {
                let cur =
                    CtrlrState::from_repr(actual).unwrap_or(CtrlrState::Failed);
                debug!(self.log, "conditional state transition lost";
                    "expected" => %expected, "state" => %cur,
                    "requested" => %new);
                Err(cur)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn machine() -> StateMachine {
        StateMachine::new(Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn returns_previous_state() {
        let sm = machine();
        assert_eq!(sm.transition(CtrlrState::Started), CtrlrState::Init);
        assert_eq!(sm.transition(CtrlrState::Operational), CtrlrState::Started);
        assert_eq!(sm.transition(CtrlrState::InReset), CtrlrState::Operational);
        // A second reset sees that one is already underway
        assert_eq!(sm.transition(CtrlrState::InReset), CtrlrState::InReset);
        assert_eq!(sm.get(), CtrlrState::InReset);
    }

    #[test]
    fn missing_is_terminal() {
        let sm = machine();
        sm.transition(CtrlrState::Missing);
        for s in [
            CtrlrState::InReset,
            CtrlrState::Started,
            CtrlrState::Operational,
            CtrlrState::Failed,
        ] {
            assert_eq!(sm.transition(s), CtrlrState::Missing);
            assert_eq!(sm.get(), CtrlrState::Missing);
        }
    }

    #[test]
    fn failed_only_goes_missing() {
        let sm = machine();
        sm.transition(CtrlrState::Failed);
        assert_eq!(sm.transition(CtrlrState::Operational), CtrlrState::Failed);
        assert_eq!(sm.transition(CtrlrState::InReset), CtrlrState::Failed);
        assert_eq!(sm.get(), CtrlrState::Failed);
        assert_eq!(sm.transition(CtrlrState::Missing), CtrlrState::Failed);
        assert_eq!(sm.get(), CtrlrState::Missing);
    }

    #[test]
    fn conditional_transition() {
        let sm = machine();
        sm.transition(CtrlrState::Operational);
        assert_eq!(
            sm.transition_from(CtrlrState::Operational, CtrlrState::Suspend),
            Ok(())
        );
        // Someone else moved on meanwhile: nothing is overwritten
        sm.transition(CtrlrState::InReset);
        assert_eq!(
            sm.transition_from(CtrlrState::Suspend, CtrlrState::Operational),
            Err(CtrlrState::InReset)
        );
        assert_eq!(sm.get(), CtrlrState::InReset);

        sm.transition(CtrlrState::Failed);
        assert_eq!(
            sm.transition_from(CtrlrState::Failed, CtrlrState::Operational),
            Err(CtrlrState::Failed)
        );
        assert_eq!(
            sm.transition_from(CtrlrState::Failed, CtrlrState::Missing),
            Ok(())
        );
        assert_eq!(
            sm.transition_from(CtrlrState::Missing, CtrlrState::Init),
            Err(CtrlrState::Missing)
        );
    }

    #[test]
    fn one_winner_entering_reset() {
        let sm = Arc::new(machine());
        sm.transition(CtrlrState::Operational);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sm = sm.clone();
                thread::spawn(move || sm.transition(CtrlrState::InReset))
            })
            .collect();
        let prevs: Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            prevs.iter().filter(|p| **p == CtrlrState::Operational).count(),
            1
        );
    }

    #[test]
    fn gates() {
        assert!(CtrlrState::Operational.io_gate().is_ok());
        assert_eq!(CtrlrState::Started.io_gate(), Err(NvmeError::NotReady));
        assert!(CtrlrState::Started.admin_gate().is_ok());
        assert_eq!(CtrlrState::InReset.admin_gate(), Err(NvmeError::InReset));
        assert_eq!(
            CtrlrState::Missing.io_gate(),
            Err(NvmeError::DeviceMissing)
        );
        assert_eq!(
            CtrlrState::HealthDegraded.io_gate(),
            Err(NvmeError::FatalError)
        );
        assert_eq!(
            CtrlrState::HealthDegraded.admin_gate(),
            Err(NvmeError::FatalError)
        );
        assert!(CtrlrState::Quiesced.doorbells_blocked());
        assert!(!CtrlrState::Operational.doorbells_blocked());
    }

    #[test]
    fn serializes_by_name() {
        let s = serde_json::to_string(&CtrlrState::HealthDegraded).unwrap();
        assert_eq!(s, "\"HealthDegraded\"");
        assert_eq!(CtrlrState::InReset.to_string(), "InReset");
    }
}
