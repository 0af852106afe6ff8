// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller reset and recovery.

use slog::{error, info, warn};

use crate::ctrlr::Controller;
use crate::state::CtrlrState;
use crate::{CmdResult, NvmeError};

impl Controller {
    /// Reset the controller and bring it back to `Operational` with the
    /// same set of I/O queues.
    ///
    /// Commands outstanding on the I/O queues are completed with `status`;
    /// those on the admin queue with `InReset`. Entering `InReset` is what
    /// grants the right to reset, so only one reset runs at a time, and
    /// none starts while a drain or task management function holds the
    /// controller in `Suspend`: either way the caller gets `Busy`. If
    /// recovery fails the controller is marked `Failed` and, when
    /// `reissue` is set, the I/O queues are flushed once more with `status`
    /// so that nothing submitted during the attempt is left behind.
    pub fn hw_reset(&self, status: NvmeError, reissue: bool) -> CmdResult {
        loop {
            let prev = self.state();
            match prev {
                CtrlrState::InReset | CtrlrState::Suspend => {
                    return Err(NvmeError::Busy)
                }
                CtrlrState::Failed => return Err(NvmeError::Failed),
                CtrlrState::Missing => return Err(NvmeError::DeviceMissing),
                // Nothing to recover
                CtrlrState::Init
                | CtrlrState::Quiesced
                | CtrlrState::Detached => return Err(NvmeError::NotReady),
                CtrlrState::Started
                | CtrlrState::Operational
                | CtrlrState::HealthDegraded => {}
            }
            if self.state.transition_from(prev, CtrlrState::InReset).is_ok() {
                return self.reset_entered(prev, status, reissue);
            }
        }
    }

    /// Reset on behalf of whoever moved the controller to `Suspend`.
    pub(crate) fn reset_suspended(
        &self,
        status: NvmeError,
        reissue: bool,
    ) -> CmdResult {
        match self
            .state
            .transition_from(CtrlrState::Suspend, CtrlrState::InReset)
        {
            Ok(()) => self.reset_entered(CtrlrState::Suspend, status, reissue),
            Err(cur) => {
                warn!(self.log, "controller left suspend before reset";
                    "state" => %cur);
                Err(NvmeError::Busy)
            }
        }
    }

    fn reset_entered(
        &self,
        prev: CtrlrState,
        status: NvmeError,
        reissue: bool,
    ) -> CmdResult {
        warn!(self.log, "resetting controller";
            "from" => %prev, "status" => %status);

        let res = self.reset_and_restart(status);
        match res {
            Ok(()) => {
                info!(self.log, "controller reset complete");
            }
            Err(e) => {
                error!(self.log, "controller reset failed"; "error" => %e);
                // Removal or a stop may have overtaken the reset
                let cur = self.state();
                if matches!(cur, CtrlrState::InReset | CtrlrState::Started) {
                    let _ = self.state.transition_from(cur, CtrlrState::Failed);
                }
                if reissue {
                    for qp in self.io_queues() {
                        qp.flush(status);
                    }
                }
            }
        }
        res
    }

    fn reset_and_restart(&self, status: NvmeError) -> CmdResult {
        let ioqs = self.io_queues();
        let _ = self.adminq.suspend();
        for qp in &ioqs {
            let _ = qp.suspend();
        }

        self.hw_stop()?;

        {
            let _guard = self.inner.lock().unwrap();
            self.adminq.flush(NvmeError::InReset);
            self.adminq.reset()?;
            for qp in &ioqs {
                qp.flush(status);
                qp.reset()?;
            }
            self.aen.reset();
        }

        self.hw_start()?;
        self.advance(CtrlrState::InReset, CtrlrState::Started)?;
        self.adminq.resume()?;
        self.identify()?;

        let expected = self.num_io_queues();
        let actual = self.request_io_queues(expected)?;
        if actual != expected {
            error!(self.log, "controller changed its I/O queue count";
                "expected" => expected, "actual" => actual);
            return Err(NvmeError::QueueCountChanged { expected, actual });
        }
        for qp in &ioqs {
            self.create_hw_queue(qp)?;
        }
        for qp in &ioqs {
            qp.resume()?;
        }
        if let Err(e) = self.arm_async_events() {
            warn!(self.log, "failed to re-arm async events"; "error" => %e);
        }
        self.advance(CtrlrState::Started, CtrlrState::Operational)
    }

    /// Step the reset along, failing if something else took the
    /// controller over in the meantime.
    fn advance(&self, from: CtrlrState, to: CtrlrState) -> CmdResult {
        self.state.transition_from(from, to).map_err(|cur| {
            warn!(self.log, "reset overtaken"; "state" => %cur);
            match cur.io_gate() {
                Err(e) => e,
                Ok(()) => NvmeError::Busy,
            }
        })
    }
}
