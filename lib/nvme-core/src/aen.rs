// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous Event Requests.
//!
//! A number of AER commands are kept outstanding on the admin queue. When
//! the controller completes one, the event it carries is handed to the
//! exception task and a replacement request is submitted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

use slog::{debug, info, warn, Logger};

use crate::bits::*;
use crate::ctrlr::Controller;
use crate::exception::ExceptionEvent;
use crate::queue::QueuePair;
use crate::slots::Command;
use crate::state::CtrlrState;
use crate::{CmdResult, NvmeError};

/// Asynchronous Event Information decoded from completion dword 0.
///
/// See NVMe 1.0e Section 5.2, Figure 26
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AsyncEvent {
    pub event_type: u8,
    pub info: u8,
    pub log_page: u8,
}

impl AsyncEvent {
    pub fn decode(dw0: u32) -> Self {
        Self {
            event_type: (dw0 & 0x7) as u8,
            info: (dw0 >> 8) as u8,
            log_page: (dw0 >> 16) as u8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.event_type {
            AEN_TYPE_ERROR => "error",
            AEN_TYPE_SMART => "smart/health",
            AEN_TYPE_NOTICE => "notice",
            AEN_TYPE_IO_CMD_SET => "io command set",
            AEN_TYPE_VENDOR => "vendor",
            _ => "reserved",
        }
    }

    /// The exception event the monitor raises for this notification, if
    /// any.
    pub fn exception(&self) -> Option<ExceptionEvent> {
        match self.event_type {
            AEN_TYPE_ERROR => Some(ExceptionEvent::ErrorCheck),
            AEN_TYPE_SMART => Some(ExceptionEvent::HealthCheck),
            _ => None,
        }
    }
}

pub struct AsyncEventMonitor {
    outstanding: AtomicU32,
    limit: AtomicU32,
    log: Logger,
}

impl AsyncEventMonitor {
    pub fn new(limit: u32, log: &Logger) -> Self {
        Self {
            outstanding: AtomicU32::new(0),
            limit: AtomicU32::new(limit),
            log: log.clone(),
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    pub(crate) fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Reserve room for one more request, failing at the limit.
    fn reserve(&self) -> bool {
        let limit = self.limit();
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn unreserve(&self) {
        let _ = self.outstanding.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    /// Forget every outstanding request; the controller dropped them.
    pub(crate) fn reset(&self) {
        self.outstanding.store(0, Ordering::Release);
    }
}

impl Controller {
    /// Submit async event requests until the limit is reached.
    ///
    /// Returns how many were submitted.
    pub fn arm_async_events(&self) -> Result<u32, NvmeError> {
        let state = self.state();
        if state > CtrlrState::InReset {
            debug!(self.aen.log, "not arming async events"; "state" => %state);
            return Err(NvmeError::NotReady);
        }
        let mut armed = 0;
        while self.aen.reserve() {
            if let Err(e) = self.submit_async_event() {
                self.aen.unreserve();
                if armed == 0 {
                    return Err(e);
                }
                break;
            }
            armed += 1;
        }
        if armed > 0 {
            debug!(self.aen.log, "async event requests armed";
                "count" => armed, "outstanding" => self.aen.outstanding());
        }
        Ok(armed)
    }

    fn submit_async_event(&self) -> CmdResult {
        let adminq = &self.adminq;
        let cmd = adminq.allocate().ok_or(NvmeError::QueueFull)?;
        cmd.set_sqe(SubmissionQueueEntry::new(ADMIN_OPC_ASYNC_EVENT_REQ));
        let me = self.me.clone();
        let res = adminq.submit_raw(
            cmd,
            Box::new(move |qp, cmd, res| async_event_done(&me, qp, cmd, res)),
        );
        if res.is_err() {
            adminq.release(cmd);
        }
        res
    }
}

/// Completion of an async event request, run from admin completion
/// context.
fn async_event_done(
    ctrlr: &Weak<Controller>,
    qp: &QueuePair,
    cmd: &Command,
    res: CmdResult,
) {
    let cqe = cmd.cqe();
    qp.release(cmd);
    let Some(ctrlr) = ctrlr.upgrade() else {
        return;
    };
    let aen = &ctrlr.aen;
    aen.unreserve();

    match res {
        Ok(()) => {
            let event = AsyncEvent::decode(cqe.dw0);
            info!(aen.log, "async event";
                "type" => event.type_name(),
                "info" => event.info,
                "log_page" => event.log_page);
            if let Some(ev) = event.exception() {
                ctrlr.events.signal(ev);
            }
            if let Err(e) = ctrlr.arm_async_events() {
                debug!(aen.log, "async event request not re-armed"; "error" => %e);
            }
        }
        Err(NvmeError::InReset) => {}
        Err(e) => {
            if cqe.sct() == SCT_CMD_SPECIFIC && cqe.sc() == STS_ASYNC_EVENT_LIMIT {
                warn!(aen.log, "async event request limit exceeded";
                    "outstanding" => aen.outstanding());
            } else {
                warn!(aen.log, "async event request failed"; "error" => %e);
            }
        }
    }
}
