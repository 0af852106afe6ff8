// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The exception task: a single thread serializing every recovery action
//! taken on a controller.
//!
//! Events are posted as bits into a mailbox. The task drains them one at a
//! time in a fixed priority order, running each handler to completion
//! before looking at the mailbox again.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::{debug, error, info, warn, Logger};

use crate::bits::*;
use crate::ctrlr::Controller;
use crate::hw;
use crate::slots::RequestTag;
use crate::state::CtrlrState;
use crate::{CmdResult, NvmeError};

/// How often the timer event fires when I/O timeouts are being tracked.
pub const TIMER_TICK: Duration = Duration::from_secs(1);

/// Attempts made at reading a log page before giving up on it.
const LOG_PAGE_RETRIES: usize = 5;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ExceptionMask: u32 {
        const DEVICE_REMOVED = 1 << 0;
        const TASK_SHUTDOWN = 1 << 1;
        const TM_ABORT = 1 << 2;
        const TM_VIRT_RESET = 1 << 3;
        const TM_BUS_RESET = 1 << 4;
        const TM_LUN_RESET = 1 << 5;
        const TM_DEVICE_RESET = 1 << 6;
        const CTRLR_RESET = 1 << 7;
        const TASK_TIMER = 1 << 8;
        const ERROR_CHECK = 1 << 9;
        const HEALTH_CHECK = 1 << 10;
        const TASK_START = 1 << 11;
        const QUIESCE = 1 << 12;

        /// Events still accepted once the device has been removed.
        const AFTER_REMOVAL = Self::TASK_SHUTDOWN.bits() | Self::QUIESCE.bits();
    }
}

/// Events handled by the exception task, declared in priority order.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum ExceptionEvent {
    DeviceRemoved = 0,
    TaskShutdown,
    TmAbort,
    TmVirtReset,
    TmBusReset,
    TmLunReset,
    TmDeviceReset,
    CtrlrReset,
    TaskTimer,
    ErrorCheck,
    HealthCheck,
    TaskStart,
    Quiesce,
}

const EVENT_COUNT: usize = 13;

impl ExceptionEvent {
    pub const PRIORITY: [ExceptionEvent; EVENT_COUNT] = [
        ExceptionEvent::DeviceRemoved,
        ExceptionEvent::TaskShutdown,
        ExceptionEvent::TmAbort,
        ExceptionEvent::TmVirtReset,
        ExceptionEvent::TmBusReset,
        ExceptionEvent::TmLunReset,
        ExceptionEvent::TmDeviceReset,
        ExceptionEvent::CtrlrReset,
        ExceptionEvent::TaskTimer,
        ExceptionEvent::ErrorCheck,
        ExceptionEvent::HealthCheck,
        ExceptionEvent::TaskStart,
        ExceptionEvent::Quiesce,
    ];

    pub fn mask(self) -> ExceptionMask {
        ExceptionMask::from_bits_retain(1 << self as u32)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Task management functions forwarded from the storage stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskMgmt {
    /// Abort one request.
    Abort,
    /// Abort every request of one initiator.
    VirtReset,
    BusReset,
    LunReset,
    DeviceReset,
}

impl TaskMgmt {
    pub fn event(self) -> ExceptionEvent {
        match self {
            TaskMgmt::Abort => ExceptionEvent::TmAbort,
            TaskMgmt::VirtReset => ExceptionEvent::TmVirtReset,
            TaskMgmt::BusReset => ExceptionEvent::TmBusReset,
            TaskMgmt::LunReset => ExceptionEvent::TmLunReset,
            TaskMgmt::DeviceReset => ExceptionEvent::TmDeviceReset,
        }
    }
}

struct Mailbox {
    pending: ExceptionMask,
    running: ExceptionMask,
    allowed: ExceptionMask,
    /// Times each event has been handled, and the last result.
    completed: [u64; EVENT_COUNT],
    results: [Option<CmdResult>; EVENT_COUNT],
    exit: bool,
}

pub struct ExceptionQueue {
    mbox: Mutex<Mailbox>,
    wake: Condvar,
    done: Condvar,
}

impl ExceptionQueue {
    pub fn new() -> Self {
        Self {
            mbox: Mutex::new(Mailbox {
                pending: ExceptionMask::empty(),
                running: ExceptionMask::empty(),
                allowed: ExceptionMask::all(),
                completed: [0; EVENT_COUNT],
                results: [None; EVENT_COUNT],
                exit: false,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Post `ev`. Posting an event which is already pending does nothing.
    ///
    /// Returns false if the event is not currently accepted.
    pub fn signal(&self, ev: ExceptionEvent) -> bool {
        let mut mb = self.mbox.lock().unwrap();
        if mb.exit || !mb.allowed.contains(ev.mask()) {
            return false;
        }
        if !mb.pending.contains(ev.mask()) {
            mb.pending.insert(ev.mask());
            self.wake.notify_all();
        }
        true
    }

    /// Post `ev` and wait for a handler run which started after the post to
    /// finish, returning its result.
    pub fn signal_and_wait(&self, ev: ExceptionEvent, timeout: Duration) -> CmdResult {
        let idx = ev.index();
        let mut mb = self.mbox.lock().unwrap();
        if mb.exit {
            return Err(NvmeError::NotReady);
        }
        if !mb.allowed.contains(ev.mask()) {
            return Err(NvmeError::DeviceMissing);
        }
        // A run already underway may have sampled its inputs before we got
        // here, so wait for the one after it.
        let target = mb.completed[idx]
            + 1
            + mb.running.contains(ev.mask()) as u64;
        mb.pending.insert(ev.mask());
        self.wake.notify_all();

        let deadline = Instant::now() + timeout;
        while mb.completed[idx] < target {
            if mb.exit {
                return Err(NvmeError::NotReady);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NvmeError::Timeout);
            }
            mb = self.done.wait_timeout(mb, deadline - now).unwrap().0;
        }
        mb.results[idx].unwrap_or(Ok(()))
    }

    pub fn pending(&self) -> ExceptionMask {
        self.mbox.lock().unwrap().pending
    }

    /// After removal only shutdown and quiesce requests are honoured.
    pub(crate) fn narrow_for_removal(&self) {
        let mut mb = self.mbox.lock().unwrap();
        mb.allowed = ExceptionMask::AFTER_REMOVAL;
        mb.pending &= ExceptionMask::AFTER_REMOVAL;
    }

    /// Ask the task to exit. Waiters are released.
    pub(crate) fn shutdown(&self) {
        let mut mb = self.mbox.lock().unwrap();
        mb.exit = true;
        self.wake.notify_all();
        self.done.notify_all();
    }

    /// Block until an event is due, returning the highest priority one.
    ///
    /// With `tick` set, a timer event is raised each time the task sleeps
    /// that long without being woken.
    fn next(&self, tick: Option<Duration>) -> Option<ExceptionEvent> {
        let mut mb = self.mbox.lock().unwrap();
        loop {
            if mb.exit {
                return None;
            }
            let due = ExceptionEvent::PRIORITY
                .iter()
                .copied()
                .find(|ev| mb.pending.contains(ev.mask()));
            if let Some(ev) = due {
                mb.pending.remove(ev.mask());
                mb.running.insert(ev.mask());
                return Some(ev);
            }
            mb = match tick {
                Some(tick) => {
                    let (mut mb, res) = self.wake.wait_timeout(mb, tick).unwrap();
                    if res.timed_out()
                        && mb.allowed.contains(ExceptionMask::TASK_TIMER)
                    {
                        mb.pending.insert(ExceptionMask::TASK_TIMER);
                    }
                    mb
                }
                None => self.wake.wait(mb).unwrap(),
            };
        }
    }

    fn finish(&self, ev: ExceptionEvent, res: CmdResult) {
        let mut mb = self.mbox.lock().unwrap();
        mb.running.remove(ev.mask());
        mb.results[ev.index()] = Some(res);
        mb.completed[ev.index()] += 1;
        self.done.notify_all();
    }
}

impl Default for ExceptionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the exception task for `ctrlr`.
///
/// The task holds only a weak reference and exits once the controller is
/// gone or shut down.
pub(crate) fn spawn(
    ctrlr: &Arc<Controller>,
    tick: Option<Duration>,
) -> std::io::Result<JoinHandle<()>> {
    let me: Weak<Controller> = Arc::downgrade(ctrlr);
    let events = ctrlr.events.clone();
    let log = ctrlr.log.new(slog::o!("task" => "exception"));
    thread::Builder::new()
        .name(format!("nvme-exc-{}", ctrlr.name()))
        .spawn(move || task_loop(me, events, tick, log))
}

fn task_loop(
    me: Weak<Controller>,
    events: Arc<ExceptionQueue>,
    tick: Option<Duration>,
    log: Logger,
) {
    debug!(log, "exception task running");
    while let Some(ev) = events.next(tick) {
        let Some(ctrlr) = me.upgrade() else {
            break;
        };
        if ev != ExceptionEvent::TaskTimer {
            debug!(log, "handling exception"; "event" => %ev);
        }
        let res = ctrlr.handle_exception(ev);
        drop(ctrlr);
        if let Err(e) = res {
            warn!(log, "exception handler failed"; "event" => %ev, "error" => %e);
        }
        events.finish(ev, res);
        if ev == ExceptionEvent::TaskShutdown {
            break;
        }
    }
    debug!(log, "exception task exiting");
}

impl Controller {
    pub(crate) fn handle_exception(&self, ev: ExceptionEvent) -> CmdResult {
        match ev {
            ExceptionEvent::DeviceRemoved => {
                self.events.narrow_for_removal();
                self.remove();
                Ok(())
            }
            ExceptionEvent::TaskShutdown => {
                self.events.shutdown();
                Ok(())
            }
            ExceptionEvent::TmAbort | ExceptionEvent::TmVirtReset => {
                self.tm_abort(ev)
            }
            ExceptionEvent::TmBusReset
            | ExceptionEvent::TmLunReset
            | ExceptionEvent::TmDeviceReset
            | ExceptionEvent::CtrlrReset => self.hw_reset(NvmeError::Reset, true),
            ExceptionEvent::TaskTimer => self.timer_tick(),
            ExceptionEvent::ErrorCheck => self.check_error_log(),
            ExceptionEvent::HealthCheck => self.check_health(),
            ExceptionEvent::TaskStart => self.start(),
            ExceptionEvent::Quiesce => self.stop(),
        }
    }

    /// Look for the request named by the pending task management function
    /// among the commands owned by the controller, and reset the controller
    /// if it is there.
    fn tm_abort(&self, ev: ExceptionEvent) -> CmdResult {
        let Some(tag) = self.tm_request.lock().unwrap().take() else {
            return Err(NvmeError::BadParam);
        };
        self.state
            .transition_from(CtrlrState::Operational, CtrlrState::Suspend)
            .map_err(|_| NvmeError::Busy)?;

        let ioqs = self.io_queues();
        for qp in &ioqs {
            let _ = qp.suspend();
            qp.process_completions();
        }

        let matches = |req: RequestTag| match ev {
            ExceptionEvent::TmVirtReset => req.initiator == tag.initiator,
            _ => req == tag,
        };
        let found: usize = ioqs
            .iter()
            .map(|qp| {
                qp.active_commands()
                    .filter_map(|cmd| cmd.request())
                    .filter(|req| matches(*req))
                    .count()
            })
            .sum();

        if found > 0 {
            info!(self.log, "task management found outstanding commands";
                "event" => %ev, "count" => found,
                "initiator" => tag.initiator, "serial" => tag.serial);
            return self.reset_suspended(NvmeError::Aborted, true);
        }
        for qp in &ioqs {
            let _ = qp.resume();
        }
        if let Err(cur) = self
            .state
            .transition_from(CtrlrState::Suspend, CtrlrState::Operational)
        {
            debug!(self.log, "state changed during task management";
                "state" => %cur);
        }
        Ok(())
    }

    /// Advance the I/O timeout clock, resetting the controller if commands
    /// have been outstanding for a whole revolution.
    fn timer_tick(&self) -> CmdResult {
        if hw::is_removed(&*self.hw.regs) {
            warn!(self.log, "device removal detected");
            self.events.signal(ExceptionEvent::DeviceRemoved);
            return Ok(());
        }
        let Some(clock) = &self.clock else {
            return Ok(());
        };
        // Check the slot before publishing it: submissions racing with the
        // check still count against the current one.
        let slot = clock.peek_next();
        if self.state() != CtrlrState::Operational {
            clock.advance();
            return Ok(());
        }
        let expired: u32 = self
            .io_queues()
            .iter()
            .filter(|qp| !qp.is_suspended())
            .map(|qp| qp.timed_out(slot))
            .sum();
        clock.advance();
        if expired == 0 {
            return Ok(());
        }
        warn!(self.log, "I/O commands timed out";
            "count" => expired, "slot" => slot);
        self.hw_reset(NvmeError::Timeout, true)
    }

    fn read_log_page<T>(&self, lid: u8) -> Result<T, NvmeError>
    where
        T: zerocopy::FromBytes + zerocopy::IntoBytes,
    {
        let mut last = NvmeError::Failure;
        for attempt in 1..=LOG_PAGE_RETRIES {
            match self.get_log_page::<T>(lid) {
                Ok(page) => return Ok(page),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    debug!(self.log, "log page read failed";
                        "lid" => lid, "attempt" => attempt, "error" => %e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn rearm_if_idle(&self) {
        if self.aen.outstanding() == 0 {
            if let Err(e) = self.arm_async_events() {
                debug!(self.log, "async events not re-armed"; "error" => %e);
            }
        }
    }

    fn check_error_log(&self) -> CmdResult {
        if self.state() >= CtrlrState::InReset {
            return Ok(());
        }
        match self.read_log_page::<ErrorLogEntry>(LOG_ID_ERROR_INFO) {
            Ok(entry) => {
                if { entry.error_count } != 0 {
                    warn!(self.log, "controller error log";
                        "count" => { entry.error_count },
                        "sqid" => { entry.sqid },
                        "cid" => { entry.cid },
                        "status" => { entry.status },
                        "lba" => { entry.lba },
                        "nsid" => { entry.nsid });
                }
            }
            Err(e) => {
                error!(self.log, "unable to read error log"; "error" => %e);
                if self.state() == CtrlrState::Operational {
                    return self.hw_reset(NvmeError::Reset, true);
                }
                return Err(e);
            }
        }
        self.rearm_if_idle();
        Ok(())
    }

    fn check_health(&self) -> CmdResult {
        if self.state() >= CtrlrState::InReset {
            return Ok(());
        }
        match self.read_log_page::<SmartLog>(LOG_ID_SMART_HEALTH) {
            Ok(smart) => {
                let warning = smart.critical_warning() & CriticalWarning::DEGRADED;
                if !warning.is_empty() {
                    let health = self.add_health_warning(warning);
                    error!(self.log, "controller health degraded";
                        "warning" => ?warning,
                        "health" => ?health,
                        "media_errors" => smart.media_errors());
                    self.state.transition(CtrlrState::HealthDegraded);
                }
            }
            Err(e) => {
                error!(self.log, "unable to read health log"; "error" => %e);
                if self.state() == CtrlrState::Operational {
                    return self.hw_reset(NvmeError::Reset, true);
                }
                return Err(e);
            }
        }
        self.rearm_if_idle();
        Ok(())
    }
}
