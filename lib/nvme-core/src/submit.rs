// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command submission, asynchronous and synchronous.
//!
//! A synchronous waiter that gives up and a completion that arrives late
//! race on the command status: `Active` becomes either `Done` (the
//! completion won, the waiter cleans up) or `FreeOnComplete` (the waiter
//! won, the completion cleans up). Whoever loses the compare-and-swap
//! leaves the slot alone.

use std::time::Duration;

use slog::{error, warn};

use crate::bits::CompletionQueueEntry;
use crate::queue::{QueuePair, ADMIN_QUEUE_ID};
use crate::slots::{CmdStatus, Command, DoneFn};
use crate::{CmdResult, NvmeError};

impl QueuePair {
    fn gate(&self) -> CmdResult {
        let state = self.state.get();
        match self.id() {
            ADMIN_QUEUE_ID => state.admin_gate(),
            _ => state.io_gate(),
        }
    }

    /// Submit with `done` installed as the raw completion callback. `done`
    /// becomes responsible for releasing the slot.
    ///
    /// On failure the callback is dropped and the slot stays with the
    /// caller.
    pub(crate) fn submit_raw(&self, cmd: &Command, done: DoneFn) -> CmdResult {
        self.gate()?;
        cmd.lock().done = Some(done);
        if let Err(err) = self.enqueue(cmd) {
            cmd.lock().done = None;
            return Err(err);
        }
        Ok(())
    }

    /// Submit `cmd` and return immediately.
    ///
    /// `done` runs from completion context with the decoded result; the
    /// command's cleanup callback runs and the slot is released after it
    /// returns.
    pub fn submit_async<F>(&self, cmd: &Command, done: F) -> CmdResult
    where
        F: FnOnce(&QueuePair, &Command, CmdResult) + Send + 'static,
    {
        self.submit_raw(
            cmd,
            Box::new(move |qp, cmd, res| {
                done(qp, cmd, res);
                cmd.run_cleanup();
                qp.release(cmd);
            }),
        )
    }

    /// Submit `cmd` and block until it completes or `timeout` passes.
    ///
    /// The slot is consumed whatever the outcome. On success the completion
    /// entry is returned. On timeout the command is left for whichever of a
    /// late completion or a queue flush comes first to clean up.
    pub fn submit_and_wait(
        &self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<CompletionQueueEntry, NvmeError> {
        if let Err(err) = self.submit_raw(cmd, Box::new(wake_waiter)) {
            cmd.run_cleanup();
            self.release(cmd);
            return Err(err);
        }

        let guard = cmd.lock();
        let (guard, _) = cmd
            .cv
            .wait_timeout_while(guard, timeout, |_| {
                cmd.status() == CmdStatus::Active
            })
            .unwrap();

        match cmd.cas_status(CmdStatus::Active, CmdStatus::FreeOnComplete) {
            Ok(()) => {
                drop(guard);
                warn!(self.log, "command timed out";
                    "cid" => cmd.id(), "opcode" => cmd.sqe().opcode());
                Err(NvmeError::Timeout)
            }
            Err(CmdStatus::Done) => {
                let cqe = guard.cqe;
                let res = guard.result.unwrap_or(Ok(()));
                drop(guard);
                cmd.run_cleanup();
                self.release(cmd);
                res.map(|()| cqe)
            }
            Err(other) => {
                drop(guard);
                error!(self.log, "waited command in unexpected state";
                    "cid" => cmd.id(), "status" => ?other);
                Err(NvmeError::FatalError)
            }
        }
    }
}

/// Completion callback for synchronous submissions.
fn wake_waiter(qp: &QueuePair, cmd: &Command, _res: CmdResult) {
    let guard = cmd.lock();
    match cmd.cas_status(CmdStatus::Active, CmdStatus::Done) {
        Ok(()) => {
            drop(guard);
            cmd.cv.notify_all();
        }
        Err(_) => {
            // The waiter already gave up on this command.
            drop(guard);
            cmd.run_cleanup();
            qp.release(cmd);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use rand::{Rng, SeedableRng};

    use crate::bits::*;
    use crate::slots::CmdStatus;
    use crate::state::CtrlrState;
    use crate::test::{CqWriter, MockHw};
    use crate::NvmeError;

    #[test]
    fn wait_returns_completion() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 8, 4);
        qp.resume().unwrap();
        let mut dev = CqWriter::new(&qp);

        let cmd = qp.allocate().unwrap();
        let id = cmd.id();
        let res = thread::scope(|s| {
            let waiter =
                s.spawn(|| qp.submit_and_wait(cmd, Duration::from_secs(10)));
            while cmd.status() != CmdStatus::Active {
                thread::yield_now();
            }
            dev.post_dw0(id, 1, 0xfeed, SCT_GENERIC, STS_SUCCESS);
            qp.process_completions();
            waiter.join().unwrap()
        });

        let cqe = res.unwrap();
        assert_eq!({ cqe.dw0 }, 0xfeed);
        assert_eq!(qp.stats().active, 0);
    }

    #[test]
    fn wait_surfaces_decoded_error() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 8, 4);
        qp.resume().unwrap();
        let mut dev = CqWriter::new(&qp);

        let cmd = qp.allocate().unwrap();
        let id = cmd.id();
        let res = thread::scope(|s| {
            let waiter =
                s.spawn(|| qp.submit_and_wait(cmd, Duration::from_secs(10)));
            while cmd.status() != CmdStatus::Active {
                thread::yield_now();
            }
            dev.post(id, 1, SCT_GENERIC, STS_LBA_RANGE);
            qp.process_completions();
            waiter.join().unwrap()
        });
        assert_eq!(res.unwrap_err(), NvmeError::LbaOutOfRange);
    }

    #[test]
    fn timeout_then_late_completion_cleans_once() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 8, 4);
        qp.resume().unwrap();
        let mut dev = CqWriter::new(&qp);
        let cleanups = Arc::new(AtomicUsize::new(0));

        let cmd = qp.allocate().unwrap();
        let counter = cleanups.clone();
        cmd.set_cleanup(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(
            qp.submit_and_wait(cmd, Duration::from_millis(10)),
            Err(NvmeError::Timeout)
        );
        assert_eq!(cmd.status(), CmdStatus::FreeOnComplete);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        dev.post(cmd.id(), 1, SCT_GENERIC, STS_SUCCESS);
        qp.process_completions();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(cmd.status(), CmdStatus::Free);
        assert_eq!(qp.stats().free, 4);
    }

    #[test]
    fn timeout_then_flush_cleans_once() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 8, 4);
        qp.resume().unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let cmd = qp.allocate().unwrap();
        let counter = cleanups.clone();
        cmd.set_cleanup(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(
            qp.submit_and_wait(cmd, Duration::from_millis(1)),
            Err(NvmeError::Timeout)
        );
        qp.flush(NvmeError::Reset);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(qp.stats().free, 4);
    }

    #[test]
    fn refused_submission_keeps_slot() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 8, 4);
        qp.resume().unwrap();
        mock.state.transition(CtrlrState::Quiesced);

        let cmd = qp.allocate().unwrap();
        assert_eq!(
            qp.submit_async(cmd, |_, _, _| panic!("never submitted")),
            Err(NvmeError::Quiesced)
        );
        assert_eq!(cmd.status(), CmdStatus::Free);
        assert_eq!(qp.stats().active, 1);
        qp.release(cmd);
        assert_eq!(qp.stats().active, 0);
    }

    #[test]
    fn abort_complete_race() {
        let mock = MockHw::new();
        let qp = mock.queue(1, 16, 4);
        qp.resume().unwrap();
        let mut dev = CqWriter::new(&qp);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut outcomes = [0usize; 2];

        for _ in 0..300 {
            let cleanups = Arc::new(AtomicUsize::new(0));
            let cmd = qp.allocate().unwrap();
            let id = cmd.id();
            let counter = cleanups.clone();
            cmd.set_cleanup(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

            let wait = Duration::from_micros(rng.gen_range(0..200));
            let delay = Duration::from_micros(rng.gen_range(0..200));
            let barrier = Barrier::new(2);

            let res = thread::scope(|s| {
                let waiter = s.spawn(|| {
                    barrier.wait();
                    qp.submit_and_wait(cmd, wait)
                });
                barrier.wait();
                while cmd.status() == CmdStatus::Free {
                    thread::yield_now();
                }
                thread::sleep(delay);
                let sqhd = qp.sq.lock().unwrap().tail as u16;
                dev.post(id, sqhd, SCT_GENERIC, STS_SUCCESS);
                qp.process_completions();
                waiter.join().unwrap()
            });

            match res {
                Ok(_) => outcomes[0] += 1,
                Err(NvmeError::Timeout) => outcomes[1] += 1,
                Err(e) => panic!("unexpected result {e}"),
            }
            // Exactly one side cleaned up, and the slot is back
            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
            assert_eq!(cmd.status(), CmdStatus::Free);
            assert_eq!(qp.stats().active, 0);
        }
        assert_eq!(outcomes[0] + outcomes[1], 300);
    }
}
