// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion ring processing, run from interrupt or poll context.

use std::sync::atomic::Ordering;

use slog::{debug, error};

use crate::bits::{CompletionQueueEntry, CQE_SIZE};
use crate::queue::{CompState, QueuePair};
use crate::slots::{CmdStatus, Command};
use crate::{status, CmdResult};

impl QueuePair {
    /// Handle every entry the controller has posted since the last call.
    ///
    /// Returns the number of ring entries consumed.
    pub fn process_completions(&self) -> usize {
        let mut cq = self.cq.lock().unwrap();
        self.process_locked(&mut cq)
    }

    pub(crate) fn process_locked(&self, cq: &mut CompState) -> usize {
        let start = (cq.head, cq.phase);
        let mut sq_head = None;
        let mut consumed = 0;

        loop {
            let off = cq.head as usize * CQE_SIZE;
            // The phase tag lives in the upper quadword, which the device
            // writes last.
            let hi = self.cq_mem.load_u64(off + 8);
            if CompletionQueueEntry::phase_of(hi) != cq.phase {
                break;
            }
            let lo = self.cq_mem.load_u64(off);
            let cqe = CompletionQueueEntry::from_words(lo, hi);

            if let Some(head) = self.handle_entry(&cqe) {
                sq_head = Some(head);
            }

            cq.head += 1;
            if cq.head == self.cq_size() {
                cq.head = 0;
                cq.phase = !cq.phase;
            }
            consumed += 1;
        }

        if (cq.head, cq.phase) != start {
            if !self.state.get().doorbells_blocked() {
                self.regs.write32(self.doorbells.cq, cq.head);
            }
        }
        if let Some(head) = sq_head {
            self.sq_head_hint.store(head as u32, Ordering::Release);
        }
        consumed
    }

    /// Validate and dispatch one completion, returning the SQ head it
    /// reports if the entry was accepted.
    fn handle_entry(&self, cqe: &CompletionQueueEntry) -> Option<u16> {
        let cid = cqe.cid;
        let Some(cmd) = self.slots.get(cid) else {
            error!(self.log, "completion with invalid command id";
                "cid" => cid, "max" => self.slots.count());
            return None;
        };
        let cur = cmd.status();
        if !matches!(cur, CmdStatus::Active | CmdStatus::FreeOnComplete) {
            error!(self.log, "completion for inactive command";
                "cid" => cid, "status" => ?cur);
            return None;
        }

        let res = status::decode_entry(cqe);
        if let Err(err) = res {
            debug!(self.log, "command failed";
                "cid" => cid,
                "opcode" => cmd.sqe().opcode(),
                "sct" => cqe.sct(),
                "sc" => cqe.sc(),
                "status" => %err);
        }
        cmd.lock().cqe = *cqe;
        self.complete(cmd, res);
        Some(cqe.sqhd)
    }

    /// Record `res` on the command and hand it to its completion callback.
    ///
    /// A command without a callback is simply released.
    pub(crate) fn complete(&self, cmd: &Command, res: CmdResult) {
        let done = {
            let mut inner = cmd.lock();
            inner.result = Some(res);
            inner.done.take()
        };
        match done {
            Some(done) => done(self, cmd, res),
            None => self.release(cmd),
        }
    }
}
