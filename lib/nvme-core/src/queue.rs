// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use slog::{error, info, o, warn, Logger};
use thiserror::Error;

use crate::bits::{CQE_SIZE, SQE_SIZE};
use crate::ctrlr::Hardware;
use crate::hw::{DmaBuf, DmaError, Doorbells, IntrCtl, RegisterBlock};
use crate::slots::{self, CmdStatus, Command, CommandSlotTable, FreeCursor};
use crate::state::StateMachine;
use crate::timeout::{TimeoutClock, TimeoutWheel};
use crate::{CmdResult, NvmeError};

/// Each queue is identified by a 16-bit ID.
///
/// See NVMe 1.0e Section 4.1.4 Queue Identifier
pub type QueueId = u16;

/// The Admin Completion and Submission Queues are defined to have ID 0.
pub const ADMIN_QUEUE_ID: QueueId = 0;

/// The minimum number of entries in either ring.
///
/// One entry is always unusable so that a full ring can be told apart from
/// an empty one.
const MIN_QUEUE_SIZE: u32 = 2;

/// The maximum number of entries in an I/O ring.
pub const MAX_QUEUE_SIZE: u32 = 1 << 16;

/// The maximum number of entries in the Admin rings.
const MAX_ADMIN_QUEUE_SIZE: u32 = 1 << 12;

/// No submission queue head has been reported since it was last consumed.
pub(crate) const SQ_HEAD_NONE: u32 = u32::MAX;

/// Errors that may be encountered during Queue creation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreateErr {
    #[error("invalid size")]
    InvalidSize,

    #[error("invalid command slot count")]
    InvalidSlotCount,

    #[error("ring allocation failed: {0}")]
    Dma(#[from] DmaError),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueueFlags: u8 {
        const SUSPENDED = 1 << 0;
        const FLUSHING = 1 << 1;
    }
}

/// Geometry of a queue pair.
#[derive(Clone, Copy, Debug)]
pub struct QueueParams {
    pub id: QueueId,
    /// Interrupt vector the completion ring signals on.
    pub vector: u16,
    pub sq_size: u32,
    pub cq_size: u32,
    /// Number of command slots (and so of command identifiers).
    pub slots: u32,
    /// CAP.DSTRD of the controller owning the queue.
    pub dstrd: u8,
}

/// Submission side state, guarded by the submission lock.
#[derive(Debug)]
pub(crate) struct SubState {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    /// Entries which may be written before the head must be refreshed.
    pub(crate) entries: u32,
    pub(crate) flags: QueueFlags,
    pub(crate) free: FreeCursor,
}

/// Completion side state, guarded by the completion lock.
#[derive(Debug)]
pub(crate) struct CompState {
    pub(crate) head: u32,
    /// Phase tag expected on the next new entry.
    pub(crate) phase: bool,
}

impl CompState {
    fn new() -> Self {
        // The ring starts zeroed, so the first pass of real entries is
        // posted with the phase tag set.
        Self { head: 0, phase: true }
    }
}

/// Point-in-time view of a queue pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub qid: QueueId,
    pub sq_size: u32,
    pub cq_size: u32,
    pub active: u32,
    pub free: u32,
    pub suspended: bool,
}

/// A submission ring and the completion ring it reports to.
pub struct QueuePair {
    id: QueueId,
    vector: u16,
    sq_size: u32,
    cq_size: u32,
    pub(crate) sq_mem: Arc<DmaBuf>,
    pub(crate) cq_mem: Arc<DmaBuf>,
    pub(crate) doorbells: Doorbells,
    pub(crate) regs: Arc<dyn RegisterBlock>,
    intr: Arc<dyn IntrCtl>,
    pub(crate) state: Arc<StateMachine>,
    pub(crate) slots: CommandSlotTable,
    pub(crate) sq: Mutex<SubState>,
    /// Latest SQ head reported by the controller, consumed by read-and-clear.
    pub(crate) sq_head_hint: AtomicU32,
    pub(crate) cq: Mutex<CompState>,
    timeouts: Option<TimeoutWheel>,
    pub(crate) log: Logger,
}

impl QueuePair {
    /// Allocate the rings and slot table for a new queue pair.
    ///
    /// The queue starts out suspended; it must be resumed once the
    /// controller knows about it.
    pub fn new(
        params: QueueParams,
        hw: &Hardware,
        state: Arc<StateMachine>,
        clock: Option<Arc<TimeoutClock>>,
        log: &Logger,
    ) -> Result<Arc<Self>, QueueCreateErr> {
        let max = match params.id {
            ADMIN_QUEUE_ID => MAX_ADMIN_QUEUE_SIZE,
            _ => MAX_QUEUE_SIZE,
        };
        for size in [params.sq_size, params.cq_size] {
            if !(MIN_QUEUE_SIZE..=max).contains(&size) {
                return Err(QueueCreateErr::InvalidSize);
            }
        }
        let count = slots::validate_count(params.slots)
            .map_err(|_| QueueCreateErr::InvalidSlotCount)?;

        let sq_mem = hw.dma.alloc(params.sq_size as usize * SQE_SIZE)?;
        let cq_mem = hw.dma.alloc(params.cq_size as usize * CQE_SIZE)?;
        let (slots, free) = CommandSlotTable::new(count);
        let timeouts = match params.id {
            ADMIN_QUEUE_ID => None,
            _ => clock.map(TimeoutWheel::new),
        };

        Ok(Arc::new(Self {
            id: params.id,
            vector: params.vector,
            sq_size: params.sq_size,
            cq_size: params.cq_size,
            sq_mem,
            cq_mem,
            doorbells: Doorbells::new(params.id, params.dstrd),
            regs: hw.regs.clone(),
            intr: hw.intr.clone(),
            state,
            slots,
            sq: Mutex::new(SubState {
                head: 0,
                tail: 0,
                entries: params.sq_size - 1,
                flags: QueueFlags::SUSPENDED,
                free,
            }),
            sq_head_hint: AtomicU32::new(SQ_HEAD_NONE),
            cq: Mutex::new(CompState::new()),
            timeouts,
            log: log.new(o!("qid" => params.id)),
        }))
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn vector(&self) -> u16 {
        self.vector
    }

    pub fn sq_size(&self) -> u32 {
        self.sq_size
    }

    pub fn cq_size(&self) -> u32 {
        self.cq_size
    }

    pub fn sq_iova(&self) -> u64 {
        self.sq_mem.iova()
    }

    pub fn cq_iova(&self) -> u64 {
        self.cq_mem.iova()
    }

    pub fn slots(&self) -> &CommandSlotTable {
        &self.slots
    }

    pub fn is_suspended(&self) -> bool {
        self.sq.lock().unwrap().flags.contains(QueueFlags::SUSPENDED)
    }

    /// Free submission entries given the ring pointers.
    fn free_entries(&self, head: u32, tail: u32) -> u32 {
        self.sq_size - 1 - (tail + self.sq_size - head) % self.sq_size
    }

    /// Take a free command slot.
    ///
    /// Returns `None` when every slot is in use or the queue is suspended;
    /// callers are expected to push back on their own submitters.
    pub fn allocate(&self) -> Option<&Command> {
        let mut sq = self.sq.lock().unwrap();
        if sq.flags.contains(QueueFlags::SUSPENDED) {
            return None;
        }
        self.slots.allocate(&mut sq.free)
    }

    /// Return a command slot to the pool.
    ///
    /// Safe to call from completion context: no queue locks are taken.
    pub fn release(&self, cmd: &Command) {
        let slot = cmd.lock().timeout_slot.take();
        if let (Some(wheel), Some(slot)) = (&self.timeouts, slot) {
            wheel.disarm(slot);
        }
        self.slots.release(cmd);
    }

    /// Write `cmd` into the submission ring and ring the doorbell.
    ///
    /// The command only becomes `Active` here. A full ring or suspended
    /// queue fails without touching the hardware.
    pub(crate) fn enqueue(&self, cmd: &Command) -> CmdResult {
        let mut sq = self.sq.lock().unwrap();
        if sq.entries == 0 {
            let head = self.sq_head_hint.swap(SQ_HEAD_NONE, Ordering::AcqRel);
            if head != SQ_HEAD_NONE {
                sq.head = head;
            }
            sq.entries = self.free_entries(sq.head, sq.tail);
        }
        if sq.entries == 0 {
            warn!(self.log, "submission queue full"; "cid" => cmd.id());
            return Err(NvmeError::QueueFull);
        }
        if sq.flags.contains(QueueFlags::SUSPENDED) {
            return Err(NvmeError::InReset);
        }

        let mut sqe = cmd.sqe();
        sqe.set_cid(cmd.id());
        self.sq_mem.write(sq.tail as usize * SQE_SIZE, &sqe);
        if let Some(wheel) = &self.timeouts {
            cmd.lock().timeout_slot = Some(wheel.arm());
        }
        cmd.set_status(CmdStatus::Active);

        sq.tail = (sq.tail + 1) % self.sq_size;
        sq.entries -= 1;
        self.regs.write32(self.doorbells.sq, sq.tail);
        Ok(())
    }

    /// Stop submissions and mask the queue's interrupt.
    pub fn suspend(&self) -> CmdResult {
        let mut sq = self.sq.lock().unwrap();
        if sq.flags.contains(QueueFlags::SUSPENDED) {
            warn!(self.log, "queue already suspended");
            return Err(NvmeError::BadParam);
        }
        self.intr.disable(self.vector);
        sq.flags.insert(QueueFlags::SUSPENDED);
        Ok(())
    }

    pub fn resume(&self) -> CmdResult {
        let mut sq = self.sq.lock().unwrap();
        if !sq.flags.contains(QueueFlags::SUSPENDED) {
            warn!(self.log, "queue is not suspended");
            return Err(NvmeError::BadParam);
        }
        sq.flags.remove(QueueFlags::SUSPENDED);
        self.intr.enable(self.vector);
        Ok(())
    }

    /// Drain whatever the controller has posted, then complete every
    /// command still outstanding with `status`.
    pub fn flush(&self, status: NvmeError) {
        let mut cq = self.cq.lock().unwrap();
        self.sq.lock().unwrap().flags.insert(QueueFlags::FLUSHING);
        self.process_locked(&mut cq);

        let mut flushed = 0;
        for cmd in self.slots.iter() {
            if matches!(
                cmd.status(),
                CmdStatus::Active | CmdStatus::FreeOnComplete
            ) {
                self.complete(cmd, Err(status));
                flushed += 1;
            }
        }
        self.sq.lock().unwrap().flags.remove(QueueFlags::FLUSHING);
        if flushed > 0 {
            info!(self.log, "flushed outstanding commands";
                "count" => flushed, "status" => %status);
        }
    }

    /// Return both rings to their initial state.
    ///
    /// Only legal on a suspended queue, after it has been flushed. The free
    /// pool is left as it is: a slot still held by a submitter, or by a
    /// waiter which has not yet seen its flushed completion, stays with its
    /// holder and comes back through [`Self::release`].
    pub fn reset(&self) -> CmdResult {
        let mut cq = self.cq.lock().unwrap();
        let mut sq = self.sq.lock().unwrap();
        if !sq.flags.contains(QueueFlags::SUSPENDED) {
            error!(self.log, "attempt to reset an active queue");
            return Err(NvmeError::Busy);
        }

        self.sq_mem.zero();
        self.cq_mem.zero();
        *cq = CompState::new();
        sq.head = 0;
        sq.tail = 0;
        sq.entries = self.sq_size - 1;
        self.sq_head_hint.store(SQ_HEAD_NONE, Ordering::Release);
        if let Some(wheel) = &self.timeouts {
            for cmd in self.slots.iter() {
                cmd.lock().timeout_slot = None;
            }
            wheel.clear();
        }
        info!(self.log, "queue reset");
        Ok(())
    }

    /// Commands currently owned by the controller.
    pub fn active_commands(&self) -> impl Iterator<Item = &Command> + '_ {
        self.slots.iter().filter(|c| c.status() == CmdStatus::Active)
    }

    /// Commands submitted during timeout slot `slot` still outstanding.
    pub(crate) fn timed_out(&self, slot: usize) -> u32 {
        self.timeouts.as_ref().map(|w| w.outstanding(slot)).unwrap_or(0)
    }

    pub fn stats(&self) -> QueueStats {
        let sq = self.sq.lock().unwrap();
        QueueStats {
            qid: self.id,
            sq_size: self.sq_size,
            cq_size: self.cq_size,
            active: self.slots.active(),
            free: self.slots.free_count(&sq.free),
            suspended: sq.flags.contains(QueueFlags::SUSPENDED),
        }
    }
}
