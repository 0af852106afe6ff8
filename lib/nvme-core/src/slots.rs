// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed pool of per-queue command contexts.
//!
//! Commands are addressed by a 1-based identifier equal to their index in
//! the table plus one; identifier 0 is never handed out. Allocation happens
//! under the owning queue's submission lock from a simple cursor list, while
//! release pushes onto a lock-free pending stack so that it may be done
//! from completion (interrupt) context without blocking on submitters.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::bits::{CompletionQueueEntry, SubmissionQueueEntry};
use crate::queue::QueuePair;
use crate::{CmdResult, NvmeError};

pub type CmdId = u16;

/// Invoked once the controller (or a queue flush) completes the command.
///
/// The callback owns the slot at that point and must see it released,
/// either directly or through [`QueuePair::release`].
pub type DoneFn = Box<dyn FnOnce(&QueuePair, &Command, CmdResult) + Send>;

/// Frees whatever resources the submitter tied to the command.
pub type CleanupFn = Box<dyn FnOnce(&Command) + Send>;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::FromRepr)]
pub enum CmdStatus {
    Free = 0,
    Active = 1,
    Done = 2,
    FreeOnComplete = 3,
}

/// Identity of the external request a command was issued for.
///
/// Only used for matching during task management, never dereferenced.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestTag {
    pub initiator: u64,
    pub serial: u64,
}

#[derive(Default)]
pub(crate) struct CmdInner {
    pub(crate) sqe: SubmissionQueueEntry,
    pub(crate) cqe: CompletionQueueEntry,
    pub(crate) result: Option<CmdResult>,
    pub(crate) done: Option<DoneFn>,
    pub(crate) cleanup: Option<CleanupFn>,
    pub(crate) request: Option<RequestTag>,
    pub(crate) timeout_slot: Option<usize>,
}

/// A command slot.
pub struct Command {
    id: CmdId,
    status: AtomicU8,
    /// Link to the next free slot while on a free list, 0 terminates.
    next: AtomicU16,
    pub(crate) inner: Mutex<CmdInner>,
    pub(crate) cv: Condvar,
}

impl Command {
    fn new(id: CmdId) -> Self {
        Self {
            id,
            status: AtomicU8::new(CmdStatus::Free as u8),
            next: AtomicU16::new(0),
            inner: Mutex::new(CmdInner::default()),
            cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> CmdId {
        self.id
    }

    pub fn status(&self) -> CmdStatus {
        CmdStatus::from_repr(self.status.load(Ordering::Acquire))
            .unwrap_or(CmdStatus::Free)
    }

    pub(crate) fn set_status(&self, status: CmdStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Atomically move from `old` to `new`, returning the status observed
    /// on failure.
    pub(crate) fn cas_status(
        &self,
        old: CmdStatus,
        new: CmdStatus,
    ) -> Result<(), CmdStatus> {
        self.status
            .compare_exchange(
                old as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|cur| CmdStatus::from_repr(cur).unwrap_or(CmdStatus::Free))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CmdInner> {
        self.inner.lock().unwrap()
    }

    /// Set the outbound command. The identifier is stamped in at submission.
    pub fn set_sqe(&self, sqe: SubmissionQueueEntry) {
        self.lock().sqe = sqe;
    }

    pub fn sqe(&self) -> SubmissionQueueEntry {
        self.lock().sqe
    }

    /// The last completion recorded for this command.
    pub fn cqe(&self) -> CompletionQueueEntry {
        self.lock().cqe
    }

    pub fn set_cleanup(&self, cleanup: CleanupFn) {
        self.lock().cleanup = Some(cleanup);
    }

    pub fn set_request(&self, tag: RequestTag) {
        self.lock().request = Some(tag);
    }

    pub fn request(&self) -> Option<RequestTag> {
        self.lock().request
    }

    /// Run (and consume) the cleanup callback, if one is set.
    pub(crate) fn run_cleanup(&self) {
        let cleanup = self.lock().cleanup.take();
        if let Some(cleanup) = cleanup {
            cleanup(self);
        }
    }
}

/// Locked half of the free list, owned by the queue's submission state.
#[derive(Debug, Default)]
pub(crate) struct FreeCursor {
    head: CmdId,
    len: u32,
}

impl FreeCursor {
    pub(crate) fn len(&self) -> u32 {
        self.len
    }
}

/// The pending stack packs its head identifier into the low half of a
/// quadword and its length into the high half.
fn pack(head: CmdId, len: u32) -> u64 {
    head as u64 | (len as u64) << 32
}

fn unpack(val: u64) -> (CmdId, u32) {
    (val as CmdId, (val >> 32) as u32)
}

pub struct CommandSlotTable {
    slots: Box<[Command]>,
    pending: AtomicU64,
    active: AtomicU32,
}

impl CommandSlotTable {
    /// Build a table of `count` slots, all of them on the returned cursor.
    pub(crate) fn new(count: u16) -> (Self, FreeCursor) {
        let slots = (1..=count).map(Command::new).collect();
        let table =
            Self { slots, pending: AtomicU64::new(0), active: AtomicU32::new(0) };
        let mut cursor = FreeCursor::default();
        table.link_all(&mut cursor);
        (table, cursor)
    }

    pub fn count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Look up a slot by identifier. Out-of-range identifiers yield `None`.
    pub fn get(&self, id: CmdId) -> Option<&Command> {
        match id {
            0 => None,
            _ => self.slots.get(id as usize - 1),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.slots.iter()
    }

    /// Number of slots handed out and not yet released.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Take a slot from the cursor, splicing in the pending stack when the
    /// cursor has run dry.
    ///
    /// The caller holds the lock protecting `cursor`.
    pub(crate) fn allocate(&self, cursor: &mut FreeCursor) -> Option<&Command> {
        if cursor.head == 0 {
            let (head, len) = unpack(self.pending.swap(0, Ordering::AcqRel));
            cursor.head = head;
            cursor.len = len;
        }
        let cmd = self.get(cursor.head)?;
        cursor.head = cmd.next.load(Ordering::Acquire);
        cursor.len -= 1;
        self.active.fetch_add(1, Ordering::AcqRel);
        assert_eq!(cmd.status(), CmdStatus::Free);
        Some(cmd)
    }

    /// Return a slot to the pool. Takes no queue locks.
    pub(crate) fn release(&self, cmd: &Command) {
        {
            let mut inner = cmd.lock();
            inner.done = None;
            inner.cleanup = None;
            inner.request = None;
            inner.result = None;
        }
        cmd.set_status(CmdStatus::Free);
        self.active.fetch_sub(1, Ordering::AcqRel);

        let mut old = self.pending.load(Ordering::Acquire);
        loop {
            let (head, len) = unpack(old);
            cmd.next.store(head, Ordering::Release);
            match self.pending.compare_exchange_weak(
                old,
                pack(cmd.id, len + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    /// Link every slot onto the cursor in identifier order.
    fn link_all(&self, cursor: &mut FreeCursor) {
        self.pending.store(0, Ordering::Release);
        for (idx, cmd) in self.slots.iter().enumerate() {
            *cmd.lock() = CmdInner::default();
            cmd.set_status(CmdStatus::Free);
            let next = match idx + 1 < self.slots.len() {
                true => cmd.id + 1,
                false => 0,
            };
            cmd.next.store(next, Ordering::Release);
        }
        cursor.head = match self.slots.is_empty() {
            true => 0,
            false => 1,
        };
        cursor.len = self.slots.len() as u32;
        self.active.store(0, Ordering::Release);
    }

    /// Slots currently free, with `cursor` being the locked half.
    pub(crate) fn free_count(&self, cursor: &FreeCursor) -> u32 {
        cursor.len + unpack(self.pending.load(Ordering::Acquire)).1
    }
}

/// Reject a slot count which cannot be expressed in a command identifier.
pub(crate) fn validate_count(count: u32) -> Result<u16, NvmeError> {
    match count {
        1..=0xfffe => Ok(count as u16),
        _ => Err(NvmeError::BadParam),
    }
}
