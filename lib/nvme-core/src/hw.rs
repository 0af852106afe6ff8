// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware collaborators: controller registers, interrupt control and
//! DMA-able memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::bits::REG_ALL_ONES;
use crate::queue::QueueId;

// Controller register offsets within BAR0
// See NVMe 1.0e Section 3.1 Register Definition

pub const REG_CAP: usize = 0x00;
pub const REG_VS: usize = 0x08;
pub const REG_INTMS: usize = 0x0c;
pub const REG_INTMC: usize = 0x10;
pub const REG_CC: usize = 0x14;
pub const REG_CSTS: usize = 0x1c;
pub const REG_AQA: usize = 0x24;
pub const REG_ASQ: usize = 0x28;
pub const REG_ACQ: usize = 0x30;
pub const REG_DOORBELL_BASE: usize = 0x1000;

/// Memory-mapped controller registers.
pub trait RegisterBlock: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, val: u32);

    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    fn write64(&self, offset: usize, val: u64) {
        self.write32(offset, val as u32);
        self.write32(offset + 4, (val >> 32) as u32);
    }
}

/// Per-vector interrupt masking.
///
/// Once a vector is enabled, the platform delivers its interrupts to
/// [`crate::Controller::handle_interrupt`].
pub trait IntrCtl: Send + Sync {
    fn enable(&self, vector: u16);
    fn disable(&self, vector: u16);
}

/// Source of memory shared with the controller.
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, len: usize) -> Result<Arc<DmaBuf>, DmaError>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("cannot allocate an empty DMA buffer")]
    ZeroLength,

    #[error("DMA address space exhausted")]
    Exhausted,
}

/// A buffer visible to both the driver and the device at `iova`.
///
/// Contents are held as little-endian quadwords so that the device and the
/// driver can race on them without tearing individual words.
#[derive(Debug)]
pub struct DmaBuf {
    iova: u64,
    len: usize,
    words: Box<[AtomicU64]>,
}

impl DmaBuf {
    pub fn new(iova: u64, len: usize) -> Self {
        let words = (0..(len + 7) / 8).map(|_| AtomicU64::new(0)).collect();
        Self { iova, len, words }
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load the aligned quadword at `offset` with acquire ordering.
    pub fn load_u64(&self, offset: usize) -> u64 {
        debug_assert_eq!(offset % 8, 0);
        self.words[offset / 8].load(Ordering::Acquire)
    }

    /// Store the aligned quadword at `offset` with release ordering.
    pub fn store_u64(&self, offset: usize, val: u64) {
        debug_assert_eq!(offset % 8, 0);
        self.words[offset / 8].store(val, Ordering::Release)
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len);
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let start = pos % 8;
            let n = (8 - start).min(buf.len() - done);
            let word = self.words[pos / 8].load(Ordering::Acquire);
            buf[done..done + n]
                .copy_from_slice(&word.to_le_bytes()[start..start + n]);
            done += n;
        }
    }

    /// Copy `data` in, lowest quadword first.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done;
            let start = pos % 8;
            let n = (8 - start).min(data.len() - done);
            let slot = &self.words[pos / 8];
            let mut bytes = match n {
                8 => [0u8; 8],
                _ => slot.load(Ordering::Acquire).to_le_bytes(),
            };
            bytes[start..start + n].copy_from_slice(&data[done..done + n]);
            slot.store(u64::from_le_bytes(bytes), Ordering::Release);
            done += n;
        }
    }

    pub fn read<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut val = T::new_zeroed();
        self.read_bytes(offset, val.as_mut_bytes());
        val
    }

    pub fn write<T: IntoBytes + Immutable>(&self, offset: usize, val: &T) {
        self.write_bytes(offset, val.as_bytes())
    }

    pub fn zero(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

/// Heap-backed [`DmaAllocator`] handing out addresses from a private
/// IO-virtual space.
///
/// Buffers can be found again by address, which is how a device model
/// reaches the rings and data buffers it is told about.
pub struct HeapDma {
    next: AtomicU64,
    regions: Mutex<BTreeMap<u64, Weak<DmaBuf>>>,
}

impl HeapDma {
    const BASE: u64 = 0x1_0000_0000;
    const PAGE: u64 = 4096;

    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(Self::BASE),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Find the live buffer containing `addr`, along with the offset of
    /// `addr` into it.
    pub fn lookup(&self, addr: u64) -> Option<(Arc<DmaBuf>, usize)> {
        let mut regions = self.regions.lock().unwrap();
        let (&base, region) = regions.range(..=addr).next_back()?;
        match region.upgrade() {
            Some(buf) if addr < base + buf.len() as u64 => {
                Some((buf, (addr - base) as usize))
            }
            Some(_) => None,
            None => {
                regions.remove(&base);
                None
            }
        }
    }
}

impl Default for HeapDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HeapDma {
    fn alloc(&self, len: usize) -> Result<Arc<DmaBuf>, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }
        let span = (len as u64 + Self::PAGE - 1) & !(Self::PAGE - 1);
        let iova = self.next.fetch_add(span, Ordering::Relaxed);
        iova.checked_add(span).ok_or(DmaError::Exhausted)?;

        let buf = Arc::new(DmaBuf::new(iova, len));
        self.regions.lock().unwrap().insert(iova, Arc::downgrade(&buf));
        Ok(buf)
    }
}

/// Register offsets of a queue pair's doorbells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Doorbells {
    pub sq: usize,
    pub cq: usize,
}

impl Doorbells {
    /// Doorbells sit in pairs after the registers, spaced 2^(2 + DSTRD)
    /// bytes apart.
    ///
    /// See NVMe 1.0e Section 3.1.10 / 3.1.11
    pub fn new(qid: QueueId, dstrd: u8) -> Self {
        let stride = 4usize << dstrd;
        let sq = REG_DOORBELL_BASE + (2 * qid as usize) * stride;
        Self { sq, cq: sq + stride }
    }
}

/// A surprise-removed device reads back as all ones.
pub fn is_removed(regs: &dyn RegisterBlock) -> bool {
    regs.read32(REG_CSTS) == REG_ALL_ONES
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::CompletionQueueEntry;

    #[test]
    fn doorbell_layout() {
        assert_eq!(Doorbells::new(0, 0), Doorbells { sq: 0x1000, cq: 0x1004 });
        assert_eq!(Doorbells::new(3, 0), Doorbells { sq: 0x1018, cq: 0x101c });
        assert_eq!(Doorbells::new(1, 2), Doorbells { sq: 0x1020, cq: 0x1030 });
    }

    #[test]
    fn dma_lookup() {
        let dma = HeapDma::new();
        let a = dma.alloc(100).unwrap();
        let b = dma.alloc(8192).unwrap();
        assert!(matches!(dma.alloc(0), Err(DmaError::ZeroLength)));

        let (found, off) = dma.lookup(b.iova() + 4100).unwrap();
        assert_eq!(found.iova(), b.iova());
        assert_eq!(off, 4100);

        // Past the end of `a` but still within its page
        assert!(dma.lookup(a.iova() + 100).is_none());

        let b_iova = b.iova();
        drop(b);
        assert!(dma.lookup(b_iova).is_none());
    }

    #[test]
    fn dma_typed_access() {
        let buf = DmaBuf::new(0, 64);
        let mut cqe = CompletionQueueEntry { cid: 9, dw0: 0xabcd, ..Default::default() };
        cqe.set_phase(true);
        buf.write(16, &cqe);

        let (lo, hi) = cqe.to_words();
        assert_eq!(buf.load_u64(16), lo);
        assert_eq!(buf.load_u64(24), hi);

        let back: CompletionQueueEntry = buf.read(16);
        assert_eq!(back, cqe);

        // Unaligned partial writes leave neighbours alone
        buf.write_bytes(3, &[0xff, 0xee]);
        let mut out = [0u8; 6];
        buf.read_bytes(1, &mut out);
        assert_eq!(out, [0, 0, 0xff, 0xee, 0, 0]);

        buf.zero();
        assert_eq!(buf.load_u64(16), 0);
    }
}
