// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures: recording register and interrupt mocks, a completion
//! ring writer for driving a single queue by hand, and a simulated
//! controller for exercising whole bring-up and recovery flows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nvme_config_toml::DriverParams;
use slog::{o, Drain, Logger};
use zerocopy::{FromZeros, IntoBytes};

use crate::bits::*;
use crate::ctrlr::{Controller, Hardware};
use crate::hw::*;
use crate::paths::PathNotifier;
use crate::queue::{QueueCreateErr, QueueId, QueueParams, QueuePair};
use crate::state::{CtrlrState, StateMachine};

/// Logger for tests: silent unless `NVME_TEST_LOG` is set.
pub fn test_logger() -> Logger {
    if std::env::var_os("NVME_TEST_LOG").is_none() {
        return Logger::root(slog::Discard, o!());
    }
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Poll `cond` until it holds, giving up after ten seconds.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, ev: String) {
        self.events.lock().unwrap().push(ev);
    }
}

impl PathNotifier for RecordingNotifier {
    fn scan_and_claim(&self) {
        self.record("scan".to_string());
    }

    fn delete_path(&self, nsid: u32) {
        self.record(format!("delete {nsid}"));
    }

    fn paths_lost(&self) {
        self.record("lost".to_string());
    }
}

/// Registers which remember what was written to them.
#[derive(Default)]
pub struct MockRegs {
    values: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl MockRegs {
    pub fn last_write(&self, offset: usize) -> Option<u32> {
        let writes = self.writes.lock().unwrap();
        writes.iter().rev().find(|(off, _)| *off == offset).map(|(_, v)| *v)
    }

    pub fn write_count(&self, offset: usize) -> usize {
        let writes = self.writes.lock().unwrap();
        writes.iter().filter(|(off, _)| *off == offset).count()
    }
}

impl RegisterBlock for MockRegs {
    fn read32(&self, offset: usize) -> u32 {
        self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, val: u32) {
        self.values.lock().unwrap().insert(offset, val);
        self.writes.lock().unwrap().push((offset, val));
    }
}

#[derive(Default)]
pub struct MockIntr {
    enabled: Mutex<BTreeSet<u16>>,
}

impl MockIntr {
    pub fn is_enabled(&self, vector: u16) -> bool {
        self.enabled.lock().unwrap().contains(&vector)
    }
}

impl IntrCtl for MockIntr {
    fn enable(&self, vector: u16) {
        self.enabled.lock().unwrap().insert(vector);
    }

    fn disable(&self, vector: u16) {
        self.enabled.lock().unwrap().remove(&vector);
    }
}

/// Hardware for driving queue pairs directly, with an operational
/// controller state.
pub struct MockHw {
    pub regs: Arc<MockRegs>,
    pub intr: Arc<MockIntr>,
    pub dma: Arc<HeapDma>,
    pub hw: Hardware,
    pub state: Arc<StateMachine>,
    pub log: Logger,
}

impl MockHw {
    pub fn new() -> Self {
        let log = test_logger();
        let regs = Arc::new(MockRegs::default());
        let intr = Arc::new(MockIntr::default());
        let dma = Arc::new(HeapDma::new());
        let hw = Hardware {
            regs: regs.clone(),
            intr: intr.clone(),
            dma: dma.clone(),
        };
        let state = Arc::new(StateMachine::new(log.clone()));
        state.transition(CtrlrState::Operational);
        Self { regs, intr, dma, hw, state, log }
    }

    pub fn queue_params(
        &self,
        params: QueueParams,
    ) -> Result<Arc<QueuePair>, QueueCreateErr> {
        QueuePair::new(params, &self.hw, self.state.clone(), None, &self.log)
    }

    pub fn queue(&self, id: QueueId, size: u32, slots: u32) -> Arc<QueuePair> {
        self.queue_sizes(id, size, size, slots)
    }

    pub fn queue_sizes(
        &self,
        id: QueueId,
        sq_size: u32,
        cq_size: u32,
        slots: u32,
    ) -> Arc<QueuePair> {
        self.queue_params(QueueParams {
            id,
            vector: id,
            sq_size,
            cq_size,
            slots,
            dstrd: 0,
        })
        .unwrap()
    }
}

/// Posts completion entries into a queue's completion ring the way a
/// controller would: low quadword first, phase tag last.
pub struct CqWriter {
    qp: Arc<QueuePair>,
    tail: u32,
    phase: bool,
}

impl CqWriter {
    pub fn new(qp: &Arc<QueuePair>) -> Self {
        Self { qp: qp.clone(), tail: 0, phase: true }
    }

    pub fn post(&mut self, cid: u16, sqhd: u16, sct: u8, sc: u8) {
        self.post_dw0(cid, sqhd, 0, sct, sc)
    }

    pub fn post_dw0(&mut self, cid: u16, sqhd: u16, dw0: u32, sct: u8, sc: u8) {
        let mut cqe = CompletionQueueEntry {
            dw0,
            sqhd,
            sqid: self.qp.id(),
            cid,
            ..Default::default()
        };
        cqe.set_status(sct, sc);
        cqe.set_phase(self.phase);
        let (lo, hi) = cqe.to_words();
        let off = self.tail as usize * CQE_SIZE;
        self.qp.cq_mem.store_u64(off, lo);
        self.qp.cq_mem.store_u64(off + 8, hi);

        self.tail += 1;
        if self.tail == self.qp.cq_size() {
            self.tail = 0;
            self.phase = !self.phase;
        }
    }
}

/// Small queues and short waits, sized to fit the simulated controller.
pub fn sim_params() -> DriverParams {
    DriverParams {
        log_level: 5,
        admin_sub_queue_size: 32,
        admin_cpl_queue_size: 32,
        io_sub_queue_size: 64,
        io_cpl_queue_size: 64,
        io_command_id_size: 32,
        max_io_queues: 2,
        max_namespaces: 4,
        io_timeout: 0,
        admin_timeout_ms: 2000,
        max_async_events: 3,
        poll_interval_us: 100,
    }
}

/// Asynchronous Event Request Limit reported by the simulated controller,
/// 0's based.
const SIM_AERL: u8 = 3;
const SIM_VERSION: u32 = 0x0001_0400;
const SIM_NAMESPACES: u32 = 2;

enum DevMsg {
    /// A submission queue tail doorbell, tagged with the enable epoch it
    /// was written in.
    Doorbell { epoch: u64, qid: QueueId, tail: u32 },
    /// Deliver an interrupt on a vector.
    Interrupt(u16),
}

struct SimSq {
    base: u64,
    size: u32,
    head: u32,
    cqid: QueueId,
}

struct SimCq {
    base: u64,
    size: u32,
    tail: u32,
    phase: bool,
    vector: u16,
}

struct Reply {
    dw0: u32,
    sct: u8,
    sc: u8,
}

fn ok(dw0: u32) -> Option<Reply> {
    Some(Reply { dw0, sct: SCT_GENERIC, sc: STS_SUCCESS })
}

fn fail(sct: u8, sc: u8) -> Option<Reply> {
    Some(Reply { dw0: 0, sct, sc })
}

/// Number of Queues feature value granting `n` of each kind.
fn queue_count(n: u32) -> u32 {
    let n = n.max(1) - 1;
    (n << 16) | n
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    out[..s.len()].copy_from_slice(s.as_bytes());
    out
}

fn sim_identify_controller() -> IdentifyController {
    let mut id = IdentifyController::new_zeroed();
    id.vid = 0x1de;
    id.mn = padded("Simulated NVMe");
    id.sn = padded("SIM0001");
    id.fr = padded("1.0");
    id.aerl = SIM_AERL;
    id.elpe = 3;
    id.sqes = NvmQueueEntrySize(0).with_required(6).with_maximum(6).0;
    id.cqes = NvmQueueEntrySize(0).with_required(4).with_maximum(4).0;
    id.nn = SIM_NAMESPACES;
    id
}

/// Namespace 1 uses 512 byte blocks, namespace 2 4k blocks.
fn sim_identify_namespace(nsid: u32) -> Option<IdentifyNamespace> {
    let lbads = match nsid {
        1 => 9,
        2 => 12,
        _ => return None,
    };
    let mut ns = IdentifyNamespace::new_zeroed();
    ns.nsze = 1 << 20;
    ns.ncap = 1 << 20;
    let mut lbaf = [LbaFormat::default(); 16];
    lbaf[0].lbads = lbads;
    ns.lbaf = lbaf;
    Some(ns)
}

struct SimState {
    cap: Capabilities,
    cc: Configuration,
    aqa: AdminQueueAttrs,
    asq: u64,
    acq: u64,
    removed: bool,
    /// Bumped on every change of CC.EN.
    epoch: u64,
    enables: usize,
    en_changed: Instant,
    ready_delay: Duration,

    sqs: BTreeMap<QueueId, SimSq>,
    cqs: BTreeMap<QueueId, SimCq>,
    held_aers: Vec<u16>,
    held_io: Vec<(QueueId, u16)>,
    masked: BTreeSet<u16>,
    pending: BTreeSet<u16>,
    seen: BTreeMap<u8, usize>,

    io_status: (u8, u8),
    hold_io: bool,
    refuse_queue_count: bool,
    max_queues: u16,
    smart_warning: u8,
    fail_log_pages: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            cap: Capabilities(0)
                .with_mqes(1023)
                .with_cqr(true)
                .with_to(1)
                .with_dstrd(0)
                .with_css_nvm(true),
            cc: Configuration(0),
            aqa: AdminQueueAttrs(0),
            asq: 0,
            acq: 0,
            removed: false,
            epoch: 0,
            enables: 0,
            en_changed: Instant::now(),
            ready_delay: Duration::ZERO,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            held_aers: Vec::new(),
            held_io: Vec::new(),
            masked: BTreeSet::new(),
            pending: BTreeSet::new(),
            seen: BTreeMap::new(),
            io_status: (SCT_GENERIC, STS_SUCCESS),
            hold_io: false,
            refuse_queue_count: false,
            max_queues: 16,
            smart_warning: 0,
            fail_log_pages: false,
        }
    }

    /// CSTS.RDY follows CC.EN once the ready delay has passed.
    fn ready(&self) -> bool {
        let en = self.cc.enabled();
        match self.en_changed.elapsed() >= self.ready_delay {
            true => en,
            false => !en,
        }
    }

    fn write_cc(&mut self, cc: Configuration) {
        let was = self.cc.enabled();
        self.cc = cc;
        if was == cc.enabled() {
            return;
        }
        self.epoch += 1;
        self.en_changed = Instant::now();
        self.sqs.clear();
        self.cqs.clear();
        self.held_aers.clear();
        self.held_io.clear();
        self.pending.clear();
        if cc.enabled() {
            self.enables += 1;
            self.sqs.insert(
                0,
                SimSq {
                    base: self.asq,
                    size: self.aqa.asqs() as u32 + 1,
                    head: 0,
                    cqid: 0,
                },
            );
            self.cqs.insert(
                0,
                SimCq {
                    base: self.acq,
                    size: self.aqa.acqs() as u32 + 1,
                    tail: 0,
                    phase: true,
                    vector: 0,
                },
            );
        }
    }

    /// Post a completion for `cid` on the completion queue backing `sqid`,
    /// returning the vector to interrupt.
    fn post(
        &mut self,
        dma: &HeapDma,
        sqid: QueueId,
        cid: u16,
        reply: Reply,
    ) -> Option<u16> {
        let sq = self.sqs.get(&sqid)?;
        let sqhd = sq.head as u16;
        let cq = self.cqs.get_mut(&sq.cqid)?;

        let mut cqe = CompletionQueueEntry {
            dw0: reply.dw0,
            sqhd,
            sqid,
            cid,
            ..Default::default()
        };
        cqe.set_status(reply.sct, reply.sc);
        cqe.set_phase(cq.phase);
        let (lo, hi) = cqe.to_words();
        let (buf, off) =
            dma.lookup(cq.base + cq.tail as u64 * CQE_SIZE as u64)?;
        buf.store_u64(off, lo);
        buf.store_u64(off + 8, hi);

        cq.tail += 1;
        if cq.tail == cq.size {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
        Some(cq.vector)
    }

    fn admin(&mut self, dma: &HeapDma, sqe: &SubmissionQueueEntry) -> Option<Reply> {
        *self.seen.entry(sqe.opcode()).or_default() += 1;
        let (cdw10, cdw11) = (sqe.cdw10, sqe.cdw11);
        match sqe.opcode() {
            ADMIN_OPC_IDENTIFY => self.identify(dma, sqe),
            ADMIN_OPC_SET_FEATURES => match cdw10 as u8 {
                FEAT_ID_NUM_QUEUES if self.refuse_queue_count => {
                    fail(SCT_GENERIC, STS_INVAL_FIELD)
                }
                FEAT_ID_NUM_QUEUES => {
                    let nsq = (cdw11 & 0xffff) + 1;
                    let ncq = (cdw11 >> 16) + 1;
                    ok(queue_count(nsq.min(ncq).min(self.max_queues as u32)))
                }
                FEAT_ID_ASYNC_EVENT_CFG => ok(0),
                _ => fail(SCT_GENERIC, STS_INVAL_FIELD),
            },
            ADMIN_OPC_GET_FEATURES => match cdw10 as u8 {
                FEAT_ID_NUM_QUEUES => ok(queue_count(self.max_queues as u32)),
                _ => fail(SCT_GENERIC, STS_INVAL_FIELD),
            },
            ADMIN_OPC_CREATE_IO_CQ => {
                self.cqs.insert(
                    cdw10 as u16,
                    SimCq {
                        base: sqe.prp1,
                        size: (cdw10 >> 16) + 1,
                        tail: 0,
                        phase: true,
                        vector: (cdw11 >> 16) as u16,
                    },
                );
                ok(0)
            }
            ADMIN_OPC_CREATE_IO_SQ => {
                let cqid = (cdw11 >> 16) as u16;
                if cqid == 0 || !self.cqs.contains_key(&cqid) {
                    return fail(SCT_CMD_SPECIFIC, STS_CREATE_IO_Q_INVAL_CQ);
                }
                self.sqs.insert(
                    cdw10 as u16,
                    SimSq {
                        base: sqe.prp1,
                        size: (cdw10 >> 16) + 1,
                        head: 0,
                        cqid,
                    },
                );
                ok(0)
            }
            ADMIN_OPC_DELETE_IO_SQ => {
                self.sqs.remove(&(cdw10 as u16));
                ok(0)
            }
            ADMIN_OPC_DELETE_IO_CQ => {
                self.cqs.remove(&(cdw10 as u16));
                ok(0)
            }
            ADMIN_OPC_GET_LOG_PAGE => self.log_page(dma, sqe),
            ADMIN_OPC_ASYNC_EVENT_REQ => {
                if self.held_aers.len() > SIM_AERL as usize {
                    return fail(SCT_CMD_SPECIFIC, STS_ASYNC_EVENT_LIMIT);
                }
                self.held_aers.push(sqe.cid());
                None
            }
            _ => fail(SCT_GENERIC, STS_INVAL_OPC),
        }
    }

    fn identify(&self, dma: &HeapDma, sqe: &SubmissionQueueEntry) -> Option<Reply> {
        let Some((buf, off)) = dma.lookup(sqe.prp1) else {
            return fail(SCT_GENERIC, STS_DATA_XFER_ERR);
        };
        match sqe.cdw10 as u8 {
            IDENT_CNS_CONTROLLER => {
                buf.write(off, &sim_identify_controller());
                ok(0)
            }
            IDENT_CNS_NAMESPACE => match sim_identify_namespace(sqe.nsid) {
                Some(ns) => {
                    buf.write(off, &ns);
                    ok(0)
                }
                None => fail(SCT_GENERIC, STS_INVALID_NS),
            },
            _ => fail(SCT_GENERIC, STS_INVAL_FIELD),
        }
    }

    fn log_page(&self, dma: &HeapDma, sqe: &SubmissionQueueEntry) -> Option<Reply> {
        let cdw10 = sqe.cdw10;
        let len = ((cdw10 >> 16) as usize + 1) * 4;
        if self.fail_log_pages {
            return fail(SCT_CMD_SPECIFIC, STS_INVALID_LOG_PAGE);
        }
        let Some((buf, off)) = dma.lookup(sqe.prp1) else {
            return fail(SCT_GENERIC, STS_DATA_XFER_ERR);
        };
        match cdw10 as u8 {
            LOG_ID_SMART_HEALTH => {
                let mut smart = SmartLog::new_zeroed();
                smart.critical_warning = self.smart_warning;
                smart.temperature = 300;
                let bytes = smart.as_bytes();
                buf.write_bytes(off, &bytes[..len.min(bytes.len())]);
                ok(0)
            }
            LOG_ID_ERROR_INFO => {
                buf.write_bytes(off, &vec![0u8; len]);
                ok(0)
            }
            _ => fail(SCT_CMD_SPECIFIC, STS_INVALID_LOG_PAGE),
        }
    }

    fn io(&mut self, qid: QueueId, sqe: &SubmissionQueueEntry) -> Option<Reply> {
        if self.hold_io {
            self.held_io.push((qid, sqe.cid()));
            return None;
        }
        let (sct, sc) = self.io_status;
        Some(Reply { dw0: 0, sct, sc })
    }
}

/// A controller model good enough for the driver's bring-up, admin, I/O and
/// recovery paths.
///
/// Doorbell writes are handed to a device thread which consumes submission
/// entries from DMA memory and posts completions back, so commands finish
/// asynchronously just as they would on hardware.
pub struct SimCtrlr {
    state: Mutex<SimState>,
    dma: Arc<HeapDma>,
    tx: Sender<DevMsg>,
    ctrlr: Mutex<Weak<Controller>>,
}

impl SimCtrlr {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sim = Arc::new(Self {
            state: Mutex::new(SimState::new()),
            dma: Arc::new(HeapDma::new()),
            tx,
            ctrlr: Mutex::new(Weak::new()),
        });
        let weak = Arc::downgrade(&sim);
        thread::Builder::new()
            .name("nvme-sim".to_string())
            .spawn(move || device_loop(weak, rx))
            .unwrap();
        sim
    }

    pub fn hardware(self: &Arc<Self>) -> Hardware {
        Hardware {
            regs: self.clone(),
            intr: self.clone(),
            dma: self.dma.clone(),
        }
    }

    /// Route interrupts to `ctrlr`.
    pub fn attach(&self, ctrlr: &Arc<Controller>) {
        *self.ctrlr.lock().unwrap() = Arc::downgrade(ctrlr);
    }

    fn st(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn held_aers(&self) -> usize {
        self.st().held_aers.len()
    }

    /// Admin commands with `opcode` received so far.
    pub fn commands_seen(&self, opcode: u8) -> usize {
        self.st().seen.get(&opcode).copied().unwrap_or(0)
    }

    pub fn set_io_status(&self, sct: u8, sc: u8) {
        self.st().io_status = (sct, sc);
    }

    pub fn set_refuse_queue_count(&self, refuse: bool) {
        self.st().refuse_queue_count = refuse;
    }

    pub fn set_max_queues(&self, max: u16) {
        self.st().max_queues = max;
    }

    /// Accept I/O commands without ever completing them. Held commands
    /// are dropped when the controller is disabled.
    pub fn set_hold_io(&self, hold: bool) {
        self.st().hold_io = hold;
    }

    /// Make every register read back as all ones.
    pub fn set_removed(&self, removed: bool) {
        self.st().removed = removed;
    }

    /// Number of times the controller has been enabled.
    pub fn enable_count(&self) -> usize {
        self.st().enables
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.st().ready_delay = delay;
    }

    pub fn set_smart_warning(&self, warning: CriticalWarning) {
        self.st().smart_warning = warning.bits();
    }

    pub fn set_fail_log_pages(&self, fail: bool) {
        self.st().fail_log_pages = fail;
    }

    /// Complete the oldest held async event request with `dw0`.
    pub fn post_async_event(&self, dw0: u32) -> bool {
        let vector = {
            let mut st = self.st();
            if st.held_aers.is_empty() {
                return false;
            }
            let cid = st.held_aers.remove(0);
            let reply = Reply { dw0, sct: SCT_GENERIC, sc: STS_SUCCESS };
            st.post(&self.dma, 0, cid, reply)
        };
        if let Some(v) = vector {
            let _ = self.tx.send(DevMsg::Interrupt(v));
        }
        true
    }

    /// Consume submission entries up to `tail`, returning the vectors
    /// which need an interrupt.
    fn run_queue(&self, epoch: u64, qid: QueueId, tail: u32) -> Vec<u16> {
        let mut vectors = Vec::new();
        let mut st = self.st();
        if epoch != st.epoch || st.removed || !st.cc.enabled() {
            return vectors;
        }
        let Some(sq) = st.sqs.get(&qid) else {
            return vectors;
        };
        let (base, size) = (sq.base, sq.size);
        if tail >= size {
            return vectors;
        }

        loop {
            let head = match st.sqs.get(&qid) {
                Some(sq) if sq.head != tail => sq.head,
                _ => break,
            };
            let addr = base + head as u64 * SQE_SIZE as u64;
            let Some((buf, off)) = self.dma.lookup(addr) else {
                break;
            };
            let sqe: SubmissionQueueEntry = buf.read(off);
            if let Some(sq) = st.sqs.get_mut(&qid) {
                sq.head = (head + 1) % size;
            }

            let reply = match qid {
                0 => st.admin(&self.dma, &sqe),
                _ => st.io(qid, &sqe),
            };
            if let Some(reply) = reply {
                if let Some(v) = st.post(&self.dma, qid, sqe.cid(), reply) {
                    vectors.push(v);
                }
            }
        }
        vectors
    }

    /// Interrupt the controller on each unmasked vector. Masked vectors
    /// stay pending until they are enabled again.
    fn deliver(&self, mut vectors: Vec<u16>) {
        vectors.sort_unstable();
        vectors.dedup();
        {
            let mut st = self.st();
            vectors.retain(|v| {
                if st.masked.contains(v) {
                    st.pending.insert(*v);
                    false
                } else {
                    true
                }
            });
        }
        let ctrlr = self.ctrlr.lock().unwrap().upgrade();
        if let Some(ctrlr) = ctrlr {
            for v in vectors {
                ctrlr.handle_interrupt(v);
            }
        }
    }
}

fn device_loop(sim: Weak<SimCtrlr>, rx: Receiver<DevMsg>) {
    for msg in rx.iter() {
        let Some(sim) = sim.upgrade() else {
            break;
        };
        let vectors = match msg {
            DevMsg::Doorbell { epoch, qid, tail } => {
                sim.run_queue(epoch, qid, tail)
            }
            DevMsg::Interrupt(v) => vec![v],
        };
        if !vectors.is_empty() {
            sim.deliver(vectors);
        }
    }
}

impl RegisterBlock for SimCtrlr {
    fn read32(&self, offset: usize) -> u32 {
        let st = self.st();
        if st.removed {
            return REG_ALL_ONES;
        }
        match offset {
            REG_CAP => st.cap.0 as u32,
            o if o == REG_CAP + 4 => (st.cap.0 >> 32) as u32,
            REG_VS => SIM_VERSION,
            REG_CC => st.cc.0,
            REG_CSTS => Status(0).with_ready(st.ready()).0,
            REG_AQA => st.aqa.0,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, val: u32) {
        let mut st = self.st();
        if st.removed {
            return;
        }
        let lo = |reg: u64| (reg & !0xffff_ffff) | val as u64;
        let hi = |reg: u64| (reg & 0xffff_ffff) | (val as u64) << 32;
        match offset {
            REG_CC => st.write_cc(Configuration(val)),
            REG_AQA => st.aqa = AdminQueueAttrs(val),
            REG_ASQ => st.asq = lo(st.asq),
            o if o == REG_ASQ + 4 => st.asq = hi(st.asq),
            REG_ACQ => st.acq = lo(st.acq),
            o if o == REG_ACQ + 4 => st.acq = hi(st.acq),
            o if o >= REG_DOORBELL_BASE => {
                // Stride of 4 bytes: SQ tail and CQ head doorbells
                // alternate. Completion heads need no action.
                let idx = (o - REG_DOORBELL_BASE) / 4;
                if idx % 2 == 0 {
                    let _ = self.tx.send(DevMsg::Doorbell {
                        epoch: st.epoch,
                        qid: (idx / 2) as QueueId,
                        tail: val,
                    });
                }
            }
            _ => {}
        }
    }
}

impl IntrCtl for SimCtrlr {
    fn enable(&self, vector: u16) {
        let pending = {
            let mut st = self.st();
            st.masked.remove(&vector);
            st.pending.remove(&vector)
        };
        if pending {
            let _ = self.tx.send(DevMsg::Interrupt(vector));
        }
    }

    fn disable(&self, vector: u16) {
        self.st().masked.insert(vector);
    }
}

#[test]
fn error_classes() {
    use crate::{queue, NvmeError};

    assert!(NvmeError::QueueFull.is_transient());
    assert!(NvmeError::InReset.is_transient());
    assert!(!NvmeError::InReset.is_terminal());
    assert!(NvmeError::DeviceMissing.is_terminal());
    assert!(!NvmeError::DeviceMissing.requires_reset());
    assert!(NvmeError::ProtocolError.requires_reset());
    assert!(!NvmeError::InvalidField.is_transient());
    assert!(!NvmeError::InvalidField.requires_reset());

    let err: NvmeError = queue::QueueCreateErr::InvalidSize.into();
    assert_eq!(err.to_string(), "failed to create queue: invalid size");
}
