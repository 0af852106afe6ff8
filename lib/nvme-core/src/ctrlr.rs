// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nvme_config_toml::DriverParams;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::aen::AsyncEventMonitor;
use crate::bits::*;
use crate::exception::{self, ExceptionEvent, ExceptionQueue, TaskMgmt};
use crate::hw::{
    self, DmaAllocator, DmaBuf, IntrCtl, RegisterBlock, REG_ACQ, REG_AQA,
    REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_VS,
};
use crate::paths::{Namespace, PathNotifier, PathTable};
use crate::queue::{QueueId, QueuePair, QueueParams, QueueStats, ADMIN_QUEUE_ID};
use crate::slots::{Command, RequestTag};
use crate::state::{CtrlrState, StateMachine};
use crate::timeout::TimeoutClock;
use crate::{CmdResult, NvmeError};

/// Namespace identifier addressing every namespace.
const NSID_ALL: u32 = 0xffff_ffff;

/// Identify and log page buffers.
const DATA_BUF_SIZE: usize = 4096;

/// The collaborators through which the driver reaches the device.
#[derive(Clone)]
pub struct Hardware {
    pub regs: Arc<dyn RegisterBlock>,
    pub intr: Arc<dyn IntrCtl>,
    pub dma: Arc<dyn DmaAllocator>,
}

/// What Identify Controller told us.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlrIdent {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// Async event requests the controller accepts concurrently.
    pub async_event_limit: u32,
    pub error_log_entries: u32,
    pub namespaces: u32,
}

fn ascii_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Serializable snapshot of a controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub name: String,
    pub state: CtrlrState,
    pub num_io_queues: u16,
    pub outstanding_async_events: u32,
    /// Critical warnings seen in the SMART log.
    pub health: u8,
    pub queues: Vec<QueueStats>,
}

/// State guarded by the controller lock.
pub(crate) struct CtrlrInner {
    ready_timeout: Duration,
    dstrd: u8,
    /// Largest queue the controller supports (CAP.MQES + 1).
    max_entries: u32,
    ident: Option<CtrlrIdent>,
    num_io_queues: u16,
}

pub struct Controller {
    name: String,
    pub(crate) me: Weak<Controller>,
    pub(crate) hw: Hardware,
    pub(crate) params: DriverParams,
    pub(crate) state: Arc<StateMachine>,
    pub(crate) adminq: Arc<QueuePair>,
    ioqs: RwLock<Vec<Arc<QueuePair>>>,
    pub(crate) inner: Mutex<CtrlrInner>,
    pub(crate) clock: Option<Arc<TimeoutClock>>,
    pub(crate) events: Arc<ExceptionQueue>,
    task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) aen: AsyncEventMonitor,
    health: AtomicU8,
    pub(crate) paths: PathTable,
    pub(crate) tm_request: Mutex<Option<RequestTag>>,
    pub(crate) log: Logger,
}

fn log_level(level: u32) -> slog::Level {
    match level {
        1 => slog::Level::Error,
        2 => slog::Level::Warning,
        3 => slog::Level::Info,
        4 => slog::Level::Debug,
        _ => slog::Level::Trace,
    }
}

impl Controller {
    /// Set up the driver state for a controller and start its exception
    /// task. The controller itself is left alone until [`Self::start`].
    pub fn new(
        name: &str,
        hw: Hardware,
        params: &DriverParams,
        notifier: Arc<dyn PathNotifier>,
        log: &Logger,
    ) -> Result<Arc<Self>, NvmeError> {
        let mut params = params.clone();
        let adjusted = params.validate();
        let log = Logger::root(
            slog::LevelFilter::new(log.clone(), log_level(params.log_level))
                .fuse(),
            o!("ctrlr" => name.to_string()),
        );
        for adj in adjusted {
            warn!(log, "driver parameter out of range"; "param" => adj.name,
                "detail" => %adj);
        }

        let cap = hw.regs.read64(REG_CAP);
        if cap == u64::MAX {
            error!(log, "device not present");
            return Err(NvmeError::DeviceMissing);
        }
        let cap = Capabilities(cap);
        let max_entries = cap.mqes() as u32 + 1;

        let state = Arc::new(StateMachine::new(log.clone()));
        let adminq = QueuePair::new(
            QueueParams {
                id: ADMIN_QUEUE_ID,
                vector: 0,
                sq_size: params.admin_sub_queue_size.min(max_entries),
                cq_size: params.admin_cpl_queue_size.min(max_entries),
                slots: params.admin_sub_queue_size,
                dstrd: cap.dstrd(),
            },
            &hw,
            state.clone(),
            None,
            &log,
        )?;
        let clock = match params.io_timeout {
            0 => None,
            secs => Some(Arc::new(TimeoutClock::new(secs as usize))),
        };
        let aen = AsyncEventMonitor::new(params.max_async_events, &log);
        let paths = PathTable::new(notifier, &log);

        let ctrlr = Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            me: me.clone(),
            hw,
            params,
            state,
            adminq,
            ioqs: RwLock::new(Vec::new()),
            inner: Mutex::new(CtrlrInner {
                ready_timeout: ready_timeout(cap),
                dstrd: cap.dstrd(),
                max_entries,
                ident: None,
                num_io_queues: 0,
            }),
            clock,
            events: Arc::new(ExceptionQueue::new()),
            task: Mutex::new(None),
            aen,
            health: AtomicU8::new(0),
            paths,
            tm_request: Mutex::new(None),
            log,
        });

        let tick = ctrlr.clock.as_ref().map(|_| exception::TIMER_TICK);
        let task = exception::spawn(&ctrlr, tick).map_err(|e| {
            error!(ctrlr.log, "failed to spawn exception task"; "error" => %e);
            NvmeError::NoResources
        })?;
        *ctrlr.task.lock().unwrap() = Some(task);
        Ok(ctrlr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CtrlrState {
        self.state.get()
    }

    pub fn admin_queue(&self) -> &Arc<QueuePair> {
        &self.adminq
    }

    pub fn io_queues(&self) -> Vec<Arc<QueuePair>> {
        self.ioqs.read().unwrap().clone()
    }

    pub fn io_queue(&self, qid: QueueId) -> Option<Arc<QueuePair>> {
        self.ioqs.read().unwrap().iter().find(|qp| qp.id() == qid).cloned()
    }

    pub fn num_io_queues(&self) -> u16 {
        self.inner.lock().unwrap().num_io_queues
    }

    pub fn ident(&self) -> Option<CtrlrIdent> {
        self.inner.lock().unwrap().ident.clone()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.paths.namespaces()
    }

    pub fn set_namespace_offline(&self, nsid: u32) -> CmdResult {
        self.paths.namespace_offline(nsid)
    }

    /// Critical warnings accumulated from the SMART log.
    pub fn health(&self) -> CriticalWarning {
        CriticalWarning::from_bits_retain(self.health.load(Ordering::Acquire))
    }

    pub(crate) fn add_health_warning(&self, warning: CriticalWarning) -> CriticalWarning {
        let prev = self.health.fetch_or(warning.bits(), Ordering::AcqRel);
        CriticalWarning::from_bits_retain(prev) | warning
    }

    pub(crate) fn dma_alloc(&self, len: usize) -> Result<Arc<DmaBuf>, NvmeError> {
        self.hw.dma.alloc(len).map_err(|e| {
            warn!(self.log, "DMA allocation failed"; "len" => len, "error" => %e);
            NvmeError::NoResources
        })
    }

    /// Service an interrupt on `vector`, returning the number of completion
    /// entries consumed.
    pub fn handle_interrupt(&self, vector: u16) -> usize {
        if matches!(
            self.state(),
            CtrlrState::Init | CtrlrState::Missing | CtrlrState::Detached
        ) {
            return 0;
        }
        let qp = match vector {
            0 => Some(self.adminq.clone()),
            v => self.ioqs.read().unwrap().iter().find(|q| q.vector() == v).cloned(),
        };
        qp.map_or(0, |qp| qp.process_completions())
    }

    /// Process completions on every queue, as if each had interrupted.
    pub fn poll(&self) -> usize {
        self.adminq.process_completions()
            + self.io_queues().iter().map(|qp| qp.process_completions()).sum::<usize>()
    }

    /// Wait for CSTS.RDY to read as `ready`.
    fn wait_ready(&self, ready: bool) -> CmdResult {
        let timeout = self.inner.lock().unwrap().ready_timeout;
        let start = Instant::now();
        loop {
            if hw::is_removed(&*self.hw.regs) {
                error!(self.log, "device removed while waiting for ready";
                    "ready" => ready);
                self.state.transition(CtrlrState::Missing);
                return Err(NvmeError::DeviceMissing);
            }
            let csts = Status(self.hw.regs.read32(REG_CSTS));
            if csts.ready() == ready {
                return Ok(());
            }
            if start.elapsed() > timeout {
                error!(self.log, "timed out waiting for ready";
                    "ready" => ready, "csts" => csts.0, "cfs" => csts.cfs());
                return Err(NvmeError::Timeout);
            }
            thread::sleep(self.params.poll_interval());
        }
    }

    /// Enable the controller with the admin queue programmed in.
    pub(crate) fn hw_start(&self) -> CmdResult {
        let regs = &*self.hw.regs;
        let cap = regs.read64(REG_CAP);
        if cap == u64::MAX {
            self.state.transition(CtrlrState::Missing);
            return Err(NvmeError::DeviceMissing);
        }
        let cap = Capabilities(cap);
        if cap.mpsmin() > 0 || !cap.css_nvm() {
            error!(self.log, "controller capabilities not supported";
                "mpsmin" => cap.mpsmin(), "css_nvm" => cap.css_nvm());
            return Err(NvmeError::IncompatibleController);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ready_timeout = ready_timeout(cap);
            inner.dstrd = cap.dstrd();
            inner.max_entries = cap.mqes() as u32 + 1;
        }

        if Status(regs.read32(REG_CSTS)).ready() {
            let mut cc = Configuration(regs.read32(REG_CC));
            cc.set_enabled(false);
            regs.write32(REG_CC, cc.0);
            self.wait_ready(false)?;
        }

        let adminq = &self.adminq;
        let aqa = AdminQueueAttrs(0)
            .with_asqs((adminq.sq_size() - 1) as u16)
            .with_acqs((adminq.cq_size() - 1) as u16);
        regs.write32(REG_AQA, aqa.0);
        regs.write64(REG_ASQ, adminq.sq_iova());
        regs.write64(REG_ACQ, adminq.cq_iova());

        let cc = Configuration(0)
            .with_enabled(true)
            .with_css(IOCommandSet::Nvm)
            .with_mps(0)
            .with_ams(ArbitrationMechanism::RoundRobin)
            .with_shn(ShutdownNotification::None)
            .with_iosqes(IOSQES)
            .with_iocqes(IOCQES);
        regs.write32(REG_CC, cc.0);
        self.wait_ready(true)?;

        let vs = regs.read32(REG_VS);
        if vs == REG_ALL_ONES {
            self.state.transition(CtrlrState::Missing);
            return Err(NvmeError::DeviceMissing);
        }
        info!(self.log, "controller enabled";
            "version" => format!("{}.{}", vs >> 16, (vs >> 8) & 0xff));
        Ok(())
    }

    /// Disable the controller. A device which is gone counts as stopped.
    pub(crate) fn hw_stop(&self) -> CmdResult {
        if self.state() == CtrlrState::Missing || hw::is_removed(&*self.hw.regs) {
            return Ok(());
        }
        let regs = &*self.hw.regs;
        let mut cc = Configuration(regs.read32(REG_CC));
        cc.set_enabled(false);
        regs.write32(REG_CC, cc.0);
        match self.wait_ready(false) {
            Err(NvmeError::DeviceMissing) => Ok(()),
            res => res,
        }
    }

    /// Issue an admin command and wait for it.
    pub fn admin_cmd(
        &self,
        sqe: SubmissionQueueEntry,
    ) -> Result<CompletionQueueEntry, NvmeError> {
        let Some(cmd) = self.adminq.allocate() else {
            return Err(match self.adminq.is_suspended() {
                true => NvmeError::InReset,
                false => NvmeError::QueueFull,
            });
        };
        cmd.set_sqe(sqe);
        self.adminq.submit_and_wait(cmd, self.params.admin_timeout())
    }

    /// Read log page `lid` into a `T`.
    pub fn get_log_page<T>(&self, lid: u8) -> Result<T, NvmeError>
    where
        T: zerocopy::FromBytes + zerocopy::IntoBytes,
    {
        let len = std::mem::size_of::<T>();
        let buf = self.dma_alloc(len)?;
        let numd = (len / 4 - 1) as u32;
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_GET_LOG_PAGE);
        sqe.nsid = NSID_ALL;
        sqe.prp1 = buf.iova();
        sqe.cdw10 = (numd << 16) | lid as u32;
        self.admin_cmd(sqe)?;
        Ok(buf.read(0))
    }

    pub fn get_feature(&self, fid: u8) -> Result<u32, NvmeError> {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_GET_FEATURES);
        sqe.cdw10 = fid as u32;
        self.admin_cmd(sqe).map(|cqe| cqe.dw0)
    }

    pub fn set_feature(&self, fid: u8, value: u32) -> Result<u32, NvmeError> {
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_SET_FEATURES);
        sqe.cdw10 = fid as u32;
        sqe.cdw11 = value;
        self.admin_cmd(sqe).map(|cqe| cqe.dw0)
    }

    /// Identify the controller and check that it can run with the entry
    /// sizes the driver uses.
    pub(crate) fn identify(&self) -> CmdResult {
        let buf = self.dma_alloc(DATA_BUF_SIZE)?;
        let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_IDENTIFY);
        sqe.prp1 = buf.iova();
        sqe.cdw10 = IDENT_CNS_CONTROLLER as u32;
        self.admin_cmd(sqe)?;

        let id: IdentifyController = buf.read(0);
        if !id.sqes().supports(IOSQES) || !id.cqes().supports(IOCQES) {
            error!(self.log, "queue entry sizes not supported";
                "sqes" => id.sqes, "cqes" => id.cqes);
            return Err(NvmeError::IncompatibleController);
        }
        let (mn, sn, fr) = (id.mn, id.sn, id.fr);
        let ident = CtrlrIdent {
            model: ascii_field(&mn),
            serial: ascii_field(&sn),
            firmware: ascii_field(&fr),
            async_event_limit: id.aerl as u32 + 1,
            error_log_entries: id.elpe as u32 + 1,
            namespaces: { id.nn },
        };
        info!(self.log, "identified controller";
            "model" => &ident.model,
            "serial" => &ident.serial,
            "firmware" => &ident.firmware,
            "namespaces" => ident.namespaces);
        self.aen.set_limit(self.params.max_async_events.min(ident.async_event_limit));
        self.inner.lock().unwrap().ident = Some(ident);
        Ok(())
    }

    /// Ask for `want` I/O queue pairs, returning how many were granted.
    pub(crate) fn request_io_queues(&self, want: u16) -> Result<u16, NvmeError> {
        let n = want as u32 - 1;
        let granted = match self.set_feature(FEAT_ID_NUM_QUEUES, (n << 16) | n) {
            Ok(dw0) => dw0,
            Err(e) if e.is_terminal() || e == NvmeError::Timeout => return Err(e),
            Err(e) => {
                warn!(self.log, "queue count request refused"; "error" => %e);
                match self.get_feature(FEAT_ID_NUM_QUEUES) {
                    Ok(dw0) => dw0,
                    Err(_) => 0,
                }
            }
        };
        let nsqa = (granted & 0xffff) + 1;
        let ncqa = (granted >> 16) + 1;
        let count = (want as u32).min(nsqa).min(ncqa) as u16;
        debug!(self.log, "I/O queues granted";
            "requested" => want, "sq" => nsqa, "cq" => ncqa, "using" => count);
        Ok(count)
    }

    /// Tell the controller about `qp`, completion queue first.
    pub(crate) fn create_hw_queue(&self, qp: &QueuePair) -> CmdResult {
        let qid = qp.id() as u32;

        let mut cq = SubmissionQueueEntry::new(ADMIN_OPC_CREATE_IO_CQ);
        cq.prp1 = qp.cq_iova();
        cq.cdw10 = ((qp.cq_size() - 1) << 16) | qid;
        // Interrupts enabled, physically contiguous
        cq.cdw11 = ((qp.vector() as u32) << 16) | 0b11;
        self.admin_cmd(cq)?;

        let mut sq = SubmissionQueueEntry::new(ADMIN_OPC_CREATE_IO_SQ);
        sq.prp1 = qp.sq_iova();
        sq.cdw10 = ((qp.sq_size() - 1) << 16) | qid;
        sq.cdw11 = (qid << 16) | 0b1;
        if let Err(e) = self.admin_cmd(sq) {
            error!(self.log, "failed to create submission queue";
                "qid" => qid, "error" => %e);
            let mut del = SubmissionQueueEntry::new(ADMIN_OPC_DELETE_IO_CQ);
            del.cdw10 = qid;
            let _ = self.admin_cmd(del);
            return Err(e);
        }
        Ok(())
    }

    fn create_io_queues(&self, count: u16) -> CmdResult {
        let (dstrd, max_entries) = {
            let inner = self.inner.lock().unwrap();
            (inner.dstrd, inner.max_entries)
        };
        let mut queues = Vec::with_capacity(count as usize);
        for qid in 1..=count {
            let qp = QueuePair::new(
                QueueParams {
                    id: qid,
                    vector: qid,
                    sq_size: self.params.io_sub_queue_size.min(max_entries),
                    cq_size: self.params.io_cpl_queue_size.min(max_entries),
                    slots: self.params.io_command_id_size,
                    dstrd,
                },
                &self.hw,
                self.state.clone(),
                self.clock.clone(),
                &self.log,
            )?;
            self.create_hw_queue(&qp)?;
            qp.resume()?;
            queues.push(qp);
        }
        *self.ioqs.write().unwrap() = queues;
        Ok(())
    }

    fn configure_async_events(&self) {
        if let Err(e) = self.set_feature(FEAT_ID_ASYNC_EVENT_CFG, ASYNC_EVENT_CFG_ALL) {
            warn!(self.log, "failed to configure async events"; "error" => %e);
        }
    }

    fn scan_namespaces(&self) {
        let count = self
            .ident()
            .map_or(0, |id| id.namespaces)
            .min(self.params.max_namespaces);
        for nsid in 1..=count {
            let res = self.dma_alloc(DATA_BUF_SIZE).and_then(|buf| {
                let mut sqe = SubmissionQueueEntry::new(ADMIN_OPC_IDENTIFY);
                sqe.nsid = nsid;
                sqe.prp1 = buf.iova();
                sqe.cdw10 = IDENT_CNS_NAMESPACE as u32;
                self.admin_cmd(sqe)?;
                Ok(buf.read::<IdentifyNamespace>(0))
            });
            match res {
                Ok(id) => self.paths.update(nsid, &id),
                Err(e) => {
                    warn!(self.log, "failed to identify namespace";
                        "nsid" => nsid, "error" => %e);
                }
            }
        }
    }

    fn bring_up(&self) -> CmdResult {
        self.hw_start()?;
        self.state.transition(CtrlrState::Started);
        self.adminq.resume()?;
        self.identify()?;

        let want = self.params.max_io_queues.min(u16::MAX as u32) as u16;
        let count = self.request_io_queues(want)?;
        self.create_io_queues(count)?;
        self.inner.lock().unwrap().num_io_queues = count;

        self.configure_async_events();
        if let Err(e) = self.arm_async_events() {
            warn!(self.log, "failed to arm async events"; "error" => %e);
        }
        self.scan_namespaces();
        self.state.transition(CtrlrState::Operational);
        self.paths.ctrlr_online();
        Ok(())
    }

    /// Bring the controller up from `Init` or `Quiesced`.
    pub fn start(&self) -> CmdResult {
        let state = self.state();
        if !matches!(state, CtrlrState::Init | CtrlrState::Quiesced) {
            warn!(self.log, "cannot start controller"; "state" => %state);
            return Err(match state.io_gate() {
                Ok(()) => NvmeError::Busy,
                Err(e) => e,
            });
        }
        info!(self.log, "starting controller");
        if let Err(e) = self.bring_up() {
            error!(self.log, "controller start failed"; "error" => %e);
            self.state.transition(CtrlrState::Failed);
            let _ = self.hw_stop();
            self.drop_queues(e);
            return Err(e);
        }
        info!(self.log, "controller operational";
            "io_queues" => self.num_io_queues());
        Ok(())
    }

    /// Pause I/O submission long enough to drain what the controller has
    /// already completed, then carry on.
    ///
    /// Holding the controller in `Suspend` keeps resets out until the
    /// queues are running again.
    pub fn quiesce(&self) -> CmdResult {
        let prev = self.state();
        if !matches!(prev, CtrlrState::Operational | CtrlrState::HealthDegraded) {
            return Err(NvmeError::Busy);
        }
        self.state
            .transition_from(prev, CtrlrState::Suspend)
            .map_err(|_| NvmeError::Busy)?;
        let ioqs = self.io_queues();
        for qp in &ioqs {
            let _ = qp.suspend();
        }
        let drained: usize = ioqs.iter().map(|qp| qp.process_completions()).sum();
        for qp in &ioqs {
            let _ = qp.resume();
        }
        if let Err(cur) = self.state.transition_from(CtrlrState::Suspend, prev) {
            warn!(self.log, "state changed while draining"; "state" => %cur);
            return Err(NvmeError::Busy);
        }
        debug!(self.log, "queues drained"; "entries" => drained);
        Ok(())
    }

    /// Suspend and flush every queue, failing outstanding admin commands
    /// with `InReset` and I/O commands with `io_status`, then forget the
    /// I/O queues.
    fn drop_queues(&self, io_status: NvmeError) {
        let ioqs = self.io_queues();
        if !self.adminq.is_suspended() {
            let _ = self.adminq.suspend();
        }
        for qp in ioqs.iter().filter(|qp| !qp.is_suspended()) {
            let _ = qp.suspend();
        }
        {
            let _guard = self.inner.lock().unwrap();
            self.adminq.flush(NvmeError::InReset);
            let _ = self.adminq.reset();
            for qp in &ioqs {
                qp.flush(io_status);
            }
        }
        self.aen.reset();
        self.ioqs.write().unwrap().clear();
    }

    /// Take the controller out of service.
    pub fn stop(&self) -> CmdResult {
        let state = self.state();
        match state {
            CtrlrState::Missing => return Err(NvmeError::DeviceMissing),
            CtrlrState::Init | CtrlrState::Quiesced | CtrlrState::Detached => {
                return Ok(())
            }
            _ => {}
        }
        info!(self.log, "stopping controller"; "state" => %state);
        self.state.transition(CtrlrState::Quiesced);
        let res = self.hw_stop();
        self.drop_queues(NvmeError::Quiesced);
        self.inner.lock().unwrap().num_io_queues = 0;
        self.paths.ctrlr_offline();
        res
    }

    /// The device is physically gone: fail everything and report the
    /// paths lost.
    pub(crate) fn remove(&self) {
        self.state.transition(CtrlrState::Missing);
        warn!(self.log, "controller removed");
        let ioqs = self.io_queues();
        if !self.adminq.is_suspended() {
            let _ = self.adminq.suspend();
        }
        for qp in ioqs.iter().filter(|qp| !qp.is_suspended()) {
            let _ = qp.suspend();
        }
        {
            let _guard = self.inner.lock().unwrap();
            self.adminq.flush(NvmeError::DeviceMissing);
            let _ = self.adminq.reset();
            for qp in &ioqs {
                qp.flush(NvmeError::DeviceMissing);
            }
        }
        self.aen.reset();
        self.paths.lost();
    }

    /// Stop the controller if it is running, then shut down the exception
    /// task.
    pub fn detach(&self, timeout: Duration) {
        let state = self.state();
        if !matches!(
            state,
            CtrlrState::Init
                | CtrlrState::Quiesced
                | CtrlrState::Missing
                | CtrlrState::Detached
        ) {
            if let Err(e) = self.request_quiesce(timeout) {
                warn!(self.log, "failed to stop controller on detach"; "error" => %e);
            }
        }
        self.events.signal(ExceptionEvent::TaskShutdown);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if task.thread().id() != thread::current().id() {
                let _ = task.join();
            }
        }
        self.events.shutdown();
        self.state.transition(CtrlrState::Detached);
        info!(self.log, "controller detached");
    }

    /// Report that the platform saw the device disappear.
    pub fn notify_removed(&self) {
        self.events.signal(ExceptionEvent::DeviceRemoved);
    }

    pub fn request_reset(&self, timeout: Duration) -> CmdResult {
        self.events.signal_and_wait(ExceptionEvent::CtrlrReset, timeout)
    }

    pub fn request_quiesce(&self, timeout: Duration) -> CmdResult {
        self.events.signal_and_wait(ExceptionEvent::Quiesce, timeout)
    }

    pub fn request_start(&self, timeout: Duration) -> CmdResult {
        self.events.signal_and_wait(ExceptionEvent::TaskStart, timeout)
    }

    /// Run a task management function and wait for its outcome.
    pub fn task_management(
        &self,
        kind: TaskMgmt,
        tag: RequestTag,
        timeout: Duration,
    ) -> CmdResult {
        if matches!(kind, TaskMgmt::Abort | TaskMgmt::VirtReset) {
            *self.tm_request.lock().unwrap() = Some(tag);
        }
        self.events.signal_and_wait(kind.event(), timeout)
    }

    /// Submit an I/O command on queue `qid`, tagged with the request it
    /// belongs to.
    pub fn submit_io<F>(
        &self,
        qid: QueueId,
        sqe: SubmissionQueueEntry,
        tag: Option<RequestTag>,
        done: F,
    ) -> CmdResult
    where
        F: FnOnce(&QueuePair, &Command, CmdResult) + Send + 'static,
    {
        let qp = self.io_queue(qid).ok_or(NvmeError::BadParam)?;
        self.state().io_gate()?;
        let cmd = qp.allocate().ok_or(NvmeError::QueueFull)?;
        cmd.set_sqe(sqe);
        if let Some(tag) = tag {
            cmd.set_request(tag);
        }
        if let Err(e) = qp.submit_async(cmd, done) {
            qp.release(cmd);
            return Err(e);
        }
        Ok(())
    }

    pub fn stats(&self) -> ControllerStats {
        let queues = std::iter::once(self.adminq.clone())
            .chain(self.io_queues())
            .map(|qp| qp.stats())
            .collect();
        ControllerStats {
            name: self.name.clone(),
            state: self.state(),
            num_io_queues: self.num_io_queues(),
            outstanding_async_events: self.aen.outstanding(),
            health: self.health().bits(),
            queues,
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.events.shutdown();
    }
}

/// CAP.TO is in 500ms units.
fn ready_timeout(cap: Capabilities) -> Duration {
    Duration::from_millis(cap.to().max(1) as u64 * 500)
}
