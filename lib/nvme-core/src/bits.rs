// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory and register layouts defined by the NVMe specification, as
//! seen from the host side.

#![allow(dead_code)]

use bitstruct::bitstruct;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A Submission Queue Entry as represented in memory.
///
/// See NVMe 1.0e Section 4.2 Submission Queue Entry - Command Format
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct SubmissionQueueEntry {
    /// Command Dword 0 (CDW0)
    ///
    /// Bits
    /// 31:16 - Command Identifier (CID)
    /// 09:08 - Fused Operation (FUSE)
    /// 07:00 - Opcode (OPC)
    pub cdw0: u32,

    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Reserved - Bytes 15:08
    pub rsvd: u64,

    /// Metadata Pointer (MPTR)
    pub mptr: u64,

    /// The first Physical Region Page (PRP) entry for the command.
    pub prp1: u64,

    /// Either reserved, the second PRP entry or a PRP List pointer.
    pub prp2: u64,

    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionQueueEntry {
    /// An otherwise empty entry for `opcode`.
    pub fn new(opcode: u8) -> Self {
        Self { cdw0: opcode as u32, ..Default::default() }
    }

    /// Returns the Identifier (CID) of this Submission Queue Entry.
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// Stamp the command identifier into CDW0, leaving opcode and fuse bits
    /// alone.
    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xffff) | ((cid as u32) << 16);
    }

    /// Returns the Opcode (OPC) of this Submission Queue Entry.
    pub fn opcode(&self) -> u8 {
        self.cdw0 as u8
    }
}

/// A Completion Queue Entry as represented in memory.
///
/// See NVMe 1.0e Section 4.5 Completion Queue Entry
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct CompletionQueueEntry {
    /// Dword 0 (DW0)
    ///
    /// A command specific value.
    pub dw0: u32,

    /// Reserved (DW1) - Bytes 07:04
    pub rsvd: u32,

    /// Submission Queue Head Pointer (SQHD)
    pub sqhd: u16,

    /// Submission Queue Identifier (SQID)
    pub sqid: u16,

    /// Command Identifier (CID)
    pub cid: u16,

    /// Bit      0 Phase Tag (P)
    /// Bits  8:01 Status Code (SC)
    /// Bits 11:09 Status Code Type (SCT)
    /// Bit     15 Do Not Retry (DNR)
    ///
    /// See NVMe 1.0e Section 4.5.1 Status Field Definition
    pub status_phase: u16,
}

impl CompletionQueueEntry {
    /// Reassemble an entry from its two little-endian quadwords.
    ///
    /// The high quadword carries the phase tag, so ring readers load it
    /// first and only read the low quadword once the phase matches.
    pub fn from_words(lo: u64, hi: u64) -> Self {
        Self {
            dw0: lo as u32,
            rsvd: (lo >> 32) as u32,
            sqhd: hi as u16,
            sqid: (hi >> 16) as u16,
            cid: (hi >> 32) as u16,
            status_phase: (hi >> 48) as u16,
        }
    }

    /// Split the entry into the quadwords `from_words` expects.
    pub fn to_words(&self) -> (u64, u64) {
        let lo = self.dw0 as u64 | (self.rsvd as u64) << 32;
        let hi = self.sqhd as u64
            | (self.sqid as u64) << 16
            | (self.cid as u64) << 32
            | (self.status_phase as u64) << 48;
        (lo, hi)
    }

    /// Phase tag carried by the high quadword of an entry.
    pub fn phase_of(hi: u64) -> bool {
        (hi >> 48) & 1 != 0
    }

    pub fn phase(&self) -> bool {
        self.status_phase & 1 != 0
    }

    pub fn set_phase(&mut self, phase: bool) {
        match phase {
            true => self.status_phase |= 0b1,
            false => self.status_phase &= !0b1,
        }
    }

    pub fn sc(&self) -> u8 {
        (self.status_phase >> 1) as u8
    }

    pub fn sct(&self) -> u8 {
        ((self.status_phase >> 9) & 0b111) as u8
    }

    pub fn dnr(&self) -> bool {
        self.status_phase & (1 << 15) != 0
    }

    /// Replace the status field, keeping the phase tag.
    pub fn set_status(&mut self, sct: u8, sc: u8) {
        self.status_phase = (self.status_phase & 0b1)
            | (sc as u16) << 1
            | ((sct & 0b111) as u16) << 9;
    }
}

// Register bits

bitstruct! {
    /// Representation of the Controller Capabilities (CAP) register.
    ///
    /// See NVMe 1.0e Section 3.1.1 Offset 00h: CAP - Controller Capabilities
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities(pub u64) {
        /// Maximum Queue Entries Supported (MQES), 0's based.
        pub mqes: u16 = 0..16;

        /// Contiguous Queues Required (CQR)
        pub cqr: bool = 16;

        pub ams_roundrobin: bool = 17;
        pub ams_vendor: bool = 18;

        reserved1: u8 = 19..24;

        /// Timeout (TO)
        ///
        /// Worst case time to wait for CSTS.RDY to change, in 500ms units.
        pub to: u8 = 24..32;

        /// Doorbell Stride (DSTRD)
        ///
        /// Specified as 2^(2 + DSTRD) bytes.
        pub dstrd: u8 = 32..36;

        reserved2: u8 = 36;

        /// Command Sets Supported (CSS): NVM command set.
        pub css_nvm: bool = 37;

        css_reserved: u8 = 38..45;
        reserved3: u8 = 45..48;

        /// Memory Page Size Minimum (MPSMIN), 2^(12 + MPSMIN) bytes.
        pub mpsmin: u8 = 48..52;

        /// Memory Page Size Maximum (MPSMAX), 2^(12 + MPSMAX) bytes.
        pub mpsmax: u8 = 52..56;

        reserved4: u8 = 56..64;
    }
}

bitstruct! {
    /// Representation of the Controller Configuration (CC) register.
    ///
    /// See NVMe 1.0e Section 3.1.5 Offset 14h: CC - Controller Configuration
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Configuration(pub u32) {
        /// Enable (EN)
        ///
        /// Transitioning from 1 to 0 resets the controller.
        pub enabled: bool = 0;

        reserved1: u8 = 1..4;

        /// I/O Command Set Selected (CSS)
        pub css: IOCommandSet = 4..7;

        /// Memory Page Size (MPS), 2^(12 + MPS) bytes.
        pub mps: u8 = 7..11;

        /// Arbitration Mechanism Selected (AMS)
        pub ams: ArbitrationMechanism = 11..14;

        /// Shutdown Notification (SHN)
        pub shn: ShutdownNotification = 14..16;

        /// I/O Submission Queue Entry Size (IOSQES), 2^IOSQES bytes.
        pub iosqes: u8 = 16..20;

        /// I/O Completion Queue Entry Size (IOCQES), 2^IOCQES bytes.
        pub iocqes: u8 = 20..24;

        reserved2: u8 = 24..32;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IOCommandSet {
    Nvm,
    Reserved(u8),
}

impl bitstruct::FromRaw<u8, IOCommandSet> for Configuration {
    fn from_raw(raw: u8) -> IOCommandSet {
        match raw {
            0b000 => IOCommandSet::Nvm,
            _ => IOCommandSet::Reserved(raw),
        }
    }
}

impl bitstruct::IntoRaw<u8, IOCommandSet> for Configuration {
    fn into_raw(target: IOCommandSet) -> u8 {
        match target {
            IOCommandSet::Nvm => 0b000,
            IOCommandSet::Reserved(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbitrationMechanism {
    RoundRobin,
    WeightedRoundRobinWithUrgent,
    Reserved(u8),
    Vendor,
}

impl bitstruct::FromRaw<u8, ArbitrationMechanism> for Configuration {
    fn from_raw(raw: u8) -> ArbitrationMechanism {
        match raw {
            0b000 => ArbitrationMechanism::RoundRobin,
            0b001 => ArbitrationMechanism::WeightedRoundRobinWithUrgent,
            0b111 => ArbitrationMechanism::Vendor,
            _ => ArbitrationMechanism::Reserved(raw),
        }
    }
}

impl bitstruct::IntoRaw<u8, ArbitrationMechanism> for Configuration {
    fn into_raw(target: ArbitrationMechanism) -> u8 {
        match target {
            ArbitrationMechanism::RoundRobin => 0b000,
            ArbitrationMechanism::WeightedRoundRobinWithUrgent => 0b001,
            ArbitrationMechanism::Reserved(raw) => raw,
            ArbitrationMechanism::Vendor => 0b111,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownNotification {
    None,
    Normal,
    Abrupt,
    Reserved,
}

impl bitstruct::FromRaw<u8, ShutdownNotification> for Configuration {
    fn from_raw(raw: u8) -> ShutdownNotification {
        match raw & 0b11 {
            0b00 => ShutdownNotification::None,
            0b01 => ShutdownNotification::Normal,
            0b10 => ShutdownNotification::Abrupt,
            _ => ShutdownNotification::Reserved,
        }
    }
}

impl bitstruct::IntoRaw<u8, ShutdownNotification> for Configuration {
    fn into_raw(target: ShutdownNotification) -> u8 {
        match target {
            ShutdownNotification::None => 0b00,
            ShutdownNotification::Normal => 0b01,
            ShutdownNotification::Abrupt => 0b10,
            ShutdownNotification::Reserved => 0b11,
        }
    }
}

bitstruct! {
    /// Representation of the Controller Status (CSTS) register.
    ///
    /// See NVMe 1.0e Section 3.1.6 Offset 1Ch: CSTS - Controller Status
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Status(pub u32) {
        /// Ready (RDY)
        pub ready: bool = 0;

        /// Controller Fatal Status (CFS)
        pub cfs: bool = 1;

        /// Shutdown Status (SHST)
        pub shst: u8 = 2..4;

        reserved: u32 = 4..32;
    }
}

bitstruct! {
    /// Representation of the Admin Queue Attributes (AQA) register.
    ///
    /// See NVMe 1.0e Section 3.1.7 Offset 24h: AQA - Admin Queue Attributes
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AdminQueueAttrs(pub u32) {
        /// Admin Submission Queue Size (ASQS), 0's based.
        pub asqs: u16 = 0..12;

        reserved1: u8 = 12..16;

        /// Admin Completion Queue Size (ACQS), 0's based.
        pub acqs: u16 = 16..28;

        reserved2: u8 = 28..32;
    }
}

bitstruct! {
    /// Queue Entry Size Required & Maximum (SQES/CQES in Identify Controller)
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NvmQueueEntrySize(pub u8) {
        /// Required (minimum) entry size as 2^required bytes.
        pub required: u8 = 0..4;

        /// Maximum entry size as 2^maximum bytes.
        pub maximum: u8 = 4..8;
    }
}

impl NvmQueueEntrySize {
    /// Whether an entry of 2^`size` bytes is within the advertised bounds.
    pub fn supports(&self, size: u8) -> bool {
        self.required() <= size && size <= self.maximum()
    }
}

/// Controller is removed when a register read returns all ones.
pub const REG_ALL_ONES: u32 = u32::MAX;

/// Entry sizes programmed into CC.IOSQES/IOCQES (64 and 16 bytes).
pub const IOSQES: u8 = 6;
pub const IOCQES: u8 = 4;

pub const SQE_SIZE: usize = 1 << IOSQES;
pub const CQE_SIZE: usize = 1 << IOCQES;

// Admin Command Opcodes
// See NVMe 1.0e Section 5, Figure 25 Opcodes for Admin Commands

pub const ADMIN_OPC_DELETE_IO_SQ: u8 = 0x00;
pub const ADMIN_OPC_CREATE_IO_SQ: u8 = 0x01;
pub const ADMIN_OPC_GET_LOG_PAGE: u8 = 0x02;
pub const ADMIN_OPC_DELETE_IO_CQ: u8 = 0x04;
pub const ADMIN_OPC_CREATE_IO_CQ: u8 = 0x05;
pub const ADMIN_OPC_IDENTIFY: u8 = 0x06;
pub const ADMIN_OPC_ABORT: u8 = 0x08;
pub const ADMIN_OPC_SET_FEATURES: u8 = 0x09;
pub const ADMIN_OPC_GET_FEATURES: u8 = 0x0A;
pub const ADMIN_OPC_ASYNC_EVENT_REQ: u8 = 0x0C;

// NVM Command Opcodes
// See NVMe 1.0e Section 6, Figure 99 Opcodes for NVM Commands

pub const NVM_OPC_FLUSH: u8 = 0x00;
pub const NVM_OPC_WRITE: u8 = 0x01;
pub const NVM_OPC_READ: u8 = 0x02;

// Status Code Types
// See NVMe 1.0e Section 4.5.1.1, Figure 16 Status Code - Status Code Type Values

pub const SCT_GENERIC: u8 = 0x0;
pub const SCT_CMD_SPECIFIC: u8 = 0x1;
pub const SCT_MEDIA: u8 = 0x2;
pub const SCT_VENDOR: u8 = 0x7;

// Generic Command Status Values
// See NVMe 1.0e Section 4.5.1.2.1, Figure 17

pub const STS_SUCCESS: u8 = 0x00;
pub const STS_INVAL_OPC: u8 = 0x01;
pub const STS_INVAL_FIELD: u8 = 0x02;
pub const STS_CID_CONFLICT: u8 = 0x03;
pub const STS_DATA_XFER_ERR: u8 = 0x04;
pub const STS_PWR_LOSS_ABRT: u8 = 0x05;
pub const STS_INTERNAL_ERR: u8 = 0x06;
pub const STS_ABORT_REQ: u8 = 0x07;
pub const STS_ABORT_SQ_DEL: u8 = 0x08;
pub const STS_FAILED_FUSED: u8 = 0x09;
pub const STS_MISSING_FUSED: u8 = 0x0A;
pub const STS_INVALID_NS: u8 = 0x0B;
pub const STS_COMMAND_SEQ_ERR: u8 = 0x0C;
pub const STS_LBA_RANGE: u8 = 0x80;
pub const STS_CAP_EXCEEDED: u8 = 0x81;
pub const STS_NS_NOT_READY: u8 = 0x82;

// Command Specific Status Values
// See NVMe 1.0e Section 4.5.1.2.2, Figure 19

pub const STS_CREATE_IO_Q_INVAL_CQ: u8 = 0x00;
pub const STS_CREATE_IO_Q_INVAL_QID: u8 = 0x01;
pub const STS_CREATE_IO_Q_INVAL_QSIZE: u8 = 0x02;
pub const STS_ABORT_CMD_LIMIT: u8 = 0x03;
pub const STS_ASYNC_EVENT_LIMIT: u8 = 0x05;
pub const STS_INVALID_FW_SLOT: u8 = 0x06;
pub const STS_INVALID_FW_IMAGE: u8 = 0x07;
pub const STS_CREATE_IO_Q_INVAL_INT_VEC: u8 = 0x08;
pub const STS_INVALID_LOG_PAGE: u8 = 0x09;
pub const STS_INVALID_FORMAT: u8 = 0x0A;
pub const STS_FW_NEEDS_RESET: u8 = 0x0B;
pub const STS_DELETE_IO_Q_INVAL_Q_DELETION: u8 = 0x0C;
pub const STS_READ_CONFLICTING_ATTRS: u8 = 0x80;
pub const STS_READ_INVALID_PROT_INFO: u8 = 0x81;
pub const STS_WRITE_READ_ONLY_RANGE: u8 = 0x82;

// Media Error Status Values
// See NVMe 1.0e Section 4.5.1.2.3, Figure 21

pub const STS_WRITE_FAULT: u8 = 0x80;
pub const STS_UNRECOVERED_READ: u8 = 0x81;
pub const STS_E2E_GUARD: u8 = 0x82;
pub const STS_E2E_APP_TAG: u8 = 0x83;
pub const STS_E2E_REF_TAG: u8 = 0x84;
pub const STS_COMPARE_FAILURE: u8 = 0x85;
pub const STS_ACCESS_DENIED: u8 = 0x86;

// Feature Identifiers
// See NVMe 1.0e Section 5.12.1, Figure 73

pub const FEAT_ID_NUM_QUEUES: u8 = 0x07;
pub const FEAT_ID_ASYNC_EVENT_CFG: u8 = 0x0B;

/// Async events enabled by Set Features: every critical warning bit.
pub const ASYNC_EVENT_CFG_ALL: u32 = 0x1F;

// Identify CNS values
// See NVMe 1.0e Section 5.11, Figure 65

pub const IDENT_CNS_NAMESPACE: u8 = 0x0;
pub const IDENT_CNS_CONTROLLER: u8 = 0x1;

// Log Page Identifiers
// See NVMe 1.0e Section 5.10.1, Figure 58

pub const LOG_ID_ERROR_INFO: u8 = 0x01;
pub const LOG_ID_SMART_HEALTH: u8 = 0x02;
pub const LOG_ID_FW_SLOT: u8 = 0x03;

// Asynchronous Event Types
// See NVMe 1.0e Section 5.2, Figure 30

pub const AEN_TYPE_ERROR: u8 = 0x0;
pub const AEN_TYPE_SMART: u8 = 0x1;
pub const AEN_TYPE_NOTICE: u8 = 0x2;
pub const AEN_TYPE_IO_CMD_SET: u8 = 0x6;
pub const AEN_TYPE_VENDOR: u8 = 0x7;

bitflags! {
    /// Critical Warning byte of the SMART / Health Information log.
    ///
    /// See NVMe 1.0e Section 5.10.1.2, Figure 60
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CriticalWarning: u8 {
        const AVAILABLE_SPARE = 1 << 0;
        const TEMPERATURE = 1 << 1;
        const MEDIA = 1 << 2;
        const READ_ONLY = 1 << 3;
        const VOLATILE_BACKUP = 1 << 4;

        /// Warnings that mark the controller as health degraded.
        const DEGRADED = Self::AVAILABLE_SPARE.bits()
            | Self::TEMPERATURE.bits()
            | Self::MEDIA.bits()
            | Self::READ_ONLY.bits();
    }
}

/// Identify Controller Data Structure, trimmed to the fields the driver
/// consumes.
///
/// See NVMe 1.0e Section 5.11, Figure 66
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    pub mdts: u8,
    pub _resv1: [u8; 178],

    pub oacs: u16,
    pub acl: u8,
    /// Asynchronous Event Request Limit (AERL), 0's based.
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    /// Error Log Page Entries (ELPE), 0's based.
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub _resv2: [u8; 247],

    pub sqes: u8,
    pub cqes: u8,
    pub _resv3: [u8; 2],
    /// Number of Namespaces (NN)
    pub nn: u32,
    pub _resv4: [u8; 3576],
}

impl IdentifyController {
    pub fn sqes(&self) -> NvmQueueEntrySize {
        NvmQueueEntrySize(self.sqes)
    }

    pub fn cqes(&self) -> NvmQueueEntrySize {
        NvmQueueEntrySize(self.cqes)
    }
}

/// LBA Format Data Structure
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct LbaFormat {
    /// Metadata Size (MS) in bytes
    pub ms: u16,
    /// LBA Data Size (LBADS) as 2^LBADS bytes
    pub lbads: u8,
    /// Relative Performance (RP), bits 1:0
    pub rp: u8,
}

/// Identify Namespace Data Structure
///
/// See NVMe 1.0e Section 5.11, Figure 67
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct IdentifyNamespace {
    /// Namespace Size (NSZE) in logical blocks
    pub nsze: u64,
    /// Namespace Capacity (NCAP)
    pub ncap: u64,
    /// Namespace Utilization (NUSE)
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA Formats (NLBAF), 0's based
    pub nlbaf: u8,
    /// Formatted LBA Size (FLBAS); bits 3:0 select the LBA format
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    /// End-to-end Data Protection Type Settings (DPS); bits 2:0 pick the
    /// protection type, 0 meaning none
    pub dps: u8,
    pub _resv1: [u8; 98],
    pub lbaf: [LbaFormat; 16],
    pub _resv2: [u8; 3904],
}

impl IdentifyNamespace {
    /// The LBA format the namespace is formatted with.
    pub fn active_format(&self) -> LbaFormat {
        let lbaf = self.lbaf;
        lbaf[(self.flbas & 0xf) as usize]
    }
}

/// SMART / Health Information log page (Log Identifier 02h)
///
/// See NVMe 1.0e Section 5.10.1.2, Figure 60
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct SmartLog {
    pub critical_warning: u8,
    /// Composite temperature in Kelvin
    pub temperature: u16,
    pub avail_spare: u8,
    pub avail_spare_thresh: u8,
    pub percent_used: u8,
    pub _resv1: [u8; 26],
    pub data_units_read: [u8; 16],
    pub data_units_written: [u8; 16],
    pub host_reads: [u8; 16],
    pub host_writes: [u8; 16],
    pub ctrl_busy_time: [u8; 16],
    pub power_cycles: [u8; 16],
    pub power_on_hours: [u8; 16],
    pub unsafe_shutdowns: [u8; 16],
    pub media_errors: [u8; 16],
    pub num_err_log_entries: [u8; 16],
    pub _resv2: [u8; 320],
}

impl SmartLog {
    pub fn critical_warning(&self) -> CriticalWarning {
        CriticalWarning::from_bits_retain(self.critical_warning)
    }

    pub fn media_errors(&self) -> u128 {
        u128::from_le_bytes(self.media_errors)
    }
}

/// Error Information log entry (Log Identifier 01h)
///
/// See NVMe 1.0e Section 5.10.1.1, Figure 59
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct ErrorLogEntry {
    pub error_count: u64,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
    pub param_err_loc: u16,
    pub lba: u64,
    pub nsid: u32,
    pub vs: u8,
    pub _resv: [u8; 35],
}
