// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of completion status fields into driver errors.

use crate::bits::*;
use crate::{CmdResult, NvmeError};

/// Decode the Status Code Type / Status Code pair of a completion.
pub fn decode(sct: u8, sc: u8) -> CmdResult {
    match sct {
        SCT_GENERIC => decode_generic(sc),
        SCT_CMD_SPECIFIC => decode_cmd_specific(sc),
        SCT_MEDIA => decode_media(sc),
        _ => Err(NvmeError::Failure),
    }
}

/// Decode the status of a completion queue entry.
pub fn decode_entry(cqe: &CompletionQueueEntry) -> CmdResult {
    decode(cqe.sct(), cqe.sc())
}

fn decode_generic(sc: u8) -> CmdResult {
    match sc {
        STS_SUCCESS => Ok(()),
        STS_INVAL_OPC => Err(NvmeError::InvalidOpcode),
        STS_INVAL_FIELD => Err(NvmeError::InvalidField),
        STS_CID_CONFLICT => Err(NvmeError::ProtocolError),
        STS_DATA_XFER_ERR => Err(NvmeError::IoError),
        STS_PWR_LOSS_ABRT => Err(NvmeError::DeviceMissing),
        STS_INTERNAL_ERR => Err(NvmeError::MediumError),
        STS_ABORT_REQ => Err(NvmeError::Aborted),
        STS_ABORT_SQ_DEL => Err(NvmeError::Quiesced),
        STS_FAILED_FUSED | STS_MISSING_FUSED | STS_COMMAND_SEQ_ERR => {
            Err(NvmeError::ProtocolError)
        }
        STS_INVALID_NS => Err(NvmeError::InvalidNsOrFormat),
        STS_LBA_RANGE => Err(NvmeError::LbaOutOfRange),
        STS_CAP_EXCEEDED => Err(NvmeError::CapacityExceeded),
        STS_NS_NOT_READY => Err(NvmeError::NsNotReady),
        _ => Err(NvmeError::Failure),
    }
}

fn decode_cmd_specific(sc: u8) -> CmdResult {
    match sc {
        // The new firmware is in place, it just waits on a reset.
        STS_FW_NEEDS_RESET => Ok(()),
        STS_CREATE_IO_Q_INVAL_CQ
        | STS_CREATE_IO_Q_INVAL_QID
        | STS_CREATE_IO_Q_INVAL_QSIZE
        | STS_ABORT_CMD_LIMIT
        | STS_ASYNC_EVENT_LIMIT
        | STS_INVALID_FW_SLOT
        | STS_INVALID_FW_IMAGE
        | STS_CREATE_IO_Q_INVAL_INT_VEC
        | STS_INVALID_LOG_PAGE
        | STS_INVALID_FORMAT
        | STS_DELETE_IO_Q_INVAL_Q_DELETION => Err(NvmeError::ProtocolError),
        STS_READ_CONFLICTING_ATTRS => Err(NvmeError::ConflictAttributes),
        STS_READ_INVALID_PROT_INFO => Err(NvmeError::InvalidProtectionInfo),
        _ => Err(NvmeError::Failure),
    }
}

fn decode_media(sc: u8) -> CmdResult {
    match sc {
        STS_WRITE_FAULT => Err(NvmeError::IoWriteError),
        STS_UNRECOVERED_READ => Err(NvmeError::IoReadError),
        STS_E2E_GUARD | STS_E2E_APP_TAG | STS_E2E_REF_TAG => {
            Err(NvmeError::GuardCheckError)
        }
        _ => Err(NvmeError::MediumError),
    }
}
