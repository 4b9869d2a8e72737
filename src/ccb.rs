//! Command Control Blocks and their arena
//!
//! Every outstanding request (SCSI command, text/login exchange, task
//! management request, NOP ping) is tracked by a CCB. The wire correlates
//! responses to requests through the 32-bit Initiator Task Tag, which here
//! encodes an arena slot index plus a generation stamp. A slot's generation
//! is bumped every time the slot is released, so a stale tag arriving from
//! the target after slot reuse fails the lookup instead of aliasing a new
//! request.

use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{logout_response, scsi_status, tmf_response, TAG_NONE};
use crate::sequence::SequenceWindow;

/// Final status of a request, delivered to its issuer
///
/// Target-reported statuses (SCSI status byte, logout/task-management
/// response codes, login status class) all map onto this one taxonomy;
/// engine-internal failures only ever surface as `Lost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Good,
    /// SCSI check condition; sense data is in the CCB's sense buffer
    CheckCondition,
    /// Transient target-side congestion (busy, task set full, reservation)
    Busy,
    /// Target reported an error completing the request
    TargetError,
    /// Target could not deliver the request to the SCSI layer at all
    TargetFailure,
    LoginFailed,
    /// The request itself violated the protocol (rejected by the target)
    ProtocolError,
    TaskNotFound,
    LunNotFound,
    Unsupported,
    NotAuthorized,
    /// Referenced connection ID was unknown to the target
    BadCid,
    /// Connection died while the request was in flight
    Lost,
}

impl CmdStatus {
    /// Map a SCSI status byte from a SCSI Response or final Data-In
    pub fn from_scsi_status(status: u8) -> CmdStatus {
        match status {
            scsi_status::GOOD | scsi_status::CONDITION_MET => CmdStatus::Good,
            scsi_status::CHECK_CONDITION => CmdStatus::CheckCondition,
            scsi_status::BUSY
            | scsi_status::RESERVATION_CONFLICT
            | scsi_status::TASK_SET_FULL
            | scsi_status::ACA_ACTIVE => CmdStatus::Busy,
            _ => CmdStatus::TargetError,
        }
    }

    /// Map a Logout Response code
    pub fn from_logout_response(response: u8) -> CmdStatus {
        match response {
            logout_response::SUCCESS => CmdStatus::Good,
            logout_response::CID_NOT_FOUND => CmdStatus::BadCid,
            logout_response::CONNECTION_RECOVERY_NOT_SUPPORTED => CmdStatus::Unsupported,
            _ => CmdStatus::TargetError,
        }
    }

    /// Map a Task Management Response code
    pub fn from_tmf_response(response: u8) -> CmdStatus {
        match response {
            tmf_response::FUNCTION_COMPLETE => CmdStatus::Good,
            tmf_response::TASK_NOT_FOUND => CmdStatus::TaskNotFound,
            tmf_response::LUN_NOT_FOUND => CmdStatus::LunNotFound,
            tmf_response::REASSIGNMENT_NOT_SUPPORTED | tmf_response::FUNCTION_NOT_SUPPORTED => {
                CmdStatus::Unsupported
            }
            tmf_response::AUTHORIZATION_FAILED => CmdStatus::NotAuthorized,
            _ => CmdStatus::ProtocolError,
        }
    }
}

/// CCB lifecycle state
///
/// `Free → Queued → Busy → Complete → Free`. A tag resolves on the wire
/// only from `Busy` onward; `Queued` means the request has not been put on
/// the wire yet, so nothing the target sends can legitimately reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Free,
    Queued,
    Busy,
    Complete(CmdStatus),
}

/// What kind of request a CCB tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcbKind {
    Scsi,
    Login,
    Text,
    Logout {
        /// The logout targets the connection it was sent on
        own_connection: bool,
        cid: u16,
    },
    TaskMgmt,
    Nop,
}

/// Typed task tag: arena slot index plus generation stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTag {
    pub slot: u16,
    pub generation: u16,
}

impl TaskTag {
    /// Wire encoding: generation in the high half, slot in the low half
    pub fn to_wire(self) -> u32 {
        ((self.generation as u32) << 16) | self.slot as u32
    }

    pub fn from_wire(itt: u32) -> TaskTag {
        TaskTag {
            slot: (itt & 0xffff) as u16,
            generation: (itt >> 16) as u16,
        }
    }
}

/// One outstanding request
#[derive(Debug)]
pub struct Ccb {
    tag: TaskTag,
    disposition: Disposition,
    pub kind: CcbKind,
    pub cmd_sn: u32,
    /// DataSN reassembly window for SCSI read data
    pub data_sn: SequenceWindow,
    /// Read buffer; its length is the expected transfer length
    read_buf: Vec<u8>,
    pub transferred: u32,
    pub residual_count: u32,
    pub underflow: bool,
    pub overflow: bool,
    sense: Vec<u8>,
    sense_capacity: usize,
    /// Accumulated multi-PDU text/login payload, owned here until the
    /// final fragment arrives and it is moved to the negotiation engine
    pending_text: Vec<u8>,
    /// Target transfer tag from the last continuation response
    pub ttt: u32,
    /// Queued for (re)transmission and still unanswered; candidates for
    /// the CmdSN admission resend sweep
    pub wants_resend: bool,
    /// At least one response PDU referenced this CCB
    pub got_response: bool,
    /// Resends since the last response (per-occurrence ceiling)
    pub resend_count: u32,
    /// Lifetime resends (total ceiling, never reset)
    pub total_resends: u32,
    /// Status from a final response parked until the DataSN window drains
    pub parked_status: Option<CmdStatus>,
    /// DataSN the read is expected to end at, learned from the final
    /// status PDU; completion waits until the window reaches it
    pub final_data_sn: Option<u32>,
}

impl Ccb {
    fn new(tag: TaskTag, max_ahead: usize) -> Self {
        Ccb {
            tag,
            disposition: Disposition::Free,
            kind: CcbKind::Nop,
            cmd_sn: 0,
            data_sn: SequenceWindow::new(0, max_ahead),
            read_buf: Vec::new(),
            transferred: 0,
            residual_count: 0,
            underflow: false,
            overflow: false,
            sense: Vec::new(),
            sense_capacity: 0,
            pending_text: Vec::new(),
            ttt: TAG_NONE,
            wants_resend: false,
            got_response: false,
            resend_count: 0,
            total_resends: 0,
            parked_status: None,
            final_data_sn: None,
        }
    }

    pub fn tag(&self) -> TaskTag {
        self.tag
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.disposition, Disposition::Complete(_))
    }

    /// Expected read transfer length in bytes
    pub fn transfer_length(&self) -> usize {
        self.read_buf.len()
    }

    /// Take ownership of the read buffer: the frame reader fills it
    /// without holding the session lock across a blocking read, and the
    /// issuer moves the finished data out the same way.
    pub fn take_read_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buf)
    }

    pub fn put_read_buf(&mut self, buf: Vec<u8>) {
        self.read_buf = buf;
    }

    /// Copy sense data, truncated to the capacity the issuer asked for
    pub fn store_sense(&mut self, sense: &[u8]) {
        let n = sense.len().min(self.sense_capacity);
        self.sense.clear();
        self.sense.extend_from_slice(&sense[..n]);
    }

    pub fn sense(&self) -> &[u8] {
        &self.sense
    }

    /// Append one continuation fragment to the pending text payload
    pub fn push_text(&mut self, payload: &[u8], max_text_payload: usize) -> IscsiResult<()> {
        if self.pending_text.len() + payload.len() > max_text_payload {
            return Err(IscsiError::Protocol(format!(
                "text continuation exceeds {} bytes",
                max_text_payload
            )));
        }
        self.pending_text.extend_from_slice(payload);
        Ok(())
    }

    /// Move the assembled text payload out for the negotiation engine
    pub fn take_text(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_text)
    }

    /// Whether every Data-In PDU of this read has arrived. True when the
    /// DataSN window has no holes and, once the final status told us where
    /// the sequence ends, the window has reached that end.
    pub fn read_settled(&self) -> bool {
        match self.final_data_sn {
            Some(end) => self.data_sn.is_drained() && self.data_sn.expected() == end,
            None => self.data_sn.is_drained(),
        }
    }
}

/// Arena of generation-tagged CCB slots
///
/// Not internally synchronized: the owning `Session` guards it with its
/// lock, per the one-lock-per-session concurrency model.
#[derive(Debug)]
pub struct CcbArena {
    slots: Vec<Ccb>,
    max_ahead: usize,
}

impl CcbArena {
    /// `capacity` must stay below 0xffff so a wire tag can never collide
    /// with the reserved "no task" sentinel.
    pub fn new(capacity: usize, max_ahead: usize) -> Self {
        assert!(capacity > 0 && capacity < 0xffff);
        let slots = (0..capacity)
            .map(|i| Ccb::new(TaskTag { slot: i as u16, generation: 0 }, max_ahead))
            .collect();
        CcbArena { slots, max_ahead }
    }

    /// Allocate a free slot for a new request. Returns `None` when every
    /// slot is in use (the issuer must wait for a completion).
    pub fn allocate(&mut self, kind: CcbKind, cmd_sn: u32) -> Option<TaskTag> {
        let max_ahead = self.max_ahead;
        let slot = self
            .slots
            .iter_mut()
            .find(|c| c.disposition == Disposition::Free)?;
        let tag = slot.tag;
        *slot = Ccb::new(tag, max_ahead);
        slot.kind = kind;
        slot.cmd_sn = cmd_sn;
        slot.disposition = Disposition::Queued;
        Some(tag)
    }

    /// Provide the read buffer (sized to the expected transfer length)
    /// and sense capacity for a SCSI read before it goes on the wire.
    pub fn prepare_read(&mut self, tag: TaskTag, transfer_length: usize, sense_capacity: usize) {
        if let Some(ccb) = self.get_mut(tag) {
            ccb.read_buf = vec![0u8; transfer_length];
            ccb.sense_capacity = sense_capacity;
        }
    }

    /// Mark the request as on the wire: from here on the tag resolves and
    /// the CmdSN admission sweep may resend it.
    pub fn start(&mut self, tag: TaskTag) -> IscsiResult<()> {
        match self.get_mut(tag) {
            Some(ccb) if ccb.disposition == Disposition::Queued => {
                ccb.disposition = Disposition::Busy;
                ccb.wants_resend = true;
                Ok(())
            }
            _ => Err(IscsiError::Session(format!(
                "cannot start tag {:#010x}",
                tag.to_wire()
            ))),
        }
    }

    /// Resolve a slot by typed tag, with no liveness policy applied
    pub fn get_mut(&mut self, tag: TaskTag) -> Option<&mut Ccb> {
        let ccb = self.slots.get_mut(tag.slot as usize)?;
        if ccb.tag.generation != tag.generation {
            return None;
        }
        Some(ccb)
    }

    /// Correlate a wire ITT to a live CCB.
    ///
    /// Fails closed: the "no task" sentinel, out-of-range slots, stale
    /// generations and slots not awaiting a response all return `None`.
    /// None of these are fatal by themselves; the caller treats the PDU
    /// as addressed to an unknown or already-completed request.
    pub fn lookup(&mut self, itt: u32) -> Option<&mut Ccb> {
        if itt == TAG_NONE {
            log::debug!("lookup of reserved task tag");
            return None;
        }
        let tag = TaskTag::from_wire(itt);
        let Some(ccb) = self.slots.get_mut(tag.slot as usize) else {
            log::warn!("task tag {:#010x}: slot {} out of range", itt, tag.slot);
            return None;
        };
        if ccb.tag.generation != tag.generation {
            log::warn!(
                "task tag {:#010x}: stale generation {} (slot now {})",
                itt,
                tag.generation,
                ccb.tag.generation
            );
            return None;
        }
        match ccb.disposition {
            Disposition::Busy | Disposition::Complete(_) => Some(ccb),
            other => {
                log::warn!("task tag {:#010x}: not awaiting a response ({:?})", itt, other);
                None
            }
        }
    }

    /// Complete a request and record the status its issuer will read back
    pub fn complete(&mut self, tag: TaskTag, status: CmdStatus) -> bool {
        match self.get_mut(tag) {
            Some(ccb) if !ccb.is_complete() => {
                log::debug!("tag {:#010x} complete: {:?}", tag.to_wire(), status);
                ccb.disposition = Disposition::Complete(status);
                ccb.wants_resend = false;
                true
            }
            _ => false,
        }
    }

    /// Read a completed request's status without releasing the slot
    pub fn status(&self, tag: TaskTag) -> Option<CmdStatus> {
        let ccb = self.slots.get(tag.slot as usize)?;
        if ccb.tag.generation != tag.generation {
            return None;
        }
        match ccb.disposition {
            Disposition::Complete(status) => Some(status),
            _ => None,
        }
    }

    /// Return a slot to the free pool once its issuer has read the
    /// disposition back. Bumps the generation so the old wire tag is dead.
    pub fn release(&mut self, tag: TaskTag) {
        let max_ahead = self.max_ahead;
        if let Some(ccb) = self.get_mut(tag) {
            let next = TaskTag {
                slot: tag.slot,
                generation: tag.generation.wrapping_add(1),
            };
            *ccb = Ccb::new(next, max_ahead);
        }
    }

    /// Fail every in-flight request; used when the connection dies.
    /// Returns how many CCBs were marked lost.
    pub fn fail_all(&mut self, status: CmdStatus) -> usize {
        let mut failed = 0;
        for ccb in &mut self.slots {
            if matches!(ccb.disposition, Disposition::Queued | Disposition::Busy) {
                ccb.disposition = Disposition::Complete(status);
                ccb.wants_resend = false;
                failed += 1;
            }
        }
        failed
    }

    /// Whether any request is currently on the wire awaiting a response
    pub fn any_busy(&self) -> bool {
        self.slots
            .iter()
            .any(|c| c.disposition == Disposition::Busy)
    }

    /// Iterate over the CCBs currently on the wire (for the resend sweep)
    pub fn iter_busy_mut(&mut self) -> impl Iterator<Item = &mut Ccb> {
        self.slots
            .iter_mut()
            .filter(|c| c.disposition == Disposition::Busy)
    }
}
