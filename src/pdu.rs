//! iSCSI PDU (Protocol Data Unit) header parsing
//!
//! This module handles the binary protocol format for the PDUs a target
//! sends to an initiator, based on RFC 3720:
//! https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Only headers are handled here. Data segments, padding and digests are
//! the frame reader's business (see `recv`); a parsed [`Bhs`] tells it how
//! much to read.

use crate::error::{IscsiError, IscsiResult};
use byteorder::{BigEndian, ByteOrder};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Reserved ITT/TTT value meaning "no task" (RFC 3720 Section 10.19)
pub const TAG_NONE: u32 = 0xffff_ffff;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target); seen on the receive side
    // only inside the header a Reject PDU echoes back.
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // SCSI Data-In flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const STATUS: u8 = 0x01;

    // Residual flags (SCSI Response byte 1, Data-In byte 1)
    pub const UNDERFLOW: u8 = 0x02;
    pub const OVERFLOW: u8 = 0x04;
    pub const BIDI_UNDERFLOW: u8 = 0x08;
    pub const BIDI_OVERFLOW: u8 = 0x10;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;
}

/// SCSI response status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Logout response codes (RFC 3720 Section 10.15.1)
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Task management response codes (RFC 3720 Section 10.6.1)
pub mod tmf_response {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const TASK_NOT_FOUND: u8 = 1;
    pub const LUN_NOT_FOUND: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGNMENT_NOT_SUPPORTED: u8 = 4;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
    pub const AUTHORIZATION_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const SNACK_REJECT: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECT: u8 = 0x06;
    pub const TASK_IN_PROGRESS: u8 = 0x07;
    pub const INVALID_DATA_ACK: u8 = 0x08;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
    pub const LONG_OPERATION_REJECT: u8 = 0x0a;
    pub const NEGOTIATION_RESET: u8 = 0x0b;
    pub const WAITING_FOR_LOGOUT: u8 = 0x0c;

    /// Reasons after which the original request may be retransmitted
    /// unchanged (digest corruption and transient target resource limits).
    pub fn is_resendable(reason: u8) -> bool {
        matches!(
            reason,
            DATA_DIGEST_ERROR | IMMEDIATE_COMMAND_REJECT | LONG_OPERATION_REJECT
        )
    }
}

/// Async event codes (RFC 3720 Section 10.9.1)
pub mod async_event {
    pub const SCSI_EVENT: u8 = 0;
    pub const LOGOUT_REQUESTED: u8 = 1;
    pub const CONNECTION_DROPPED: u8 = 2;
    pub const ALL_CONNECTIONS_DROPPED: u8 = 3;
    pub const RENEGOTIATE: u8 = 4;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone)]
pub struct Bhs {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (Response/Status for a SCSI Response,
    /// Reason for a Reject, version fields for a Login Response)
    pub opcode_bytes: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number or opcode-specific (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
}

impl Bhs {
    /// Parse a BHS from the first 48 bytes of `buf`
    pub fn from_bytes(buf: &[u8]) -> IscsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "BHS too short: {} bytes, need {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let immediate = (buf[0] & 0x40) != 0;
        let opcode = buf[0] & 0x3F;
        let flags = buf[1];
        let opcode_bytes = [buf[2], buf[3]];
        let ahs_length = buf[4];
        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let data_length = ((buf[5] as u32) << 16) | ((buf[6] as u32) << 8) | (buf[7] as u32);
        let lun = BigEndian::read_u64(&buf[8..16]);
        let itt = BigEndian::read_u32(&buf[16..20]);
        let mut specific = [0u8; 28];
        specific.copy_from_slice(&buf[20..48]);

        Ok(Bhs {
            opcode,
            immediate,
            flags,
            opcode_bytes,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
        })
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// Target Transfer Tag (bytes 20-23, where the opcode defines one)
    pub fn ttt(&self) -> u32 {
        BigEndian::read_u32(&self.specific[0..4])
    }

    /// StatSN (bytes 24-27; every target PDU carries it at this offset)
    pub fn stat_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[4..8])
    }

    /// ExpCmdSN (bytes 28-31)
    pub fn exp_cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[8..12])
    }

    /// MaxCmdSN (bytes 32-35)
    pub fn max_cmd_sn(&self) -> u32 {
        BigEndian::read_u32(&self.specific[12..16])
    }

    /// Data segment length padded to the 4-byte boundary
    pub fn padded_data_length(&self) -> usize {
        (self.data_length as usize).div_ceil(4) * 4
    }

    /// Number of pad bytes following the data segment (0-3)
    pub fn pad_length(&self) -> usize {
        self.padded_data_length() - self.data_length as usize
    }
}

// ============================================================================
// Response PDU parsing helpers
// ============================================================================

impl Bhs {
    fn expect_opcode(&self, expected: u8) -> IscsiResult<()> {
        if self.opcode != expected {
            return Err(IscsiError::InvalidPdu(format!(
                "expected opcode 0x{:02x}, got 0x{:02x} ({})",
                expected,
                self.opcode,
                self.opcode_name()
            )));
        }
        Ok(())
    }

    /// Parse Login Response fields
    pub fn parse_login_response(&self) -> IscsiResult<LoginResponse> {
        self.expect_opcode(opcode::LOGIN_RESPONSE)?;

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);

        Ok(LoginResponse {
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            isid,
            tsih,
            itt: self.itt,
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            status_class: self.specific[16],
            status_detail: self.specific[17],
        })
    }

    /// Parse Text Response fields
    pub fn parse_text_response(&self) -> IscsiResult<TextResponse> {
        self.expect_opcode(opcode::TEXT_RESPONSE)?;

        Ok(TextResponse {
            final_flag: (self.flags & flags::FINAL) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            itt: self.itt,
            ttt: self.ttt(),
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
        })
    }

    /// Parse Logout Response fields
    pub fn parse_logout_response(&self) -> IscsiResult<LogoutResponse> {
        self.expect_opcode(opcode::LOGOUT_RESPONSE)?;

        Ok(LogoutResponse {
            itt: self.itt,
            response: self.opcode_bytes[0],
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            time2wait: BigEndian::read_u16(&self.specific[20..22]),
            time2retain: BigEndian::read_u16(&self.specific[22..24]),
        })
    }

    /// Parse SCSI Response fields
    pub fn parse_scsi_response(&self) -> IscsiResult<ScsiResponse> {
        self.expect_opcode(opcode::SCSI_RESPONSE)?;

        Ok(ScsiResponse {
            itt: self.itt,
            response: self.opcode_bytes[0],
            status: self.opcode_bytes[1],
            underflow: (self.flags & flags::UNDERFLOW) != 0,
            overflow: (self.flags & flags::OVERFLOW) != 0,
            bidi_underflow: (self.flags & flags::BIDI_UNDERFLOW) != 0,
            bidi_overflow: (self.flags & flags::BIDI_OVERFLOW) != 0,
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            exp_data_sn: BigEndian::read_u32(&self.specific[16..20]),
            bidi_residual_count: BigEndian::read_u32(&self.specific[20..24]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
        })
    }

    /// Parse SCSI Data-In fields
    pub fn parse_data_in(&self) -> IscsiResult<DataIn> {
        self.expect_opcode(opcode::SCSI_DATA_IN)?;

        Ok(DataIn {
            final_flag: (self.flags & flags::FINAL) != 0,
            ack_requested: (self.flags & flags::ACKNOWLEDGE) != 0,
            has_status: (self.flags & flags::STATUS) != 0,
            underflow: (self.flags & flags::UNDERFLOW) != 0,
            overflow: (self.flags & flags::OVERFLOW) != 0,
            status: self.opcode_bytes[1],
            itt: self.itt,
            ttt: self.ttt(),
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
        })
    }

    /// Parse R2T (Ready To Transfer) fields
    pub fn parse_r2t(&self) -> IscsiResult<R2t> {
        self.expect_opcode(opcode::R2T)?;

        Ok(R2t {
            lun: self.lun,
            itt: self.itt,
            ttt: self.ttt(),
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            r2t_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            desired_length: BigEndian::read_u32(&self.specific[24..28]),
        })
    }

    /// Parse Task Management Response fields
    pub fn parse_tmf_response(&self) -> IscsiResult<TmfResponse> {
        self.expect_opcode(opcode::TASK_MANAGEMENT_RESPONSE)?;

        Ok(TmfResponse {
            itt: self.itt,
            response: self.opcode_bytes[0],
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
        })
    }

    /// Parse NOP-In fields
    pub fn parse_nop_in(&self) -> IscsiResult<NopIn> {
        self.expect_opcode(opcode::NOP_IN)?;

        Ok(NopIn {
            lun: self.lun,
            itt: self.itt,
            ttt: self.ttt(),
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
        })
    }

    /// Parse Async Message fields
    pub fn parse_async_message(&self) -> IscsiResult<AsyncMessage> {
        self.expect_opcode(opcode::ASYNC_MESSAGE)?;

        Ok(AsyncMessage {
            lun: self.lun,
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
            event: self.specific[16],
            vendor_code: self.specific[17],
            parameter1: BigEndian::read_u16(&self.specific[18..20]),
            parameter2: BigEndian::read_u16(&self.specific[20..22]),
            parameter3: BigEndian::read_u16(&self.specific[22..24]),
        })
    }

    /// Parse Reject fields. The header of the rejected PDU follows in the
    /// data segment.
    pub fn parse_reject(&self) -> IscsiResult<Reject> {
        self.expect_opcode(opcode::REJECT)?;

        Ok(Reject {
            reason: self.opcode_bytes[0],
            stat_sn: self.stat_sn(),
            exp_cmd_sn: self.exp_cmd_sn(),
            max_cmd_sn: self.max_cmd_sn(),
        })
    }
}

/// Parsed Login Response
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
}

/// Parsed Text Response
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub final_flag: bool,
    pub cont: bool,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

/// Parsed Logout Response
#[derive(Debug, Clone)]
pub struct LogoutResponse {
    pub itt: u32,
    pub response: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

/// Parsed SCSI Response
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    pub itt: u32,
    /// iSCSI service response (0x00 = command completed at target)
    pub response: u8,
    /// SCSI status byte, valid when `response` is 0
    pub status: u8,
    pub underflow: bool,
    pub overflow: bool,
    pub bidi_underflow: bool,
    pub bidi_overflow: bool,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub bidi_residual_count: u32,
    pub residual_count: u32,
}

/// Parsed SCSI Data-In
#[derive(Debug, Clone)]
pub struct DataIn {
    pub final_flag: bool,
    pub ack_requested: bool,
    /// S bit: this PDU piggybacks the command status
    pub has_status: bool,
    pub underflow: bool,
    pub overflow: bool,
    pub status: u8,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
}

/// Parsed R2T
#[derive(Debug, Clone)]
pub struct R2t {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

/// Parsed Task Management Response
#[derive(Debug, Clone)]
pub struct TmfResponse {
    pub itt: u32,
    pub response: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

/// Parsed NOP-In
#[derive(Debug, Clone)]
pub struct NopIn {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

/// Parsed Async Message
#[derive(Debug, Clone)]
pub struct AsyncMessage {
    pub lun: u64,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub event: u8,
    pub vendor_code: u8,
    /// CID of the affected connection (events 2 and 3)
    pub parameter1: u16,
    /// Time2Wait in seconds
    pub parameter2: u16,
    /// Time2Retain in seconds
    pub parameter3: u16,
}

/// Parsed Reject
#[derive(Debug, Clone)]
pub struct Reject {
    pub reason: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> IscsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    if data.is_empty() {
        return Ok(params);
    }

    // Split on null bytes
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        if let Some(eq_pos) = s.find('=') {
            let key = s[..eq_pos].to_string();
            let value = s[eq_pos + 1..].to_string();
            params.push((key, value));
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================
