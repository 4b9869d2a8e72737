//! Receive path: frame reading, dispatch, and per-opcode handling
//!
//! One `RecvEngine` runs per connection, on its own thread, as the sole
//! reader of that connection's transport. Each iteration reads one PDU
//! (header, optional header digest, data segment, padding, optional data
//! digest), correlates it with the request that caused it, validates the
//! relevant sequence numbers, applies the opcode-specific state
//! transition, and finally runs the session's CmdSN admission sweep.
//!
//! The engine calls out of the protocol core through three seams: the
//! send path (SNACKs, resends, NOP pongs, data-out kickoff), the
//! negotiation engine (assembled login/text payloads), and the
//! session/connection lifecycle (logout and teardown requests).

use crate::ccb::{CcbKind, CmdStatus, TaskTag};
use crate::digest::{verify_data_digest, verify_header_digest, DIGEST_SIZE};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{
    async_event, login_status, opcode, reject_reason, Bhs, LoginResponse, TextResponse,
    BHS_SIZE, TAG_NONE,
};
use crate::sequence::SnOutcome;
use crate::session::{Connection, ResendOverflow, Session};
use crate::transport::{ReadWait, Transport};
use std::sync::{Arc, Mutex, MutexGuard};

/// What the dispatcher should do after a handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// PDU fully applied; run the admission sweep and keep reading
    Continue,
    /// PDU was stale, duplicate or unattributable; discard and keep going
    Drop,
    /// The connection cannot continue
    ConnectionFatal,
}

/// SNACK classes the engine can ask the send path for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnackKind {
    /// Re-deliver a run of status PDUs
    Status,
    /// Re-deliver a run of Data-In PDUs
    Data,
    /// Acknowledge received data up to a DataSN (target asked via A bit)
    DataAck,
}

/// Verdict of the negotiation engine on an assembled login/text payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// The exchange is finished; complete the request
    Complete,
    /// The negotiation engine has issued (or will issue) a follow-up
    /// request on the same task; leave the CCB pending
    MoreExchanges,
}

/// Outbound operations the receive path needs from the transmit side
pub trait SendPath: Send + Sync {
    /// Ask the target to re-deliver `run_length` PDUs starting at
    /// `beg_run` (0 meaning "everything from beg_run on" for DataAck)
    fn request_snack(&self, kind: SnackKind, beg_run: u32, run_length: u32) -> IscsiResult<()>;

    /// Retransmit the original request PDU for `tag` unchanged
    fn resend_original(&self, tag: TaskTag) -> IscsiResult<()>;

    /// Answer an unsolicited NOP-In ping, echoing its payload
    fn send_nop_pong(&self, ttt: u32, payload: Vec<u8>) -> IscsiResult<()>;

    /// Send our own NOP-Out ping to keep sequence numbers moving
    fn send_nop_ping(&self) -> IscsiResult<()>;

    /// Begin the data-out transfer an R2T invited
    fn start_data_out(&self, tag: TaskTag, ttt: u32, offset: u32, length: u32) -> IscsiResult<()>;
}

/// Consumer of assembled login/text negotiation payloads
pub trait NegotiationEngine: Send + Sync {
    fn login_response(
        &self,
        tag: TaskTag,
        response: &LoginResponse,
        payload: Vec<u8>,
    ) -> IscsiResult<NegotiationOutcome>;

    fn text_response(
        &self,
        tag: TaskTag,
        response: &TextResponse,
        payload: Vec<u8>,
    ) -> IscsiResult<NegotiationOutcome>;
}

/// Connection/session teardown requests raised by the receive path
pub trait SessionLifecycle: Send + Sync {
    /// Log this connection out in an orderly fashion
    fn request_logout(&self, reason: &str);
    /// The target announced it will drop the named connection
    fn drop_connection(&self, cid: u16, time2wait: u16, time2retain: u16);
    /// The target announced it will drop every connection of the session
    fn session_dropped(&self, time2wait: u16, time2retain: u16);
    /// The target asked for parameter renegotiation
    fn request_renegotiation(&self);
    /// The logout for this connection completed; teardown may proceed
    fn connection_settled(&self, cid: u16);
    /// The session is beyond recovery
    fn kill_session(&self, reason: &str);
}

/// One received PDU; lives for a single dispatch cycle
#[derive(Debug)]
pub struct Pdu {
    pub bhs: Bhs,
    pub data: Vec<u8>,
}

/// Outcome of a StatSN window check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatVerdict {
    Proceed,
    Stale,
    Fatal,
}

/// Where a Data-In PDU's payload should land
enum DataInTarget {
    /// No live CCB or no active read; consume and drop
    Discard,
    /// CCB read buffer, taken out so the read happens without the lock
    Buffer(TaskTag, Vec<u8>),
}

/// Per-connection receive loop and dispatcher
pub struct RecvEngine<T: Transport> {
    transport: T,
    session: Arc<Session>,
    conn: Arc<Mutex<Connection>>,
    send: Arc<dyn SendPath>,
    negotiation: Arc<dyn NegotiationEngine>,
    lifecycle: Arc<dyn SessionLifecycle>,
    /// Consecutive header-level frame errors; two in a row is fatal
    frame_failures: u32,
    /// Whether the last idle period already provoked a ping
    pinged_idle: bool,
}

impl<T: Transport> RecvEngine<T> {
    pub fn new(
        transport: T,
        session: Arc<Session>,
        conn: Arc<Mutex<Connection>>,
        send: Arc<dyn SendPath>,
        negotiation: Arc<dyn NegotiationEngine>,
        lifecycle: Arc<dyn SessionLifecycle>,
    ) -> Self {
        RecvEngine {
            transport,
            session,
            conn,
            send,
            negotiation,
            lifecycle,
            frame_failures: 0,
            pinged_idle: false,
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run until the connection terminates. Requests still in flight when
    /// the loop exits are failed with `Lost` so their issuers wake up.
    pub fn run(&mut self) -> IscsiResult<()> {
        let cid = self.conn().cid;
        log::info!("receive loop started (cid {})", cid);

        let result = self.run_inner();
        self.session.fail_all_in_flight();

        match &result {
            Ok(()) => log::info!("receive loop finished (cid {})", cid),
            Err(e) => log::error!("receive loop failed (cid {}): {}", cid, e),
        }
        result
    }

    fn run_inner(&mut self) -> IscsiResult<()> {
        loop {
            if self.conn().is_terminating() {
                return Ok(());
            }
            match self.receive_pdu() {
                Ok(Disposition::Continue) | Ok(Disposition::Drop) => {
                    self.frame_failures = 0;
                    self.pinged_idle = false;
                }
                Ok(Disposition::ConnectionFatal) => {
                    return Err(IscsiError::Protocol(
                        "handler terminated the connection".to_string(),
                    ));
                }
                Err(IscsiError::IdleTimeout) => {
                    if self.conn().is_terminating() {
                        return Ok(());
                    }
                    if self.pinged_idle {
                        return Err(IscsiError::Transport(format!(
                            "no traffic for {:?} despite ping",
                            self.conn().idle_for()
                        )));
                    }
                    log::debug!("idle, pinging target");
                    self.send.send_nop_ping()?;
                    self.pinged_idle = true;
                }
                Err(e) if !e.is_connection_fatal() => {
                    self.frame_failures += 1;
                    if self.frame_failures >= 2 {
                        return Err(IscsiError::Transport(format!(
                            "repeated frame errors, last: {}",
                            e
                        )));
                    }
                    self.resynchronize(&e)?;
                }
                Err(e) => {
                    // A transport error during cooperative teardown is the
                    // cancel handle doing its job.
                    if self.conn().is_terminating() {
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Best-effort realignment after header-level corruption: throw away
    /// everything already buffered and hope the next read starts a PDU.
    fn resynchronize(&mut self, cause: &IscsiError) -> IscsiResult<()> {
        let discarded = self.transport.drain()?;
        log::warn!(
            "resynchronizing after frame error ({}); {} bytes discarded",
            cause,
            discarded
        );
        Ok(())
    }

    /// Read, validate and dispatch exactly one PDU
    pub fn receive_pdu(&mut self) -> IscsiResult<Disposition> {
        let mut header = [0u8; BHS_SIZE];
        self.transport.read_full(&mut header, ReadWait::Idle)?;

        // Digest settings can change mid-session, so sample them per PDU
        let (header_digest_on, data_digest_on) = self.conn().digests();

        if header_digest_on {
            let mut digest = [0u8; DIGEST_SIZE];
            self.transport.read_full(&mut digest, ReadWait::Data)?;
            if !verify_header_digest(&header, digest) {
                return Err(IscsiError::Frame("header digest mismatch".to_string()));
            }
        }

        let bhs = Bhs::from_bytes(&header)?;
        log::debug!(
            "rx {} itt {:#010x} dlen {}",
            bhs.opcode_name(),
            bhs.itt,
            bhs.data_length
        );

        // Target-to-initiator PDUs never carry an AHS
        if bhs.ahs_length != 0 {
            return Err(IscsiError::Protocol(format!(
                "{} with AHS length {}",
                bhs.opcode_name(),
                bhs.ahs_length
            )));
        }
        let max_segment = self.session.config().max_recv_data_segment_length;
        if bhs.data_length > max_segment {
            return Err(IscsiError::Truncated {
                limit: max_segment as usize,
                got: bhs.data_length as usize,
            });
        }

        let disposition = if bhs.opcode == opcode::SCSI_DATA_IN {
            // Data lands directly in the CCB's buffer; no intermediate copy
            self.receive_data_in(&bhs, data_digest_on)?
        } else {
            let data = self.read_segment(&bhs, data_digest_on)?;
            self.dispatch(&Pdu { bhs: bhs.clone(), data })?
        };

        if disposition == Disposition::Continue {
            return self.finish_pdu(&bhs);
        }
        Ok(disposition)
    }

    /// Read a data segment, padding and data digest into a fresh buffer
    fn read_segment(&mut self, bhs: &Bhs, data_digest_on: bool) -> IscsiResult<Vec<u8>> {
        let len = bhs.data_length as usize;
        let mut data = vec![0u8; len];
        if len > 0 {
            self.transport.read_full(&mut data, ReadWait::Data)?;
        }
        let mut pad = [0u8; 4];
        let pad_len = bhs.pad_length();
        if pad_len > 0 {
            self.transport.read_full(&mut pad[..pad_len], ReadWait::Data)?;
        }
        if data_digest_on && len > 0 {
            let mut digest = [0u8; DIGEST_SIZE];
            self.transport.read_full(&mut digest, ReadWait::Data)?;
            if !verify_data_digest(&data, &pad[..pad_len], digest) {
                // The stream is still aligned; the PDU is just poison
                return Err(IscsiError::Frame("data digest mismatch".to_string()));
            }
        }
        Ok(data)
    }

    /// Consume and discard a payload whose PDU cannot be attributed
    fn discard_segment(&mut self, bhs: &Bhs, data_digest_on: bool) -> IscsiResult<()> {
        let mut remaining = bhs.padded_data_length();
        if data_digest_on && bhs.data_length > 0 {
            remaining += DIGEST_SIZE;
        }
        let mut scratch = [0u8; 512];
        while remaining > 0 {
            let n = remaining.min(scratch.len());
            self.transport.read_full(&mut scratch[..n], ReadWait::Data)?;
            remaining -= n;
        }
        Ok(())
    }

    /// Post-handler bookkeeping: CmdSN admission sweep, then the idle
    /// clock reset. Runs for every successfully applied PDU, since every
    /// target PDU advertises the command window.
    fn finish_pdu(&mut self, bhs: &Bhs) -> IscsiResult<Disposition> {
        match self
            .session
            .update_cmd_window(bhs.exp_cmd_sn(), bhs.max_cmd_sn())
        {
            Ok(resend) => {
                for tag in resend {
                    self.send.resend_original(tag)?;
                }
            }
            Err(ResendOverflow::Connection(tag)) => {
                self.lifecycle.request_logout(&format!(
                    "request {:#010x} exhausted its resend budget",
                    tag.to_wire()
                ));
                return Ok(Disposition::ConnectionFatal);
            }
            Err(ResendOverflow::Session(tag)) => {
                self.lifecycle.kill_session(&format!(
                    "request {:#010x} exhausted the session resend budget",
                    tag.to_wire()
                ));
                return Ok(Disposition::ConnectionFatal);
            }
        }
        self.conn().touch();
        Ok(Disposition::Continue)
    }

    /// Feed a status sequence number to the connection's window and apply
    /// the recovery policy for what comes out.
    fn check_stat_sn(&mut self, stat_sn: u32) -> IscsiResult<StatVerdict> {
        let erl = self.session.lock().error_recovery_level;
        let (outcome, in_service, expected) = {
            let mut conn = self.conn();
            let in_service = conn.is_active();
            let expected = conn.stat_sn.expected();
            (conn.stat_sn.observe(stat_sn)?, in_service, expected)
        };
        match outcome {
            SnOutcome::InOrder => Ok(StatVerdict::Proceed),
            SnOutcome::Duplicate => {
                log::debug!("stale StatSN {}, dropping PDU", stat_sn);
                Ok(StatVerdict::Stale)
            }
            SnOutcome::Gap(missing) => {
                if erl == 0 || !in_service {
                    log::error!(
                        "StatSN gap (expected {}, got {}) with no recovery available",
                        expected,
                        stat_sn
                    );
                    return Ok(StatVerdict::Fatal);
                }
                log::warn!(
                    "StatSN gap: requesting status SNACK for [{}..{}]",
                    expected,
                    expected.wrapping_add(missing).wrapping_sub(1)
                );
                self.send.request_snack(SnackKind::Status, expected, missing)?;
                Ok(StatVerdict::Proceed)
            }
        }
    }

    /// Route a fully read PDU to its opcode handler
    fn dispatch(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        match pdu.bhs.opcode {
            opcode::LOGIN_RESPONSE => self.handle_login_response(pdu),
            opcode::TEXT_RESPONSE => self.handle_text_response(pdu),
            opcode::LOGOUT_RESPONSE => self.handle_logout_response(pdu),
            opcode::SCSI_RESPONSE => self.handle_scsi_response(pdu),
            opcode::TASK_MANAGEMENT_RESPONSE => self.handle_tmf_response(pdu),
            opcode::R2T => self.handle_r2t(pdu),
            opcode::NOP_IN => self.handle_nop_in(pdu),
            opcode::ASYNC_MESSAGE => self.handle_async_message(pdu),
            opcode::REJECT => self.handle_reject(pdu),
            other => Err(IscsiError::Protocol(format!(
                "unexpected opcode {:#04x} from target",
                other
            ))),
        }
    }

    /// Correlate a response to its CCB and mark it answered. Returns the
    /// tag, or `None` when the PDU cannot be attributed (and must be
    /// dropped as a duplicate for an unknown request).
    fn correlate(&mut self, itt: u32) -> Option<TaskTag> {
        let mut sess = self.session.lock();
        let ccb = sess.arena.lookup(itt)?;
        if ccb.is_complete() {
            log::debug!("tag {:#010x} already complete, duplicate response", itt);
            return None;
        }
        ccb.got_response = true;
        ccb.resend_count = 0;
        Some(ccb.tag())
    }

    // ------------------------------------------------------------------
    // Opcode handlers
    // ------------------------------------------------------------------

    fn handle_login_response(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let rsp = pdu.bhs.parse_login_response()?;
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(rsp.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        let max_text = self.session.config().max_text_payload;
        let payload = {
            let mut sess = self.session.lock();
            let Some(ccb) = sess.arena.get_mut(tag) else {
                return Ok(Disposition::Drop);
            };
            ccb.push_text(&pdu.data, max_text)?;
            if rsp.cont {
                // More fragments coming; nothing to hand off yet
                None
            } else {
                Some(ccb.take_text())
            }
        };
        let Some(payload) = payload else {
            return Ok(Disposition::Continue);
        };

        if rsp.status_class != login_status::SUCCESS {
            log::warn!(
                "login failed: class {:#04x} detail {:#04x}",
                rsp.status_class,
                rsp.status_detail
            );
            self.session.complete(tag, CmdStatus::LoginFailed);
            return Ok(Disposition::Continue);
        }

        match self.negotiation.login_response(tag, &rsp, payload)? {
            NegotiationOutcome::Complete => self.session.complete(tag, CmdStatus::Good),
            NegotiationOutcome::MoreExchanges => {}
        }
        Ok(Disposition::Continue)
    }

    fn handle_text_response(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let rsp = pdu.bhs.parse_text_response()?;
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(rsp.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        let max_text = self.session.config().max_text_payload;
        let payload = {
            let mut sess = self.session.lock();
            let Some(ccb) = sess.arena.get_mut(tag) else {
                return Ok(Disposition::Drop);
            };
            // The TTT travels with continuations so the follow-up empty
            // Text request can reference the same exchange
            ccb.ttt = rsp.ttt;
            ccb.push_text(&pdu.data, max_text)?;
            if rsp.cont {
                None
            } else {
                Some(ccb.take_text())
            }
        };
        let Some(payload) = payload else {
            return Ok(Disposition::Continue);
        };

        match self.negotiation.text_response(tag, &rsp, payload)? {
            NegotiationOutcome::Complete => self.session.complete(tag, CmdStatus::Good),
            NegotiationOutcome::MoreExchanges => {}
        }
        Ok(Disposition::Continue)
    }

    fn handle_logout_response(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let rsp = pdu.bhs.parse_logout_response()?;
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(rsp.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        let status = CmdStatus::from_logout_response(rsp.response);
        log::info!(
            "logout response {} (Time2Wait {}, Time2Retain {})",
            rsp.response,
            rsp.time2wait,
            rsp.time2retain
        );

        let own_logout = {
            let mut sess = self.session.lock();
            match sess.arena.get_mut(tag).map(|c| c.kind) {
                Some(CcbKind::Logout { own_connection, cid }) => Some((own_connection, cid)),
                _ => {
                    log::warn!("logout response for non-logout tag {:#010x}", tag.to_wire());
                    None
                }
            }
        };

        if let Some((true, cid)) = own_logout {
            // This connection is done carrying traffic; let teardown run
            self.conn().settle();
            self.lifecycle.connection_settled(cid);
        }
        self.session.complete(tag, status);
        Ok(Disposition::Continue)
    }

    fn handle_scsi_response(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let rsp = pdu.bhs.parse_scsi_response()?;
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(rsp.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        let erl = self.session.lock().error_recovery_level;
        let mut completion = None;
        let mut snack = None;
        {
            let mut sess = self.session.lock();
            let Some(ccb) = sess.arena.get_mut(tag) else {
                return Ok(Disposition::Drop);
            };

            if rsp.response != 0 {
                // The target never delivered the command to the SCSI layer
                log::warn!(
                    "tag {:#010x}: iSCSI service response {:#04x}",
                    tag.to_wire(),
                    rsp.response
                );
                completion = Some(CmdStatus::TargetFailure);
            } else {
                let status = CmdStatus::from_scsi_status(rsp.status);
                if status == CmdStatus::CheckCondition {
                    store_sense_data(ccb, &pdu.data);
                }
                if rsp.underflow {
                    ccb.underflow = true;
                    ccb.residual_count = rsp.residual_count;
                } else if rsp.overflow {
                    ccb.overflow = true;
                    ccb.residual_count = rsp.residual_count;
                }

                ccb.final_data_sn = Some(rsp.exp_data_sn);
                if ccb.read_settled() {
                    completion = Some(status);
                } else {
                    // Data-In PDUs are still missing under this response
                    let expected = ccb.data_sn.expected();
                    let missing = rsp
                        .exp_data_sn
                        .wrapping_sub(expected)
                        .saturating_sub(ccb.data_sn.ahead_len() as u32);
                    if erl == 0 {
                        return Err(IscsiError::SequenceGap {
                            expected,
                            got: rsp.exp_data_sn,
                        });
                    }
                    log::warn!(
                        "tag {:#010x}: {} data PDUs missing at final status, requesting data SNACK",
                        tag.to_wire(),
                        missing
                    );
                    snack = Some((expected, missing.max(1)));
                    ccb.parked_status = Some(status);
                }
            }
        }
        if let Some((begin, count)) = snack {
            self.send.request_snack(SnackKind::Data, begin, count)?;
        }
        if let Some(status) = completion {
            self.session.complete(tag, status);
        }
        Ok(Disposition::Continue)
    }

    fn handle_tmf_response(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let rsp = pdu.bhs.parse_tmf_response()?;
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(rsp.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        let status = CmdStatus::from_tmf_response(rsp.response);
        log::info!(
            "task management response {} for tag {:#010x}: {:?}",
            rsp.response,
            tag.to_wire(),
            status
        );
        self.session.complete(tag, status);
        Ok(Disposition::Continue)
    }

    fn handle_r2t(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let r2t = pdu.bhs.parse_r2t()?;
        // R2T carries StatSN for information only and does not advance it
        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        log::debug!(
            "R2T for tag {:#010x}: {} bytes at offset {}",
            tag.to_wire(),
            r2t.desired_length,
            r2t.buffer_offset
        );
        self.send
            .start_data_out(tag, r2t.ttt, r2t.buffer_offset, r2t.desired_length)?;
        Ok(Disposition::Continue)
    }

    fn handle_nop_in(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let nop = pdu.bhs.parse_nop_in()?;

        if pdu.bhs.itt == TAG_NONE {
            // Unsolicited keep-alive from the target. Its StatSN is the
            // next one to be assigned, not a consumed value, so the
            // window is left alone.
            if nop.ttt != TAG_NONE {
                log::debug!("target ping, answering with pong ({} bytes)", pdu.data.len());
                self.send.send_nop_pong(nop.ttt, pdu.data.clone())?;
            }
            if self.session.lock().arena.any_busy() {
                // Requests are in flight; ping back so the counters the
                // target just advertised get acknowledged promptly
                self.send.send_nop_ping()?;
            }
            return Ok(Disposition::Continue);
        }

        let Some(tag) = self.correlate(pdu.bhs.itt) else {
            return Ok(Disposition::Drop);
        };
        match self.check_stat_sn(nop.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }
        self.session.complete(tag, CmdStatus::Good);
        Ok(Disposition::Continue)
    }

    fn handle_async_message(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let msg = pdu.bhs.parse_async_message()?;
        match self.check_stat_sn(msg.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        match msg.event {
            async_event::SCSI_EVENT => {
                // Payload is autosense data; nothing is listening for it
                log::info!("SCSI async event ({} bytes sense), ignoring", pdu.data.len());
            }
            async_event::LOGOUT_REQUESTED => {
                log::warn!("target requests logout");
                self.lifecycle.request_logout("target requested logout");
            }
            async_event::CONNECTION_DROPPED => {
                log::warn!(
                    "target dropping cid {} (Time2Wait {}, Time2Retain {})",
                    msg.parameter1,
                    msg.parameter2,
                    msg.parameter3
                );
                self.lifecycle
                    .drop_connection(msg.parameter1, msg.parameter2, msg.parameter3);
            }
            async_event::ALL_CONNECTIONS_DROPPED => {
                log::warn!(
                    "target dropping all connections (Time2Wait {}, Time2Retain {})",
                    msg.parameter2,
                    msg.parameter3
                );
                self.lifecycle.session_dropped(msg.parameter2, msg.parameter3);
            }
            async_event::RENEGOTIATE => {
                log::warn!("target requests parameter renegotiation");
                self.lifecycle.request_renegotiation();
            }
            other => {
                // Unknown events must not break interoperability
                log::debug!("ignoring unknown async event {}", other);
            }
        }
        Ok(Disposition::Continue)
    }

    fn handle_reject(&mut self, pdu: &Pdu) -> IscsiResult<Disposition> {
        let reject = pdu.bhs.parse_reject()?;
        match self.check_stat_sn(reject.stat_sn)? {
            StatVerdict::Stale => return Ok(Disposition::Drop),
            StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
            StatVerdict::Proceed => {}
        }

        self.conn().needs_recovery = true;

        // The header of the offending PDU rides in the data segment
        if pdu.data.len() < BHS_SIZE {
            log::warn!(
                "reject (reason {:#04x}) with short payload ({} bytes), cannot attribute",
                reject.reason,
                pdu.data.len()
            );
            return Ok(Disposition::Drop);
        }
        let original = Bhs::from_bytes(&pdu.data[..BHS_SIZE])?;
        log::warn!(
            "target rejected our {} (tag {:#010x}), reason {:#04x}",
            original.opcode_name(),
            original.itt,
            reject.reason
        );

        let Some(tag) = self.correlate(original.itt) else {
            return Ok(Disposition::Drop);
        };

        if reject_reason::is_resendable(reject.reason) {
            // Retransmission burns the same budget the admission sweep uses
            let overflow = {
                let mut sess = self.session.lock();
                let config_occurrence = self.session.config().max_resend_per_occurrence;
                let config_total = self.session.config().max_resend_total;
                match sess.arena.get_mut(tag) {
                    Some(ccb) => {
                        ccb.resend_count += 1;
                        ccb.total_resends += 1;
                        ccb.got_response = false;
                        if ccb.total_resends > config_total {
                            Some(ResendOverflow::Session(tag))
                        } else if ccb.resend_count > config_occurrence {
                            Some(ResendOverflow::Connection(tag))
                        } else {
                            None
                        }
                    }
                    None => return Ok(Disposition::Drop),
                }
            };
            match overflow {
                Some(ResendOverflow::Connection(tag)) => {
                    self.lifecycle.request_logout(&format!(
                        "rejected request {:#010x} exhausted its resend budget",
                        tag.to_wire()
                    ));
                    return Ok(Disposition::ConnectionFatal);
                }
                Some(ResendOverflow::Session(tag)) => {
                    self.lifecycle.kill_session(&format!(
                        "rejected request {:#010x} exhausted the session resend budget",
                        tag.to_wire()
                    ));
                    return Ok(Disposition::ConnectionFatal);
                }
                None => self.send.resend_original(tag)?,
            }
        } else {
            self.session.complete(tag, CmdStatus::ProtocolError);
        }
        Ok(Disposition::Continue)
    }

    // ------------------------------------------------------------------
    // SCSI Data-In
    // ------------------------------------------------------------------

    fn receive_data_in(&mut self, bhs: &Bhs, data_digest_on: bool) -> IscsiResult<Disposition> {
        let din = bhs.parse_data_in()?;
        let len = bhs.data_length as usize;
        let offset = din.buffer_offset as usize;

        let target = {
            let mut sess = self.session.lock();
            match sess.arena.lookup(bhs.itt) {
                None => DataInTarget::Discard,
                Some(ccb) => {
                    if ccb.kind != CcbKind::Scsi || ccb.transfer_length() == 0 {
                        log::warn!(
                            "Data-In for tag {:#010x} with no active data receive",
                            bhs.itt
                        );
                        DataInTarget::Discard
                    } else if offset + len > ccb.transfer_length() {
                        // Would overrun the buffer the issuer supplied
                        return Err(IscsiError::Truncated {
                            limit: ccb.transfer_length(),
                            got: offset + len,
                        });
                    } else {
                        ccb.got_response = true;
                        ccb.resend_count = 0;
                        DataInTarget::Buffer(ccb.tag(), ccb.take_read_buf())
                    }
                }
            }
        };
        let (tag, mut buf) = match target {
            DataInTarget::Discard => {
                self.discard_segment(bhs, data_digest_on)?;
                return Ok(Disposition::Drop);
            }
            DataInTarget::Buffer(tag, buf) => (tag, buf),
        };

        // Payload straight into place; the buffer is owned by this thread
        // for the duration of the read, so no lock is held across it.
        if len > 0 {
            self.transport
                .read_full(&mut buf[offset..offset + len], ReadWait::Data)?;
        }
        let mut pad = [0u8; 4];
        let pad_len = bhs.pad_length();
        if pad_len > 0 {
            self.transport.read_full(&mut pad[..pad_len], ReadWait::Data)?;
        }
        let mut digest_ok = true;
        if data_digest_on && len > 0 {
            let mut digest = [0u8; DIGEST_SIZE];
            self.transport.read_full(&mut digest, ReadWait::Data)?;
            digest_ok = verify_data_digest(&buf[offset..offset + len], &pad[..pad_len], digest);
        }

        // Hand the buffer back before any policy decision; the DataSN
        // window has not moved, so a corrupt PDU is simply re-deliverable.
        {
            let mut sess = self.session.lock();
            if let Some(ccb) = sess.arena.get_mut(tag) {
                ccb.put_read_buf(buf);
            }
        }
        if !digest_ok {
            log::warn!("Data-In payload digest mismatch for tag {:#010x}", bhs.itt);
            return Ok(Disposition::Drop);
        }

        // Piggybacked status consumes a StatSN
        if din.has_status {
            match self.check_stat_sn(din.stat_sn)? {
                StatVerdict::Stale => return Ok(Disposition::Drop),
                StatVerdict::Fatal => return Ok(Disposition::ConnectionFatal),
                StatVerdict::Proceed => {}
            }
        }

        let erl = self.session.lock().error_recovery_level;
        let mut completion = None;
        let mut snack = None;
        let mut ack = None;
        {
            let mut sess = self.session.lock();
            let Some(ccb) = sess.arena.get_mut(tag) else {
                return Ok(Disposition::Drop);
            };
            match ccb.data_sn.observe(din.data_sn)? {
                SnOutcome::Duplicate => {
                    // Same bytes at the same offset; nothing to undo
                    log::debug!("duplicate DataSN {} for tag {:#010x}", din.data_sn, bhs.itt);
                    return Ok(Disposition::Drop);
                }
                SnOutcome::Gap(missing) => {
                    let expected = ccb.data_sn.expected();
                    if erl == 0 {
                        return Err(IscsiError::SequenceGap {
                            expected,
                            got: din.data_sn,
                        });
                    }
                    log::warn!(
                        "DataSN gap for tag {:#010x}: requesting data SNACK for [{}..{}]",
                        bhs.itt,
                        expected,
                        expected.wrapping_add(missing).wrapping_sub(1)
                    );
                    snack = Some((expected, missing));
                }
                SnOutcome::InOrder => {}
            }

            ccb.transferred += len as u32;
            if din.ack_requested && erl > 0 {
                ack = Some(ccb.data_sn.expected());
            }

            if din.has_status {
                if din.underflow {
                    ccb.underflow = true;
                    ccb.residual_count = din.residual_count;
                } else if din.overflow {
                    ccb.overflow = true;
                    ccb.residual_count = din.residual_count;
                }
                let status = CmdStatus::from_scsi_status(din.status);
                ccb.final_data_sn = Some(din.data_sn.wrapping_add(1));
                if ccb.read_settled() {
                    completion = Some(status);
                } else {
                    ccb.parked_status = Some(status);
                }
            } else if let Some(parked) = ccb.parked_status {
                // A gap that was holding up a final status may just have
                // been filled
                if ccb.read_settled() {
                    ccb.parked_status = None;
                    completion = Some(parked);
                }
            }
        }

        if let Some((begin, count)) = snack {
            self.send.request_snack(SnackKind::Data, begin, count)?;
        }
        if let Some(up_to) = ack {
            self.send.request_snack(SnackKind::DataAck, up_to, 0)?;
        }
        if let Some(status) = completion {
            self.session.complete(tag, status);
        }
        Ok(Disposition::Continue)
    }
}

/// Pull sense data out of a SCSI Response data segment: a 2-byte length
/// prefix, then the sense bytes, truncated to what the issuer can hold.
fn store_sense_data(ccb: &mut crate::ccb::Ccb, payload: &[u8]) {
    if payload.len() < 2 {
        return;
    }
    let sense_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let available = sense_len.min(payload.len() - 2);
    ccb.store_sense(&payload[2..2 + available]);
}

// ============================================================================
// Unit Tests
// ============================================================================
