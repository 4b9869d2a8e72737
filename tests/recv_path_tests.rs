//! Integration tests for the receive path
//!
//! These drive the full engine (frame reading, digest checks, sequence
//! windows, correlation, handlers, admission) through an in-memory
//! transport carrying byte-exact PDU streams, with recording stand-ins
//! for the send path, negotiation engine and lifecycle collaborators.

use iscsi_initiator::ccb::CcbKind;
use iscsi_initiator::digest::{data_digest, digest_to_wire, header_digest};
use iscsi_initiator::pdu::{
    flags, login_status, opcode, scsi_status, LoginResponse, TextResponse, BHS_SIZE, TAG_NONE,
};
use iscsi_initiator::{
    CmdStatus, ConnState, Connection, Disposition, IscsiError, IscsiResult, NegotiationEngine,
    NegotiationOutcome, ReadWait, RecvConfig, RecvEngine, SendPath, Session, SessionLifecycle,
    SnackKind, TaskTag, Transport,
};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

// ============================================================================
// In-memory transport
// ============================================================================

struct ScriptedTransport {
    input: Vec<u8>,
    pos: usize,
}

impl ScriptedTransport {
    fn new(input: Vec<u8>) -> Self {
        ScriptedTransport { input, pos: 0 }
    }
}

impl Transport for ScriptedTransport {
    fn read_full(&mut self, buf: &mut [u8], wait: ReadWait) -> IscsiResult<()> {
        let remaining = self.input.len() - self.pos;
        if remaining < buf.len() {
            if remaining == 0 && wait == ReadWait::Idle {
                return Err(IscsiError::IdleTimeout);
            }
            return Err(IscsiError::Transport("stream exhausted".to_string()));
        }
        buf.copy_from_slice(&self.input[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(())
    }

    fn drain(&mut self) -> IscsiResult<usize> {
        let discarded = self.input.len() - self.pos;
        self.pos = self.input.len();
        Ok(discarded)
    }

    fn shutdown(&mut self) -> IscsiResult<()> {
        Ok(())
    }
}

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Default)]
struct SendRecorder {
    snacks: Mutex<Vec<(SnackKind, u32, u32)>>,
    resends: Mutex<Vec<TaskTag>>,
    pongs: Mutex<Vec<(u32, Vec<u8>)>>,
    pings: Mutex<u32>,
    data_outs: Mutex<Vec<(TaskTag, u32, u32, u32)>>,
}

impl SendPath for SendRecorder {
    fn request_snack(&self, kind: SnackKind, beg: u32, run: u32) -> IscsiResult<()> {
        self.snacks.lock().unwrap().push((kind, beg, run));
        Ok(())
    }
    fn resend_original(&self, tag: TaskTag) -> IscsiResult<()> {
        self.resends.lock().unwrap().push(tag);
        Ok(())
    }
    fn send_nop_pong(&self, ttt: u32, payload: Vec<u8>) -> IscsiResult<()> {
        self.pongs.lock().unwrap().push((ttt, payload));
        Ok(())
    }
    fn send_nop_ping(&self) -> IscsiResult<()> {
        *self.pings.lock().unwrap() += 1;
        Ok(())
    }
    fn start_data_out(&self, tag: TaskTag, ttt: u32, off: u32, len: u32) -> IscsiResult<()> {
        self.data_outs.lock().unwrap().push((tag, ttt, off, len));
        Ok(())
    }
}

struct NegotiationRecorder {
    outcome: NegotiationOutcome,
    payloads: Mutex<Vec<(TaskTag, Vec<u8>)>>,
}

impl NegotiationRecorder {
    fn completing() -> Self {
        NegotiationRecorder {
            outcome: NegotiationOutcome::Complete,
            payloads: Mutex::new(Vec::new()),
        }
    }
}

impl NegotiationEngine for NegotiationRecorder {
    fn login_response(
        &self,
        tag: TaskTag,
        _response: &LoginResponse,
        payload: Vec<u8>,
    ) -> IscsiResult<NegotiationOutcome> {
        self.payloads.lock().unwrap().push((tag, payload));
        Ok(self.outcome)
    }
    fn text_response(
        &self,
        tag: TaskTag,
        _response: &TextResponse,
        payload: Vec<u8>,
    ) -> IscsiResult<NegotiationOutcome> {
        self.payloads.lock().unwrap().push((tag, payload));
        Ok(self.outcome)
    }
}

#[derive(Default)]
struct LifecycleRecorder {
    events: Mutex<Vec<String>>,
}

impl LifecycleRecorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionLifecycle for LifecycleRecorder {
    fn request_logout(&self, _reason: &str) {
        self.events.lock().unwrap().push("logout".to_string());
    }
    fn drop_connection(&self, cid: u16, _t2w: u16, _t2r: u16) {
        self.events.lock().unwrap().push(format!("drop {}", cid));
    }
    fn session_dropped(&self, _t2w: u16, _t2r: u16) {
        self.events.lock().unwrap().push("session dropped".to_string());
    }
    fn request_renegotiation(&self) {
        self.events.lock().unwrap().push("renegotiate".to_string());
    }
    fn connection_settled(&self, cid: u16) {
        self.events.lock().unwrap().push(format!("settled {}", cid));
    }
    fn kill_session(&self, _reason: &str) {
        self.events.lock().unwrap().push("kill session".to_string());
    }
}

// ============================================================================
// PDU stream builders
// ============================================================================

fn header(op: u8) -> [u8; BHS_SIZE] {
    let mut buf = [0u8; BHS_SIZE];
    buf[0] = op;
    buf
}

fn set_u32(buf: &mut [u8; BHS_SIZE], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn set_sns(buf: &mut [u8; BHS_SIZE], stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) {
    set_u32(buf, 24, stat_sn);
    set_u32(buf, 28, exp_cmd_sn);
    set_u32(buf, 32, max_cmd_sn);
}

/// Serialize one PDU the way a target would, with optional digests
fn frame_digested(
    mut buf: [u8; BHS_SIZE],
    payload: &[u8],
    header_digest_on: bool,
    data_digest_on: bool,
) -> Vec<u8> {
    buf[5] = ((payload.len() >> 16) & 0xff) as u8;
    buf[6] = ((payload.len() >> 8) & 0xff) as u8;
    buf[7] = (payload.len() & 0xff) as u8;

    let mut bytes = buf.to_vec();
    if header_digest_on {
        bytes.extend_from_slice(&digest_to_wire(header_digest(&buf)));
    }
    bytes.extend_from_slice(payload);
    let pad_len = (4 - payload.len() % 4) % 4;
    bytes.extend_from_slice(&[0u8; 3][..pad_len]);
    if data_digest_on && !payload.is_empty() {
        bytes.extend_from_slice(&digest_to_wire(data_digest(payload, &vec![0u8; pad_len])));
    }
    bytes
}

fn frame(buf: [u8; BHS_SIZE], payload: &[u8]) -> Vec<u8> {
    frame_digested(buf, payload, false, false)
}

fn data_in_header(
    itt: u32,
    data_sn: u32,
    buffer_offset: u32,
    stat_sn: u32,
    status: Option<u8>,
    final_flag: bool,
) -> [u8; BHS_SIZE] {
    let mut buf = header(opcode::SCSI_DATA_IN);
    if final_flag {
        buf[1] |= flags::FINAL;
    }
    if let Some(s) = status {
        buf[1] |= flags::STATUS;
        buf[3] = s;
    }
    set_u32(&mut buf, 16, itt);
    set_u32(&mut buf, 20, TAG_NONE);
    set_sns(&mut buf, stat_sn, 1, 64);
    set_u32(&mut buf, 36, data_sn);
    set_u32(&mut buf, 40, buffer_offset);
    buf
}

// ============================================================================
// Test harness
// ============================================================================

struct Harness {
    session: Arc<Session>,
    conn: Arc<Mutex<Connection>>,
    send: Arc<SendRecorder>,
    negotiation: Arc<NegotiationRecorder>,
    lifecycle: Arc<LifecycleRecorder>,
}

impl Harness {
    fn new(erl: u8) -> Self {
        Harness::with_session(erl, 1, 64, RecvConfig::default())
    }

    fn with_session(erl: u8, exp_cmd_sn: u32, max_cmd_sn: u32, config: RecvConfig) -> Self {
        Lazy::force(&LOGGER);
        Harness {
            session: Arc::new(Session::new(exp_cmd_sn, max_cmd_sn, erl, config.clone())),
            conn: Arc::new(Mutex::new(Connection::new(0, 100, &config))),
            send: Arc::new(SendRecorder::default()),
            negotiation: Arc::new(NegotiationRecorder::completing()),
            lifecycle: Arc::new(LifecycleRecorder::default()),
        }
    }

    fn engine(&self, stream: Vec<u8>) -> RecvEngine<ScriptedTransport> {
        RecvEngine::new(
            ScriptedTransport::new(stream),
            self.session.clone(),
            self.conn.clone(),
            self.send.clone(),
            self.negotiation.clone(),
            self.lifecycle.clone(),
        )
    }

    fn busy_ccb(&self, kind: CcbKind, cmd_sn: u32) -> TaskTag {
        let mut sess = self.session.lock();
        let tag = sess.arena.allocate(kind, cmd_sn).unwrap();
        sess.arena.start(tag).unwrap();
        tag
    }

    fn busy_read(&self, cmd_sn: u32, transfer_length: usize) -> TaskTag {
        let mut sess = self.session.lock();
        let tag = sess.arena.allocate(CcbKind::Scsi, cmd_sn).unwrap();
        sess.arena.prepare_read(tag, transfer_length, 64);
        sess.arena.start(tag).unwrap();
        tag
    }

    fn status_of(&self, tag: TaskTag) -> Option<CmdStatus> {
        self.session.lock().arena.status(tag)
    }
}

// ============================================================================
// SCSI read reassembly
// ============================================================================

#[test]
fn test_read_across_two_data_in_pdus_completes_on_final_status() {
    let h = Harness::new(0);
    let tag = h.busy_read(1, 1024);

    let mut stream = Vec::new();
    stream.extend(frame(
        data_in_header(tag.to_wire(), 0, 0, 0, None, false),
        &[0xAA; 512],
    ));
    stream.extend(frame(
        data_in_header(tag.to_wire(), 1, 512, 100, Some(scsi_status::GOOD), true),
        &[0xBB; 512],
    ));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), None); // still mid-transfer
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));

    let mut sess = h.session.lock();
    let ccb = sess.arena.get_mut(tag).unwrap();
    assert_eq!(ccb.transferred, 1024);
    let data = ccb.take_read_buf();
    assert!(data[..512].iter().all(|&b| b == 0xAA));
    assert!(data[512..].iter().all(|&b| b == 0xBB));
}

#[test]
fn test_read_completion_via_separate_scsi_response() {
    let h = Harness::new(0);
    let tag = h.busy_read(1, 256);

    let mut rsp = header(opcode::SCSI_RESPONSE);
    rsp[1] = flags::FINAL;
    rsp[2] = 0x00; // service response: completed
    rsp[3] = scsi_status::GOOD;
    set_u32(&mut rsp, 16, tag.to_wire());
    set_sns(&mut rsp, 100, 1, 64);
    set_u32(&mut rsp, 36, 1); // ExpDataSN: one Data-In was sent

    let mut stream = Vec::new();
    stream.extend(frame(
        data_in_header(tag.to_wire(), 0, 0, 0, None, true),
        &[0xCC; 256],
    ));
    stream.extend(frame(rsp, &[]));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
}

#[test]
fn test_data_in_overrunning_buffer_is_fatal() {
    let h = Harness::new(0);
    let tag = h.busy_read(1, 256);
    let stream = frame(
        data_in_header(tag.to_wire(), 0, 128, 0, None, false),
        &[0u8; 256], // 128 + 256 > 256
    );
    let mut engine = h.engine(stream);
    assert!(matches!(
        engine.receive_pdu(),
        Err(IscsiError::Truncated { .. })
    ));
}

#[test]
fn test_data_sn_gap_requests_snack_and_parks_status() {
    let h = Harness::new(1);
    let tag = h.busy_read(1, 1024);

    let mut stream = Vec::new();
    // DataSN 1 arrives before DataSN 0, carrying final status
    stream.extend(frame(
        data_in_header(tag.to_wire(), 1, 512, 100, Some(scsi_status::GOOD), true),
        &[0xBB; 512],
    ));
    stream.extend(frame(
        data_in_header(tag.to_wire(), 0, 0, 0, None, false),
        &[0xAA; 512],
    ));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    // gap seen: a data SNACK for the missing run, status parked
    assert_eq!(
        h.send.snacks.lock().unwrap().as_slice(),
        &[(SnackKind::Data, 0, 1)]
    );
    assert_eq!(h.status_of(tag), None);

    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));

    let mut sess = h.session.lock();
    let data = sess.arena.get_mut(tag).unwrap().take_read_buf();
    assert!(data[..512].iter().all(|&b| b == 0xAA));
    assert!(data[512..].iter().all(|&b| b == 0xBB));
}

#[test]
fn test_data_sn_gap_at_erl0_is_fatal() {
    let h = Harness::new(0);
    let tag = h.busy_read(1, 1024);
    let stream = frame(
        data_in_header(tag.to_wire(), 1, 512, 100, None, false),
        &[0u8; 512],
    );
    let mut engine = h.engine(stream);
    assert!(matches!(
        engine.receive_pdu(),
        Err(IscsiError::SequenceGap { .. })
    ));
    assert!(h.send.snacks.lock().unwrap().is_empty());
}

#[test]
fn test_data_in_for_unknown_itt_is_consumed_and_dropped() {
    let h = Harness::new(0);
    let stream = frame(
        data_in_header(0x0009_0001, 0, 0, 0, None, false),
        &[0u8; 64],
    );
    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Drop);
    // the payload was consumed: the stream is empty, not misaligned
    assert!(matches!(
        engine.receive_pdu(),
        Err(IscsiError::IdleTimeout)
    ));
}

// ============================================================================
// SCSI response details
// ============================================================================

#[test]
fn test_check_condition_copies_truncated_sense() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Scsi, 1);
    {
        let mut sess = h.session.lock();
        sess.arena.prepare_read(tag, 0, 16); // sense capacity 16
    }

    let mut rsp = header(opcode::SCSI_RESPONSE);
    rsp[1] = flags::FINAL;
    rsp[3] = scsi_status::CHECK_CONDITION;
    set_u32(&mut rsp, 16, tag.to_wire());
    set_sns(&mut rsp, 100, 1, 64);

    // sense payload: 2-byte length prefix then 32 bytes of sense
    let mut payload = 32u16.to_be_bytes().to_vec();
    payload.extend_from_slice(&[0x70; 32]);

    let mut engine = h.engine(frame(rsp, &payload));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::CheckCondition));

    let mut sess = h.session.lock();
    let ccb = sess.arena.get_mut(tag).unwrap();
    assert_eq!(ccb.sense(), &[0x70; 16][..]);
}

#[test]
fn test_underflow_residual_recorded() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Scsi, 1);

    let mut rsp = header(opcode::SCSI_RESPONSE);
    rsp[1] = flags::FINAL | flags::UNDERFLOW;
    rsp[3] = scsi_status::GOOD;
    set_u32(&mut rsp, 16, tag.to_wire());
    set_sns(&mut rsp, 100, 1, 64);
    set_u32(&mut rsp, 44, 2048); // residual

    let mut engine = h.engine(frame(rsp, &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    let mut sess = h.session.lock();
    let ccb = sess.arena.get_mut(tag).unwrap();
    assert!(ccb.underflow);
    assert_eq!(ccb.residual_count, 2048);
}

#[test]
fn test_target_failure_response_code() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Scsi, 1);

    let mut rsp = header(opcode::SCSI_RESPONSE);
    rsp[1] = flags::FINAL;
    rsp[2] = 0x01; // target failure
    set_u32(&mut rsp, 16, tag.to_wire());
    set_sns(&mut rsp, 100, 1, 64);

    let mut engine = h.engine(frame(rsp, &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::TargetFailure));
}

// ============================================================================
// StatSN policy
// ============================================================================

fn solicited_nop_in(itt: u32, stat_sn: u32, exp_cmd_sn: u32) -> [u8; BHS_SIZE] {
    let mut buf = header(opcode::NOP_IN);
    buf[1] = flags::FINAL;
    set_u32(&mut buf, 16, itt);
    set_u32(&mut buf, 20, TAG_NONE);
    set_sns(&mut buf, stat_sn, exp_cmd_sn, 64);
    buf
}

#[test]
fn test_stat_sn_gap_with_recovery_requests_status_snack() {
    let h = Harness::new(1);
    let tag = h.busy_ccb(CcbKind::Nop, 1);

    // window expects 100; 102 arrives
    let mut engine = h.engine(frame(solicited_nop_in(tag.to_wire(), 102, 1), &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);

    // SNACK for the missing [100, 101]; the PDU itself was still applied
    assert_eq!(
        h.send.snacks.lock().unwrap().as_slice(),
        &[(SnackKind::Status, 100, 2)]
    );
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
    let conn = h.conn.lock().unwrap();
    assert_eq!(conn.stat_sn.expected(), 100);
    assert_eq!(conn.stat_sn.ahead_len(), 1);
}

#[test]
fn test_stat_sn_gap_at_erl0_tears_down_without_snack() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Nop, 1);

    let mut engine = h.engine(frame(solicited_nop_in(tag.to_wire(), 102, 1), &[]));
    assert_eq!(
        engine.receive_pdu().unwrap(),
        Disposition::ConnectionFatal
    );
    assert!(h.send.snacks.lock().unwrap().is_empty());
    assert_eq!(h.status_of(tag), None);
}

#[test]
fn test_duplicate_response_completes_exactly_once() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Nop, 1);

    let pdu = frame(solicited_nop_in(tag.to_wire(), 100, 1), &[]);
    let mut stream = pdu.clone();
    stream.extend(pdu);

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
    // identical re-delivery: already-complete CCB, stale StatSN
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Drop);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
    assert_eq!(h.conn.lock().unwrap().stat_sn.expected(), 101);
}

// ============================================================================
// CmdSN admission and resend
// ============================================================================

fn unsolicited_nop_in(exp_cmd_sn: u32, max_cmd_sn: u32) -> [u8; BHS_SIZE] {
    let mut buf = header(opcode::NOP_IN);
    buf[1] = flags::FINAL;
    set_u32(&mut buf, 16, TAG_NONE);
    set_u32(&mut buf, 20, TAG_NONE);
    set_sns(&mut buf, 100, exp_cmd_sn, max_cmd_sn);
    buf
}

#[test]
fn test_admission_resends_commands_below_advertised_window() {
    // Session window ExpCmdSN=5, MaxCmdSN=10; CCBs queued at 5, 6, 7
    let h = Harness::with_session(0, 5, 10, RecvConfig::default());
    let t5 = h.busy_ccb(CcbKind::Scsi, 5);
    let t6 = h.busy_ccb(CcbKind::Scsi, 6);
    let t7 = h.busy_ccb(CcbKind::Scsi, 7);

    // NOP-In advertising ExpCmdSN=7
    let mut engine = h.engine(frame(unsolicited_nop_in(7, 12), &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);

    let resends = h.send.resends.lock().unwrap();
    assert_eq!(resends.as_slice(), &[t5, t6]);
    assert!(!resends.contains(&t7));
    drop(resends);
    let sess = h.session.lock();
    assert_eq!(sess.exp_cmd_sn, 7);
    assert_eq!(sess.max_cmd_sn, 12);
}

#[test]
fn test_resend_occurrence_ceiling_requests_logout() {
    let mut config = RecvConfig::default();
    config.max_resend_per_occurrence = 1;
    let h = Harness::with_session(0, 5, 10, config);
    h.busy_ccb(CcbKind::Scsi, 5);

    let mut stream = frame(unsolicited_nop_in(7, 12), &[]);
    stream.extend(frame(unsolicited_nop_in(7, 12), &[]));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(
        engine.receive_pdu().unwrap(),
        Disposition::ConnectionFatal
    );
    assert_eq!(h.lifecycle.events(), vec!["logout".to_string()]);
}

#[test]
fn test_resend_total_ceiling_kills_session() {
    let mut config = RecvConfig::default();
    config.max_resend_per_occurrence = 100;
    config.max_resend_total = 1;
    let h = Harness::with_session(0, 5, 10, config);
    h.busy_ccb(CcbKind::Scsi, 5);

    let mut stream = frame(unsolicited_nop_in(7, 12), &[]);
    stream.extend(frame(unsolicited_nop_in(7, 12), &[]));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(
        engine.receive_pdu().unwrap(),
        Disposition::ConnectionFatal
    );
    assert_eq!(h.lifecycle.events(), vec!["kill session".to_string()]);
}

// ============================================================================
// Text/login continuation
// ============================================================================

#[test]
fn test_text_continuation_reassembles_exact_concatenation() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Text, 1);

    let fragments: [&[u8]; 3] = [b"TargetName=iqn.2004-", b"04.example:disk", b".0\0"];
    let mut stream = Vec::new();
    for (i, fragment) in fragments.iter().enumerate() {
        let last = i == fragments.len() - 1;
        let mut buf = header(opcode::TEXT_RESPONSE);
        buf[1] = if last { flags::FINAL } else { flags::CONTINUE };
        set_u32(&mut buf, 16, tag.to_wire());
        set_u32(&mut buf, 20, if last { TAG_NONE } else { 0x7000_0001 });
        set_sns(&mut buf, 100 + i as u32, 1, 64);
        stream.extend(frame(buf, fragment));
    }

    let mut engine = h.engine(stream);
    for _ in 0..3 {
        assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    }

    let payloads = h.negotiation.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].0, tag);
    assert_eq!(payloads[0].1, b"TargetName=iqn.2004-04.example:disk.0\0");
    drop(payloads);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
}

#[test]
fn test_login_failure_completes_without_negotiation() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Login, 1);

    let mut buf = header(opcode::LOGIN_RESPONSE);
    set_u32(&mut buf, 16, tag.to_wire());
    set_sns(&mut buf, 100, 1, 64);
    buf[36] = login_status::INITIATOR_ERROR;
    buf[37] = 0x01; // authentication failure

    let mut engine = h.engine(frame(buf, &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::LoginFailed));
    assert!(h.negotiation.payloads.lock().unwrap().is_empty());
}

// ============================================================================
// Logout and teardown
// ============================================================================

#[test]
fn test_own_logout_settles_connection() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(
        CcbKind::Logout {
            own_connection: true,
            cid: 0,
        },
        1,
    );

    let mut buf = header(opcode::LOGOUT_RESPONSE);
    buf[1] = flags::FINAL;
    buf[2] = 0; // success
    set_u32(&mut buf, 16, tag.to_wire());
    set_sns(&mut buf, 100, 1, 64);

    let mut engine = h.engine(frame(buf, &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::Good));
    assert_eq!(h.conn.lock().unwrap().state(), ConnState::Settling);
    assert_eq!(h.lifecycle.events(), vec!["settled 0".to_string()]);
}

#[test]
fn test_other_connection_logout_does_not_settle() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(
        CcbKind::Logout {
            own_connection: false,
            cid: 3,
        },
        1,
    );

    let mut buf = header(opcode::LOGOUT_RESPONSE);
    buf[1] = flags::FINAL;
    buf[2] = 1; // CID not found
    set_u32(&mut buf, 16, tag.to_wire());
    set_sns(&mut buf, 100, 1, 64);

    let mut engine = h.engine(frame(buf, &[]));
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);
    assert_eq!(h.status_of(tag), Some(CmdStatus::BadCid));
    assert_eq!(h.conn.lock().unwrap().state(), ConnState::Active);
    assert!(h.lifecycle.events().is_empty());
}

// ============================================================================
// Digests over the full frame
// ============================================================================

#[test]
fn test_digests_enabled_mid_session_are_honored() {
    let h = Harness::new(0);

    // First PDU before digests are negotiated on
    let mut first = header(opcode::NOP_IN);
    first[1] = flags::FINAL;
    set_u32(&mut first, 16, TAG_NONE);
    set_u32(&mut first, 20, 0x2222_0001);
    set_sns(&mut first, 100, 1, 64);

    // Second PDU framed with both digests
    let mut second = header(opcode::NOP_IN);
    second[1] = flags::FINAL;
    set_u32(&mut second, 16, TAG_NONE);
    set_u32(&mut second, 20, 0x2222_0002);
    set_sns(&mut second, 100, 1, 64);

    let mut stream = frame(first, b"one");
    stream.extend(frame_digested(second, b"two", true, true));

    let mut engine = h.engine(stream);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);

    // negotiation turned digests on between the PDUs
    h.conn.lock().unwrap().set_digests(true, true);
    assert_eq!(engine.receive_pdu().unwrap(), Disposition::Continue);

    let pongs = h.send.pongs.lock().unwrap();
    assert_eq!(pongs.len(), 2);
    assert_eq!(pongs[1].1, b"two");
}

#[test]
fn test_corrupt_data_digest_is_recoverable_frame_error() {
    let h = Harness::new(0);
    h.conn.lock().unwrap().set_digests(false, true);
    let tag = h.busy_ccb(CcbKind::Text, 1);

    let mut buf = header(opcode::TEXT_RESPONSE);
    buf[1] = flags::FINAL;
    set_u32(&mut buf, 16, tag.to_wire());
    set_u32(&mut buf, 20, TAG_NONE);
    set_sns(&mut buf, 100, 1, 64);

    let mut stream = frame_digested(buf, b"Key=Val\0", false, true);
    let len = stream.len();
    stream[len - 1] ^= 0xff; // corrupt the data digest

    let mut engine = h.engine(stream);
    match engine.receive_pdu() {
        Err(e @ IscsiError::Frame(_)) => assert!(!e.is_connection_fatal()),
        other => panic!("expected frame error, got {:?}", other),
    }
    // nothing was applied
    assert_eq!(h.status_of(tag), None);
    assert!(h.negotiation.payloads.lock().unwrap().is_empty());
}

// ============================================================================
// Receive loop
// ============================================================================

#[test]
fn test_run_fails_in_flight_requests_when_stream_dies() {
    let h = Harness::new(0);
    let tag = h.busy_ccb(CcbKind::Scsi, 1);

    // one valid PDU for an unrelated exchange, then silence
    let stream = frame(unsolicited_nop_in(1, 64), &[]);
    let mut engine = h.engine(stream);

    let result = engine.run();
    assert!(result.is_err());
    // the idle handler pinged once before giving up
    assert_eq!(*h.send.pings.lock().unwrap(), 1);
    // and the in-flight request was woken with Lost
    assert_eq!(h.session.wait_complete(tag), Some(CmdStatus::Lost));
}

#[test]
fn test_run_exits_cleanly_on_termination() {
    let h = Harness::new(0);
    h.conn.lock().unwrap().terminate();
    let mut engine = h.engine(Vec::new());
    assert!(engine.run().is_ok());
}
