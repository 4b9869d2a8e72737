//! Session and connection state for the receive engine
//!
//! A `Session` is the logical association with one target, spanning one or
//! more connections. It owns the advertised command window and the CCB
//! arena, guarded by a single lock: timer-driven resend logic and the
//! receive thread both go through it, the receive thread only for the
//! brief window update at the end of each PDU. A `Connection` is one
//! transport endpoint with its own StatSN window and digest settings.

use crate::ccb::{CcbArena, CmdStatus, TaskTag};
use crate::sequence::{sn_before, SequenceWindow};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Receive-engine tuning knobs
///
/// The out-of-order and resend bounds are tuning constants, not protocol
/// requirements; the defaults are deliberately small because excessive
/// loss on a TCP-carried stream means the connection is sick.
#[derive(Debug, Clone)]
pub struct RecvConfig {
    /// Largest data segment we accept in a single PDU
    pub max_recv_data_segment_length: u32,
    /// Bound on any sequence window's out-of-order set; beyond it the
    /// connection is torn down rather than buffering without limit
    pub max_ahead: usize,
    /// Resends of one request since its last response before the
    /// connection is considered broken
    pub max_resend_per_occurrence: u32,
    /// Lifetime resends of one request before the whole session is
    /// considered broken
    pub max_resend_total: u32,
    /// Idle bound on waiting for the next PDU header
    pub idle_timeout: Duration,
    /// Bound on mid-frame stalls (payload, padding, digests)
    pub data_timeout: Duration,
    /// Cap on an accumulated multi-PDU text/login payload
    pub max_text_payload: usize,
    /// CCB arena size (outstanding request limit)
    pub ccb_slots: usize,
}

impl Default for RecvConfig {
    fn default() -> Self {
        RecvConfig {
            max_recv_data_segment_length: 8192,
            max_ahead: 16,
            max_resend_per_occurrence: 2,
            max_resend_total: 6,
            idle_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(10),
            max_text_payload: 65536,
            ccb_slots: 64,
        }
    }
}

/// Which resend ceiling an admission sweep tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOverflow {
    /// Per-occurrence ceiling: tear down and log out this connection
    Connection(TaskTag),
    /// Total-attempts ceiling: the session itself is beyond saving
    Session(TaskTag),
}

/// Mutable session interior, guarded by the session lock
#[derive(Debug)]
pub struct SessionInner {
    /// Next CmdSN the target expects (advertised window low edge)
    pub exp_cmd_sn: u32,
    /// Highest CmdSN the target will accept
    pub max_cmd_sn: u32,
    /// Negotiated error recovery level (0-2)
    pub error_recovery_level: u8,
    pub arena: CcbArena,
}

/// iSCSI session: advertised command window, recovery level, CCBs
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionInner>,
    completions: Condvar,
    config: RecvConfig,
}

impl Session {
    pub fn new(exp_cmd_sn: u32, max_cmd_sn: u32, error_recovery_level: u8, config: RecvConfig) -> Self {
        let arena = CcbArena::new(config.ccb_slots, config.max_ahead);
        Session {
            inner: Mutex::new(SessionInner {
                exp_cmd_sn,
                max_cmd_sn,
                error_recovery_level,
                arena,
            }),
            completions: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &RecvConfig {
        &self.config
    }

    /// Lock the session interior. Poisoning is ignored: the state is a
    /// set of counters and dispositions that stay consistent per field.
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an advertised command window and sweep for unanswered
    /// requests the target has implicitly asked for again.
    ///
    /// Any CCB still waiting to be sent or re-sent whose CmdSN has fallen
    /// below the advertised ExpCmdSN, and that has never seen a response,
    /// is due for retransmission; its tags are returned so the caller can
    /// hand them to the send path *outside* the session lock. Ceiling
    /// overruns abort the sweep.
    pub fn update_cmd_window(&self, exp_cmd_sn: u32, max_cmd_sn: u32) -> Result<Vec<TaskTag>, ResendOverflow> {
        let mut inner = self.lock();

        if sn_before(inner.exp_cmd_sn, exp_cmd_sn) {
            inner.exp_cmd_sn = exp_cmd_sn;
        }
        if sn_before(inner.max_cmd_sn, max_cmd_sn) {
            inner.max_cmd_sn = max_cmd_sn;
        }
        let exp = inner.exp_cmd_sn;

        let mut resend = Vec::new();
        for ccb in inner.arena.iter_busy_mut() {
            if !ccb.wants_resend || ccb.got_response || !sn_before(ccb.cmd_sn, exp) {
                continue;
            }
            ccb.resend_count += 1;
            ccb.total_resends += 1;
            if ccb.total_resends > self.config.max_resend_total {
                log::error!(
                    "tag {:#010x}: {} lifetime resends, session exhausted",
                    ccb.tag().to_wire(),
                    ccb.total_resends
                );
                return Err(ResendOverflow::Session(ccb.tag()));
            }
            if ccb.resend_count > self.config.max_resend_per_occurrence {
                log::error!(
                    "tag {:#010x}: {} resends without response, connection exhausted",
                    ccb.tag().to_wire(),
                    ccb.resend_count
                );
                return Err(ResendOverflow::Connection(ccb.tag()));
            }
            log::info!(
                "tag {:#010x}: CmdSN {} fell below ExpCmdSN {}, resending (attempt {})",
                ccb.tag().to_wire(),
                ccb.cmd_sn,
                exp,
                ccb.resend_count
            );
            resend.push(ccb.tag());
        }
        Ok(resend)
    }

    /// Complete a request and wake its issuer
    pub fn complete(&self, tag: TaskTag, status: CmdStatus) {
        let completed = {
            let mut inner = self.lock();
            inner.arena.complete(tag, status)
        };
        if completed {
            self.completions.notify_all();
        }
    }

    /// Block until the request completes, then return its status.
    /// The slot stays allocated until `release` is called.
    pub fn wait_complete(&self, tag: TaskTag) -> Option<CmdStatus> {
        let mut inner = self.lock();
        loop {
            if let Some(status) = inner.arena.status(tag) {
                return Some(status);
            }
            if inner.arena.get_mut(tag).is_none() {
                // stale or released tag; there is nothing to wait for
                return None;
            }
            inner = self
                .completions
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Release a completed request's slot back to the arena
    pub fn release(&self, tag: TaskTag) {
        self.lock().arena.release(tag);
    }

    /// Mark every in-flight request lost and wake all issuers; called
    /// when a connection dies with requests outstanding.
    pub fn fail_all_in_flight(&self) -> usize {
        let failed = self.lock().arena.fail_all(CmdStatus::Lost);
        if failed > 0 {
            log::warn!("{} in-flight requests lost with the connection", failed);
            self.completions.notify_all();
        }
        failed
    }
}

/// Connection service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum ConnState {
    /// Full feature phase, PDUs flowing
    #[default]
    Active,
    /// Logout response for this connection received; draining
    Settling,
    /// Teardown requested; the receive loop exits at the next iteration
    Terminating,
}

/// One transport endpoint of a session
#[derive(Debug)]
pub struct Connection {
    pub cid: u16,
    state: ConnState,
    /// Digest settings may flip mid-session when negotiation enables
    /// them, so the frame reader re-checks per PDU
    header_digest: bool,
    data_digest: bool,
    /// StatSN validation window
    pub stat_sn: SequenceWindow,
    /// Set when a Reject told us the target saw corruption from us
    pub needs_recovery: bool,
    last_pdu: Instant,
}

impl Connection {
    /// `exp_stat_sn` is the first StatSN expected after login
    pub fn new(cid: u16, exp_stat_sn: u32, config: &RecvConfig) -> Self {
        Connection {
            cid,
            state: ConnState::Active,
            header_digest: false,
            data_digest: false,
            stat_sn: SequenceWindow::new(exp_stat_sn, config.max_ahead),
            needs_recovery: false,
            last_pdu: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    pub fn is_terminating(&self) -> bool {
        self.state == ConnState::Terminating
    }

    /// Cooperative cancellation: observed by the receive loop after its
    /// current blocking read returns. Pair with a transport shutdown to
    /// unblock that read.
    pub fn terminate(&mut self) {
        self.state = ConnState::Terminating;
    }

    /// Logout for this connection completed; stop treating gaps and
    /// errors as recoverable.
    pub fn settle(&mut self) {
        if self.state == ConnState::Active {
            self.state = ConnState::Settling;
        }
    }

    pub fn digests(&self) -> (bool, bool) {
        (self.header_digest, self.data_digest)
    }

    /// Applied by the negotiation layer when digests are enabled
    /// mid-session
    pub fn set_digests(&mut self, header: bool, data: bool) {
        self.header_digest = header;
        self.data_digest = data;
    }

    /// Reset the idle/liveness clock after a fully processed PDU
    pub fn touch(&mut self) {
        self.last_pdu = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_pdu.elapsed()
    }
}
