//! Per-ECU UDS session state
//!
//! Tracks the active diagnostic session and its tester-present deadline,
//! the security-access handshake (seed, attempts, lockout), the writable
//! data identifiers and the routine runtime. Long-running routines are
//! spawned tokio tasks polled through RequestRoutineResults.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::DiagnosticSession;

/// S3 server timeout: the session reverts to default when no request
/// arrives within this window.
pub const S3_SERVER_TIMEOUT: Duration = Duration::from_secs(5);
/// Wrong keys tolerated before security access locks out.
pub const SECURITY_MAX_ATTEMPTS: u8 = 3;
/// How long the lockout answers ExceededNumberOfAttempts.
pub const SECURITY_LOCKOUT: Duration = Duration::from_secs(10);
/// Level-1 key derivation mask: key = seed XOR mask.
pub const LEVEL1_KEY_MASK: u32 = 0x1234_5678;

/// Per-level key mask; higher levels fold the level number in.
pub fn key_mask(level: u8) -> u32 {
    match level {
        1 => LEVEL1_KEY_MASK,
        n => LEVEL1_KEY_MASK ^ 0x0101_0101u32.wrapping_mul(n as u32),
    }
}

/// A seed handed out and awaiting its key.
#[derive(Debug, Clone, Copy)]
pub struct PendingSeed {
    pub level: u8,
    pub seed: u32,
}

/// A routine the tester started. Completion is a background task writing
/// into `result`; `requestResult` polls it.
pub struct RoutineRun {
    pub handle: JoinHandle<()>,
    pub result: Arc<Mutex<Option<Vec<u8>>>>,
    pub stopped: bool,
}

/// Routines this ECU implements: (identifier, name, completion delay,
/// result payload).
pub(crate) struct RoutineDef {
    pub id: u16,
    pub name: &'static str,
    pub duration: Duration,
    pub result: &'static [u8],
}

pub(crate) const ROUTINES: &[RoutineDef] = &[
    RoutineDef {
        id: 0x0201,
        name: "fuel pump prime",
        duration: Duration::ZERO,
        result: &[0x00],
    },
    RoutineDef {
        id: 0x0203,
        name: "evap system leak check",
        duration: Duration::from_millis(1500),
        result: &[0x00, 0x42],
    },
    RoutineDef {
        id: 0xFF00,
        name: "ecu self test",
        duration: Duration::from_millis(500),
        result: &[0x00],
    },
];

pub(crate) fn routine_def(id: u16) -> Option<&'static RoutineDef> {
    ROUTINES.iter().find(|r| r.id == id)
}

pub struct UdsSession {
    pub(crate) session: DiagnosticSession,
    pub(crate) security_level: u8,
    pub(crate) pending_seed: Option<PendingSeed>,
    pub(crate) failed_attempts: u8,
    pub(crate) lockout_until: Option<Instant>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) routines: HashMap<u16, RoutineRun>,
    pub(crate) stored_dids: HashMap<u16, Vec<u8>>,
    pub(crate) transfer_active: bool,
    boot_nonce: u32,
    seed_counter: u32,
}

impl UdsSession {
    pub fn new() -> Self {
        Self {
            session: DiagnosticSession::Default,
            security_level: 0,
            pending_seed: None,
            failed_attempts: 0,
            lockout_until: None,
            deadline: None,
            routines: HashMap::new(),
            stored_dids: HashMap::from([
                (0x0100, vec![0x00, 0x01]),
                (0x0101, vec![0x00, 0x02]),
            ]),
            transfer_active: false,
            boot_nonce: rand::thread_rng().gen(),
            seed_counter: 0,
        }
    }

    pub fn session(&self) -> DiagnosticSession {
        self.session
    }

    pub fn security_level(&self) -> u8 {
        self.security_level
    }

    /// Enter a diagnostic session. Any transition re-locks security; the
    /// default session carries no tester-present deadline.
    pub fn enter_session(&mut self, session: DiagnosticSession, now: Instant) {
        if session != self.session {
            self.security_level = 0;
            self.pending_seed = None;
        }
        self.session = session;
        self.deadline = match session {
            DiagnosticSession::Default => {
                self.transfer_active = false;
                None
            }
            _ => Some(now + S3_SERVER_TIMEOUT),
        };
        info!(session = ?session, "diagnostic session entered");
    }

    /// Lazily applied session timeout: revert to default and lock security
    /// once the tester-present window has elapsed.
    pub fn expire_if_idle(&mut self, now: Instant) {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                info!(session = ?self.session, "session timed out, reverting to default");
                self.session = DiagnosticSession::Default;
                self.security_level = 0;
                self.pending_seed = None;
                self.deadline = None;
                self.transfer_active = false;
            }
        }
    }

    /// Refresh the tester-present deadline.
    pub fn touch(&mut self, now: Instant) {
        if self.session != DiagnosticSession::Default {
            self.deadline = Some(now + S3_SERVER_TIMEOUT);
        }
    }

    /// Deterministic-per-boot seed: a monotonic counter folded with the
    /// boot nonce. Reproducible within a run, different across runs.
    pub fn next_seed(&mut self) -> u32 {
        self.seed_counter = self.seed_counter.wrapping_add(1);
        let seed = self.seed_counter.wrapping_mul(0x9E37_79B9) ^ self.boot_nonce;
        if seed == 0 {
            self.boot_nonce | 1
        } else {
            seed
        }
    }

    /// True while the attempt counter has tripped and the delay window has
    /// not yet passed.
    pub fn locked_out(&mut self, now: Instant) -> bool {
        if self.failed_attempts < SECURITY_MAX_ATTEMPTS {
            return false;
        }
        match self.lockout_until {
            Some(until) if now >= until => {
                debug!("security lockout expired");
                self.failed_attempts = 0;
                self.lockout_until = None;
                false
            }
            _ => true,
        }
    }

    pub fn register_failed_key(&mut self, now: Instant) {
        self.failed_attempts += 1;
        if self.failed_attempts >= SECURITY_MAX_ATTEMPTS {
            self.lockout_until = Some(now + SECURITY_LOCKOUT);
            info!(
                attempts = self.failed_attempts,
                "security access locked out"
            );
        }
    }

    pub fn unlock(&mut self, level: u8) {
        info!(level, "security access granted");
        self.security_level = level;
        self.pending_seed = None;
        self.failed_attempts = 0;
        self.lockout_until = None;
    }

    /// ECU reset / shutdown: back to defaults, abort running routines.
    pub fn reset(&mut self) {
        self.session = DiagnosticSession::Default;
        self.security_level = 0;
        self.pending_seed = None;
        self.deadline = None;
        self.transfer_active = false;
        for (_, run) in self.routines.drain() {
            run.handle.abort();
        }
    }
}

impl Default for UdsSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdsSession {
    fn drop(&mut self) {
        for run in self.routines.values() {
            run.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_change_relocks_security() {
        let mut s = UdsSession::new();
        let now = Instant::now();
        s.enter_session(DiagnosticSession::Extended, now);
        s.unlock(1);
        assert_eq!(s.security_level(), 1);
        s.enter_session(DiagnosticSession::Programming, now);
        assert_eq!(s.security_level(), 0);
    }

    #[test]
    fn idle_session_reverts_to_default() {
        let mut s = UdsSession::new();
        let now = Instant::now();
        s.enter_session(DiagnosticSession::Extended, now);
        s.unlock(1);
        s.expire_if_idle(now + Duration::from_secs(4));
        assert_eq!(s.session(), DiagnosticSession::Extended);
        s.expire_if_idle(now + Duration::from_secs(6));
        assert_eq!(s.session(), DiagnosticSession::Default);
        assert_eq!(s.security_level(), 0);
    }

    #[test]
    fn touch_extends_the_deadline() {
        let mut s = UdsSession::new();
        let now = Instant::now();
        s.enter_session(DiagnosticSession::Extended, now);
        s.touch(now + Duration::from_secs(4));
        s.expire_if_idle(now + Duration::from_secs(6));
        assert_eq!(s.session(), DiagnosticSession::Extended);
    }

    #[test]
    fn seeds_vary_within_a_boot() {
        let mut s = UdsSession::new();
        let a = s.next_seed();
        let b = s.next_seed();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn lockout_expires_after_delay() {
        let mut s = UdsSession::new();
        let now = Instant::now();
        for _ in 0..SECURITY_MAX_ATTEMPTS {
            s.register_failed_key(now);
        }
        assert!(s.locked_out(now));
        assert!(s.locked_out(now + SECURITY_LOCKOUT - Duration::from_millis(1)));
        assert!(!s.locked_out(now + SECURITY_LOCKOUT));
    }

    #[test]
    fn level_masks_differ_per_level() {
        assert_eq!(key_mask(1), 0x1234_5678);
        assert_ne!(key_mask(2), key_mask(1));
        assert_ne!(key_mask(3), key_mask(2));
    }
}
