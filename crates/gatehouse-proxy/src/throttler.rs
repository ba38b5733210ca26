//! Local login throttling keyed by (client IP, tenant).
//!
//! Repeated authentication failures from the same key back off
//! exponentially. The token returned by `login_check` carries causality:
//! reports that race with a newer check are ignored.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{ErrorCode, ProxyError};

/// Outcome of an authentication attempt, reported back to the throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Ok,
    InvalidCredentials,
}

/// Key identifying a connection for throttling purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionTags {
    pub ip: String,
    pub tenant: String,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

const THROTTLED_HINT: &str = "Connection throttling is triggered by repeated authentication failure. Make
sure the username and password are correct.
";

pub fn throttled_error() -> ProxyError {
    ProxyError::new(
        ErrorCode::ProxyRefusedConnection,
        "connection attempt throttled",
    )
    .with_hint(THROTTLED_HINT)
}

#[derive(Debug)]
struct ThrottleEntry {
    next_backoff: Duration,
    next_allowed: Instant,
    updated_at: Instant,
}

/// In-process throttle service. A zero base delay disables it entirely:
/// every check passes and reports are no-ops.
pub struct Throttler {
    base_delay: Duration,
    entries: Mutex<HashMap<ConnectionTags, ThrottleEntry>>,
}

impl Throttler {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check before dialing a backend. Returns the throttle
    /// token to hand back via `report_attempt`.
    pub fn login_check(&self, tags: &ConnectionTags) -> Result<Instant, ProxyError> {
        self.login_check_at(tags, Instant::now())
    }

    fn login_check_at(&self, tags: &ConnectionTags, now: Instant) -> Result<Instant, ProxyError> {
        if self.base_delay.is_zero() {
            return Ok(now);
        }
        let entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(tags) {
            if now < entry.next_allowed {
                return Err(throttled_error());
            }
        }
        Ok(now)
    }

    /// Report the outcome of an authentication attempt. Success clears the
    /// key's backoff; failure escalates it. An error is returned when a
    /// concurrent failure escalated the backoff after this attempt's
    /// check, in which case the session must be refused even though its
    /// own authentication succeeded.
    pub fn report_attempt(
        &self,
        tags: &ConnectionTags,
        token: Instant,
        status: AttemptStatus,
    ) -> Result<(), ProxyError> {
        self.report_attempt_at(tags, token, status, Instant::now())
    }

    fn report_attempt_at(
        &self,
        tags: &ConnectionTags,
        token: Instant,
        status: AttemptStatus,
        now: Instant,
    ) -> Result<(), ProxyError> {
        if self.base_delay.is_zero() {
            return Ok(());
        }
        let mut entries = self.entries.lock().unwrap();
        match status {
            AttemptStatus::Ok => {
                if let Some(entry) = entries.get(tags) {
                    if token < entry.updated_at && now < entry.next_allowed {
                        return Err(throttled_error());
                    }
                }
                entries.remove(tags);
                Ok(())
            }
            AttemptStatus::InvalidCredentials => {
                match entries.entry(tags.clone()) {
                    Entry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        // Stale report: a newer attempt already updated
                        // this key.
                        if token < entry.updated_at {
                            return Ok(());
                        }
                        entry.next_allowed = now + entry.next_backoff;
                        entry.next_backoff = (entry.next_backoff * 2).min(MAX_BACKOFF);
                        entry.updated_at = now;
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(ThrottleEntry {
                            next_allowed: now + self.base_delay,
                            next_backoff: (self.base_delay * 2).min(MAX_BACKOFF),
                            updated_at: now,
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> ConnectionTags {
        ConnectionTags {
            ip: "10.0.0.7".into(),
            tenant: "3".into(),
        }
    }

    #[test]
    fn test_zero_base_delay_never_refuses() {
        let throttler = Throttler::new(Duration::ZERO);
        let now = Instant::now();
        for i in 0..10 {
            let token = throttler.login_check_at(&tags(), now).unwrap();
            throttler
                .report_attempt_at(&tags(), token, AttemptStatus::InvalidCredentials, now)
                .unwrap();
            assert!(
                throttler.login_check_at(&tags(), now).is_ok(),
                "refused after {} failures",
                i + 1
            );
        }
    }

    #[test]
    fn test_backoff_doubles_per_failure() {
        let base = Duration::from_millis(100);
        let throttler = Throttler::new(base);
        let t0 = Instant::now();

        // First failure: blocked for base, admitted after.
        let token = throttler.login_check_at(&tags(), t0).unwrap();
        throttler
            .report_attempt_at(&tags(), token, AttemptStatus::InvalidCredentials, t0)
            .unwrap();
        assert!(throttler
            .login_check_at(&tags(), t0 + Duration::from_millis(50))
            .is_err());
        let t1 = t0 + Duration::from_millis(150);
        let token = throttler.login_check_at(&tags(), t1).unwrap();

        // Second failure: blocked for 2 * base from t1.
        throttler
            .report_attempt_at(&tags(), token, AttemptStatus::InvalidCredentials, t1)
            .unwrap();
        assert!(throttler
            .login_check_at(&tags(), t1 + Duration::from_millis(150))
            .is_err());
        assert!(throttler
            .login_check_at(&tags(), t1 + Duration::from_millis(250))
            .is_ok());
    }

    #[test]
    fn test_success_clears_backoff() {
        let throttler = Throttler::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let token = throttler.login_check_at(&tags(), t0).unwrap();
        throttler
            .report_attempt_at(&tags(), token, AttemptStatus::InvalidCredentials, t0)
            .unwrap();

        let t1 = t0 + Duration::from_millis(200);
        let token = throttler.login_check_at(&tags(), t1).unwrap();
        throttler
            .report_attempt_at(&tags(), token, AttemptStatus::Ok, t1)
            .unwrap();
        assert!(throttler
            .login_check_at(&tags(), t1 + Duration::from_millis(1))
            .is_ok());
    }

    #[test]
    fn test_stale_failure_report_ignored() {
        let throttler = Throttler::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let stale_token = throttler.login_check_at(&tags(), t0).unwrap();

        // A newer attempt fails first.
        let t1 = t0 + Duration::from_millis(10);
        let fresh_token = throttler.login_check_at(&tags(), t1).unwrap();
        throttler
            .report_attempt_at(&tags(), fresh_token, AttemptStatus::InvalidCredentials, t1)
            .unwrap();

        // The stale failure must not escalate the backoff further.
        let t2 = t1 + Duration::from_millis(5);
        throttler
            .report_attempt_at(&tags(), stale_token, AttemptStatus::InvalidCredentials, t2)
            .unwrap();
        // Still admitted once the first (and only) backoff window passes.
        assert!(throttler
            .login_check_at(&tags(), t1 + Duration::from_millis(150))
            .is_ok());
    }

    #[test]
    fn test_stale_success_refused_while_throttled() {
        let throttler = Throttler::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let stale_token = throttler.login_check_at(&tags(), t0).unwrap();

        let t1 = t0 + Duration::from_millis(10);
        let fresh_token = throttler.login_check_at(&tags(), t1).unwrap();
        throttler
            .report_attempt_at(&tags(), fresh_token, AttemptStatus::InvalidCredentials, t1)
            .unwrap();

        // The stale attempt authenticated, but the key is now throttled.
        let err = throttler
            .report_attempt_at(
                &tags(),
                stale_token,
                AttemptStatus::Ok,
                t1 + Duration::from_millis(20),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProxyRefusedConnection);
    }
}
