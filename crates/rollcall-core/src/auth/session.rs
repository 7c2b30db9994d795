use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{to_delta, to_std, Clock, SystemClock};
use crate::error::{SessionError, StorageError};
use crate::storage::SessionStorage;

/// Storage key of the session record. Outside the cache prefix, so
/// `TtlStore::clear` leaves it alone.
pub const SESSION_STORAGE_KEY: &str = "rollcall_session";

/// Inactivity window before a session needs renewal (30 minutes).
pub const DEFAULT_SESSION_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Renewals allowed before a fresh login is required.
pub const DEFAULT_MAX_EXTENSIONS: u32 = 2;

/// Renewal policy. Defaults to a 30-minute window and two renewals, so a
/// session lives at most 90 minutes without a fresh login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub window: Duration,
    pub max_extensions: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_SESSION_WINDOW,
            max_extensions: DEFAULT_MAX_EXTENSIONS,
        }
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub start_time: DateTime<Utc>,
    pub last_extension: DateTime<Utc>,
    pub extension_count: u32,
    pub max_extensions: u32,
}

impl SessionInfo {
    pub fn extensions_left(&self) -> u32 {
        self.max_extensions.saturating_sub(self.extension_count)
    }

    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        to_std(now - self.last_extension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session record.
    Absent,
    /// Within the current window.
    Active,
    /// Window elapsed, renewals remain.
    Renewable,
    /// Window elapsed and no renewals remain.
    Expired,
}

/// Read-only classification of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCheck {
    pub state: SessionState,
    pub is_valid: bool,
    pub should_extend: bool,
    pub extensions_left: u32,
}

/// Result of a successful renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExtension {
    pub extension_count: u32,
    pub extensions_left: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub last_extension: DateTime<Utc>,
    pub extension_count: u32,
    pub max_extensions: u32,
    pub extensions_left: u32,
    pub session_age: Duration,
    pub idle: Duration,
    /// Time until the current window closes; zero once it has.
    pub time_until_expiry: Duration,
}

impl SessionStats {
    /// Get minutes remaining in the current window (for display)
    pub fn minutes_until_expiry(&self) -> u64 {
        self.time_until_expiry.as_secs() / 60
    }
}

/// What the authentication layer should do with the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    Valid,
    Renewed { extensions_left: u32 },
    ForceLogout,
}

/// Bounded, renewable session window persisted in session storage.
pub struct SessionManager {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn SessionStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            policy: SessionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Start a fresh session, replacing any existing record.
    pub fn init_session(&self) -> SessionInfo {
        let now = self.clock.now();
        let session = SessionInfo {
            start_time: now,
            last_extension: now,
            extension_count: 0,
            max_extensions: self.policy.max_extensions,
        };
        if let Err(e) = self.save(&session) {
            warn!(error = %e, "Failed to persist new session");
        }
        info!(max_extensions = session.max_extensions, "Session started");
        session
    }

    pub fn check_session(&self) -> SessionCheck {
        match self.load() {
            None => SessionCheck {
                state: SessionState::Absent,
                is_valid: false,
                should_extend: false,
                extensions_left: 0,
            },
            Some(session) => {
                let state = self.classify(&session, self.clock.now());
                SessionCheck {
                    state,
                    is_valid: matches!(state, SessionState::Active | SessionState::Renewable),
                    should_extend: state == SessionState::Renewable,
                    extensions_left: session.extensions_left(),
                }
            }
        }
    }

    /// Renew a session whose window has elapsed. Refused when there is no
    /// session, when the window is still open, or when no renewals remain.
    pub fn extend_session(&self) -> Result<SessionExtension, SessionError> {
        let mut session = self.load().ok_or(SessionError::NoSession)?;

        if session.extension_count >= session.max_extensions {
            return Err(SessionError::LimitReached {
                max: session.max_extensions,
            });
        }

        let now = self.clock.now();
        if self.classify(&session, now) == SessionState::Active {
            return Err(SessionError::NotDue);
        }

        session.last_extension = now;
        session.extension_count += 1;
        self.save(&session)?;

        info!(
            extension_count = session.extension_count,
            extensions_left = session.extensions_left(),
            "Session extended"
        );
        Ok(SessionExtension {
            extension_count: session.extension_count,
            extensions_left: session.extensions_left(),
        })
    }

    pub fn clear_session(&self) {
        if let Err(e) = self.storage.remove_item(SESSION_STORAGE_KEY) {
            warn!(error = %e, "Failed to clear session");
        }
    }

    pub fn get_session_stats(&self) -> Option<SessionStats> {
        let session = self.load()?;
        let now = self.clock.now();
        let idle = session.idle(now);
        Some(SessionStats {
            state: self.classify(&session, now),
            start_time: session.start_time,
            last_extension: session.last_extension,
            extension_count: session.extension_count,
            max_extensions: session.max_extensions,
            extensions_left: session.extensions_left(),
            session_age: to_std(now - session.start_time),
            idle,
            time_until_expiry: self.policy.window.saturating_sub(idle),
        })
    }

    /// Decide between keeping, silently renewing, or ending the session.
    pub fn resolve(&self) -> SessionDecision {
        let check = self.check_session();
        match check.state {
            SessionState::Active => SessionDecision::Valid,
            SessionState::Renewable => match self.extend_session() {
                Ok(extension) => SessionDecision::Renewed {
                    extensions_left: extension.extensions_left,
                },
                Err(e) => {
                    warn!(error = %e, "Session renewal failed, forcing logout");
                    self.clear_session();
                    SessionDecision::ForceLogout
                }
            },
            SessionState::Expired => {
                info!("Session renewals exhausted, forcing logout");
                self.clear_session();
                SessionDecision::ForceLogout
            }
            SessionState::Absent => SessionDecision::ForceLogout,
        }
    }

    fn classify(&self, session: &SessionInfo, now: DateTime<Utc>) -> SessionState {
        if now - session.last_extension <= to_delta(self.policy.window) {
            SessionState::Active
        } else if session.extension_count < session.max_extensions {
            SessionState::Renewable
        } else {
            SessionState::Expired
        }
    }

    fn load(&self) -> Option<SessionInfo> {
        let raw = match self.storage.get_item(SESSION_STORAGE_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read session");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Failed to parse session record");
                None
            }
        }
    }

    fn save(&self, session: &SessionInfo) -> Result<(), StorageError> {
        let encoded =
            serde_json::to_string(session).map_err(|e| StorageError::Encode(e.to_string()))?;
        self.storage.set_item(SESSION_STORAGE_KEY, &encoded)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    const THIRTY_ONE_MINUTES: Duration = Duration::from_secs(31 * 60);

    fn manager() -> (SessionManager, Arc<ManualClock>, Arc<MemoryStorage>) {
        let clock = Arc::new(ManualClock::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = SessionManager::with_clock(storage.clone(), clock.clone());
        (manager, clock, storage)
    }

    #[test]
    fn test_fresh_session_is_valid() {
        let (manager, _, _) = manager();
        let session = manager.init_session();
        assert_eq!(session.extension_count, 0);
        assert_eq!(session.start_time, session.last_extension);

        let check = manager.check_session();
        assert_eq!(check.state, SessionState::Active);
        assert!(check.is_valid);
        assert!(!check.should_extend);
        assert_eq!(check.extensions_left, 2);
    }

    #[test]
    fn test_elapsed_window_is_renewable() {
        let (manager, clock, _) = manager();
        manager.init_session();
        clock.advance(THIRTY_ONE_MINUTES);

        let check = manager.check_session();
        assert_eq!(check.state, SessionState::Renewable);
        assert!(check.should_extend);
        assert_eq!(check.extensions_left, 2);

        let extension = manager.extend_session().unwrap();
        assert_eq!(extension.extension_count, 1);
        assert_eq!(extension.extensions_left, 1);
        assert_eq!(manager.check_session().state, SessionState::Active);
    }

    #[test]
    fn test_third_expiry_forces_logout() {
        let (manager, clock, _) = manager();
        manager.init_session();

        for _ in 0..2 {
            clock.advance(THIRTY_ONE_MINUTES);
            assert!(manager.check_session().should_extend);
            manager.extend_session().unwrap();
        }

        clock.advance(THIRTY_ONE_MINUTES);
        let check = manager.check_session();
        assert_eq!(check.state, SessionState::Expired);
        assert!(!check.is_valid);
        assert!(!check.should_extend);
        assert_eq!(check.extensions_left, 0);
        assert_eq!(
            manager.extend_session(),
            Err(SessionError::LimitReached { max: 2 })
        );
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let (manager, clock, _) = manager();
        manager.init_session();
        clock.advance(DEFAULT_SESSION_WINDOW);
        assert_eq!(manager.check_session().state, SessionState::Active);
        clock.advance(Duration::from_millis(1));
        assert_eq!(manager.check_session().state, SessionState::Renewable);
    }

    #[test]
    fn test_extend_without_session() {
        let (manager, _, _) = manager();
        assert_eq!(manager.extend_session(), Err(SessionError::NoSession));
        assert_eq!(manager.check_session().state, SessionState::Absent);
    }

    #[test]
    fn test_extend_while_active_is_refused() {
        let (manager, _, _) = manager();
        manager.init_session();
        assert_eq!(manager.extend_session(), Err(SessionError::NotDue));
        assert_eq!(manager.check_session().extensions_left, 2);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let (manager, clock, storage) = manager();
        manager.init_session();
        clock.advance(THIRTY_ONE_MINUTES);
        let before = storage.get_item(SESSION_STORAGE_KEY).unwrap();
        manager.check_session();
        manager.get_session_stats();
        assert_eq!(storage.get_item(SESSION_STORAGE_KEY).unwrap(), before);
    }

    #[test]
    fn test_clear_session() {
        let (manager, _, storage) = manager();
        manager.init_session();
        manager.clear_session();
        assert!(storage.is_empty());
        assert!(manager.get_session_stats().is_none());
        assert!(!manager.check_session().is_valid);
    }

    #[test]
    fn test_custom_policy() {
        let (manager, clock, _) = manager();
        let manager = manager.with_policy(SessionPolicy {
            window: Duration::from_secs(600),
            max_extensions: 1,
        });
        manager.init_session();

        clock.advance(Duration::from_secs(601));
        manager.extend_session().unwrap();
        clock.advance(Duration::from_secs(601));
        assert_eq!(manager.check_session().state, SessionState::Expired);
    }

    #[test]
    fn test_session_stats() {
        let (manager, clock, _) = manager();
        manager.init_session();
        clock.advance(Duration::from_secs(10 * 60));

        let stats = manager.get_session_stats().unwrap();
        assert_eq!(stats.state, SessionState::Active);
        assert_eq!(stats.session_age, Duration::from_secs(600));
        assert_eq!(stats.idle, Duration::from_secs(600));
        assert_eq!(stats.minutes_until_expiry(), 20);
        assert_eq!(stats.extensions_left, 2);

        clock.advance(THIRTY_ONE_MINUTES);
        let stats = manager.get_session_stats().unwrap();
        assert_eq!(stats.time_until_expiry, Duration::ZERO);
    }

    #[test]
    fn test_resolve_paths() {
        let (manager, clock, _) = manager();
        assert_eq!(manager.resolve(), SessionDecision::ForceLogout);

        manager.init_session();
        assert_eq!(manager.resolve(), SessionDecision::Valid);

        clock.advance(THIRTY_ONE_MINUTES);
        assert_eq!(
            manager.resolve(),
            SessionDecision::Renewed { extensions_left: 1 }
        );
        clock.advance(THIRTY_ONE_MINUTES);
        assert_eq!(
            manager.resolve(),
            SessionDecision::Renewed { extensions_left: 0 }
        );
        clock.advance(THIRTY_ONE_MINUTES);
        assert_eq!(manager.resolve(), SessionDecision::ForceLogout);
        assert_eq!(manager.check_session().state, SessionState::Absent);
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let (manager, _, storage) = manager();
        storage.set_item(SESSION_STORAGE_KEY, "{broken").unwrap();
        assert_eq!(manager.check_session().state, SessionState::Absent);
    }

    /// Storage that serves an existing record but rejects writes.
    struct FrozenStorage(MemoryStorage);

    impl SessionStorage for FrozenStorage {
        fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.0.get_item(key)
        }

        fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("storage disabled".to_string()))
        }

        fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            self.0.remove_item(key)
        }

        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.0.keys()
        }
    }

    #[test]
    fn test_persist_failure_is_reported() {
        let (manager, clock, storage) = manager();
        manager.init_session();
        let record = storage.get_item(SESSION_STORAGE_KEY).unwrap().unwrap();

        let frozen = MemoryStorage::new();
        frozen.set_item(SESSION_STORAGE_KEY, &record).unwrap();
        let manager = SessionManager::with_clock(Arc::new(FrozenStorage(frozen)), clock.clone());

        clock.advance(THIRTY_ONE_MINUTES);
        assert!(matches!(
            manager.extend_session(),
            Err(SessionError::Persist(StorageError::Unavailable(_)))
        ));
        // Nothing changed, so the session is still waiting for renewal
        assert_eq!(manager.check_session().extensions_left, 2);
    }
}
