//! Authentication session lifecycle.
//!
//! This module provides `SessionManager`, a state machine over a single
//! session record kept in session storage. A session is valid for a
//! 30-minute inactivity window and may be silently renewed twice before a
//! fresh login is forced. Both limits are configurable via `SessionPolicy`.

pub mod session;

pub use session::{
    SessionCheck, SessionDecision, SessionExtension, SessionInfo, SessionManager, SessionPolicy,
    SessionState, SessionStats, DEFAULT_MAX_EXTENSIONS, DEFAULT_SESSION_WINDOW,
    SESSION_STORAGE_KEY,
};
