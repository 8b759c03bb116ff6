//! Session Manager
//!
//! Owns every research session: starts controllers under a global limit on
//! running sessions, fans their progress out to stream subscribers, handles
//! cancellation, and drops finished sessions after their TTL.

pub mod archive;
pub mod events;
pub mod manager;

pub use events::ResearchEvent;
pub use manager::{SessionManager, SessionSnapshot, SessionStatus, SessionSummary};
