//! Conversation funnel: per-participant state machine, lead tracking and
//! the idle-triggered remarketing sweep.

#![warn(clippy::unwrap_used)]

pub mod content;
pub mod leads;
pub mod scheduler;
pub mod session;
pub mod state_machine;

pub use content::FunnelContent;
pub use leads::{InMemoryLeadStore, LeadStore, LeadTracker};
pub use scheduler::{PlannedNudges, RemarketingScheduler, SchedulerHandle, SweepReport};
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use state_machine::FunnelMachine;
