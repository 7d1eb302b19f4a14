//! Repository layer

pub mod mailboxes;
pub mod messages;
pub mod plan_entries;
pub mod spam_events;

pub use mailboxes::MailboxRepository;
pub use messages::MessageRepository;
pub use plan_entries::{NewPlanEntry, PlanEntryRepository};
pub use spam_events::SpamEventRepository;
