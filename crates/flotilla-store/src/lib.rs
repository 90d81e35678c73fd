//! SQLite-backed persistence for flotilla: event streams, cursors, leases,
//! checkpoints and agent records.

pub mod agents;
pub mod checkpoints;
pub mod cursors;
pub mod database;
pub mod error;
pub mod events;
pub mod locks;
pub mod mailboxes;
pub mod retry;
pub mod row_helpers;
pub mod schema;

pub use agents::AgentRepo;
pub use checkpoints::{
    CheckpointBackend, CheckpointManager, CheckpointWrite, ClaimOutcome, FileCheckpointBackend, PrunePolicy,
    SqliteCheckpointBackend,
};
pub use cursors::{Cursor, CursorRepo};
pub use database::{Database, StorageTier};
pub use error::StoreError;
pub use events::EventStore;
pub use locks::LockRepo;
pub use mailboxes::{Mailbox, MailboxRepo};
pub use retry::RetryPolicy;
