//! Board client: a scoped query cache, optimistic transactions over it, and
//! the remote, recovery and live-update plumbing around them.

pub mod cache;
pub mod client;
pub mod live;
pub mod notice;
pub mod recovery;
pub mod remote;
pub mod transaction;

pub use cache::{QueryCache, ScopeKey};
pub use client::{BoardClient, MutationError};
pub use notice::{Notice, NoticeLevel, Notifier};
pub use recovery::{PendingMutation, RecoveryService, RetryPolicy};
pub use remote::{HttpRemote, RemoteError, TaskRemote};
pub use transaction::{Phase, Transaction};
