pub mod poller;
pub mod repo;
pub mod sync;

pub use poller::GitOpsPoller;
pub use repo::{CommitInfo, GitRepository};
pub use sync::{apply_local_reservations, SyncService};
