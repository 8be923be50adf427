//! Queue module: task records, retry policy, and the persisted queue store.

mod record;
mod retry;
mod state;
mod store;

pub use record::TaskRecord;
pub use retry::{Backoff, Decision, RetryMatcher, RetryPolicy};
pub use state::TaskState;
pub use store::{DEFAULT_NAMESPACE, QueueStore};
