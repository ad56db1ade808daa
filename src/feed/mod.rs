pub mod dedup;
pub mod event;
pub mod log;

pub use dedup::{DedupLock, NoDedup, StoreDedupLock};
pub use event::{ChangeEvent, ChangeOp, Checkpoint, EventId, FeedGap, FeedItem};
pub use log::{ChangeFeed, ChangeSubscription, FeedStats};
