pub mod error;
pub mod types;

pub use error::{Result, TallyError};
pub use types::{
    AggregateKey, COMMENTS, CounterName, CounterRegistry, CounterSpec, DetailId, DetailRecord,
    EntityId, LIKES, NewDetail, OwnerRole, POSTS,
};
