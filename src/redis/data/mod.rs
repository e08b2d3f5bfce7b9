//! Value objects stored in the keyspace.
//!
//! - `Value`: tagged union of the five data types
//! - `RedisObject`: a value plus its LRU stamp, shared through `Rc`
//! - `SortedSet`: member -> score map with a score-ordered index

mod sorted_set;
mod value;

pub use sorted_set::SortedSet;
pub(crate) use value::parse_i64;
pub use value::{
    estimate_idle_ms, lru_clock, MemberSet, ObjectRef, RedisObject, Value, LRU_CLOCK_MAX, LRU_CLOCK_RESOLUTION_MS,
};
