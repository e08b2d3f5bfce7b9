mod client;
mod data;
mod db;
mod error;
pub mod expire_dst;
mod glob;
mod notify;
mod propagate;
mod registry;
mod resp;
mod server;
mod slowlog;
pub mod transaction_dst;
#[cfg(test)]
mod tests;

pub use client::{Client, ClientFlags, ClientId, MultiCmd};
pub use data::{ObjectRef, RedisObject, SortedSet, Value};
pub use db::Database;
pub use error::{CommandError, CommandResult};
pub use expire_dst::{
    run_expire_batch, summarize_expire_batch, ExpireDSTConfig, ExpireDSTHarness, ExpireDSTResult,
};
pub use glob::glob_match;
pub use notify::{
    notify_keyspace_event, InMemoryPublisher, Notification, NotificationPublisher, NotifyFlags,
    NullPublisher,
};
pub use propagate::{InMemorySink, NullSink, PropagateTargets, PropagatedOp, PropagationSink};
pub use registry::{CommandDescriptor, CommandFlags, CommandKind, CommandTable};
pub use resp::RespValue;
pub use server::{
    CallFlags, ExpireCycle, Role, SaveKind, SaveStatus, SaveTask, Server, ServerBuilder, Stats,
};
pub use slowlog::{Slowlog, SlowlogEntry};
pub use transaction_dst::{
    run_transaction_batch, summarize_transaction_batch, TransactionDSTConfig,
    TransactionDSTHarness, TransactionDSTResult,
};
