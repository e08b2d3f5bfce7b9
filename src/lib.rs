pub mod bio;
pub mod clock;
pub mod config;
pub mod observability;
pub mod redis;
pub mod simulator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ServerConfig};
pub use redis::{ClientId, CommandError, RespValue, Server, Value};
