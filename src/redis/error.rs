//! Client-visible command errors.
//!
//! `Display` renders the exact text sent to the client, error code included.

use super::resp::RespValue;

pub const WRONGTYPE_ERR: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
pub const BGSAVE_ERR: &str = "MISCONF Redis is configured to save RDB snapshots, but is currently not able to persist on disk. Commands that may modify the data set are disabled. Please check Redis logs for details about the error.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    UnknownCommand(String),
    WrongArity(String),
    WrongType,
    NoAuth,
    Syntax,
    NotInteger,
    NotFloat,
    OutOfRange,
    NoSuchKey,
    InvalidExpire(String),
    InvalidDb,
    Misconf,
    AofWriteFailed(String),
    Loading,
    ExecAbort,
    ReadOnlyReplica,
    Oom,
    /// Free-form message; rendered with the generic `ERR` prefix.
    Other(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::UnknownCommand(name) => write!(f, "ERR unknown command '{}'", name),
            CommandError::WrongArity(name) => {
                write!(f, "ERR wrong number of arguments for '{}' command", name)
            }
            CommandError::WrongType => f.write_str(WRONGTYPE_ERR),
            CommandError::NoAuth => f.write_str("NOAUTH Authentication required."),
            CommandError::Syntax => f.write_str("ERR syntax error"),
            CommandError::NotInteger => {
                f.write_str("ERR value is not an integer or out of range")
            }
            CommandError::NotFloat => f.write_str("ERR value is not a valid float"),
            CommandError::OutOfRange => f.write_str("ERR index out of range"),
            CommandError::NoSuchKey => f.write_str("ERR no such key"),
            CommandError::InvalidExpire(cmd) => {
                write!(f, "ERR invalid expire time in '{}' command", cmd)
            }
            CommandError::InvalidDb => f.write_str("ERR DB index is out of range"),
            CommandError::Misconf => f.write_str(BGSAVE_ERR),
            CommandError::AofWriteFailed(msg) => {
                write!(f, "MISCONF Errors writing to the AOF file: {}", msg)
            }
            CommandError::Loading => f.write_str("LOADING Redis is loading the dataset in memory"),
            CommandError::ExecAbort => {
                f.write_str("EXECABORT Transaction discarded because of previous errors.")
            }
            CommandError::ReadOnlyReplica => {
                f.write_str("READONLY You can't write against a read only slave.")
            }
            CommandError::Oom => {
                f.write_str("OOM command not allowed when used memory > 'maxmemory'.")
            }
            CommandError::Other(msg) => write!(f, "ERR {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<CommandError> for RespValue {
    fn from(e: CommandError) -> Self {
        RespValue::Error(e.to_string())
    }
}

pub type CommandResult = Result<RespValue, CommandError>;
