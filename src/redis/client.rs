//! Per-connection state the engine keeps for a client.

use super::registry::CommandDescriptor;
use bytes::Bytes;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientFlags: u16 {
        /// Inside MULTI.
        const MULTI = 1 << 0;
        /// A watched key was modified.
        const DIRTY_CAS = 1 << 1;
        /// A command failed to queue.
        const DIRTY_EXEC = 1 << 2;
        const CLOSE_AFTER_REPLY = 1 << 3;
        /// The upstream replication link.
        const MASTER = 1 << 4;
        const FORCE_AOF = 1 << 5;
        const FORCE_REPL = 1 << 6;
        const PREVENT_AOF_PROP = 1 << 7;
        const PREVENT_REPL_PROP = 1 << 8;
        const PREVENT_PROP = Self::PREVENT_AOF_PROP.bits() | Self::PREVENT_REPL_PROP.bits();
        /// Flags a command sets for the duration of its own `call`.
        const PROPAGATION =
            Self::FORCE_AOF.bits() | Self::FORCE_REPL.bits() | Self::PREVENT_PROP.bits();
    }
}

/// A command queued between MULTI and EXEC.
#[derive(Debug, Clone)]
pub struct MultiCmd {
    pub cmd: Rc<CommandDescriptor>,
    pub argv: Vec<Bytes>,
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    /// Selected database index.
    pub db: usize,
    pub flags: ClientFlags,
    pub authenticated: bool,
    /// Command currently being executed, or the last one executed.
    pub cmd: Option<Rc<CommandDescriptor>>,
    pub mstate: Vec<MultiCmd>,
    /// Forward half of the watch index: (db, key) pairs this client watches.
    pub watched_keys: Vec<(usize, Bytes)>,
    pub created_ms: i64,
}

impl Client {
    pub fn new(id: ClientId, authenticated: bool, now_ms: i64) -> Self {
        Client {
            id,
            db: 0,
            flags: ClientFlags::empty(),
            authenticated,
            cmd: None,
            mstate: Vec::new(),
            watched_keys: Vec::new(),
            created_ms: now_ms,
        }
    }

    pub fn in_multi(&self) -> bool {
        self.flags.contains(ClientFlags::MULTI)
    }

    pub fn is_master(&self) -> bool {
        self.flags.contains(ClientFlags::MASTER)
    }

    pub fn close_after_reply(&self) -> bool {
        self.flags.contains(ClientFlags::CLOSE_AFTER_REPLY)
    }

    pub fn is_watching(&self, db: usize, key: &[u8]) -> bool {
        self.watched_keys
            .iter()
            .any(|(d, k)| *d == db && k.as_ref() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_operations() {
        let mut flags = ClientFlags::empty();
        flags.insert(ClientFlags::MULTI);
        flags.insert(ClientFlags::FORCE_AOF);
        assert!(flags.contains(ClientFlags::MULTI));
        assert!(flags.intersects(ClientFlags::PROPAGATION));
        assert_eq!(
            flags.intersection(ClientFlags::PROPAGATION),
            ClientFlags::FORCE_AOF
        );
        flags.remove(ClientFlags::PROPAGATION);
        assert!(!flags.intersects(ClientFlags::PROPAGATION));
        assert!(flags.contains(ClientFlags::MULTI));
    }

    #[test]
    fn test_prevent_prop_is_both_channels() {
        assert!(ClientFlags::PREVENT_PROP.contains(ClientFlags::PREVENT_AOF_PROP));
        assert!(ClientFlags::PREVENT_PROP.contains(ClientFlags::PREVENT_REPL_PROP));
    }

    #[test]
    fn test_propagation_mask_covers_force_and_prevent() {
        assert_eq!(
            ClientFlags::PROPAGATION,
            ClientFlags::FORCE_AOF
                | ClientFlags::FORCE_REPL
                | ClientFlags::PREVENT_AOF_PROP
                | ClientFlags::PREVENT_REPL_PROP
        );
        assert!(!ClientFlags::PROPAGATION.intersects(ClientFlags::MULTI | ClientFlags::MASTER));
        assert_eq!(ClientFlags::default(), ClientFlags::empty());
    }
}
