//! Command registry.
//!
//! The static command table is decoded once at startup into descriptors held
//! in two case-insensitive maps: the live table, which `rename_commands` may
//! rewrite, and the original-name table, which never changes and is used to
//! resolve commands the engine synthesizes itself (DEL for expired keys,
//! MULTI/EXEC markers, propagation rewrites).
//!
//! # Invariants
//!
//! - Every flag character in the static table decodes; an unknown one panics
//!   while the table is being populated
//! - Both maps hold the same descriptors (shared `Rc`), so statistics are
//!   visible under the old and the new name

use super::resp::RespValue;
use ahash::AHashMap;
use bytes::Bytes;
use std::cell::Cell;
use std::rc::Rc;

bitflags::bitflags! {
    /// Command flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u16 {
        const WRITE = 1 << 0;
        const READONLY = 1 << 1;
        const DENYOOM = 1 << 2;
        const ADMIN = 1 << 3;
        const PUBSUB = 1 << 4;
        const NOSCRIPT = 1 << 5;
        const RANDOM = 1 << 6;
        const SORT_FOR_SCRIPT = 1 << 7;
        const LOADING = 1 << 8;
        const STALE = 1 << 9;
        const SKIP_MONITOR = 1 << 10;
        const ASKING = 1 << 11;
        const FAST = 1 << 12;
    }
}

impl CommandFlags {
    /// Decode a flag string such as `"wmF"`. Returns the first unknown
    /// character on failure.
    pub fn from_sflags(sflags: &str) -> Result<CommandFlags, char> {
        let mut flags = CommandFlags::empty();
        for c in sflags.chars() {
            let (_, flag, _) = FLAG_TABLE
                .iter()
                .find(|(code, _, _)| *code == c)
                .ok_or(c)?;
            flags.insert(*flag);
        }
        Ok(flags)
    }

    /// Flag names in table order, as reported by COMMAND INFO.
    pub fn names(self) -> Vec<&'static str> {
        FLAG_TABLE
            .iter()
            .filter(|(_, flag, _)| self.contains(*flag))
            .map(|(_, _, name)| *name)
            .collect()
    }

    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
    pub fn is_readonly(self) -> bool {
        self.contains(Self::READONLY)
    }
    pub fn is_denyoom(self) -> bool {
        self.contains(Self::DENYOOM)
    }
    pub fn is_admin(self) -> bool {
        self.contains(Self::ADMIN)
    }
    pub fn is_pubsub(self) -> bool {
        self.contains(Self::PUBSUB)
    }
    pub fn is_noscript(self) -> bool {
        self.contains(Self::NOSCRIPT)
    }
    pub fn is_random(self) -> bool {
        self.contains(Self::RANDOM)
    }
    pub fn is_sort_for_script(self) -> bool {
        self.contains(Self::SORT_FOR_SCRIPT)
    }
    pub fn allowed_while_loading(self) -> bool {
        self.contains(Self::LOADING)
    }
    pub fn allowed_while_stale(self) -> bool {
        self.contains(Self::STALE)
    }
    pub fn skips_monitor(self) -> bool {
        self.contains(Self::SKIP_MONITOR)
    }
    pub fn is_asking(self) -> bool {
        self.contains(Self::ASKING)
    }
    pub fn is_fast(self) -> bool {
        self.contains(Self::FAST)
    }
}

const FLAG_TABLE: &[(char, CommandFlags, &str)] = &[
    ('w', CommandFlags::WRITE, "write"),
    ('r', CommandFlags::READONLY, "readonly"),
    ('m', CommandFlags::DENYOOM, "denyoom"),
    ('a', CommandFlags::ADMIN, "admin"),
    ('p', CommandFlags::PUBSUB, "pubsub"),
    ('s', CommandFlags::NOSCRIPT, "noscript"),
    ('R', CommandFlags::RANDOM, "random"),
    ('S', CommandFlags::SORT_FOR_SCRIPT, "sort_for_script"),
    ('l', CommandFlags::LOADING, "loading"),
    ('t', CommandFlags::STALE, "stale"),
    ('M', CommandFlags::SKIP_MONITOR, "skip_monitor"),
    ('k', CommandFlags::ASKING, "asking"),
    ('F', CommandFlags::FAST, "fast"),
];

/// Custom key extractor: argument vector in, key positions out.
pub type GetKeysFn = fn(&[Bytes]) -> Vec<usize>;

#[derive(Clone, Copy)]
pub enum KeySpec {
    /// `first == 0` means the command takes no keys. A negative `last` is
    /// relative to the argument count.
    Range { first: usize, last: i32, step: usize },
    Custom(GetKeysFn),
}

impl std::fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySpec::Range { first, last, step } => {
                write!(f, "Range({}, {}, {})", first, last, step)
            }
            KeySpec::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    // strings
    Get,
    Set,
    SetNx,
    SetEx,
    PSetEx,
    GetSet,
    Append,
    Strlen,
    Incr,
    Decr,
    IncrBy,
    DecrBy,
    MGet,
    MSet,
    // keys
    Del,
    Exists,
    Type,
    Keys,
    DbSize,
    Select,
    Expire,
    PExpire,
    ExpireAt,
    PExpireAt,
    Ttl,
    PTtl,
    Persist,
    Rename,
    RandomKey,
    Touch,
    FlushDb,
    FlushAll,
    Object,
    Sort,
    // lists
    LPush,
    RPush,
    LPop,
    RPop,
    LLen,
    LRange,
    // sets
    SAdd,
    SRem,
    SIsMember,
    SCard,
    SMembers,
    SPop,
    // hashes
    HSet,
    HGet,
    HDel,
    HLen,
    HGetAll,
    // sorted sets
    ZAdd,
    ZRem,
    ZScore,
    ZCard,
    ZRange,
    // transactions
    Multi,
    Exec,
    Discard,
    Watch,
    Unwatch,
    // server
    Ping,
    Echo,
    Auth,
    Info,
    Time,
    Command,
    Slowlog,
}

struct CommandEntry {
    name: &'static str,
    kind: CommandKind,
    arity: i32,
    sflags: &'static str,
    keys: KeySpec,
}

const fn keys(first: usize, last: i32, step: usize) -> KeySpec {
    KeySpec::Range { first, last, step }
}

const NO_KEYS: KeySpec = keys(0, 0, 0);

use CommandKind as K;

#[rustfmt::skip]
static COMMAND_TABLE: &[CommandEntry] = &[
    CommandEntry { name: "get", kind: K::Get, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "set", kind: K::Set, arity: -3, sflags: "wm", keys: keys(1, 1, 1) },
    CommandEntry { name: "setnx", kind: K::SetNx, arity: 3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "setex", kind: K::SetEx, arity: 4, sflags: "wm", keys: keys(1, 1, 1) },
    CommandEntry { name: "psetex", kind: K::PSetEx, arity: 4, sflags: "wm", keys: keys(1, 1, 1) },
    CommandEntry { name: "getset", kind: K::GetSet, arity: 3, sflags: "wm", keys: keys(1, 1, 1) },
    CommandEntry { name: "append", kind: K::Append, arity: 3, sflags: "wm", keys: keys(1, 1, 1) },
    CommandEntry { name: "strlen", kind: K::Strlen, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "incr", kind: K::Incr, arity: 2, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "decr", kind: K::Decr, arity: 2, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "incrby", kind: K::IncrBy, arity: 3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "decrby", kind: K::DecrBy, arity: 3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "mget", kind: K::MGet, arity: -2, sflags: "r", keys: keys(1, -1, 1) },
    CommandEntry { name: "mset", kind: K::MSet, arity: -3, sflags: "wm", keys: keys(1, -1, 2) },
    CommandEntry { name: "del", kind: K::Del, arity: -2, sflags: "w", keys: keys(1, -1, 1) },
    CommandEntry { name: "exists", kind: K::Exists, arity: -2, sflags: "rF", keys: keys(1, -1, 1) },
    CommandEntry { name: "type", kind: K::Type, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "keys", kind: K::Keys, arity: 2, sflags: "rS", keys: NO_KEYS },
    CommandEntry { name: "dbsize", kind: K::DbSize, arity: 1, sflags: "rF", keys: NO_KEYS },
    CommandEntry { name: "select", kind: K::Select, arity: 2, sflags: "lF", keys: NO_KEYS },
    CommandEntry { name: "expire", kind: K::Expire, arity: 3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "pexpire", kind: K::PExpire, arity: 3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "expireat", kind: K::ExpireAt, arity: 3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "pexpireat", kind: K::PExpireAt, arity: 3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "ttl", kind: K::Ttl, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "pttl", kind: K::PTtl, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "persist", kind: K::Persist, arity: 2, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "rename", kind: K::Rename, arity: 3, sflags: "w", keys: keys(1, 2, 1) },
    CommandEntry { name: "randomkey", kind: K::RandomKey, arity: 1, sflags: "rR", keys: NO_KEYS },
    CommandEntry { name: "touch", kind: K::Touch, arity: -2, sflags: "rF", keys: keys(1, -1, 1) },
    CommandEntry { name: "flushdb", kind: K::FlushDb, arity: 1, sflags: "w", keys: NO_KEYS },
    CommandEntry { name: "flushall", kind: K::FlushAll, arity: 1, sflags: "w", keys: NO_KEYS },
    CommandEntry { name: "object", kind: K::Object, arity: 3, sflags: "r", keys: keys(2, 2, 2) },
    CommandEntry { name: "sort", kind: K::Sort, arity: -2, sflags: "wm", keys: KeySpec::Custom(sort_get_keys) },
    CommandEntry { name: "lpush", kind: K::LPush, arity: -3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "rpush", kind: K::RPush, arity: -3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "lpop", kind: K::LPop, arity: 2, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "rpop", kind: K::RPop, arity: 2, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "llen", kind: K::LLen, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "lrange", kind: K::LRange, arity: 4, sflags: "r", keys: keys(1, 1, 1) },
    CommandEntry { name: "sadd", kind: K::SAdd, arity: -3, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "srem", kind: K::SRem, arity: -3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "sismember", kind: K::SIsMember, arity: 3, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "scard", kind: K::SCard, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "smembers", kind: K::SMembers, arity: 2, sflags: "rS", keys: keys(1, 1, 1) },
    CommandEntry { name: "spop", kind: K::SPop, arity: -2, sflags: "wRF", keys: keys(1, 1, 1) },
    CommandEntry { name: "hset", kind: K::HSet, arity: 4, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "hget", kind: K::HGet, arity: 3, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "hdel", kind: K::HDel, arity: -3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "hlen", kind: K::HLen, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "hgetall", kind: K::HGetAll, arity: 2, sflags: "r", keys: keys(1, 1, 1) },
    CommandEntry { name: "zadd", kind: K::ZAdd, arity: -4, sflags: "wmF", keys: keys(1, 1, 1) },
    CommandEntry { name: "zrem", kind: K::ZRem, arity: -3, sflags: "wF", keys: keys(1, 1, 1) },
    CommandEntry { name: "zscore", kind: K::ZScore, arity: 3, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "zcard", kind: K::ZCard, arity: 2, sflags: "rF", keys: keys(1, 1, 1) },
    CommandEntry { name: "zrange", kind: K::ZRange, arity: -4, sflags: "r", keys: keys(1, 1, 1) },
    CommandEntry { name: "multi", kind: K::Multi, arity: 1, sflags: "sF", keys: NO_KEYS },
    CommandEntry { name: "exec", kind: K::Exec, arity: 1, sflags: "sM", keys: NO_KEYS },
    CommandEntry { name: "discard", kind: K::Discard, arity: 1, sflags: "sF", keys: NO_KEYS },
    CommandEntry { name: "watch", kind: K::Watch, arity: -2, sflags: "sF", keys: keys(1, -1, 1) },
    CommandEntry { name: "unwatch", kind: K::Unwatch, arity: 1, sflags: "sF", keys: NO_KEYS },
    CommandEntry { name: "ping", kind: K::Ping, arity: -1, sflags: "tF", keys: NO_KEYS },
    CommandEntry { name: "echo", kind: K::Echo, arity: 2, sflags: "F", keys: NO_KEYS },
    CommandEntry { name: "auth", kind: K::Auth, arity: 2, sflags: "sltF", keys: NO_KEYS },
    CommandEntry { name: "info", kind: K::Info, arity: -1, sflags: "lt", keys: NO_KEYS },
    CommandEntry { name: "time", kind: K::Time, arity: 1, sflags: "RF", keys: NO_KEYS },
    CommandEntry { name: "command", kind: K::Command, arity: 0, sflags: "lt", keys: NO_KEYS },
    CommandEntry { name: "slowlog", kind: K::Slowlog, arity: -2, sflags: "a", keys: NO_KEYS },
];

/// SORT reads its source key and, with STORE, writes a destination key.
/// LIMIT, GET and BY arguments are skipped so a pattern named "store" is not
/// mistaken for the option.
pub fn sort_get_keys(argv: &[Bytes]) -> Vec<usize> {
    const SKIPLIST: &[(&[u8], usize)] = &[(b"limit", 2), (b"get", 1), (b"by", 1)];
    let mut keys = vec![1];
    let mut store = None;
    let mut i = 2;
    while i < argv.len() {
        let arg = &argv[i];
        if let Some((_, skip)) = SKIPLIST.iter().find(|(name, _)| arg.eq_ignore_ascii_case(name)) {
            i += skip;
        } else if arg.eq_ignore_ascii_case(b"store") && i + 1 < argv.len() {
            // Only the last STORE counts, matching how the option is parsed.
            store = Some(i + 1);
        }
        i += 1;
    }
    keys.extend(store);
    keys
}

pub struct CommandDescriptor {
    name: &'static str,
    pub kind: CommandKind,
    pub arity: i32,
    pub sflags: &'static str,
    pub flags: CommandFlags,
    pub keys: KeySpec,
    microseconds: Cell<u64>,
    calls: Cell<u64>,
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("sflags", &self.sflags)
            .field("keys", &self.keys)
            .finish()
    }
}

impl CommandDescriptor {
    /// The name from the static table, independent of renames.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn arity_ok(&self, argc: usize) -> bool {
        let argc = argc as i64;
        let arity = self.arity as i64;
        !((arity > 0 && arity != argc) || argc < -arity)
    }

    /// Positions of key arguments in `argv`.
    pub fn key_positions(&self, argv: &[Bytes]) -> Vec<usize> {
        match self.keys {
            KeySpec::Custom(f) => f(argv),
            KeySpec::Range { first: 0, .. } => Vec::new(),
            KeySpec::Range { first, last, step } => {
                let argc = argv.len() as i64;
                let last = if last < 0 { argc + last as i64 } else { last as i64 };
                let mut positions = Vec::new();
                let mut j = first as i64;
                while j <= last {
                    assert!(j < argc, "key position {} out of bounds for '{}'", j, self.name);
                    positions.push(j as usize);
                    j += step.max(1) as i64;
                }
                positions
            }
        }
    }

    pub fn record_call(&self, duration_us: u64) {
        self.microseconds.set(self.microseconds.get() + duration_us);
        self.calls.set(self.calls.get() + 1);
    }

    pub fn calls(&self) -> u64 {
        self.calls.get()
    }

    pub fn microseconds(&self) -> u64 {
        self.microseconds.get()
    }

    pub fn reset_stats(&self) {
        self.calls.set(0);
        self.microseconds.set(0);
    }

    /// COMMAND INFO entry: name, arity, flags, first key, last key, step.
    pub fn info_reply(&self) -> RespValue {
        let mut flags: Vec<RespValue> = self.flags.names().into_iter().map(RespValue::simple).collect();
        let (first, last, step) = match self.keys {
            KeySpec::Range { first, last, step } => (first as i64, last as i64, step as i64),
            KeySpec::Custom(_) => {
                flags.push(RespValue::simple("movablekeys"));
                (0, 0, 0)
            }
        };
        RespValue::array(vec![
            RespValue::bulk_str(self.name),
            RespValue::Integer(self.arity as i64),
            RespValue::array(flags),
            RespValue::Integer(first),
            RespValue::Integer(last),
            RespValue::Integer(step),
        ])
    }
}

pub struct CommandTable {
    commands: AHashMap<String, Rc<CommandDescriptor>>,
    orig_commands: AHashMap<String, Rc<CommandDescriptor>>,
}

fn normalize(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

impl CommandTable {
    /// Build both tables from the static command list.
    pub fn populate() -> Self {
        let mut commands = AHashMap::with_capacity(COMMAND_TABLE.len());
        let mut orig_commands = AHashMap::with_capacity(COMMAND_TABLE.len());
        for entry in COMMAND_TABLE {
            let flags = match CommandFlags::from_sflags(entry.sflags) {
                Ok(flags) => flags,
                Err(c) => panic!("Unsupported command flag '{}' in command '{}'", c, entry.name),
            };
            let descriptor = Rc::new(CommandDescriptor {
                name: entry.name,
                kind: entry.kind,
                arity: entry.arity,
                sflags: entry.sflags,
                flags,
                keys: entry.keys,
                microseconds: Cell::new(0),
                calls: Cell::new(0),
            });
            let live = commands.insert(entry.name.to_string(), descriptor.clone());
            let orig = orig_commands.insert(entry.name.to_string(), descriptor);
            assert!(live.is_none() && orig.is_none(), "duplicate command '{}'", entry.name);
        }
        CommandTable {
            commands,
            orig_commands,
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<Rc<CommandDescriptor>> {
        self.commands.get(&normalize(name)).cloned()
    }

    /// Live table first, then the original names.
    pub fn lookup_or_original(&self, name: &[u8]) -> Option<Rc<CommandDescriptor>> {
        let name = normalize(name);
        self.commands
            .get(&name)
            .or_else(|| self.orig_commands.get(&name))
            .cloned()
    }

    /// Descriptor by its static name. Panics on a name missing from the
    /// static table, which would be a bug in the caller.
    pub fn original(&self, name: &str) -> Rc<CommandDescriptor> {
        match self.orig_commands.get(name) {
            Some(cmd) => cmd.clone(),
            None => panic!("command '{}' missing from the command table", name),
        }
    }

    /// Rename a live command. An empty `new_name` removes it.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), String> {
        let old = normalize(old_name.as_bytes());
        let new = normalize(new_name.as_bytes());
        let cmd = self
            .commands
            .remove(&old)
            .ok_or_else(|| format!("no such command '{}'", old_name))?;
        if new.is_empty() {
            return Ok(());
        }
        if self.commands.contains_key(&new) {
            self.commands.insert(old, cmd);
            return Err(format!("target command name '{}' already exists", new_name));
        }
        self.commands.insert(new, cmd);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Live (possibly renamed) name and descriptor pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rc<CommandDescriptor>)> {
        self.commands.iter().map(|(name, cmd)| (name.as_str(), cmd))
    }

    pub fn reset_stats(&self) {
        for cmd in self.orig_commands.values() {
            cmd.reset_stats();
        }
    }
}
