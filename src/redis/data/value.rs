//! Redis value type and the shared object wrapper.

use super::SortedSet;
use ahash::{AHashMap, RandomState};
use bytes::Bytes;
use indexmap::IndexSet;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const LRU_CLOCK_MAX: u32 = (1 << 24) - 1;
/// One LRU clock unit, in milliseconds.
pub const LRU_CLOCK_RESOLUTION_MS: i64 = 60_000;

const EMBSTR_SIZE_LIMIT: usize = 44;
const SET_MAX_INTSET_ENTRIES: usize = 512;
const HASH_MAX_ZIPLIST_ENTRIES: usize = 512;
const HASH_MAX_ZIPLIST_VALUE: usize = 64;
const ZSET_MAX_ZIPLIST_ENTRIES: usize = 128;
const ZSET_MAX_ZIPLIST_VALUE: usize = 64;

/// Set members by position, so SPOP draws without walking the set.
pub type MemberSet = IndexSet<Bytes, RandomState>;

pub fn lru_clock(now_ms: i64) -> u32 {
    ((now_ms.max(0) / LRU_CLOCK_RESOLUTION_MS) as u64 & LRU_CLOCK_MAX as u64) as u32
}

/// Milliseconds since `lru` given the current clock, allowing one wrap.
pub fn estimate_idle_ms(lru: u32, clock: u32) -> u64 {
    let units = if clock >= lru {
        clock - lru
    } else {
        (LRU_CLOCK_MAX - lru) + clock
    };
    units as u64 * LRU_CLOCK_RESOLUTION_MS as u64
}

#[derive(Clone, Debug)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(MemberSet),
    Hash(AHashMap<Bytes, Bytes>),
    SortedSet(SortedSet),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
        }
    }

    /// Name of the compact or generic representation a real server would
    /// pick for this value.
    pub fn encoding(&self) -> &'static str {
        match self {
            Value::String(s) => {
                if s.len() <= 20 && parse_i64(s).is_some() {
                    "int"
                } else if s.len() <= EMBSTR_SIZE_LIMIT {
                    "embstr"
                } else {
                    "raw"
                }
            }
            Value::List(_) => "quicklist",
            Value::Set(s) => {
                if s.len() <= SET_MAX_INTSET_ENTRIES && s.iter().all(|m| parse_i64(m).is_some()) {
                    "intset"
                } else {
                    "hashtable"
                }
            }
            Value::Hash(h) => {
                if h.len() <= HASH_MAX_ZIPLIST_ENTRIES
                    && h.iter().all(|(f, v)| {
                        f.len() <= HASH_MAX_ZIPLIST_VALUE && v.len() <= HASH_MAX_ZIPLIST_VALUE
                    })
                {
                    "ziplist"
                } else {
                    "hashtable"
                }
            }
            Value::SortedSet(z) => {
                if z.len() <= ZSET_MAX_ZIPLIST_ENTRIES
                    && z.iter().all(|(m, _)| m.len() <= ZSET_MAX_ZIPLIST_VALUE)
                {
                    "ziplist"
                } else {
                    "skiplist"
                }
            }
        }
    }

    pub fn as_string(&self) -> Option<&Bytes> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&VecDeque<Bytes>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut VecDeque<Bytes>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&MemberSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut MemberSet> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&AHashMap<Bytes, Bytes>> {
        match self {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_hash_mut(&mut self) -> Option<&mut AHashMap<Bytes, Bytes>> {
        match self {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_sorted_set(&self) -> Option<&SortedSet> {
        match self {
            Value::SortedSet(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_sorted_set_mut(&mut self) -> Option<&mut SortedSet> {
        match self {
            Value::SortedSet(z) => Some(z),
            _ => None,
        }
    }

    /// Aggregates that became empty must not stay in the keyspace.
    pub fn is_empty_aggregate(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
        }
    }
}

/// A stored value and its last-access stamp.
#[derive(Clone, Debug)]
pub struct RedisObject {
    value: Value,
    lru: Cell<u32>,
}

/// Values are shared; the last holder frees them. Writers go through
/// `Rc::make_mut`, so a value still held elsewhere is copied, not mutated.
pub type ObjectRef = Rc<RedisObject>;

impl RedisObject {
    pub fn new(value: Value, lru: u32) -> Self {
        RedisObject {
            value,
            lru: Cell::new(lru),
        }
    }

    pub fn string(data: Bytes, lru: u32) -> Self {
        Self::new(Value::String(data), lru)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn lru(&self) -> u32 {
        self.lru.get()
    }

    pub fn touch(&self, clock: u32) {
        self.lru.set(clock);
    }
}

pub(crate) fn parse_i64(data: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(data).ok()?;
    // Reject forms that would not round-trip, like "+1" or "01".
    let n: i64 = s.parse().ok()?;
    if n.to_string() == s {
        Some(n)
    } else {
        None
    }
}
