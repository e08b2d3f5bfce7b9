//! Generic keyspace commands.
//!
//! Handles: DEL, EXISTS, TYPE, KEYS, DBSIZE, SELECT, RENAME, RANDOMKEY,
//! TOUCH, FLUSHDB, FLUSHALL, OBJECT, SORT

use super::{Role, Server};
use crate::redis::client::ClientId;
use crate::redis::data::{estimate_idle_ms, parse_i64, Value};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::glob::glob_match;
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::warn;

/// A replica cannot delete expired keys, so RANDOMKEY gives up looking for
/// a live one after this many draws.
const RANDOMKEY_REPLICA_TRIES: usize = 100;

impl Server {
    pub(super) fn execute_del(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let mut deleted = 0;
        for key in &argv[1..] {
            self.expire_if_needed(db, key);
            if self.db_delete(db, key) {
                self.notify(NotifyFlags::GENERIC, "del", key, db);
                self.dirty += 1;
                deleted += 1;
            }
        }
        Ok(RespValue::Integer(deleted))
    }

    pub(super) fn execute_exists(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let mut count = 0;
        for key in &argv[1..] {
            if self.lookup_read_notouch(db, key).is_some() {
                count += 1;
            }
        }
        Ok(RespValue::Integer(count))
    }

    pub(super) fn execute_type(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let name = self
            .lookup_read_notouch(db, &argv[1])
            .map_or("none", |obj| obj.value().type_name());
        Ok(RespValue::simple(name))
    }

    pub(super) fn execute_keys(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let pattern = &argv[1];
        let all = pattern.as_ref() == b"*";
        let matched: Vec<Bytes> = self.dbs[db]
            .keys()
            .filter(|k| all || glob_match(pattern, k))
            .cloned()
            .collect();
        let mut live = Vec::with_capacity(matched.len());
        for key in matched {
            if !self.expire_if_needed(db, &key) {
                live.push(RespValue::bulk(&key));
            }
        }
        Ok(RespValue::array(live))
    }

    pub(super) fn execute_dbsize(&mut self, c: ClientId) -> CommandResult {
        let db = self.selected_db(c);
        Ok(RespValue::Integer(self.dbs[db].len() as i64))
    }

    pub(super) fn execute_select(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let id = parse_i64(&argv[1]).ok_or_else(|| CommandError::Other("invalid DB index".into()))?;
        if id < 0 || id as usize >= self.dbs.len() {
            return Err(CommandError::InvalidDb);
        }
        self.client_state_mut(c).db = id as usize;
        Ok(RespValue::ok())
    }

    /// RENAME keeps the value object and its expiry; only the name moves.
    pub(super) fn execute_rename(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let src = &argv[1];
        let dst = &argv[2];
        let obj = self.lookup_write(db, src).ok_or(CommandError::NoSuchKey)?;
        if src == dst {
            return Ok(RespValue::ok());
        }
        let expire = self.dbs[db].get_expire(src);
        if self.lookup_write(db, dst).is_some() {
            self.db_delete(db, dst);
        }
        self.dbs[db].add(dst.clone(), obj);
        if let Some(when) = expire {
            self.dbs[db].set_expire(dst, when);
        }
        self.db_delete(db, src);
        self.signal_modified_key(db, dst);
        self.notify(NotifyFlags::GENERIC, "rename_from", src, db);
        self.notify(NotifyFlags::GENERIC, "rename_to", dst, db);
        self.dirty += 1;
        Ok(RespValue::ok())
    }

    pub(super) fn execute_randomkey(&mut self, c: ClientId) -> CommandResult {
        let db = self.selected_db(c);
        let mut tries = 0;
        loop {
            let Some(key) = self.dbs[db].random_key(&mut self.rng) else {
                return Ok(RespValue::nil());
            };
            if self.dbs[db].get_expire(&key).is_none() {
                return Ok(RespValue::bulk(&key));
            }
            tries += 1;
            if self.role == Role::Replica && tries >= RANDOMKEY_REPLICA_TRIES {
                return Ok(RespValue::bulk(&key));
            }
            if !self.expire_if_needed(db, &key) {
                return Ok(RespValue::bulk(&key));
            }
        }
    }

    pub(super) fn execute_touch(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let mut touched = 0;
        for key in &argv[1..] {
            if self.lookup_read(db, key).is_some() {
                touched += 1;
            }
        }
        Ok(RespValue::Integer(touched))
    }

    pub(super) fn execute_flushdb(&mut self, c: ClientId) -> CommandResult {
        let db = self.selected_db(c);
        self.signal_flushed_db(Some(db));
        let removed = self.dbs[db].flush();
        self.dirty += removed as u64;
        Ok(RespValue::ok())
    }

    /// FLUSHALL always propagates, even over an empty dataset.
    pub(super) fn execute_flushall(&mut self) -> CommandResult {
        self.signal_flushed_db(None);
        let removed: usize = self.dbs.iter_mut().map(|db| db.flush()).sum();
        self.dirty += removed as u64 + 1;
        if self.save_in_progress() {
            warn!("FLUSHALL while a background save is running");
        }
        Ok(RespValue::ok())
    }

    /// OBJECT ENCODING|IDLETIME|REFCOUNT key. Never touches the key.
    pub(super) fn execute_object(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let sub = &argv[1];
        if argv.len() != 3 {
            return Err(CommandError::Other(
                "Syntax error. Try OBJECT (refcount|encoding|idletime)".into(),
            ));
        }
        let Some(obj) = self.lookup_read_notouch(db, &argv[2]) else {
            return Ok(RespValue::nil());
        };
        if sub.eq_ignore_ascii_case(b"encoding") {
            Ok(RespValue::bulk_str(obj.value().encoding()))
        } else if sub.eq_ignore_ascii_case(b"idletime") {
            let idle_ms = estimate_idle_ms(obj.lru(), self.lru_clock);
            Ok(RespValue::Integer((idle_ms / 1000) as i64))
        } else if sub.eq_ignore_ascii_case(b"refcount") {
            // Not counting the handle held here.
            Ok(RespValue::Integer(Rc::strong_count(&obj) as i64 - 1))
        } else {
            Err(CommandError::Other(
                "Syntax error. Try OBJECT (refcount|encoding|idletime)".into(),
            ))
        }
    }

    /// SORT key [BY pattern] [LIMIT offset count] [GET pattern ...]
    /// [ASC|DESC] [ALPHA] [STORE destination]
    pub(super) fn execute_sort(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let opts = SortOptions::parse(argv)?;

        let (mut elements, ordered_source) = match self.lookup_read(db, &argv[1]) {
            None => (Vec::new(), false),
            Some(obj) => match obj.value() {
                Value::List(l) => (l.iter().cloned().collect::<Vec<_>>(), false),
                Value::Set(s) => (s.iter().cloned().collect(), false),
                Value::SortedSet(z) => (z.iter().map(|(m, _)| m.clone()).collect(), true),
                _ => return Err(CommandError::WrongType),
            },
        };

        if opts.dont_sort {
            if ordered_source && opts.desc {
                elements.reverse();
            }
        } else {
            let mut weighted = Vec::with_capacity(elements.len());
            for element in elements {
                let weight = match &opts.by {
                    Some(pattern) => self.lookup_by_pattern(db, pattern, &element),
                    None => Some(element.clone()),
                };
                let score = if opts.alpha {
                    0.0
                } else {
                    match &weight {
                        Some(w) => parse_sort_score(w)?,
                        None => 0.0,
                    }
                };
                weighted.push(SortItem {
                    element,
                    weight,
                    score,
                });
            }
            let alpha = opts.alpha;
            weighted.sort_by(|a, b| {
                let ord = a.compare(b, alpha);
                if opts.desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
            elements = weighted.into_iter().map(|item| item.element).collect();
        }

        let len = elements.len() as i64;
        let start = opts.limit.map_or(0, |(offset, _)| offset.max(0));
        let count = opts.limit.map_or(-1, |(_, count)| count);
        let end = if count < 0 {
            len
        } else {
            start.saturating_add(count).min(len)
        };
        let window: Vec<Bytes> = if start >= len {
            Vec::new()
        } else {
            elements[start as usize..end as usize].to_vec()
        };

        let mut output: Vec<Option<Bytes>> = Vec::new();
        if opts.get.is_empty() {
            output.extend(window.into_iter().map(Some));
        } else {
            for element in &window {
                for pattern in &opts.get {
                    output.push(self.lookup_by_pattern(db, pattern, element));
                }
            }
        }

        let Some(dest) = opts.store else {
            return Ok(RespValue::array(
                output
                    .iter()
                    .map(|v| v.as_deref().map_or_else(RespValue::nil, RespValue::bulk))
                    .collect(),
            ));
        };

        let stored = output.len();
        if stored > 0 {
            let list: VecDeque<Bytes> = output.into_iter().map(Option::unwrap_or_default).collect();
            self.set_key(db, dest.clone(), Value::List(list));
            self.notify(NotifyFlags::LIST, "sortstore", &dest, db);
            self.dirty += stored as u64;
        } else if self.db_delete(db, &dest) {
            self.notify(NotifyFlags::GENERIC, "del", &dest, db);
            self.dirty += 1;
        }
        Ok(RespValue::Integer(stored as i64))
    }

    /// Resolve a BY/GET pattern for one element. `#` is the element itself;
    /// the first `*` is replaced by the element and `->field` reads a hash
    /// field.
    fn lookup_by_pattern(&mut self, db: usize, pattern: &[u8], subst: &[u8]) -> Option<Bytes> {
        if pattern == b"#" {
            return Some(Bytes::copy_from_slice(subst));
        }
        let star = pattern.iter().position(|&b| b == b'*')?;
        let field_at = pattern[star..]
            .windows(2)
            .position(|w| w == b"->")
            .map(|p| p + star)
            .filter(|p| p + 2 < pattern.len());

        let suffix_end = field_at.unwrap_or(pattern.len());
        let mut key = BytesMut::with_capacity(pattern.len() + subst.len());
        key.put_slice(&pattern[..star]);
        key.put_slice(subst);
        key.put_slice(&pattern[star + 1..suffix_end]);

        let obj = self.lookup_read(db, &key)?;
        match (field_at, obj.value()) {
            (None, Value::String(s)) => Some(s.clone()),
            (Some(p), Value::Hash(h)) => h.get(&pattern[p + 2..]).cloned(),
            _ => None,
        }
    }
}

struct SortOptions {
    desc: bool,
    alpha: bool,
    limit: Option<(i64, i64)>,
    by: Option<Bytes>,
    dont_sort: bool,
    get: Vec<Bytes>,
    store: Option<Bytes>,
}

impl SortOptions {
    fn parse(argv: &[Bytes]) -> Result<Self, CommandError> {
        let mut opts = SortOptions {
            desc: false,
            alpha: false,
            limit: None,
            by: None,
            dont_sort: false,
            get: Vec::new(),
            store: None,
        };
        let mut j = 2;
        while j < argv.len() {
            let left = argv.len() - j - 1;
            let opt = &argv[j];
            if opt.eq_ignore_ascii_case(b"asc") {
                opts.desc = false;
            } else if opt.eq_ignore_ascii_case(b"desc") {
                opts.desc = true;
            } else if opt.eq_ignore_ascii_case(b"alpha") {
                opts.alpha = true;
            } else if opt.eq_ignore_ascii_case(b"limit") && left >= 2 {
                let offset = parse_i64(&argv[j + 1]).ok_or(CommandError::NotInteger)?;
                let count = parse_i64(&argv[j + 2]).ok_or(CommandError::NotInteger)?;
                opts.limit = Some((offset, count));
                j += 2;
            } else if opt.eq_ignore_ascii_case(b"store") && left >= 1 {
                opts.store = Some(argv[j + 1].clone());
                j += 1;
            } else if opt.eq_ignore_ascii_case(b"by") && left >= 1 {
                let pattern = argv[j + 1].clone();
                // A pattern that cannot vary per element means "don't sort".
                if !pattern.contains(&b'*') {
                    opts.dont_sort = true;
                }
                opts.by = Some(pattern);
                j += 1;
            } else if opt.eq_ignore_ascii_case(b"get") && left >= 1 {
                opts.get.push(argv[j + 1].clone());
                j += 1;
            } else {
                return Err(CommandError::Syntax);
            }
            j += 1;
        }
        Ok(opts)
    }
}

struct SortItem {
    element: Bytes,
    weight: Option<Bytes>,
    score: f64,
}

impl SortItem {
    /// Equal numeric scores fall back to comparing the elements so the
    /// order is fully defined.
    fn compare(&self, other: &SortItem, alpha: bool) -> Ordering {
        if alpha {
            match (&self.weight, &other.weight) {
                (Some(a), Some(b)) => a.cmp(b),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        } else {
            self.score
                .partial_cmp(&other.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.element.cmp(&other.element))
        }
    }
}

fn parse_sort_score(data: &[u8]) -> Result<f64, CommandError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or_else(|| CommandError::Other("One or more scores can't be converted into double".into()))
}
