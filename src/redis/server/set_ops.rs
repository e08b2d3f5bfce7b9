//! Set commands.
//!
//! Handles: SADD, SREM, SISMEMBER, SCARD, SMEMBERS, SPOP

use super::Server;
use crate::redis::client::ClientId;
use crate::redis::data::{parse_i64, MemberSet, Value};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use bytes::Bytes;
use rand::seq::index;

impl Server {
    pub(super) fn execute_sadd(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let members = &argv[2..];
        let added = match self.lookup_write_mut(db, key) {
            Some(Value::Set(set)) => members.iter().filter(|m| set.insert((*m).clone())).count(),
            Some(_) => return Err(CommandError::WrongType),
            None => {
                let set: MemberSet = members.iter().cloned().collect();
                let added = set.len();
                self.db_add(db, key.clone(), Value::Set(set));
                added
            }
        };
        if added > 0 {
            self.signal_modified_key(db, key);
            self.notify(NotifyFlags::SET, "sadd", key, db);
        }
        self.dirty += added as u64;
        Ok(RespValue::Integer(added as i64))
    }

    pub(super) fn execute_srem(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let removed = match self.lookup_write_mut(db, key) {
            None => return Ok(RespValue::Integer(0)),
            Some(Value::Set(set)) => argv[2..].iter().filter(|m| set.swap_remove(&m[..])).count(),
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal_modified_key(db, key);
            self.notify(NotifyFlags::SET, "srem", key, db);
            self.delete_if_empty(db, key);
            self.dirty += removed as u64;
        }
        Ok(RespValue::Integer(removed as i64))
    }

    pub(super) fn execute_sismember(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let found = match self.lookup_read(db, &argv[1]) {
            None => false,
            Some(obj) => obj
                .value()
                .as_set()
                .ok_or(CommandError::WrongType)?
                .contains(&argv[2]),
        };
        Ok(RespValue::Integer(found as i64))
    }

    pub(super) fn execute_scard(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let len = match self.lookup_read(db, &argv[1]) {
            None => 0,
            Some(obj) => obj.value().as_set().ok_or(CommandError::WrongType)?.len(),
        };
        Ok(RespValue::Integer(len as i64))
    }

    pub(super) fn execute_smembers(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::empty_array());
        };
        let set = obj.value().as_set().ok_or(CommandError::WrongType)?;
        Ok(RespValue::bulk_array(set.iter()))
    }

    /// SPOP key [count]
    ///
    /// Random removal is not replayable, so each popped member propagates
    /// as SREM. Popping the whole set propagates as DEL.
    pub(super) fn execute_spop(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        if argv.len() > 3 {
            return Err(CommandError::Syntax);
        }
        let db = self.selected_db(c);
        let key = &argv[1];
        let count = match argv.get(2) {
            Some(arg) => {
                let n = parse_i64(arg).ok_or(CommandError::NotInteger)?;
                if n < 0 {
                    return Err(CommandError::OutOfRange);
                }
                Some(n as usize)
            }
            None => None,
        };

        let size = match self.lookup_write(db, key) {
            None => {
                return Ok(match count {
                    Some(_) => RespValue::empty_array(),
                    None => RespValue::nil(),
                })
            }
            Some(obj) => obj.value().as_set().ok_or(CommandError::WrongType)?.len(),
        };
        if count == Some(0) {
            return Ok(RespValue::empty_array());
        }

        if let Some(n) = count {
            if n >= size {
                let members: Vec<Bytes> = self.dbs[db]
                    .get(key)
                    .and_then(|o| o.value().as_set())
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                self.notify(NotifyFlags::SET, "spop", key, db);
                self.db_delete(db, key);
                self.notify(NotifyFlags::GENERIC, "del", key, db);
                self.prevent_propagation(c);
                self.also_propagate("del", db, vec![Bytes::from_static(b"DEL"), key.clone()]);
                self.dirty += 1;
                return Ok(RespValue::bulk_array(members.iter()));
            }
        }

        let want = count.unwrap_or(1);
        let popped: Vec<Bytes> = match self.dbs[db].get(key).and_then(|o| o.value().as_set()) {
            Some(set) => index::sample(&mut self.rng, set.len(), want.min(set.len()))
                .into_iter()
                .filter_map(|idx| set.get_index(idx).cloned())
                .collect(),
            None => Vec::new(),
        };
        if let Some(Value::Set(set)) = self.lookup_write_mut(db, key) {
            for member in &popped {
                set.swap_remove(member);
            }
        }

        self.prevent_propagation(c);
        for member in &popped {
            self.also_propagate(
                "srem",
                db,
                vec![Bytes::from_static(b"SREM"), key.clone(), member.clone()],
            );
        }
        self.notify(NotifyFlags::SET, "spop", key, db);
        if !self.delete_if_empty(db, key) {
            self.signal_modified_key(db, key);
        }
        self.dirty += 1;

        Ok(match count {
            Some(_) => RespValue::bulk_array(popped.iter()),
            None => popped
                .first()
                .map_or_else(RespValue::nil, |m| RespValue::bulk(m)),
        })
    }
}
