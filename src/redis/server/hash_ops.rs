//! Hash commands.
//!
//! Handles: HSET, HGET, HDEL, HLEN, HGETALL

use super::Server;
use crate::redis::client::ClientId;
use crate::redis::data::Value;
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use ahash::AHashMap;
use bytes::Bytes;

impl Server {
    /// Replies 1 for a new field, 0 for an update.
    pub(super) fn execute_hset(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let field = argv[2].clone();
        let value = argv[3].clone();
        let created = match self.lookup_write_mut(db, key) {
            Some(Value::Hash(hash)) => {
                let created = hash.insert(field, value).is_none();
                self.signal_modified_key(db, key);
                created
            }
            Some(_) => return Err(CommandError::WrongType),
            None => {
                let mut hash = AHashMap::new();
                hash.insert(field, value);
                self.db_add(db, key.clone(), Value::Hash(hash));
                true
            }
        };
        self.notify(NotifyFlags::HASH, "hset", key, db);
        self.dirty += 1;
        Ok(RespValue::Integer(created as i64))
    }

    pub(super) fn execute_hget(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::nil());
        };
        let hash = obj.value().as_hash().ok_or(CommandError::WrongType)?;
        Ok(hash
            .get(&argv[2])
            .map_or_else(RespValue::nil, |v| RespValue::bulk(v)))
    }

    pub(super) fn execute_hdel(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let deleted = match self.lookup_write_mut(db, key) {
            None => return Ok(RespValue::Integer(0)),
            Some(Value::Hash(hash)) => argv[2..]
                .iter()
                .filter(|f| hash.remove(&f[..]).is_some())
                .count(),
            Some(_) => return Err(CommandError::WrongType),
        };
        if deleted > 0 {
            self.signal_modified_key(db, key);
            self.notify(NotifyFlags::HASH, "hdel", key, db);
            self.delete_if_empty(db, key);
            self.dirty += deleted as u64;
        }
        Ok(RespValue::Integer(deleted as i64))
    }

    pub(super) fn execute_hlen(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let len = match self.lookup_read(db, &argv[1]) {
            None => 0,
            Some(obj) => obj.value().as_hash().ok_or(CommandError::WrongType)?.len(),
        };
        Ok(RespValue::Integer(len as i64))
    }

    /// Field, value, field, value, ...
    pub(super) fn execute_hgetall(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::empty_array());
        };
        let hash = obj.value().as_hash().ok_or(CommandError::WrongType)?;
        Ok(RespValue::bulk_array(hash.iter().flat_map(|(f, v)| [f, v])))
    }
}
