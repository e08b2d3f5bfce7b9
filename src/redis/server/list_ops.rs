//! List commands.
//!
//! Handles: LPUSH, RPUSH, LPOP, RPOP, LLEN, LRANGE

use super::Server;
use crate::redis::client::ClientId;
use crate::redis::data::{parse_i64, Value};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use bytes::Bytes;
use std::collections::VecDeque;

impl Server {
    pub(super) fn execute_push(&mut self, c: ClientId, argv: &[Bytes], left: bool) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let values = &argv[2..];
        let push = |list: &mut VecDeque<Bytes>| {
            for v in values {
                if left {
                    list.push_front(v.clone());
                } else {
                    list.push_back(v.clone());
                }
            }
            list.len()
        };

        let len = match self.lookup_write_mut(db, key) {
            Some(Value::List(list)) => {
                let len = push(list);
                self.signal_modified_key(db, key);
                len
            }
            Some(_) => return Err(CommandError::WrongType),
            None => {
                let mut list = VecDeque::with_capacity(values.len());
                let len = push(&mut list);
                self.db_add(db, key.clone(), Value::List(list));
                len
            }
        };

        let event = if left { "lpush" } else { "rpush" };
        self.notify(NotifyFlags::LIST, event, key, db);
        self.dirty += values.len() as u64;
        Ok(RespValue::Integer(len as i64))
    }

    pub(super) fn execute_pop(&mut self, c: ClientId, argv: &[Bytes], left: bool) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let popped = match self.lookup_write_mut(db, key) {
            None => return Ok(RespValue::nil()),
            Some(Value::List(list)) => {
                if left {
                    list.pop_front()
                } else {
                    list.pop_back()
                }
            }
            Some(_) => return Err(CommandError::WrongType),
        };
        let Some(value) = popped else {
            return Ok(RespValue::nil());
        };

        let event = if left { "lpop" } else { "rpop" };
        self.notify(NotifyFlags::LIST, event, key, db);
        if !self.delete_if_empty(db, key) {
            self.signal_modified_key(db, key);
        }
        self.dirty += 1;
        Ok(RespValue::bulk(&value))
    }

    pub(super) fn execute_llen(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let len = match self.lookup_read(db, &argv[1]) {
            None => 0,
            Some(obj) => obj.value().as_list().ok_or(CommandError::WrongType)?.len(),
        };
        Ok(RespValue::Integer(len as i64))
    }

    /// LRANGE key start stop, inclusive, negative indices from the tail.
    pub(super) fn execute_lrange(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let start = parse_i64(&argv[2]).ok_or(CommandError::NotInteger)?;
        let stop = parse_i64(&argv[3]).ok_or(CommandError::NotInteger)?;
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::empty_array());
        };
        let list = obj.value().as_list().ok_or(CommandError::WrongType)?;

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(RespValue::empty_array());
        }
        Ok(RespValue::bulk_array(
            list.iter().skip(start as usize).take((stop - start + 1) as usize),
        ))
    }
}
