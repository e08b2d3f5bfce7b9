//! String commands.
//!
//! Handles: GET, SET, SETNX, SETEX, PSETEX, GETSET, APPEND, STRLEN, INCR,
//! DECR, INCRBY, DECRBY, MGET, MSET

use super::Server;
use crate::redis::client::ClientId;
use crate::redis::data::{parse_i64, Value};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetCondition {
    Always,
    IfMissing,
    IfExists,
}

impl Server {
    /// Current string value of a key, `None` when missing.
    fn get_string(&mut self, db: usize, key: &[u8]) -> Result<Option<Bytes>, CommandError> {
        match self.lookup_read(db, key) {
            None => Ok(None),
            Some(obj) => match obj.value() {
                Value::String(s) => Ok(Some(s.clone())),
                _ => Err(CommandError::WrongType),
            },
        }
    }

    pub(super) fn execute_get(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        Ok(match self.get_string(db, &argv[1])? {
            Some(s) => RespValue::bulk(&s),
            None => RespValue::nil(),
        })
    }

    /// SET key value [EX seconds] [PX milliseconds] [NX|XX]
    pub(super) fn execute_set(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let mut condition = SetCondition::Always;
        let mut expire: Option<(i64, i64)> = None;
        let mut j = 3;
        while j < argv.len() {
            let opt = &argv[j];
            let has_next = j + 1 < argv.len();
            if opt.eq_ignore_ascii_case(b"nx") && condition != SetCondition::IfExists {
                condition = SetCondition::IfMissing;
            } else if opt.eq_ignore_ascii_case(b"xx") && condition != SetCondition::IfMissing {
                condition = SetCondition::IfExists;
            } else if opt.eq_ignore_ascii_case(b"ex") && expire.is_none() && has_next {
                let n = parse_i64(&argv[j + 1]).ok_or(CommandError::NotInteger)?;
                expire = Some((n, 1000));
                j += 1;
            } else if opt.eq_ignore_ascii_case(b"px") && expire.is_none() && has_next {
                let n = parse_i64(&argv[j + 1]).ok_or(CommandError::NotInteger)?;
                expire = Some((n, 1));
                j += 1;
            } else {
                return Err(CommandError::Syntax);
            }
            j += 1;
        }
        self.set_generic(c, argv, condition, expire, "set", RespValue::nil())
    }

    pub(super) fn execute_setnx(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let reply = self.set_generic(
            c,
            argv,
            SetCondition::IfMissing,
            None,
            "setnx",
            RespValue::Integer(0),
        )?;
        Ok(if reply == RespValue::ok() { RespValue::Integer(1) } else { reply })
    }

    /// SETEX key seconds value / PSETEX key milliseconds value
    pub(super) fn execute_setex(&mut self, c: ClientId, argv: &[Bytes], unit_ms: i64) -> CommandResult {
        let n = parse_i64(&argv[2]).ok_or(CommandError::NotInteger)?;
        let name = if unit_ms == 1 { "psetex" } else { "setex" };
        let rewritten = [argv[0].clone(), argv[1].clone(), argv[3].clone()];
        self.set_generic(
            c,
            &rewritten,
            SetCondition::Always,
            Some((n, unit_ms)),
            name,
            RespValue::nil(),
        )
    }

    /// Shared by the SET family. `argv[1]` is the key, `argv[2]` the value;
    /// `abort_reply` is returned when the NX/XX condition fails.
    fn set_generic(
        &mut self,
        c: ClientId,
        argv: &[Bytes],
        condition: SetCondition,
        expire: Option<(i64, i64)>,
        name: &str,
        abort_reply: RespValue,
    ) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let value = &argv[2];

        let ms = match expire {
            Some((n, unit)) => {
                let ms = n
                    .checked_mul(unit)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| CommandError::InvalidExpire(name.to_string()))?;
                Some(ms)
            }
            None => None,
        };

        let exists = self.lookup_write(db, key).is_some();
        if (condition == SetCondition::IfMissing && exists)
            || (condition == SetCondition::IfExists && !exists)
        {
            return Ok(abort_reply);
        }

        self.set_key(db, key.clone(), Value::String(value.clone()));
        self.dirty += 1;
        if let Some(ms) = ms {
            // Replicas get a plain SET followed by an absolute PEXPIREAT.
            self.prevent_propagation(c);
            self.also_propagate(
                "set",
                db,
                vec![Bytes::from_static(b"SET"), key.clone(), value.clone()],
            );
            self.set_relative_expire(db, key, ms);
        }
        self.notify(NotifyFlags::STRING, "set", key, db);
        if ms.is_some() {
            self.notify(NotifyFlags::GENERIC, "expire", key, db);
        }
        Ok(RespValue::ok())
    }

    pub(super) fn execute_getset(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let old = self.get_string(db, &argv[1])?;
        self.set_key(db, argv[1].clone(), Value::String(argv[2].clone()));
        self.notify(NotifyFlags::STRING, "set", &argv[1], db);
        self.dirty += 1;
        Ok(match old {
            Some(s) => RespValue::bulk(&s),
            None => RespValue::nil(),
        })
    }

    pub(super) fn execute_append(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let suffix = &argv[2];
        let len = match self.lookup_write(db, key) {
            None => {
                self.db_add(db, key.clone(), Value::String(suffix.clone()));
                suffix.len()
            }
            Some(obj) => {
                let Value::String(current) = obj.value() else {
                    return Err(CommandError::WrongType);
                };
                let mut joined = BytesMut::with_capacity(current.len() + suffix.len());
                joined.put_slice(current);
                joined.put_slice(suffix);
                let len = joined.len();
                drop(obj);
                self.db_overwrite(db, key, Value::String(joined.freeze()));
                len
            }
        };
        self.notify(NotifyFlags::STRING, "append", key, db);
        self.dirty += 1;
        Ok(RespValue::Integer(len as i64))
    }

    pub(super) fn execute_strlen(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let len = self.get_string(db, &argv[1])?.map_or(0, |s| s.len());
        Ok(RespValue::Integer(len as i64))
    }

    /// INCRBY / DECRBY with the increment taken from `argv[2]`.
    pub(super) fn execute_incrby(&mut self, c: ClientId, argv: &[Bytes], negate: bool) -> CommandResult {
        let incr = parse_i64(&argv[2]).ok_or(CommandError::NotInteger)?;
        let incr = if negate {
            incr.checked_neg().ok_or(CommandError::NotInteger)?
        } else {
            incr
        };
        self.execute_incr_by(c, argv, incr)
    }

    pub(super) fn execute_incr_by(&mut self, c: ClientId, argv: &[Bytes], incr: i64) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let current = match self.lookup_write(db, key) {
            None => None,
            Some(obj) => match obj.value() {
                Value::String(s) => Some(parse_i64(s).ok_or(CommandError::NotInteger)?),
                _ => return Err(CommandError::WrongType),
            },
        };
        let value = current
            .unwrap_or(0)
            .checked_add(incr)
            .ok_or_else(|| CommandError::Other("increment or decrement would overflow".into()))?;
        let encoded = Value::String(Bytes::from(value.to_string()));
        if current.is_some() {
            self.db_overwrite(db, key, encoded);
        } else {
            self.db_add(db, key.clone(), encoded);
        }
        self.notify(NotifyFlags::STRING, "incrby", key, db);
        self.dirty += 1;
        Ok(RespValue::Integer(value))
    }

    pub(super) fn execute_mget(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let mut values = Vec::with_capacity(argv.len() - 1);
        for key in &argv[1..] {
            let reply = match self.lookup_read(db, key) {
                Some(obj) => match obj.value() {
                    Value::String(s) => RespValue::bulk(s),
                    _ => RespValue::nil(),
                },
                None => RespValue::nil(),
            };
            values.push(reply);
        }
        Ok(RespValue::array(values))
    }

    pub(super) fn execute_mset(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        if argv.len() % 2 == 0 {
            return Err(CommandError::WrongArity("mset".to_string()));
        }
        let db = self.selected_db(c);
        for pair in argv[1..].chunks_exact(2) {
            self.set_key(db, pair[0].clone(), Value::String(pair[1].clone()));
            self.notify(NotifyFlags::STRING, "set", &pair[0], db);
        }
        self.dirty += ((argv.len() - 1) / 2) as u64;
        Ok(RespValue::ok())
    }
}
