//! Sorted set commands.
//!
//! Handles: ZADD, ZREM, ZSCORE, ZCARD, ZRANGE

use super::Server;
use crate::redis::client::ClientId;
use crate::redis::data::{parse_i64, SortedSet, Value};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::resp::RespValue;
use bytes::Bytes;

fn parse_score(data: &[u8]) -> Result<f64, CommandError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(CommandError::NotFloat)
}

fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

impl Server {
    /// ZADD key [NX|XX] [CH] score member [score member ...]
    pub(super) fn execute_zadd(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];

        let mut nx = false;
        let mut xx = false;
        let mut ch = false;
        let mut j = 2;
        while j < argv.len() {
            let opt = &argv[j];
            if opt.eq_ignore_ascii_case(b"nx") {
                nx = true;
            } else if opt.eq_ignore_ascii_case(b"xx") {
                xx = true;
            } else if opt.eq_ignore_ascii_case(b"ch") {
                ch = true;
            } else {
                break;
            }
            j += 1;
        }
        let pairs = &argv[j..];
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return Err(CommandError::Syntax);
        }
        if nx && xx {
            return Err(CommandError::Other(
                "XX and NX options at the same time are not compatible".into(),
            ));
        }
        // Validate every score before touching the key.
        let mut entries = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks_exact(2) {
            entries.push((parse_score(&pair[0])?, pair[1].clone()));
        }

        let apply = |zset: &mut SortedSet| {
            let mut added = 0;
            let mut updated = 0;
            for (score, member) in &entries {
                match zset.score(member) {
                    Some(_) if nx => {}
                    Some(old) => {
                        if old != *score {
                            zset.insert(member.clone(), *score);
                            updated += 1;
                        }
                    }
                    None if xx => {}
                    None => {
                        zset.insert(member.clone(), *score);
                        added += 1;
                    }
                }
            }
            (added, updated)
        };

        let (added, updated) = match self.lookup_write_mut(db, key) {
            Some(Value::SortedSet(zset)) => apply(zset),
            Some(_) => return Err(CommandError::WrongType),
            None if xx => (0, 0),
            None => {
                let mut zset = SortedSet::new();
                let counts = apply(&mut zset);
                self.db_add(db, key.clone(), Value::SortedSet(zset));
                counts
            }
        };

        if added + updated > 0 {
            self.signal_modified_key(db, key);
            self.notify(NotifyFlags::ZSET, "zadd", key, db);
        }
        self.dirty += (added + updated) as u64;
        let reply = if ch { added + updated } else { added };
        Ok(RespValue::Integer(reply))
    }

    pub(super) fn execute_zrem(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let removed = match self.lookup_write_mut(db, key) {
            None => return Ok(RespValue::Integer(0)),
            Some(Value::SortedSet(zset)) => argv[2..].iter().filter(|m| zset.remove(m)).count(),
            Some(_) => return Err(CommandError::WrongType),
        };
        if removed > 0 {
            self.signal_modified_key(db, key);
            self.notify(NotifyFlags::ZSET, "zrem", key, db);
            self.delete_if_empty(db, key);
            self.dirty += removed as u64;
        }
        Ok(RespValue::Integer(removed as i64))
    }

    pub(super) fn execute_zscore(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::nil());
        };
        let zset = obj.value().as_sorted_set().ok_or(CommandError::WrongType)?;
        Ok(zset
            .score(&argv[2])
            .map_or_else(RespValue::nil, |s| RespValue::bulk_str(&format_score(s))))
    }

    pub(super) fn execute_zcard(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let len = match self.lookup_read(db, &argv[1]) {
            None => 0,
            Some(obj) => obj
                .value()
                .as_sorted_set()
                .ok_or(CommandError::WrongType)?
                .len(),
        };
        Ok(RespValue::Integer(len as i64))
    }

    /// ZRANGE key start stop [WITHSCORES]
    pub(super) fn execute_zrange(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let withscores = match argv.get(4) {
            None => false,
            Some(opt) if argv.len() == 5 && opt.eq_ignore_ascii_case(b"withscores") => true,
            Some(_) => return Err(CommandError::Syntax),
        };
        let start = parse_i64(&argv[2]).ok_or(CommandError::NotInteger)?;
        let stop = parse_i64(&argv[3]).ok_or(CommandError::NotInteger)?;
        let Some(obj) = self.lookup_read(db, &argv[1]) else {
            return Ok(RespValue::empty_array());
        };
        let zset = obj.value().as_sorted_set().ok_or(CommandError::WrongType)?;
        let mut items = Vec::new();
        for (member, score) in zset.range(start, stop) {
            items.push(RespValue::bulk(member));
            if withscores {
                items.push(RespValue::bulk_str(&format_score(score)));
            }
        }
        Ok(RespValue::array(items))
    }
}
