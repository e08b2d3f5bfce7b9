//! Key expiration.
//!
//! Keys expire two ways. Lazily: every lookup first checks the key's
//! deadline. Actively: cron samples random keys-with-expiry and deletes the
//! expired ones, within a time budget.
//!
//! A replica never deletes on its own. It waits for the DEL its primary
//! propagates, so both sides agree on when a key went away.

use super::{Role, Server};
use crate::redis::client::ClientId;
use crate::redis::data::parse_i64;
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::notify::NotifyFlags;
use crate::redis::propagate::PropagateTargets;
use crate::redis::registry::{CommandDescriptor, CommandKind};
use crate::redis::resp::RespValue;
use bytes::Bytes;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireCycle {
    /// Every cron tick; budget is a share of the tick.
    Slow,
    /// Before sleeping; only after a slow cycle ran out of time.
    Fast,
}

#[derive(Debug, Default)]
pub(super) struct ActiveExpireState {
    /// Round-robin database cursor.
    current_db: usize,
    /// The last cycle stopped on its time budget.
    pub(super) timelimit_exit: bool,
    last_fast_cycle_us: u64,
}

impl Server {
    /// Returns whether `key` is logically expired. On a primary an expired
    /// key is also deleted, propagated as DEL and notified.
    pub(super) fn expire_if_needed(&mut self, db: usize, key: &[u8]) -> bool {
        let Some(when) = self.dbs[db].get_expire(key) else {
            return false;
        };
        if self.loading {
            return false;
        }
        let now = self.mstime();
        if self.role == Role::Replica {
            return now > when;
        }
        if now <= when {
            return false;
        }
        self.delete_expired_key(db, key);
        true
    }

    fn delete_expired_key(&mut self, db: usize, key: &[u8]) {
        self.stats.expired_keys += 1;
        self.propagate_expire(db, key);
        self.notify(NotifyFlags::EXPIRED, "expired", key, db);
        self.db_delete(db, key);
        trace!(db, key = %String::from_utf8_lossy(key), "key expired");
    }

    fn propagate_expire(&mut self, db: usize, key: &[u8]) {
        let del = self.commands.original("del");
        let argv = [Bytes::from_static(b"DEL"), Bytes::copy_from_slice(key)];
        self.sink.propagate(&del, db, &argv, PropagateTargets::BOTH);
    }

    /// Sample keys-with-expiry and delete the expired ones, across a bounded
    /// number of databases and within a time budget.
    pub fn active_expire_cycle(&mut self, mode: ExpireCycle) {
        let start = self.clock.now_us();
        if self.clients_are_paused() {
            return;
        }

        let lookups = self.config.active_expire.lookups_per_loop;
        let fast_duration = self.config.active_expire.fast_duration_us;
        let stale_limit = lookups * self.config.active_expire.acceptable_stale_perc / 100;

        if mode == ExpireCycle::Fast {
            if !self.expire_state.timelimit_exit {
                return;
            }
            if start < self.expire_state.last_fast_cycle_us + fast_duration * 2 {
                return;
            }
            self.expire_state.last_fast_cycle_us = start;
        }

        let dbnum = self.dbs.len();
        let mut dbs_per_call = self.config.active_expire.dbs_per_call;
        if dbs_per_call > dbnum || self.expire_state.timelimit_exit {
            dbs_per_call = dbnum;
        }

        let timelimit = match mode {
            ExpireCycle::Fast => fast_duration,
            ExpireCycle::Slow => {
                (1_000_000 * self.config.active_expire.slow_time_perc / self.config.hz / 100).max(1)
            }
        };
        self.expire_state.timelimit_exit = false;

        let mut iteration: u64 = 0;
        let mut total_expired: u64 = 0;
        for _ in 0..dbs_per_call {
            let dbid = self.expire_state.current_db % dbnum;
            self.expire_state.current_db += 1;

            loop {
                let num = self.dbs[dbid].expires_len();
                if num == 0 {
                    self.dbs[dbid].avg_ttl = 0;
                    break;
                }
                if self.dbs[dbid].expires_too_sparse() {
                    break;
                }
                let now = self.clock.now_ms();
                let sample = self.dbs[dbid].sample_expires(&mut self.rng, num.min(lookups));

                let mut expired = 0;
                let mut ttl_sum: i64 = 0;
                let mut ttl_samples: i64 = 0;
                for (key, when) in sample {
                    let ttl = when - now;
                    if now > when {
                        self.delete_expired_key(dbid, &key);
                        expired += 1;
                    }
                    if ttl > 0 {
                        ttl_sum += ttl;
                        ttl_samples += 1;
                    }
                }
                total_expired += expired as u64;

                if ttl_samples > 0 {
                    let avg_ttl = ttl_sum / ttl_samples;
                    let db = &mut self.dbs[dbid];
                    if db.avg_ttl == 0 {
                        db.avg_ttl = avg_ttl;
                    }
                    // Each batch weighs 2%.
                    db.avg_ttl = (db.avg_ttl / 50) * 49 + avg_ttl / 50;
                }

                iteration += 1;
                if iteration & 0xf == 0 {
                    let elapsed = self.clock.now_us().saturating_sub(start);
                    if elapsed > timelimit {
                        self.expire_state.timelimit_exit = true;
                    }
                }
                if self.expire_state.timelimit_exit {
                    self.stats.expire_timelimit_exits += 1;
                    debug!(?mode, expired = total_expired, "active expire cycle hit its time limit");
                    return;
                }
                if expired <= stale_limit {
                    break;
                }
            }
        }
        if total_expired > 0 {
            debug!(?mode, expired = total_expired, "active expire cycle");
        }
    }

    /// Whether the last active cycle stopped on its time budget.
    pub fn active_expire_timed_out(&self) -> bool {
        self.expire_state.timelimit_exit
    }

    /// Average TTL of sampled keys in `db`, in milliseconds.
    pub fn avg_ttl(&self, db: usize) -> i64 {
        self.dbs[db].avg_ttl
    }

    /// EXPIRE, PEXPIRE, EXPIREAT, PEXPIREAT.
    ///
    /// Everything but PEXPIREAT is propagated as PEXPIREAT with the absolute
    /// deadline. A deadline already in the past deletes the key on a
    /// primary, and that is propagated as DEL.
    pub(super) fn execute_expire(
        &mut self,
        c: ClientId,
        argv: &[Bytes],
        cmd: &CommandDescriptor,
        absolute: bool,
        unit_ms: i64,
    ) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        let invalid = || CommandError::InvalidExpire(cmd.name().to_string());
        let n = parse_i64(&argv[2]).ok_or(CommandError::NotInteger)?;
        let base = if absolute { 0 } else { self.mstime() };
        let when = n
            .checked_mul(unit_ms)
            .and_then(|ms| ms.checked_add(base))
            .ok_or_else(invalid)?;

        if self.lookup_write(db, key).is_none() {
            return Ok(RespValue::Integer(0));
        }

        if when <= self.mstime() && !self.loading && self.role == Role::Primary {
            self.db_delete(db, key);
            self.dirty += 1;
            self.prevent_propagation(c);
            self.also_propagate("del", db, vec![Bytes::from_static(b"DEL"), key.clone()]);
            self.notify(NotifyFlags::GENERIC, "del", key, db);
            return Ok(RespValue::Integer(1));
        }

        self.dbs[db].set_expire(key, when);
        self.signal_modified_key(db, key);
        self.notify(NotifyFlags::GENERIC, "expire", key, db);
        self.dirty += 1;
        if cmd.kind != CommandKind::PExpireAt {
            self.prevent_propagation(c);
            self.also_propagate(
                "pexpireat",
                db,
                vec![
                    Bytes::from_static(b"PEXPIREAT"),
                    key.clone(),
                    Bytes::from(when.to_string()),
                ],
            );
        }
        Ok(RespValue::Integer(1))
    }

    /// TTL and PTTL: -2 for a missing key, -1 for no expiry.
    pub(super) fn execute_ttl(&mut self, c: ClientId, argv: &[Bytes], unit_ms: i64) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        if self.lookup_read_notouch(db, key).is_none() {
            return Ok(RespValue::Integer(-2));
        }
        let Some(when) = self.dbs[db].get_expire(key) else {
            return Ok(RespValue::Integer(-1));
        };
        let ttl = (when - self.mstime()).max(0);
        let ttl = if unit_ms == 1 { ttl } else { (ttl + 500) / 1000 };
        Ok(RespValue::Integer(ttl))
    }

    pub(super) fn execute_persist(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        let db = self.selected_db(c);
        let key = &argv[1];
        if self.lookup_write(db, key).is_none() {
            return Ok(RespValue::Integer(0));
        }
        if !self.dbs[db].remove_expire(key) {
            return Ok(RespValue::Integer(0));
        }
        self.signal_modified_key(db, key);
        self.notify(NotifyFlags::GENERIC, "persist", key, db);
        self.dirty += 1;
        Ok(RespValue::Integer(1))
    }

    /// Attach the expiry of SET EX/PX and SETEX/PSETEX and queue its
    /// PEXPIREAT. The caller propagates the write itself.
    pub(super) fn set_relative_expire(&mut self, db: usize, key: &Bytes, ms: i64) {
        let when = self.mstime().saturating_add(ms);
        self.dbs[db].set_expire(key, when);
        self.also_propagate(
            "pexpireat",
            db,
            vec![
                Bytes::from_static(b"PEXPIREAT"),
                key.clone(),
                Bytes::from(when.to_string()),
            ],
        );
    }
}
