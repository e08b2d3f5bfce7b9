//! Command pipeline: validation gates, invocation and propagation.

use super::{Role, Server};
use crate::redis::client::{ClientFlags, ClientId, MultiCmd};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::propagate::PropagateTargets;
use crate::redis::registry::{CommandDescriptor, CommandKind};
use crate::redis::resp::RespValue;
use bytes::Bytes;
use std::rc::Rc;
use tracing::debug;

bitflags::bitflags! {
    /// What `call` accounts for and where it may propagate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u8 {
        const SLOWLOG = 1 << 0;
        const STATS = 1 << 1;
        const PROPAGATE_AOF = 1 << 2;
        const PROPAGATE_REPL = 1 << 3;
        const PROPAGATE = Self::PROPAGATE_AOF.bits() | Self::PROPAGATE_REPL.bits();
        const FULL = Self::SLOWLOG.bits() | Self::STATS.bits() | Self::PROPAGATE.bits();
    }
}

impl CallFlags {
    /// Drop the channels these flags do not permit.
    fn mask(self, mut targets: PropagateTargets) -> PropagateTargets {
        if !self.contains(CallFlags::PROPAGATE_AOF) {
            targets.remove(PropagateTargets::AOF);
        }
        if !self.contains(CallFlags::PROPAGATE_REPL) {
            targets.remove(PropagateTargets::REPL);
        }
        targets
    }
}

impl Server {
    /// Entry point for a parsed request. Always produces a reply; errors are
    /// replies too.
    pub fn process_command(&mut self, c: ClientId, argv: Vec<Bytes>) -> RespValue {
        let prev = self.current_client.replace(c);
        let reply = self.process_command_inner(c, argv).unwrap_or_else(RespValue::from);
        self.current_client = prev;
        reply
    }

    fn process_command_inner(&mut self, c: ClientId, argv: Vec<Bytes>) -> CommandResult {
        let name = argv.first().cloned().unwrap_or_default();

        if name.eq_ignore_ascii_case(b"quit") {
            self.client_state_mut(c)
                .flags
                .insert(ClientFlags::CLOSE_AFTER_REPLY);
            return Ok(RespValue::ok());
        }

        let Some(cmd) = self.commands.lookup(&name) else {
            self.flag_transaction(c);
            let name = String::from_utf8_lossy(&name).into_owned();
            debug!(client = %c, command = %name, "unknown command");
            return Err(CommandError::UnknownCommand(name));
        };
        self.client_state_mut(c).cmd = Some(cmd.clone());

        if !cmd.arity_ok(argv.len()) {
            self.flag_transaction(c);
            return Err(CommandError::WrongArity(cmd.name().to_string()));
        }

        if self.config.requirepass.is_some()
            && !self.client_state(c).authenticated
            && cmd.kind != CommandKind::Auth
        {
            self.flag_transaction(c);
            return Err(CommandError::NoAuth);
        }

        if self.memory_pressure && cmd.flags.is_denyoom() {
            self.flag_transaction(c);
            return Err(CommandError::Oom);
        }

        if self.persistence_failing()
            && self.role == Role::Primary
            && (cmd.flags.is_write() || cmd.kind == CommandKind::Ping)
        {
            self.flag_transaction(c);
            return Err(match &self.aof_last_write_error {
                Some(msg) => CommandError::AofWriteFailed(msg.clone()),
                None => CommandError::Misconf,
            });
        }

        if self.role == Role::Replica
            && self.config.replica_read_only
            && !self.client_state(c).is_master()
            && cmd.flags.is_write()
        {
            return Err(CommandError::ReadOnlyReplica);
        }

        if self.loading && !cmd.flags.allowed_while_loading() {
            return Err(CommandError::Loading);
        }

        let transaction_control = matches!(
            cmd.kind,
            CommandKind::Exec | CommandKind::Discard | CommandKind::Multi | CommandKind::Watch
        );
        if self.client_state(c).in_multi() && !transaction_control {
            self.client_state_mut(c).mstate.push(MultiCmd { cmd, argv });
            return Ok(RespValue::queued());
        }

        Ok(self.call(c, &cmd, &argv, CallFlags::FULL))
    }

    fn persistence_failing(&self) -> bool {
        let bgsave_failed = self.config.stop_writes_on_bgsave_error
            && !self.config.save_points.is_empty()
            && !self.last_bgsave_ok;
        bgsave_failed || self.aof_last_write_error.is_some()
    }

    /// Invoke a command with accounting and propagation.
    ///
    /// Time is frozen for the outermost call; nested calls (from EXEC) see the
    /// same instant.
    pub fn call(
        &mut self,
        c: ClientId,
        cmd: &Rc<CommandDescriptor>,
        argv: &[Bytes],
        flags: CallFlags,
    ) -> RespValue {
        let prev_client = self.current_client.replace(c);
        let saved_flags = {
            let client = self.client_state_mut(c);
            let saved = client.flags.intersection(ClientFlags::PROPAGATION);
            client.flags.remove(ClientFlags::PROPAGATION);
            client.cmd = Some(cmd.clone());
            saved
        };
        let outer_ops = std::mem::take(&mut self.also_propagate);
        if self.call_depth == 0 {
            self.cmd_time_ms = self.clock.now_ms();
        }
        self.call_depth += 1;

        let dirty_before = self.dirty;
        let start = self.clock.now_us();
        let reply = self.dispatch(c, cmd, argv).unwrap_or_else(RespValue::from);
        let duration = self.clock.now_us().saturating_sub(start);
        let dirty = self.dirty.saturating_sub(dirty_before);
        self.call_depth -= 1;

        if flags.contains(CallFlags::SLOWLOG) && cmd.kind != CommandKind::Exec {
            let now_secs = self.clock.now_secs();
            self.slowlog.push_if_needed(argv, duration, now_secs);
        }
        if flags.contains(CallFlags::STATS) {
            cmd.record_call(duration);
        }

        let (client_flags, dbid) = {
            let client = self.client_state(c);
            (client.flags, client.db)
        };
        if flags.intersects(CallFlags::PROPAGATE)
            && !client_flags.contains(ClientFlags::PREVENT_PROP)
        {
            let mut targets = PropagateTargets::empty();
            if dirty > 0 {
                targets = PropagateTargets::BOTH;
            }
            if client_flags.contains(ClientFlags::FORCE_REPL) {
                targets.insert(PropagateTargets::REPL);
            }
            if client_flags.contains(ClientFlags::FORCE_AOF) {
                targets.insert(PropagateTargets::AOF);
            }
            if client_flags.contains(ClientFlags::PREVENT_REPL_PROP) {
                targets.remove(PropagateTargets::REPL);
            }
            if client_flags.contains(ClientFlags::PREVENT_AOF_PROP) {
                targets.remove(PropagateTargets::AOF);
            }
            let targets = flags.mask(targets);
            if !targets.is_empty() {
                self.sink.propagate(cmd, dbid, argv, targets);
            }
        }

        {
            let client = self.client_state_mut(c);
            client.flags.remove(ClientFlags::PROPAGATION);
            client.flags.insert(saved_flags);
        }

        // Secondary operations ignore PREVENT_PROP; only the call flags apply.
        let ops = std::mem::replace(&mut self.also_propagate, outer_ops);
        if flags.intersects(CallFlags::PROPAGATE) {
            for op in ops {
                let targets = flags.mask(op.targets);
                if !targets.is_empty() {
                    self.sink.propagate(&op.cmd, op.dbid, &op.argv, targets);
                }
            }
        }

        self.stats.numcommands += 1;
        self.current_client = prev_client;
        reply
    }

    fn dispatch(&mut self, c: ClientId, cmd: &Rc<CommandDescriptor>, argv: &[Bytes]) -> CommandResult {
        use CommandKind as K;
        match cmd.kind {
            K::Get => self.execute_get(c, argv),
            K::Set => self.execute_set(c, argv),
            K::SetNx => self.execute_setnx(c, argv),
            K::SetEx => self.execute_setex(c, argv, 1000),
            K::PSetEx => self.execute_setex(c, argv, 1),
            K::GetSet => self.execute_getset(c, argv),
            K::Append => self.execute_append(c, argv),
            K::Strlen => self.execute_strlen(c, argv),
            K::Incr => self.execute_incr_by(c, argv, 1),
            K::Decr => self.execute_incr_by(c, argv, -1),
            K::IncrBy => self.execute_incrby(c, argv, false),
            K::DecrBy => self.execute_incrby(c, argv, true),
            K::MGet => self.execute_mget(c, argv),
            K::MSet => self.execute_mset(c, argv),
            K::Del => self.execute_del(c, argv),
            K::Exists => self.execute_exists(c, argv),
            K::Type => self.execute_type(c, argv),
            K::Keys => self.execute_keys(c, argv),
            K::DbSize => self.execute_dbsize(c),
            K::Select => self.execute_select(c, argv),
            K::Expire => self.execute_expire(c, argv, cmd, false, 1000),
            K::PExpire => self.execute_expire(c, argv, cmd, false, 1),
            K::ExpireAt => self.execute_expire(c, argv, cmd, true, 1000),
            K::PExpireAt => self.execute_expire(c, argv, cmd, true, 1),
            K::Ttl => self.execute_ttl(c, argv, 1000),
            K::PTtl => self.execute_ttl(c, argv, 1),
            K::Persist => self.execute_persist(c, argv),
            K::Rename => self.execute_rename(c, argv),
            K::RandomKey => self.execute_randomkey(c),
            K::Touch => self.execute_touch(c, argv),
            K::FlushDb => self.execute_flushdb(c),
            K::FlushAll => self.execute_flushall(),
            K::Object => self.execute_object(c, argv),
            K::Sort => self.execute_sort(c, argv),
            K::LPush => self.execute_push(c, argv, true),
            K::RPush => self.execute_push(c, argv, false),
            K::LPop => self.execute_pop(c, argv, true),
            K::RPop => self.execute_pop(c, argv, false),
            K::LLen => self.execute_llen(c, argv),
            K::LRange => self.execute_lrange(c, argv),
            K::SAdd => self.execute_sadd(c, argv),
            K::SRem => self.execute_srem(c, argv),
            K::SIsMember => self.execute_sismember(c, argv),
            K::SCard => self.execute_scard(c, argv),
            K::SMembers => self.execute_smembers(c, argv),
            K::SPop => self.execute_spop(c, argv),
            K::HSet => self.execute_hset(c, argv),
            K::HGet => self.execute_hget(c, argv),
            K::HDel => self.execute_hdel(c, argv),
            K::HLen => self.execute_hlen(c, argv),
            K::HGetAll => self.execute_hgetall(c, argv),
            K::ZAdd => self.execute_zadd(c, argv),
            K::ZRem => self.execute_zrem(c, argv),
            K::ZScore => self.execute_zscore(c, argv),
            K::ZCard => self.execute_zcard(c, argv),
            K::ZRange => self.execute_zrange(c, argv),
            K::Multi => self.execute_multi(c),
            K::Exec => self.execute_exec(c),
            K::Discard => self.execute_discard(c),
            K::Watch => self.execute_watch(c, argv),
            K::Unwatch => self.execute_unwatch(c),
            K::Ping => self.execute_ping(argv),
            K::Echo => Ok(RespValue::bulk(&argv[1])),
            K::Auth => self.execute_auth(c, argv),
            K::Info => self.execute_info(argv),
            K::Time => self.execute_time(),
            K::Command => self.execute_command(argv),
            K::Slowlog => self.execute_slowlog(argv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_flags_mask_targets() {
        assert_eq!(CallFlags::FULL.mask(PropagateTargets::BOTH), PropagateTargets::BOTH);
        let aof_only = CallFlags::STATS | CallFlags::PROPAGATE_AOF;
        assert!(aof_only.intersects(CallFlags::PROPAGATE));
        assert!(!aof_only.contains(CallFlags::PROPAGATE));
        assert_eq!(aof_only.mask(PropagateTargets::BOTH), PropagateTargets::AOF);
        assert!(CallFlags::SLOWLOG.mask(PropagateTargets::BOTH).is_empty());
    }
}
