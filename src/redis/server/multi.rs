//! MULTI/EXEC transactions and WATCH.
//!
//! Queued commands run back to back inside EXEC, so no other client can
//! interleave. WATCH makes EXEC conditional: any write to a watched key
//! before EXEC sets `DIRTY_CAS` on the watcher and EXEC then replies with a
//! null array without running anything.
//!
//! Propagation wraps the batch in MULTI ... EXEC, but only once the first
//! command that may write is reached. Read-only transactions propagate
//! nothing.

use super::pipeline::CallFlags;
use super::Server;
use crate::redis::client::{ClientFlags, ClientId};
use crate::redis::error::{CommandError, CommandResult};
use crate::redis::propagate::PropagateTargets;
use crate::redis::resp::RespValue;
use bytes::Bytes;
use tracing::trace;

impl Server {
    pub(super) fn execute_multi(&mut self, c: ClientId) -> CommandResult {
        let client = self.client_state_mut(c);
        if client.in_multi() {
            return Err(CommandError::Other("MULTI calls can not be nested".into()));
        }
        client.flags.insert(ClientFlags::MULTI);
        Ok(RespValue::ok())
    }

    pub(super) fn execute_discard(&mut self, c: ClientId) -> CommandResult {
        if !self.client_state(c).in_multi() {
            return Err(CommandError::Other("DISCARD without MULTI".into()));
        }
        self.discard_transaction(c);
        Ok(RespValue::ok())
    }

    pub(super) fn execute_exec(&mut self, c: ClientId) -> CommandResult {
        let flags = self.client_state(c).flags;
        if !flags.contains(ClientFlags::MULTI) {
            return Err(CommandError::Other("EXEC without MULTI".into()));
        }
        if flags.contains(ClientFlags::DIRTY_EXEC) {
            self.discard_transaction(c);
            return Err(CommandError::ExecAbort);
        }
        if flags.contains(ClientFlags::DIRTY_CAS) {
            trace!(client = %c, "EXEC aborted by a watched key");
            self.discard_transaction(c);
            return Ok(RespValue::null_array());
        }

        self.unwatch_all_keys(c);
        let (queued, orig_cmd) = {
            let client = self.client_state_mut(c);
            (std::mem::take(&mut client.mstate), client.cmd.clone())
        };

        let mut must_propagate = false;
        let mut replies = Vec::with_capacity(queued.len());
        for entry in &queued {
            if !must_propagate && !entry.cmd.flags.is_readonly() {
                self.propagate_multi(c);
                must_propagate = true;
            }
            replies.push(self.call(c, &entry.cmd, &entry.argv, CallFlags::FULL));
        }

        self.client_state_mut(c).cmd = orig_cmd;
        self.discard_transaction(c);
        if must_propagate {
            // MULTI went out, so EXEC must follow even if nothing was dirtied.
            self.force_propagation(c, PropagateTargets::BOTH);
        }
        Ok(RespValue::array(replies))
    }

    fn propagate_multi(&mut self, c: ClientId) {
        let multi = self.commands.original("multi");
        let db = self.selected_db(c);
        self.sink.propagate(
            &multi,
            db,
            &[Bytes::from_static(b"MULTI")],
            PropagateTargets::BOTH,
        );
    }

    /// Leave MULTI state: drop the queue, clear the taint flags and unwatch.
    fn discard_transaction(&mut self, c: ClientId) {
        let client = self.client_state_mut(c);
        client.mstate.clear();
        client.flags.remove(ClientFlags::MULTI);
        client.flags.remove(ClientFlags::DIRTY_CAS);
        client.flags.remove(ClientFlags::DIRTY_EXEC);
        self.unwatch_all_keys(c);
    }

    /// Taint the open transaction after a command failed to queue.
    pub(super) fn flag_transaction(&mut self, c: ClientId) {
        let client = self.client_state_mut(c);
        if client.in_multi() {
            client.flags.insert(ClientFlags::DIRTY_EXEC);
        }
    }

    pub(super) fn execute_watch(&mut self, c: ClientId, argv: &[Bytes]) -> CommandResult {
        if self.client_state(c).in_multi() {
            return Err(CommandError::Other("WATCH inside MULTI is not allowed".into()));
        }
        for key in &argv[1..] {
            self.watch_for_key(c, key);
        }
        Ok(RespValue::ok())
    }

    pub(super) fn execute_unwatch(&mut self, c: ClientId) -> CommandResult {
        self.unwatch_all_keys(c);
        self.client_state_mut(c).flags.remove(ClientFlags::DIRTY_CAS);
        Ok(RespValue::ok())
    }

    fn watch_for_key(&mut self, c: ClientId, key: &Bytes) {
        let db = self.selected_db(c);
        if self.client_state(c).is_watching(db, key) {
            return;
        }
        self.dbs[db].add_watcher(key.clone(), c);
        self.client_state_mut(c).watched_keys.push((db, key.clone()));
    }

    /// Remove the client from every watched key's watcher list. Clearing
    /// `DIRTY_CAS` is up to the caller.
    pub(super) fn unwatch_all_keys(&mut self, c: ClientId) {
        let watched = std::mem::take(&mut self.client_state_mut(c).watched_keys);
        for (db, key) in watched {
            self.dbs[db].remove_watcher(&key, c);
        }
    }
}
