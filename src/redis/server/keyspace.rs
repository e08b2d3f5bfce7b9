//! Keyspace access for command handlers.
//!
//! Every lookup runs the lazy expiry check first. Every mutation signals
//! the key as modified, which invalidates WATCHers.

use super::{PendingOp, Role, Server};
use crate::redis::client::ClientFlags;
use crate::redis::client::ClientId;
use crate::redis::data::{ObjectRef, RedisObject, Value};
use crate::redis::notify::{notify_keyspace_event, NotifyFlags};
use crate::redis::propagate::PropagateTargets;
use bytes::Bytes;
use std::rc::Rc;

impl Server {
    /// Read lookup. Counts a hit or a miss.
    pub(super) fn lookup_read(&mut self, db: usize, key: &[u8]) -> Option<ObjectRef> {
        self.lookup_read_with_flags(db, key, false)
    }

    /// Read lookup that leaves the access time alone.
    pub(super) fn lookup_read_notouch(&mut self, db: usize, key: &[u8]) -> Option<ObjectRef> {
        self.lookup_read_with_flags(db, key, true)
    }

    fn lookup_read_with_flags(&mut self, db: usize, key: &[u8], notouch: bool) -> Option<ObjectRef> {
        if self.expire_if_needed(db, key) && self.role == Role::Replica {
            // Replicas keep logically expired keys until the primary's DEL
            // arrives, but plain readers should not see them.
            if self.current_reader_is_readonly_client() {
                self.stats.keyspace_misses += 1;
                return None;
            }
        }
        let val = self.lookup_key(db, key, notouch);
        if val.is_some() {
            self.stats.keyspace_hits += 1;
        } else {
            self.stats.keyspace_misses += 1;
        }
        val
    }

    fn current_reader_is_readonly_client(&self) -> bool {
        let Some(id) = self.current_client else {
            return false;
        };
        if self.master == Some(id) {
            return false;
        }
        self.clients
            .get(&id)
            .and_then(|c| c.cmd.as_ref())
            .map_or(false, |cmd| cmd.flags.is_readonly())
    }

    /// Write lookup: expires first, no hit/miss accounting.
    pub(super) fn lookup_write(&mut self, db: usize, key: &[u8]) -> Option<ObjectRef> {
        self.expire_if_needed(db, key);
        self.lookup_key(db, key, false)
    }

    /// Write lookup returning the value for in-place mutation. The caller
    /// must signal the key as modified once it changes it.
    pub(super) fn lookup_write_mut(&mut self, db: usize, key: &[u8]) -> Option<&mut Value> {
        self.expire_if_needed(db, key);
        let touch = !self.save_in_progress();
        let clock = self.lru_clock;
        let obj = self.dbs[db].get_mut(key)?;
        if touch {
            obj.touch(clock);
        }
        Some(Rc::make_mut(obj).value_mut())
    }

    fn lookup_key(&self, db: usize, key: &[u8], notouch: bool) -> Option<ObjectRef> {
        let obj = self.dbs[db].get(key)?;
        if !notouch && !self.save_in_progress() {
            obj.touch(self.lru_clock);
        }
        Some(obj.clone())
    }

    pub(super) fn new_object(&self, value: Value) -> ObjectRef {
        Rc::new(RedisObject::new(value, self.lru_clock))
    }

    pub(super) fn db_add(&mut self, db: usize, key: Bytes, value: Value) {
        let obj = self.new_object(value);
        self.dbs[db].add(key.clone(), obj);
        self.signal_modified_key(db, &key);
    }

    pub(super) fn db_overwrite(&mut self, db: usize, key: &[u8], value: Value) {
        let obj = self.new_object(value);
        self.dbs[db].overwrite(key, obj);
        self.signal_modified_key(db, key);
    }

    pub(super) fn db_delete(&mut self, db: usize, key: &[u8]) -> bool {
        let deleted = self.dbs[db].delete(key);
        if deleted {
            self.signal_modified_key(db, key);
        }
        self.dbs[db].verify_invariants();
        deleted
    }

    /// SET semantics: add or overwrite, drop any expiry.
    pub(super) fn set_key(&mut self, db: usize, key: Bytes, value: Value) {
        if self.lookup_write(db, &key).is_none() {
            self.db_add(db, key.clone(), value);
        } else {
            self.db_overwrite(db, &key, value);
        }
        self.dbs[db].remove_expire(&key);
    }

    /// Remove an aggregate that a write left empty.
    pub(super) fn delete_if_empty(&mut self, db: usize, key: &[u8]) -> bool {
        let empty = self.dbs[db]
            .get(key)
            .map_or(false, |o| o.value().is_empty_aggregate());
        if empty {
            self.db_delete(db, key);
            self.notify(NotifyFlags::GENERIC, "del", key, db);
        }
        empty
    }

    /// Invalidate every transaction watching `key`.
    pub(super) fn signal_modified_key(&mut self, db: usize, key: &[u8]) {
        let Some(watchers) = self.dbs[db].watchers(key) else {
            return;
        };
        for id in watchers {
            if let Some(client) = self.clients.get_mut(id) {
                client.flags.insert(ClientFlags::DIRTY_CAS);
            }
        }
    }

    /// Before flushing `db` (or every db when `None`), invalidate watchers
    /// of keys that exist there.
    pub(super) fn signal_flushed_db(&mut self, db: Option<usize>) {
        for client in self.clients.values_mut() {
            let touched = client.watched_keys.iter().any(|(d, key)| {
                db.map_or(true, |target| *d == target) && self.dbs[*d].contains(key)
            });
            if touched {
                client.flags.insert(ClientFlags::DIRTY_CAS);
            }
        }
    }

    pub(super) fn notify(&mut self, class: NotifyFlags, event: &str, key: &[u8], db: usize) {
        notify_keyspace_event(&mut *self.publisher, self.notify_flags, class, event, key, db);
    }

    /// Queue an extra operation to propagate after the current command.
    pub(super) fn also_propagate(&mut self, name: &str, db: usize, argv: Vec<Bytes>) {
        let cmd = self.commands.original(name);
        self.also_propagate.push(PendingOp {
            cmd,
            dbid: db,
            argv,
            targets: PropagateTargets::BOTH,
        });
    }

    /// Replace the command's own propagation with `also_propagate` output.
    pub(super) fn prevent_propagation(&mut self, c: ClientId) {
        self.client_state_mut(c).flags.insert(ClientFlags::PREVENT_PROP);
    }

    pub(super) fn force_propagation(&mut self, c: ClientId, targets: PropagateTargets) {
        let client = self.client_state_mut(c);
        if targets.contains(PropagateTargets::AOF) {
            client.flags.insert(ClientFlags::FORCE_AOF);
        }
        if targets.contains(PropagateTargets::REPL) {
            client.flags.insert(ClientFlags::FORCE_REPL);
        }
    }

    /// Absolute time for expiry decisions: frozen while a command runs.
    pub(super) fn mstime(&self) -> i64 {
        if self.call_depth > 0 {
            self.cmd_time_ms
        } else {
            self.clock.now_ms()
        }
    }
}
