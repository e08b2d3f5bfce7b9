//! Transaction tests - MULTI/EXEC/DISCARD/WATCH, queue errors and the
//! propagation envelope

use super::{assert_err, bulk, int, TestServer};
use crate::redis::RespValue;

// ============================================
// MULTI / EXEC / DISCARD
// ============================================

#[test]
fn test_multi_exec_basic() {
    let mut t = TestServer::new();

    assert_eq!(t.cmd(&["MULTI"]), RespValue::ok());
    assert_eq!(t.cmd(&["SET", "foo", "bar"]), RespValue::queued());
    assert_eq!(t.cmd(&["INCR", "counter"]), RespValue::queued());
    assert_eq!(t.cmd(&["GET", "foo"]), RespValue::queued());

    // Nothing ran yet.
    assert!(t.server.db(0).is_empty());

    let result = t.cmd(&["EXEC"]);
    assert_eq!(
        result,
        RespValue::array(vec![RespValue::ok(), int(1), bulk("bar")])
    );
    assert_eq!(t.cmd(&["GET", "counter"]), bulk("1"));
}

#[test]
fn test_multi_discard() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "foo", "bar"]);
    assert_eq!(t.cmd(&["DISCARD"]), RespValue::ok());
    assert_eq!(t.cmd(&["GET", "foo"]), RespValue::nil());
    assert_err(&t.cmd(&["EXEC"]), "ERR EXEC without MULTI");
}

#[test]
fn test_transaction_control_errors() {
    let mut t = TestServer::new();
    assert_err(&t.cmd(&["EXEC"]), "ERR EXEC without MULTI");
    assert_err(&t.cmd(&["DISCARD"]), "ERR DISCARD without MULTI");

    t.cmd(&["MULTI"]);
    assert_err(&t.cmd(&["MULTI"]), "ERR MULTI calls can not be nested");
    assert_err(&t.cmd(&["WATCH", "k"]), "ERR WATCH inside MULTI is not allowed");
    // Neither error poisons the transaction.
    assert_eq!(t.cmd(&["SET", "k", "v"]), RespValue::queued());
    assert_eq!(t.cmd(&["EXEC"]), RespValue::array(vec![RespValue::ok()]));
}

#[test]
fn test_empty_transaction() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::empty_array());
    assert!(t.sink.is_empty());
}

#[test]
fn test_queue_error_aborts_exec() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "a", "1"]);
    assert_err(&t.cmd(&["NOSUCHCOMMAND"]), "ERR unknown command");
    assert_err(&t.cmd(&["GET"]), "ERR wrong number of arguments for 'get' command");
    t.cmd(&["SET", "b", "2"]);

    assert_err(&t.cmd(&["EXEC"]), "EXECABORT");
    assert!(t.server.db(0).is_empty());
    assert_eq!(t.server.dirty(), 0);
    assert!(!t.server.client(t.client).map_or(true, |c| c.in_multi()));
}

#[test]
fn test_runtime_errors_do_not_stop_exec() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "str", "x"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["LPUSH", "str", "item"]);
    t.cmd(&["SET", "after", "1"]);
    let result = t.cmd(&["EXEC"]);

    let RespValue::Array(Some(replies)) = result else {
        panic!("expected EXEC replies, got {:?}", result);
    };
    assert_eq!(replies.len(), 2);
    assert_err(&replies[0], "WRONGTYPE");
    assert_eq!(replies[1], RespValue::ok());
    assert_eq!(t.cmd(&["GET", "after"]), bulk("1"));
}

#[test]
fn test_exec_dirty_counts_queued_writes() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "a", "1"]);
    t.cmd(&["SET", "b", "2"]);
    t.cmd(&["INCR", "c"]);
    t.cmd(&["GET", "a"]);
    t.cmd(&["EXEC"]);
    assert_eq!(t.server.dirty(), 3);
}

// ============================================
// Propagation envelope
// ============================================

#[test]
fn test_exec_propagates_multi_envelope() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.cmd(&["GET", "a"]);
    t.cmd(&["SET", "a", "1"]);
    t.cmd(&["INCR", "b"]);
    t.cmd(&["EXEC"]);

    assert_eq!(
        t.propagated(),
        vec![
            vec!["MULTI"],
            vec!["SET", "a", "1"],
            vec!["INCR", "b"],
            vec!["EXEC"],
        ]
    );
}

#[test]
fn test_read_only_transaction_propagates_nothing() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "a", "1"]);
    t.sink.take();

    t.cmd(&["MULTI"]);
    t.cmd(&["GET", "a"]);
    t.cmd(&["EXISTS", "a"]);
    t.cmd(&["EXEC"]);
    assert!(t.sink.is_empty());
}

#[test]
fn test_write_transaction_without_changes_still_closes_envelope() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.cmd(&["DEL", "missing"]);
    t.cmd(&["EXEC"]);

    let commands: Vec<&str> = t.sink.ops().iter().map(|op| op.command).collect();
    assert_eq!(commands, vec!["multi", "exec"]);
    assert_eq!(t.server.dirty(), 0);
}

#[test]
fn test_rewrites_inside_exec_stay_inside_envelope() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "k", "v"]);
    t.sink.take();

    t.cmd(&["MULTI"]);
    t.cmd(&["EXPIRE", "k", "100"]);
    t.cmd(&["EXEC"]);

    let ops = t.propagated();
    assert_eq!(ops.len(), 3);
    assert_eq!(ops[0], vec!["MULTI"]);
    assert_eq!(ops[1][0], "PEXPIREAT");
    assert_eq!(ops[2], vec!["EXEC"]);
}

// ============================================
// WATCH
// ============================================

#[test]
fn test_watch_conflict_aborts_exec() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["SET", "k", "1"]);

    assert_eq!(t.cmd(&["WATCH", "k"]), RespValue::ok());
    t.cmd_as(other, &["SET", "k", "2"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "3"]);
    t.sink.take();
    assert_eq!(t.cmd(&["EXEC"]), RespValue::null_array());

    assert_eq!(t.cmd(&["GET", "k"]), bulk("2"));
    assert!(t.sink.is_empty());
    assert!(t.server.db(0).watchers(b"k").is_none());
}

#[test]
fn test_watch_without_conflict() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["SET", "k", "1"]);
    t.cmd(&["WATCH", "k"]);
    t.cmd_as(other, &["GET", "k"]);
    t.cmd_as(other, &["SET", "unrelated", "x"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "3"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::array(vec![RespValue::ok()]));
    assert_eq!(t.cmd(&["GET", "k"]), bulk("3"));
}

#[test]
fn test_own_write_before_multi_aborts() {
    let mut t = TestServer::new();
    t.cmd(&["WATCH", "k"]);
    t.cmd(&["SET", "k", "mine"]);
    t.cmd(&["MULTI"]);
    t.cmd(&["GET", "k"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::null_array());
}

#[test]
fn test_watch_is_per_database() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["WATCH", "k"]);
    t.cmd_as(other, &["SELECT", "1"]);
    t.cmd_as(other, &["SET", "k", "elsewhere"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "here"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::array(vec![RespValue::ok()]));
}

#[test]
fn test_unwatch_forgets_conflicts() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["WATCH", "k"]);
    t.cmd_as(other, &["SET", "k", "2"]);
    assert_eq!(t.cmd(&["UNWATCH"]), RespValue::ok());

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "3"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::array(vec![RespValue::ok()]));
}

#[test]
fn test_flushdb_invalidates_watchers_of_existing_keys() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    let third = t.server.create_client();
    t.cmd(&["SET", "exists", "1"]);

    t.cmd(&["WATCH", "exists"]);
    t.cmd_as(third, &["WATCH", "missing"]);
    t.cmd_as(other, &["FLUSHDB"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["PING"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::null_array());

    t.cmd_as(third, &["MULTI"]);
    t.cmd_as(third, &["PING"]);
    assert_eq!(
        t.cmd_as(third, &["EXEC"]),
        RespValue::array(vec![RespValue::pong()])
    );
}

#[test]
fn test_expiry_of_watched_key_aborts() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["SET", "k", "v", "PX", "10"]);
    t.cmd(&["WATCH", "k"]);
    t.clock.advance_ms(20);
    // The read reclaims the key, which counts as a modification.
    t.cmd_as(other, &["GET", "k"]);

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "new"]);
    assert_eq!(t.cmd(&["EXEC"]), RespValue::null_array());
}

#[test]
fn test_watch_index_cleared_on_exec_and_free() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    t.cmd(&["WATCH", "a", "b", "a"]);
    t.cmd_as(other, &["WATCH", "a"]);
    assert_eq!(t.server.db(0).watchers(b"a").map(|w| w.len()), Some(2));
    assert_eq!(t.server.client(t.client).map(|c| c.watched_keys.len()), Some(2));

    t.cmd(&["MULTI"]);
    t.cmd(&["EXEC"]);
    assert_eq!(t.server.db(0).watchers(b"a").map(|w| w.len()), Some(1));
    assert!(t.server.db(0).watchers(b"b").is_none());

    t.server.free_client(other);
    assert_eq!(t.server.db(0).watched_keys().count(), 0);
}
