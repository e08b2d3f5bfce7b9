//! Pipeline tests - validation gates, replica and persistence state,
//! accounting, propagation and the introspection commands

use super::{assert_err, bulk, int, TestServer, START_MS};
use crate::config::ServerConfig;
use crate::redis::{ClientId, RespValue, SaveKind, Server};
use bytes::Bytes;

fn text(resp: RespValue) -> String {
    match resp {
        RespValue::BulkString(Some(b)) => String::from_utf8(b).expect("utf8"),
        other => panic!("expected bulk string, got {:?}", other),
    }
}

// ============================================
// Lookup and validation gates
// ============================================

#[test]
fn test_unknown_command_and_arity() {
    let mut t = TestServer::new();
    assert_eq!(
        t.cmd(&["FOO", "bar"]),
        RespValue::Error("ERR unknown command 'FOO'".to_string())
    );
    assert_eq!(
        t.cmd(&["GET"]),
        RespValue::Error("ERR wrong number of arguments for 'get' command".to_string())
    );
    assert_err(&t.cmd(&["SET", "k"]), "ERR wrong number of arguments for 'set' command");
    assert_err(&t.cmd(&["GET", "a", "b"]), "ERR wrong number of arguments");
    assert_eq!(t.server.stats().numcommands, 0);
}

#[test]
fn test_command_names_are_case_insensitive() {
    let mut t = TestServer::new();
    assert_eq!(t.cmd(&["sEt", "k", "v"]), RespValue::ok());
    assert_eq!(t.cmd(&["get", "k"]), bulk("v"));
}

#[test]
fn test_auth_required() {
    let mut config = ServerConfig::test();
    config.requirepass = Some("secret".to_string());
    let mut t = TestServer::with_config(config);

    assert_eq!(
        t.cmd(&["GET", "k"]),
        RespValue::Error("NOAUTH Authentication required.".to_string())
    );
    assert_err(&t.cmd(&["AUTH", "wrong"]), "ERR invalid password");
    assert_err(&t.cmd(&["PING"]), "NOAUTH");
    assert_eq!(t.cmd(&["AUTH", "secret"]), RespValue::ok());
    assert_eq!(t.cmd(&["GET", "k"]), RespValue::nil());

    // A later failed AUTH logs the client out again.
    assert_err(&t.cmd(&["AUTH", "nope"]), "ERR invalid password");
    assert_err(&t.cmd(&["GET", "k"]), "NOAUTH");

    // Unknown commands are reported before authentication.
    assert_err(&t.cmd(&["NOPE"]), "ERR unknown command");
}

#[test]
fn test_auth_without_password() {
    let mut t = TestServer::new();
    assert_err(
        &t.cmd(&["AUTH", "x"]),
        "ERR Client sent AUTH, but no password is set",
    );
}

#[test]
fn test_oom_rejects_only_denyoom_commands() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "k", "v"]);
    t.server.set_memory_pressure(true);

    assert_eq!(
        t.cmd(&["SET", "k2", "v"]),
        RespValue::Error("OOM command not allowed when used memory > 'maxmemory'.".to_string())
    );
    assert_err(&t.cmd(&["RPUSH", "l", "a"]), "OOM");
    assert_eq!(t.cmd(&["GET", "k"]), bulk("v"));
    assert_eq!(t.cmd(&["DEL", "k"]), int(1));

    t.server.set_memory_pressure(false);
    assert_eq!(t.cmd(&["SET", "k2", "v"]), RespValue::ok());
}

#[test]
fn test_gate_errors_taint_open_transaction() {
    let mut t = TestServer::new();
    t.cmd(&["MULTI"]);
    t.server.set_memory_pressure(true);
    assert_err(&t.cmd(&["SET", "k", "v"]), "OOM");
    t.server.set_memory_pressure(false);
    t.cmd(&["SET", "j", "v"]);
    assert_err(&t.cmd(&["EXEC"]), "EXECABORT");
    assert!(t.server.db(0).is_empty());
}

#[test]
fn test_failed_bgsave_blocks_writes() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "k", "v"]);

    let task = t
        .server
        .start_background_save(SaveKind::Snapshot)
        .expect("no save running");
    assert!(t.server.save_in_progress());
    assert!(t.server.start_background_save(SaveKind::Snapshot).is_none());
    task.finish(false);
    t.server.server_cron();
    assert!(!t.server.last_bgsave_ok());
    assert!(!t.server.save_in_progress());

    assert_err(&t.cmd(&["SET", "k", "v2"]), "MISCONF Redis is configured to save RDB snapshots");
    assert_err(&t.cmd(&["PING"]), "MISCONF");
    assert_eq!(t.cmd(&["GET", "k"]), bulk("v"));
    assert!(t.server.info_string("persistence").contains("rdb_last_bgsave_status:err"));

    // A successful save clears the condition and the dirty counter.
    let task = t
        .server
        .start_background_save(SaveKind::Snapshot)
        .expect("no save running");
    task.finish(true);
    t.server.server_cron();
    assert!(t.server.last_bgsave_ok());
    assert_eq!(t.server.dirty(), 0);
    assert_eq!(t.cmd(&["SET", "k", "v2"]), RespValue::ok());
}

#[test]
fn test_failed_bgsave_ignored_without_save_points() {
    let mut config = ServerConfig::test();
    config.save_points.clear();
    let mut t = TestServer::with_config(config);
    if let Some(task) = t.server.start_background_save(SaveKind::Snapshot) {
        task.finish(false);
    }
    t.server.server_cron();
    assert!(!t.server.last_bgsave_ok());
    assert_eq!(t.cmd(&["SET", "k", "v"]), RespValue::ok());
}

#[test]
fn test_writes_during_save_are_kept_dirty() {
    let mut t = TestServer::new();
    t.cmd(&["MSET", "a", "1", "b", "2"]);
    let task = t
        .server
        .start_background_save(SaveKind::Snapshot)
        .expect("no save running");
    t.cmd(&["SET", "c", "3"]);
    task.finish(true);
    t.server.server_cron();
    assert_eq!(t.server.dirty(), 1);
}

#[test]
fn test_aof_write_error_blocks_writes() {
    let mut t = TestServer::new();
    t.server.record_aof_write_error("No space left on device");
    assert_eq!(
        t.cmd(&["SET", "k", "v"]),
        RespValue::Error("MISCONF Errors writing to the AOF file: No space left on device".to_string())
    );
    assert_eq!(t.cmd(&["GET", "k"]), RespValue::nil());
    t.server.clear_aof_write_error();
    assert_eq!(t.cmd(&["SET", "k", "v"]), RespValue::ok());
}

#[test]
fn test_read_only_replica() {
    let mut t = TestServer::new();
    let link = t.server.create_client();
    t.server.set_replica_of(Some(link));
    assert!(t.server.client(link).map_or(false, |c| c.is_master()));

    assert_eq!(
        t.cmd(&["SET", "k", "v"]),
        RespValue::Error("READONLY You can't write against a read only slave.".to_string())
    );
    assert_eq!(t.cmd_as(link, &["SET", "k", "v"]), RespValue::ok());
    assert_eq!(t.cmd(&["GET", "k"]), bulk("v"));
    assert!(t.server.info_string("replication").contains("role:slave"));

    t.server.set_replica_of(None);
    assert!(!t.server.client(link).map_or(true, |c| c.is_master()));
    assert_eq!(t.cmd(&["SET", "k", "mine"]), RespValue::ok());
}

#[test]
fn test_replica_of_unknown_link_is_ignored() {
    let mut t = TestServer::new();
    t.server.set_replica_of(Some(ClientId(9_999)));
    assert!(t.server.info_string("replication").contains("role:master"));
    assert_eq!(t.cmd(&["SET", "k", "v"]), RespValue::ok());

    let link = t.server.create_client();
    t.server.set_replica_of(Some(link));
    t.server.set_replica_of(Some(ClientId(9_999)));
    assert!(t.server.client(link).map_or(false, |c| c.is_master()));
    assert!(t.server.info_string("replication").contains("role:slave"));
    assert_eq!(t.cmd_as(link, &["SET", "k", "w"]), RespValue::ok());
}

#[test]
fn test_writable_replica() {
    let mut config = ServerConfig::test();
    config.replica_read_only = false;
    let mut t = TestServer::with_config(config);
    let link = t.server.create_client();
    t.server.set_replica_of(Some(link));
    assert_eq!(t.cmd(&["SET", "k", "v"]), RespValue::ok());
}

#[test]
fn test_loading_allows_only_load_safe_commands() {
    let mut t = TestServer::new();
    t.server.set_loading(true);
    assert_eq!(
        t.cmd(&["GET", "k"]),
        RespValue::Error("LOADING Redis is loading the dataset in memory".to_string())
    );
    assert_err(&t.cmd(&["PING"]), "LOADING");
    assert_eq!(t.cmd(&["SELECT", "2"]), RespValue::ok());
    assert!(text(t.cmd(&["INFO", "persistence"])).contains("loading:1"));

    t.server.set_loading(false);
    assert_eq!(t.cmd(&["PING"]), RespValue::pong());
}

#[test]
fn test_quit() {
    let mut t = TestServer::new();
    assert_eq!(t.cmd(&["QUIT"]), RespValue::ok());
    assert!(t.server.client(t.client).map_or(false, |c| c.close_after_reply()));
    assert_eq!(t.server.stats().numcommands, 0);
}

// ============================================
// Propagation
// ============================================

#[test]
fn test_only_changes_propagate() {
    let mut t = TestServer::new();
    t.cmd(&["GET", "k"]);
    t.cmd(&["DEL", "k"]);
    t.cmd(&["SET", "k", "v", "XX"]);
    assert!(t.sink.is_empty());

    t.cmd(&["SELECT", "4"]);
    t.cmd(&["SET", "k", "v"]);
    let ops = t.sink.take();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].command, "set");
    assert_eq!(ops[0].dbid, 4);
    assert_eq!(ops[0].args(), vec!["SET", "k", "v"]);
}

#[test]
fn test_spop_propagates_as_srem_or_del() {
    let mut t = TestServer::new();
    t.cmd(&["SADD", "s", "a", "b", "c"]);
    t.sink.take();

    let RespValue::BulkString(Some(member)) = t.cmd(&["SPOP", "s"]) else {
        panic!("SPOP should return a member");
    };
    let member = String::from_utf8(member).expect("utf8");
    assert_eq!(t.propagated(), vec![vec!["SREM".to_string(), "s".into(), member]]);

    t.sink.take();
    t.cmd(&["SPOP", "s", "1"]);
    let ops = t.propagated();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0][0], "SREM");

    t.sink.take();
    t.cmd(&["SPOP", "s", "1"]);
    assert_eq!(t.propagated(), vec![vec!["DEL", "s"]]);
}

#[test]
fn test_renamed_commands() {
    let mut config = ServerConfig::test();
    config.rename_commands.insert("set".to_string(), "put".to_string());
    config.rename_commands.insert("del".to_string(), String::new());
    let mut t = TestServer::with_config(config);

    assert_err(&t.cmd(&["SET", "k", "v"]), "ERR unknown command 'SET'");
    assert_err(&t.cmd(&["DEL", "k"]), "ERR unknown command 'DEL'");
    assert_eq!(t.cmd(&["PUT", "k", "v", "PX", "10"]), RespValue::ok());

    let ops = t.sink.take();
    assert_eq!(ops[0].command, "set");
    assert_eq!(ops[1].command, "pexpireat");

    // Internally generated DELs keep working with DEL removed.
    t.clock.advance_ms(20);
    assert_eq!(t.cmd(&["GET", "k"]), RespValue::nil());
    let ops = t.sink.take();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].command, "del");

    assert_eq!(
        t.cmd(&["COMMAND", "COUNT"]),
        int(t.server.commands().len() as i64)
    );
    assert!(t.server.commands().lookup(b"put").is_some());
}

#[test]
fn test_bad_rename_rejected() {
    let mut config = ServerConfig::test();
    config.rename_commands.insert("nosuchcmd".to_string(), "x".to_string());
    assert!(Server::new(config).is_err());

    let mut config = ServerConfig::test();
    config.rename_commands.insert("get".to_string(), "set".to_string());
    assert!(Server::new(config).is_err());
}

// ============================================
// Accounting
// ============================================

#[test]
fn test_time_frozen_during_exec() {
    let mut t = TestServer::new();
    t.clock.set_auto_advance_us(5_000);

    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "k", "v", "PX", "1"]);
    t.cmd(&["GET", "k"]);
    let reply = t.cmd(&["EXEC"]);
    assert_eq!(reply, RespValue::array(vec![RespValue::ok(), bulk("v")]));

    assert_eq!(t.cmd(&["GET", "k"]), RespValue::nil());
}

#[test]
fn test_slowlog_records_commands_but_not_exec() {
    let mut config = ServerConfig::test();
    config.slowlog.log_slower_than_us = 0;
    let mut t = TestServer::with_config(config);

    t.cmd(&["SET", "k", "v"]);
    t.cmd(&["GET", "k"]);
    assert_eq!(t.cmd(&["SLOWLOG", "LEN"]), int(2));

    let RespValue::Array(Some(entries)) = t.cmd(&["SLOWLOG", "GET", "1"]) else {
        panic!("SLOWLOG GET should return an array");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0],
        RespValue::array(vec![
            int(2),
            int(START_MS / 1000),
            int(0),
            RespValue::array(vec![bulk("SLOWLOG"), bulk("LEN")]),
        ])
    );

    assert_eq!(t.cmd(&["SLOWLOG", "RESET"]), RespValue::ok());
    t.cmd(&["MULTI"]);
    t.cmd(&["SET", "a", "1"]);
    t.cmd(&["EXEC"]);
    // RESET itself, MULTI and the SET run by EXEC.
    assert_eq!(t.server.slowlog().len(), 3);
    assert_err(&t.cmd(&["SLOWLOG", "BOGUS"]), "ERR Unknown SLOWLOG subcommand");
}

#[test]
fn test_slowlog_disabled() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "k", "v"]);
    assert!(t.server.slowlog().is_empty());
}

#[test]
fn test_commandstats() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "a", "1"]);
    t.cmd(&["SET", "b", "1"]);
    t.cmd(&["GET", "a"]);
    t.cmd(&["MULTI"]);
    t.cmd(&["GET", "b"]);
    t.cmd(&["EXEC"]);

    let info = text(t.cmd(&["INFO", "commandstats"]));
    assert!(info.starts_with("# Commandstats\r\n"));
    assert!(info.contains("cmdstat_set:calls=2,usec=0,usec_per_call=0.00\r\n"));
    assert!(info.contains("cmdstat_get:calls=2,"));
    assert!(info.contains("cmdstat_exec:calls=1,"));
    assert!(!info.contains("cmdstat_del"));

    let default = text(t.cmd(&["INFO"]));
    assert!(!default.contains("# Commandstats"));
    assert!(default.contains("# Keyspace\r\ndb0:keys=2,expires=0,avg_ttl=0\r\n"));
    assert!(text(t.cmd(&["INFO", "all"])).contains("# Commandstats"));

    // MULTI, EXEC and the command EXEC ran; the queued GET counts once.
    assert!(default.contains("total_commands_processed:7\r\n"));
}

#[test]
fn test_client_accounting() {
    let mut t = TestServer::new();
    let other = t.server.create_client();
    assert_eq!(t.server.num_clients(), 2);
    assert!(text(t.cmd(&["INFO", "clients"])).contains("connected_clients:2"));

    t.server.free_client(other);
    t.server.free_client(other);
    assert_eq!(t.server.num_clients(), 1);
    assert_eq!(t.server.stats().numconnections, 2);
}

#[test]
fn test_blocking_keys_become_ready_on_list_creation() {
    let mut t = TestServer::new();
    t.server.register_blocking_key(0, Bytes::from_static(b"queue"));
    t.cmd(&["SET", "queue2", "x"]);
    t.cmd(&["SADD", "queue", "not-a-list"]);
    assert!(t.server.take_ready_keys().is_empty());

    t.cmd(&["DEL", "queue"]);
    t.cmd(&["RPUSH", "queue", "job"]);
    assert_eq!(
        t.server.take_ready_keys(),
        vec![(0, Bytes::from_static(b"queue"))]
    );
    assert!(t.server.take_ready_keys().is_empty());

    t.server.unregister_blocking_key(0, b"queue");
    t.cmd(&["DEL", "queue"]);
    t.cmd(&["RPUSH", "queue", "job"]);
    assert!(t.server.take_ready_keys().is_empty());
}

// ============================================
// Introspection commands
// ============================================

#[test]
fn test_ping_echo_time() {
    let mut t = TestServer::new();
    assert_eq!(t.cmd(&["PING"]), RespValue::pong());
    assert_eq!(t.cmd(&["PING", "hello"]), bulk("hello"));
    assert_err(&t.cmd(&["PING", "a", "b"]), "ERR wrong number of arguments for 'ping' command");
    assert_eq!(t.cmd(&["ECHO", "x y"]), bulk("x y"));
    assert_eq!(
        t.cmd(&["TIME"]),
        RespValue::array(vec![bulk(&(START_MS / 1000).to_string()), bulk("0")])
    );
}

#[test]
fn test_command_introspection() {
    let mut t = TestServer::new();
    let count = t.server.commands().len();
    assert_eq!(t.cmd(&["COMMAND", "COUNT"]), int(count as i64));

    let RespValue::Array(Some(all)) = t.cmd(&["COMMAND"]) else {
        panic!("COMMAND should return an array");
    };
    assert_eq!(all.len(), count);

    let RespValue::Array(Some(info)) = t.cmd(&["COMMAND", "INFO", "get", "nosuch"]) else {
        panic!("COMMAND INFO should return an array");
    };
    assert_eq!(info.len(), 2);
    assert_eq!(info[1], RespValue::nil());
    let RespValue::Array(Some(get)) = &info[0] else {
        panic!("expected a command info entry");
    };
    assert_eq!(get[0], bulk("get"));
    assert_eq!(get[1], int(2));
    assert_eq!(&get[3..], &[int(1), int(1), int(1)]);

    assert_eq!(
        t.cmd(&["COMMAND", "GETKEYS", "MSET", "a", "1", "b", "2"]),
        RespValue::array(vec![bulk("a"), bulk("b")])
    );
    assert_eq!(
        t.cmd(&["COMMAND", "GETKEYS", "SORT", "src", "BY", "w_*", "STORE", "dst"]),
        RespValue::array(vec![bulk("src"), bulk("dst")])
    );
    assert_err(
        &t.cmd(&["COMMAND", "GETKEYS", "PING"]),
        "ERR Invalid arguments specified for command",
    );
    assert_err(
        &t.cmd(&["COMMAND", "GETKEYS", "GET"]),
        "ERR Invalid number of arguments specified for command",
    );
    assert_err(
        &t.cmd(&["COMMAND", "GETKEYS", "NOPE", "x"]),
        "ERR Invalid command specified",
    );
}

#[test]
fn test_info_sections() {
    let mut t = TestServer::new();
    let server = text(t.cmd(&["INFO", "server"]));
    assert!(server.starts_with("# Server\r\n"));
    assert!(server.contains(&format!("run_id:{}\r\n", t.server.run_id())));
    assert_eq!(t.server.run_id().len(), 40);
    assert!(t.server.run_id().chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!server.contains("# Clients"));

    assert_eq!(text(t.cmd(&["INFO", "nosuchsection"])), "");
    assert_err(&t.cmd(&["INFO", "a", "b"]), "ERR syntax error");
}
