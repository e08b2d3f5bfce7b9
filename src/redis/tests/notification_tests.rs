//! Keyspace notification tests - channel shapes, class filtering and the
//! events each command family emits

use super::{int, TestServer};

/// Published (channel, payload) pairs since the last call.
fn events(t: &TestServer) -> Vec<(String, String)> {
    t.publisher
        .take()
        .into_iter()
        .map(|n| {
            (
                String::from_utf8_lossy(&n.channel).into_owned(),
                String::from_utf8_lossy(&n.payload).into_owned(),
            )
        })
        .collect()
}

/// Event names only, from a keyevent-only configuration.
fn event_names(t: &TestServer) -> Vec<String> {
    events(t)
        .into_iter()
        .map(|(channel, _)| {
            channel
                .rsplit_once(':')
                .map(|(_, event)| event.to_string())
                .unwrap_or(channel)
        })
        .collect()
}

fn pair(channel: &str, payload: &str) -> (String, String) {
    (channel.to_string(), payload.to_string())
}

#[test]
fn test_disabled_by_default() {
    let mut t = TestServer::new();
    t.cmd(&["SET", "k", "v"]);
    t.cmd(&["DEL", "k"]);
    assert!(t.publisher.is_empty());
}

#[test]
fn test_keyspace_and_keyevent_channels() {
    let mut t = TestServer::with_notifications("KEA");
    t.cmd(&["SET", "k", "v"]);
    assert_eq!(
        events(&t),
        vec![
            pair("__keyspace@0__:k", "set"),
            pair("__keyevent@0__:set", "k"),
        ]
    );

    t.cmd(&["SELECT", "5"]);
    t.cmd(&["LPUSH", "queue", "job"]);
    assert_eq!(
        events(&t),
        vec![
            pair("__keyspace@5__:queue", "lpush"),
            pair("__keyevent@5__:lpush", "queue"),
        ]
    );
}

#[test]
fn test_class_filtering() {
    let mut t = TestServer::with_notifications("Kl");
    t.cmd(&["SET", "s", "v"]);
    t.cmd(&["SADD", "set", "m"]);
    assert!(t.publisher.is_empty());
    t.cmd(&["RPUSH", "list", "a"]);
    assert_eq!(events(&t), vec![pair("__keyspace@0__:list", "rpush")]);

    // A channel type with no event class publishes nothing.
    let mut t = TestServer::with_notifications("KE");
    t.cmd(&["SET", "k", "v"]);
    t.cmd(&["DEL", "k"]);
    assert!(t.publisher.is_empty());

    // An event class with no channel type publishes nothing either.
    let mut t = TestServer::with_notifications("A");
    t.cmd(&["SET", "k", "v"]);
    assert!(t.publisher.is_empty());
}

#[test]
fn test_del_notifies_only_removed_keys() {
    let mut t = TestServer::with_notifications("Eg");
    t.cmd(&["SET", "k1", "v"]);
    assert!(t.publisher.is_empty());
    t.cmd(&["DEL", "k1", "k2"]);
    assert_eq!(events(&t), vec![pair("__keyevent@0__:del", "k1")]);
}

#[test]
fn test_string_events() {
    let mut t = TestServer::with_notifications("E$g");
    t.cmd(&["SET", "k", "v", "EX", "10"]);
    t.cmd(&["APPEND", "k", "x"]);
    t.cmd(&["INCR", "n"]);
    t.cmd(&["MSET", "a", "1", "b", "2"]);
    assert_eq!(
        event_names(&t),
        vec!["set", "expire", "append", "incrby", "set", "set"]
    );
}

#[test]
fn test_generic_events() {
    let mut t = TestServer::with_notifications("Eg");
    t.cmd(&["SET", "a", "1"]);
    t.cmd(&["RENAME", "a", "b"]);
    assert_eq!(
        events(&t),
        vec![
            pair("__keyevent@0__:rename_from", "a"),
            pair("__keyevent@0__:rename_to", "b"),
        ]
    );

    t.cmd(&["EXPIRE", "b", "100"]);
    t.cmd(&["PERSIST", "b"]);
    t.cmd(&["EXPIRE", "b", "-1"]);
    assert_eq!(event_names(&t), vec!["expire", "persist", "del"]);
    assert_eq!(t.cmd(&["EXISTS", "b"]), int(0));
}

#[test]
fn test_expired_event_on_lazy_expiry() {
    let mut t = TestServer::with_notifications("Ex");
    t.cmd(&["SET", "k", "v", "PX", "10"]);
    assert!(t.publisher.is_empty());

    t.clock.advance_ms(11);
    t.cmd(&["GET", "k"]);
    assert_eq!(events(&t), vec![pair("__keyevent@0__:expired", "k")]);
}

#[test]
fn test_expired_event_on_active_expiry() {
    let mut t = TestServer::with_notifications("Kx");
    t.cmd(&["SET", "k", "v", "PX", "10"]);
    t.clock.advance_ms(20);
    t.server.server_cron();
    assert_eq!(events(&t), vec![pair("__keyspace@0__:k", "expired")]);
}

#[test]
fn test_aggregate_emptied_notifies_del() {
    let mut t = TestServer::with_notifications("Elshzg");
    t.cmd(&["RPUSH", "l", "a"]);
    t.cmd(&["LPOP", "l"]);
    assert_eq!(event_names(&t), vec!["rpush", "lpop", "del"]);

    t.cmd(&["SADD", "s", "a", "b"]);
    t.cmd(&["SREM", "s", "a", "b"]);
    assert_eq!(event_names(&t), vec!["sadd", "srem", "del"]);

    t.cmd(&["HSET", "h", "f", "v"]);
    t.cmd(&["HDEL", "h", "f"]);
    assert_eq!(event_names(&t), vec!["hset", "hdel", "del"]);

    t.cmd(&["ZADD", "z", "1", "m"]);
    t.cmd(&["ZREM", "z", "m"]);
    assert_eq!(event_names(&t), vec!["zadd", "zrem", "del"]);
}

#[test]
fn test_noop_writes_do_not_notify() {
    let mut t = TestServer::with_notifications("EA");
    t.cmd(&["SADD", "s", "a"]);
    t.publisher.take();

    t.cmd(&["SADD", "s", "a"]);
    t.cmd(&["SREM", "s", "missing"]);
    t.cmd(&["DEL", "nothing"]);
    t.cmd(&["PERSIST", "s"]);
    t.cmd(&["SET", "s2", "v", "NX"]);
    t.cmd(&["SET", "s2", "v2", "NX"]);
    assert_eq!(events(&t), vec![pair("__keyevent@0__:set", "s2")]);
}

#[test]
fn test_spop_events() {
    let mut t = TestServer::with_notifications("Esg");
    t.cmd(&["SADD", "s", "a", "b"]);
    t.publisher.take();
    t.cmd(&["SPOP", "s"]);
    assert_eq!(event_names(&t), vec!["spop"]);
    t.cmd(&["SPOP", "s", "5"]);
    assert_eq!(event_names(&t), vec!["spop", "del"]);
}

#[test]
fn test_sort_store_event() {
    let mut t = TestServer::with_notifications("El");
    t.cmd(&["RPUSH", "src", "2", "1"]);
    t.publisher.take();
    t.cmd(&["SORT", "src", "STORE", "dst"]);
    assert_eq!(events(&t), vec![pair("__keyevent@0__:sortstore", "dst")]);
}
