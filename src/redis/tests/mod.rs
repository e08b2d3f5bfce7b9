//! Redis module tests
//!
//! Every test drives a real `Server` through `process_command`, with a
//! manual clock and in-memory propagation and notification logs.

mod notification_tests;
mod pipeline_tests;
mod transaction_tests;

use super::{ClientId, InMemoryPublisher, InMemorySink, RespValue, Server};
use crate::clock::ManualClock;
use crate::config::ServerConfig;
use bytes::Bytes;

pub(super) const START_MS: i64 = 1_000_000_000_000;

pub(super) struct TestServer {
    pub server: Server,
    pub clock: ManualClock,
    pub sink: InMemorySink,
    pub publisher: InMemoryPublisher,
    /// Default client used by `cmd`.
    pub client: ClientId,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::test())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let clock = ManualClock::new(START_MS);
        let sink = InMemorySink::new();
        let publisher = InMemoryPublisher::new();
        let mut server = Server::builder(config)
            .clock(clock.clone())
            .sink(sink.clone())
            .publisher(publisher.clone())
            .build()
            .expect("test config is valid");
        let client = server.create_client();
        TestServer {
            server,
            clock,
            sink,
            publisher,
            client,
        }
    }

    /// Notifications enabled for `classes`, e.g. `"KEA"`.
    pub fn with_notifications(classes: &str) -> Self {
        let mut config = ServerConfig::test();
        config.notify_keyspace_events = classes.to_string();
        Self::with_config(config)
    }

    pub fn cmd(&mut self, args: &[&str]) -> RespValue {
        let c = self.client;
        self.cmd_as(c, args)
    }

    pub fn cmd_as(&mut self, c: ClientId, args: &[&str]) -> RespValue {
        let argv = args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect();
        self.server.process_command(c, argv)
    }

    /// Propagated operations as argument lists.
    pub fn propagated(&self) -> Vec<Vec<String>> {
        self.sink.ops().iter().map(|op| op.args()).collect()
    }
}

pub(super) fn bulk(s: &str) -> RespValue {
    RespValue::bulk_str(s)
}

pub(super) fn int(n: i64) -> RespValue {
    RespValue::Integer(n)
}

pub(super) fn assert_err(resp: &RespValue, prefix: &str) {
    match resp {
        RespValue::Error(e) => assert!(
            e.starts_with(prefix),
            "expected error starting with {:?}, got {:?}",
            prefix,
            e
        ),
        other => panic!("expected error starting with {:?}, got {:?}", prefix, other),
    }
}
