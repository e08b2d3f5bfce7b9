//! Deterministic Simulation Testing for Transactions (MULTI/EXEC/WATCH)
//!
//! Shadow-state harness for transaction semantics on a real `Server`:
//! - MULTI/EXEC atomicity and reply shape
//! - WATCH invalidation by a second client, and UNWATCH clearing it
//! - DISCARD and the queue-error (EXECABORT) path
//! - Dirty accounting and the MULTI ... EXEC propagation envelope
//! - Watch index cleanup after every EXEC
//!
//! ## Design
//!
//! Two clients (`a` and `b`) share one server. `a` runs transactions while
//! `b` plays the concurrent writer. A shadow map holds the value every key
//! must have; each scenario checks replies, the shadow and the propagation
//! log, then records any mismatch as an invariant violation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! for seed in 0..100 {
//!     let mut harness = TransactionDSTHarness::with_seed(seed);
//!     harness.run(200);
//!     assert!(harness.result().is_success(), "Seed {} failed", seed);
//! }
//! ```

use super::client::ClientId;
use super::propagate::InMemorySink;
use super::resp::RespValue;
use super::server::Server;
use crate::config::ServerConfig;
use crate::simulator::DeterministicRng;
use ahash::AHashMap;
use bytes::Bytes;

/// Configuration for Transaction DST
#[derive(Debug, Clone)]
pub struct TransactionDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of unique keys
    pub num_keys: usize,
    /// Probability of a WATCH conflict scenario
    pub conflict_prob: f64,
    /// Probability of a DISCARD scenario
    pub discard_prob: f64,
    /// Probability of an error scenario (nested MULTI, queue errors, ...)
    pub error_prob: f64,
}

impl Default for TransactionDSTConfig {
    fn default() -> Self {
        TransactionDSTConfig {
            seed: 0,
            num_keys: 20,
            conflict_prob: 0.3,
            discard_prob: 0.15,
            error_prob: 0.1,
        }
    }
}

impl TransactionDSTConfig {
    pub fn new(seed: u64) -> Self {
        TransactionDSTConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn high_conflict(seed: u64) -> Self {
        TransactionDSTConfig {
            seed,
            num_keys: 5,
            conflict_prob: 0.6,
            discard_prob: 0.1,
            error_prob: 0.05,
        }
    }

    pub fn error_heavy(seed: u64) -> Self {
        TransactionDSTConfig {
            seed,
            error_prob: 0.3,
            discard_prob: 0.2,
            ..Default::default()
        }
    }
}

/// Operation type for logging
#[derive(Debug, Clone)]
pub enum TransactionOp {
    WatchExecNoConflict(String),
    WatchExecConflict(String),
    MultiExecSimple(String),
    DiscardAfterMulti(String),
    ErrorScenario(String),
    UnwatchThenExec(String),
}

/// Result of a Transaction DST run
#[derive(Debug, Clone)]
pub struct TransactionDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub watch_no_conflict: u64,
    pub watch_conflict: u64,
    pub simple_exec: u64,
    pub discards: u64,
    pub error_scenarios: u64,
    pub unwatch_scenarios: u64,
    pub invariant_violations: Vec<String>,
    pub last_op: Option<TransactionOp>,
}

impl TransactionDSTResult {
    pub fn new(seed: u64) -> Self {
        TransactionDSTResult {
            seed,
            total_operations: 0,
            watch_no_conflict: 0,
            watch_conflict: 0,
            simple_exec: 0,
            discards: 0,
            error_scenarios: 0,
            unwatch_scenarios: 0,
            invariant_violations: Vec::new(),
            last_op: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops (no_conflict:{}, conflict:{}, exec:{}, discard:{}, error:{}, unwatch:{}), {} violations",
            self.seed,
            self.total_operations,
            self.watch_no_conflict,
            self.watch_conflict,
            self.simple_exec,
            self.discards,
            self.error_scenarios,
            self.unwatch_scenarios,
            self.invariant_violations.len()
        )
    }
}

/// DST harness for transaction semantics
pub struct TransactionDSTHarness {
    config: TransactionDSTConfig,
    rng: DeterministicRng,
    server: Server,
    sink: InMemorySink,
    a: ClientId,
    b: ClientId,
    /// Expected value of every key that should exist.
    shadow: AHashMap<String, Vec<u8>>,
    result: TransactionDSTResult,
}

impl TransactionDSTHarness {
    pub fn new(config: TransactionDSTConfig) -> Self {
        let sink = InMemorySink::new();
        let mut server_config = ServerConfig::test();
        server_config.seed = Some(config.seed);
        let mut server = match Server::builder(server_config).sink(sink.clone()).build() {
            Ok(server) => server,
            Err(e) => panic!("test config rejected: {}", e),
        };
        let a = server.create_client();
        let b = server.create_client();
        TransactionDSTHarness {
            rng: DeterministicRng::new(config.seed),
            result: TransactionDSTResult::new(config.seed),
            shadow: AHashMap::new(),
            config,
            server,
            sink,
            a,
            b,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(TransactionDSTConfig::new(seed))
    }

    fn random_key(&mut self) -> String {
        let idx = self.rng.gen_range(0, self.config.num_keys as u64);
        format!("txkey:{}", idx)
    }

    fn random_value(&mut self) -> Vec<u8> {
        let idx = self.rng.gen_range(0, 100);
        format!("txval:{}", idx).into_bytes()
    }

    fn exec(&mut self, client: ClientId, args: &[&[u8]]) -> RespValue {
        let argv = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        self.server.process_command(client, argv)
    }

    /// SET outside any transaction, tracked in the shadow.
    fn set_now(&mut self, client: ClientId, key: &str, value: &[u8]) {
        let resp = self.exec(client, &[b"SET", key.as_bytes(), value]);
        self.assert_ok(&resp, "plain SET");
        self.shadow.insert(key.to_string(), value.to_vec());
    }

    // =========================================================================
    // Scenario Runners
    // =========================================================================

    fn run_single_op(&mut self) {
        let roll = self.rng.gen_range(0, 100);

        let error_threshold = (self.config.error_prob * 100.0) as u64;
        let discard_threshold = error_threshold + (self.config.discard_prob * 100.0) as u64;
        let conflict_threshold = discard_threshold + (self.config.conflict_prob * 100.0) as u64;

        if roll < error_threshold {
            self.run_error_scenario();
        } else if roll < discard_threshold {
            self.run_discard_scenario();
        } else if roll < conflict_threshold {
            self.run_watch_conflict_scenario();
        } else if roll < conflict_threshold + 15 {
            self.run_unwatch_scenario();
        } else if self.rng.gen_range(0, 2) == 0 {
            self.run_watch_no_conflict_scenario();
        } else {
            self.run_simple_exec_scenario();
        }
        self.check_watch_index();
    }

    /// WATCH + no mutation -> EXEC applies the queued write.
    fn run_watch_no_conflict_scenario(&mut self) {
        let key = self.random_key();
        let value = self.random_value();
        let new_value = self.random_value();

        self.result.last_op = Some(TransactionOp::WatchExecNoConflict(format!(
            "WATCH {} no-conflict",
            key
        )));
        self.result.watch_no_conflict += 1;

        let a = self.a;
        self.set_now(a, &key, &value);
        let resp = self.exec(a, &[b"WATCH", key.as_bytes()]);
        self.assert_ok(&resp, "WATCH should return OK");
        let resp = self.exec(a, &[b"MULTI"]);
        self.assert_ok(&resp, "MULTI should return OK");
        let resp = self.exec(a, &[b"SET", key.as_bytes(), &new_value]);
        self.assert_queued(&resp, "SET inside MULTI should be QUEUED");

        let resp = self.exec(a, &[b"EXEC"]);
        match &resp {
            RespValue::Array(Some(replies)) if replies.len() == 1 => {
                self.shadow.insert(key.clone(), new_value);
            }
            RespValue::Array(None) => {
                self.violation("EXEC returned a null array but nothing touched the key");
            }
            other => {
                self.violation(&format!("EXEC returned unexpected: {:?}", other));
            }
        }
        self.check_key(&key, "after uncontended EXEC");
    }

    /// WATCH, then client `b` writes the key -> EXEC returns a null array
    /// and runs nothing.
    fn run_watch_conflict_scenario(&mut self) {
        let key = self.random_key();
        let value = self.random_value();
        let mut conflict_value = self.random_value();
        if conflict_value == value {
            conflict_value.extend_from_slice(b"_conflict");
        }
        let new_value = self.random_value();

        self.result.last_op = Some(TransactionOp::WatchExecConflict(format!(
            "WATCH {} conflict",
            key
        )));
        self.result.watch_conflict += 1;

        let (a, b) = (self.a, self.b);
        self.set_now(a, &key, &value);
        let resp = self.exec(a, &[b"WATCH", key.as_bytes()]);
        self.assert_ok(&resp, "WATCH should return OK");

        self.set_now(b, &key, &conflict_value);

        let resp = self.exec(a, &[b"MULTI"]);
        self.assert_ok(&resp, "MULTI should return OK");
        let resp = self.exec(a, &[b"SET", key.as_bytes(), &new_value]);
        self.assert_queued(&resp, "SET inside MULTI should be QUEUED");

        let dirty_before = self.server.dirty();
        self.sink.take();
        let resp = self.exec(a, &[b"EXEC"]);
        if resp != RespValue::null_array() {
            self.violation(&format!(
                "EXEC after a conflicting write should be a null array, got {:?}",
                resp
            ));
        }
        if self.server.dirty() != dirty_before {
            self.violation("aborted EXEC changed the dirty counter");
        }
        if !self.sink.is_empty() {
            self.violation("aborted EXEC propagated something");
        }
        self.check_key(&key, "after aborted EXEC");
    }

    /// MULTI, two SETs, EXEC: two replies, dirty +2, and the propagation log
    /// is exactly MULTI, SET, SET, EXEC.
    fn run_simple_exec_scenario(&mut self) {
        let key1 = self.random_key();
        let key2 = self.random_key();
        let val1 = self.random_value();
        let val2 = self.random_value();

        self.result.last_op = Some(TransactionOp::MultiExecSimple(format!(
            "MULTI/EXEC {} {}",
            key1, key2
        )));
        self.result.simple_exec += 1;

        let a = self.a;
        let resp = self.exec(a, &[b"MULTI"]);
        self.assert_ok(&resp, "MULTI should return OK");
        let resp = self.exec(a, &[b"SET", key1.as_bytes(), &val1]);
        self.assert_queued(&resp, "first queued SET");
        let resp = self.exec(a, &[b"SET", key2.as_bytes(), &val2]);
        self.assert_queued(&resp, "second queued SET");

        let dirty_before = self.server.dirty();
        self.sink.take();
        let resp = self.exec(a, &[b"EXEC"]);
        match &resp {
            RespValue::Array(Some(replies)) => {
                if replies.len() != 2 {
                    self.violation(&format!("EXEC should return 2 replies, got {}", replies.len()));
                }
                self.shadow.insert(key1.clone(), val1);
                self.shadow.insert(key2.clone(), val2);
            }
            other => {
                self.violation(&format!("EXEC returned unexpected: {:?}", other));
            }
        }

        let dirty = self.server.dirty() - dirty_before;
        if dirty != 2 {
            self.violation(&format!("two queued writes raised dirty by {}", dirty));
        }
        let commands: Vec<&'static str> = self.sink.take().iter().map(|op| op.command).collect();
        if commands != ["multi", "set", "set", "exec"] {
            self.violation(&format!("unexpected propagation envelope {:?}", commands));
        }
        self.check_key(&key1, "after EXEC");
        self.check_key(&key2, "after EXEC");
    }

    /// MULTI, SET, DISCARD: nothing runs and EXEC afterwards is an error.
    fn run_discard_scenario(&mut self) {
        let key = self.random_key();
        let old_value = self.random_value();
        let new_value = self.random_value();

        self.result.last_op = Some(TransactionOp::DiscardAfterMulti(format!("DISCARD {}", key)));
        self.result.discards += 1;

        let a = self.a;
        self.set_now(a, &key, &old_value);
        let resp = self.exec(a, &[b"MULTI"]);
        self.assert_ok(&resp, "MULTI should return OK");
        let resp = self.exec(a, &[b"SET", key.as_bytes(), &new_value]);
        self.assert_queued(&resp, "queued SET before DISCARD");
        let resp = self.exec(a, &[b"DISCARD"]);
        self.assert_ok(&resp, "DISCARD should return OK");

        self.check_key(&key, "after DISCARD");
        let resp = self.exec(a, &[b"EXEC"]);
        self.assert_error_contains(&resp, "EXEC without MULTI", "EXEC after DISCARD");
    }

    fn run_error_scenario(&mut self) {
        let sub = self.rng.gen_range(0, 5);
        self.result.error_scenarios += 1;
        let a = self.a;

        match sub {
            0 => {
                self.result.last_op = Some(TransactionOp::ErrorScenario("nested MULTI".into()));
                let resp = self.exec(a, &[b"MULTI"]);
                self.assert_ok(&resp, "first MULTI");
                let resp = self.exec(a, &[b"MULTI"]);
                self.assert_error_contains(&resp, "nested", "nested MULTI");
                self.exec(a, &[b"DISCARD"]);
            }
            1 => {
                self.result.last_op =
                    Some(TransactionOp::ErrorScenario("EXEC without MULTI".into()));
                let resp = self.exec(a, &[b"EXEC"]);
                self.assert_error_contains(&resp, "EXEC without MULTI", "EXEC without MULTI");
            }
            2 => {
                self.result.last_op =
                    Some(TransactionOp::ErrorScenario("DISCARD without MULTI".into()));
                let resp = self.exec(a, &[b"DISCARD"]);
                self.assert_error_contains(&resp, "DISCARD without MULTI", "DISCARD without MULTI");
            }
            3 => {
                self.result.last_op =
                    Some(TransactionOp::ErrorScenario("WATCH inside MULTI".into()));
                let resp = self.exec(a, &[b"MULTI"]);
                self.assert_ok(&resp, "MULTI");
                let key = self.random_key();
                let resp = self.exec(a, &[b"WATCH", key.as_bytes()]);
                self.assert_error_contains(&resp, "WATCH inside MULTI", "WATCH inside MULTI");
                self.exec(a, &[b"DISCARD"]);
            }
            _ => {
                // A queue error poisons the whole transaction.
                self.result.last_op = Some(TransactionOp::ErrorScenario("queue error".into()));
                let key = self.random_key();
                let value = self.random_value();
                let resp = self.exec(a, &[b"MULTI"]);
                self.assert_ok(&resp, "MULTI");
                let resp = self.exec(a, &[b"SET", key.as_bytes(), &value]);
                self.assert_queued(&resp, "SET before the bad command");
                let resp = self.exec(a, &[b"NOSUCHCMD", key.as_bytes()]);
                self.assert_error_contains(&resp, "unknown command", "unknown command in MULTI");
                let dirty_before = self.server.dirty();
                let resp = self.exec(a, &[b"EXEC"]);
                self.assert_error_contains(&resp, "EXECABORT", "EXEC after a queue error");
                if self.server.dirty() != dirty_before {
                    self.violation("EXECABORT still ran queued commands");
                }
                self.check_key(&key, "after EXECABORT");
            }
        }
    }

    /// WATCH, UNWATCH, then a conflicting write: EXEC still succeeds.
    fn run_unwatch_scenario(&mut self) {
        let key = self.random_key();
        let value = self.random_value();
        let conflict_value = self.random_value();
        let new_value = self.random_value();

        self.result.last_op = Some(TransactionOp::UnwatchThenExec(format!(
            "UNWATCH then EXEC {}",
            key
        )));
        self.result.unwatch_scenarios += 1;

        let (a, b) = (self.a, self.b);
        self.set_now(a, &key, &value);
        self.exec(a, &[b"WATCH", key.as_bytes()]);
        let resp = self.exec(a, &[b"UNWATCH"]);
        self.assert_ok(&resp, "UNWATCH should return OK");
        self.set_now(b, &key, &conflict_value);

        let resp = self.exec(a, &[b"MULTI"]);
        self.assert_ok(&resp, "MULTI after UNWATCH");
        let resp = self.exec(a, &[b"SET", key.as_bytes(), &new_value]);
        self.assert_queued(&resp, "queued SET after UNWATCH");
        let resp = self.exec(a, &[b"EXEC"]);
        match &resp {
            RespValue::Array(Some(replies)) if replies.len() == 1 => {
                self.shadow.insert(key.clone(), new_value);
            }
            other => {
                self.violation(&format!("EXEC after UNWATCH returned {:?}", other));
            }
        }
        self.check_key(&key, "after UNWATCH + EXEC");
    }

    // =========================================================================
    // Invariant Checks
    // =========================================================================

    /// The stored value matches the shadow.
    fn check_key(&mut self, key: &str, context: &str) {
        let stored = self
            .server
            .db(0)
            .get(key.as_bytes())
            .and_then(|o| o.value().as_string().cloned());
        let expected = self.shadow.get(key).cloned();
        if stored.as_deref() != expected.as_deref() {
            self.violation(&format!(
                "{}: key {} holds {:?}, expected {:?}",
                context,
                key,
                stored.map(|s| String::from_utf8_lossy(&s).into_owned()),
                expected.map(|s| String::from_utf8_lossy(&s).into_owned())
            ));
        }
    }

    /// Outside a transaction `a` leaves no stale watch registrations behind
    /// once its scenario ends with EXEC, DISCARD or UNWATCH.
    fn check_watch_index(&mut self) {
        let a = self.a;
        let Some((in_multi, forward)) = self
            .server
            .client(a)
            .map(|client| (client.in_multi(), client.watched_keys.len()))
        else {
            self.violation("client a disappeared");
            return;
        };
        if in_multi {
            self.violation("client a left in MULTI after a scenario");
        }
        let db = self.server.db(0);
        let stale = db
            .watched_keys()
            .filter(|k| db.watchers(k).map_or(false, |w| w.contains(&a)))
            .count();
        if stale != forward {
            self.violation(&format!(
                "watch index out of sync: {} reverse entries, {} forward",
                stale, forward
            ));
        }
    }

    // =========================================================================
    // Assertion Helpers
    // =========================================================================

    fn violation(&mut self, msg: &str) {
        self.result.invariant_violations.push(format!(
            "Op #{}: {:?} - {}",
            self.result.total_operations, self.result.last_op, msg
        ));
    }

    fn assert_ok(&mut self, resp: &RespValue, context: &str) {
        if *resp != RespValue::ok() {
            self.violation(&format!("{}: expected OK, got {:?}", context, resp));
        }
    }

    fn assert_queued(&mut self, resp: &RespValue, context: &str) {
        if *resp != RespValue::queued() {
            self.violation(&format!("{}: expected QUEUED, got {:?}", context, resp));
        }
    }

    fn assert_error_contains(&mut self, resp: &RespValue, substring: &str, context: &str) {
        match resp {
            RespValue::Error(e) if e.contains(substring) => {}
            _ => {
                self.violation(&format!(
                    "{}: expected Error containing '{}', got {:?}",
                    context, substring, resp
                ));
            }
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Run the given number of scenarios, stopping at the first violation.
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.result.total_operations += 1;
            self.run_single_op();

            if !self.result.invariant_violations.is_empty() {
                break;
            }
        }
    }

    pub fn result(&self) -> &TransactionDSTResult {
        &self.result
    }
}

/// Run a batch of transaction DST tests
pub fn run_transaction_batch(
    start_seed: u64,
    num_seeds: usize,
    ops_per_seed: usize,
    config_fn: fn(u64) -> TransactionDSTConfig,
) -> Vec<TransactionDSTResult> {
    (0..num_seeds)
        .map(|i| {
            let seed = start_seed + i as u64;
            let mut harness = TransactionDSTHarness::new(config_fn(seed));
            harness.run(ops_per_seed);
            harness.result().clone()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_transaction_batch(results: &[TransactionDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();

    let mut summary = format!(
        "Transaction DST Summary\n\
         =======================\n\
         Seeds: {} total, {} passed, {} failed\n\
         Total operations: {}\n",
        total, passed, failed, total_ops
    );

    if failed > 0 {
        summary.push_str("\nFailed seeds:\n");
        for result in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("  Seed {}: {}\n", result.seed, result.summary()));
            for violation in &result.invariant_violations {
                summary.push_str(&format!("    - {}\n", violation));
            }
        }
    }

    summary
}
