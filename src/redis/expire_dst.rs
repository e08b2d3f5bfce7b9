//! Deterministic Simulation Testing for key expiration
//!
//! Drives a `Server` on a `ManualClock` with a random mix of writes, reads,
//! TTL changes, clock jumps and cron ticks, and checks it against a shadow
//! map of values and deadlines:
//!
//! - A key is visible exactly while `now <= deadline`, whether or not it has
//!   been reclaimed yet
//! - Lazy and active expiry only ever delete keys whose deadline has passed
//! - Every expired key is announced once and counted once in `expired_keys`
//! - PTTL reports the remaining time against the shadow deadline
//! - The expiry table never holds more keys than the main table

use super::client::ClientId;
use super::notify::InMemoryPublisher;
use super::propagate::InMemorySink;
use super::resp::RespValue;
use super::server::Server;
use crate::clock::{Clock, ManualClock};
use crate::config::ServerConfig;
use crate::simulator::DeterministicRng;
use ahash::AHashMap;
use bytes::Bytes;

const START_MS: i64 = 1_700_000_000_000;

/// Configuration for Expiration DST
#[derive(Debug, Clone)]
pub struct ExpireDSTConfig {
    pub seed: u64,
    pub num_keys: usize,
    /// Upper bound for generated TTLs, in milliseconds.
    pub max_ttl_ms: u64,
    /// Upper bound for one clock jump, in milliseconds.
    pub max_advance_ms: u64,
    /// Probability that a write carries a TTL.
    pub ttl_prob: f64,
    /// Probability of a cron tick per step.
    pub cron_prob: f64,
}

impl Default for ExpireDSTConfig {
    fn default() -> Self {
        ExpireDSTConfig {
            seed: 0,
            num_keys: 50,
            max_ttl_ms: 2_000,
            max_advance_ms: 500,
            ttl_prob: 0.6,
            cron_prob: 0.15,
        }
    }
}

impl ExpireDSTConfig {
    pub fn new(seed: u64) -> Self {
        ExpireDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Short TTLs and long jumps: most keys die between two touches.
    pub fn churn(seed: u64) -> Self {
        ExpireDSTConfig {
            seed,
            num_keys: 200,
            max_ttl_ms: 300,
            max_advance_ms: 400,
            ttl_prob: 0.9,
            cron_prob: 0.3,
        }
    }

    /// Few keys, long TTLs: lazy expiry on hot keys.
    pub fn hot_keys(seed: u64) -> Self {
        ExpireDSTConfig {
            seed,
            num_keys: 5,
            max_ttl_ms: 5_000,
            max_advance_ms: 200,
            ttl_prob: 0.5,
            cron_prob: 0.05,
        }
    }
}

/// Operation type for logging
#[derive(Debug, Clone)]
pub enum ExpireOp {
    Set(String),
    SetPx(String, u64),
    PExpire(String, i64),
    Persist(String),
    Get(String),
    PTtl(String),
    Del(String),
    Advance(u64),
    Cron,
}

/// Result of an Expiration DST run
#[derive(Debug, Clone)]
pub struct ExpireDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub writes: u64,
    pub reads: u64,
    pub clock_jumps: u64,
    pub cron_ticks: u64,
    /// Keys reclaimed lazily or by the active cycle.
    pub keys_expired: u64,
    pub invariant_violations: Vec<String>,
    pub last_op: Option<ExpireOp>,
}

impl ExpireDSTResult {
    pub fn new(seed: u64) -> Self {
        ExpireDSTResult {
            seed,
            total_operations: 0,
            writes: 0,
            reads: 0,
            clock_jumps: 0,
            cron_ticks: 0,
            keys_expired: 0,
            invariant_violations: Vec::new(),
            last_op: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops (writes:{}, reads:{}, jumps:{}, cron:{}, expired:{}), {} violations",
            self.seed,
            self.total_operations,
            self.writes,
            self.reads,
            self.clock_jumps,
            self.cron_ticks,
            self.keys_expired,
            self.invariant_violations.len()
        )
    }
}

#[derive(Debug, Clone)]
struct ShadowEntry {
    value: Vec<u8>,
    deadline: Option<i64>,
}

/// DST harness for lazy and active expiration
pub struct ExpireDSTHarness {
    config: ExpireDSTConfig,
    rng: DeterministicRng,
    clock: ManualClock,
    server: Server,
    publisher: InMemoryPublisher,
    client: ClientId,
    shadow: AHashMap<String, ShadowEntry>,
    result: ExpireDSTResult,
}

impl ExpireDSTHarness {
    pub fn new(config: ExpireDSTConfig) -> Self {
        let clock = ManualClock::new(START_MS);
        let publisher = InMemoryPublisher::new();
        let mut server_config = ServerConfig::test();
        server_config.seed = Some(config.seed);
        server_config.notify_keyspace_events = "Ex".to_string();
        let mut server = match Server::builder(server_config)
            .clock(clock.clone())
            .sink(InMemorySink::new())
            .publisher(publisher.clone())
            .build()
        {
            Ok(server) => server,
            Err(e) => panic!("test config rejected: {}", e),
        };
        let client = server.create_client();
        ExpireDSTHarness {
            rng: DeterministicRng::new(config.seed),
            result: ExpireDSTResult::new(config.seed),
            shadow: AHashMap::new(),
            config,
            clock,
            server,
            publisher,
            client,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(ExpireDSTConfig::new(seed))
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn random_key(&mut self) -> String {
        let idx = self.rng.gen_range(0, self.config.num_keys as u64);
        format!("exkey:{}", idx)
    }

    fn random_value(&mut self) -> Vec<u8> {
        format!("exval:{}", self.rng.gen_range(0, 1000)).into_bytes()
    }

    fn random_ttl(&mut self) -> u64 {
        self.rng.gen_range(1, self.config.max_ttl_ms + 1)
    }

    fn exec(&mut self, args: &[&[u8]]) -> RespValue {
        let argv = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        self.server.process_command(self.client, argv)
    }

    /// Live according to the shadow at the current time.
    fn shadow_live(&self, key: &str) -> Option<&ShadowEntry> {
        let now = self.now();
        self.shadow
            .get(key)
            .filter(|e| e.deadline.map_or(true, |when| now <= when))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn run_single_op(&mut self) {
        self.publisher.take();

        let roll = self.rng.gen_range(0, 100);
        let cron_threshold = (self.config.cron_prob * 100.0) as u64;
        if roll < cron_threshold {
            self.op_cron();
        } else if roll < cron_threshold + 15 {
            self.op_advance();
        } else {
            let key = self.random_key();
            match self.rng.gen_range(0, 8) {
                0 | 1 => self.op_set(&key),
                2 => self.op_pexpire(&key),
                3 => self.op_persist(&key),
                4 | 5 => self.op_get(&key),
                6 => self.op_pttl(&key),
                _ => self.op_del(&key),
            }
        }

        self.check_expired_accounting();
        self.check_tables();
    }

    fn op_set(&mut self, key: &str) {
        self.result.writes += 1;
        let value = self.random_value();
        let ttl = self.rng.gen_bool(self.config.ttl_prob).then(|| self.random_ttl());
        let resp = match ttl {
            Some(ms) => {
                self.result.last_op = Some(ExpireOp::SetPx(key.to_string(), ms));
                let ms = ms.to_string();
                self.exec(&[b"SET", key.as_bytes(), &value, b"PX", ms.as_bytes()])
            }
            None => {
                self.result.last_op = Some(ExpireOp::Set(key.to_string()));
                self.exec(&[b"SET", key.as_bytes(), &value])
            }
        };
        self.reap_expired_notifications();
        if resp != RespValue::ok() {
            self.violation(&format!("SET returned {:?}", resp));
            return;
        }
        let deadline = ttl.map(|ms| self.now() + ms as i64);
        self.shadow
            .insert(key.to_string(), ShadowEntry { value, deadline });
    }

    /// PEXPIRE with a TTL that is sometimes already in the past.
    fn op_pexpire(&mut self, key: &str) {
        self.result.writes += 1;
        let ttl = if self.rng.gen_bool(0.2) {
            -(self.rng.gen_range(0, 100) as i64)
        } else {
            self.random_ttl() as i64
        };
        self.result.last_op = Some(ExpireOp::PExpire(key.to_string(), ttl));
        let live = self.shadow_live(key).is_some();
        let ttl_arg = ttl.to_string();
        let resp = self.exec(&[b"PEXPIRE", key.as_bytes(), ttl_arg.as_bytes()]);
        self.reap_expired_notifications();

        let expected = RespValue::Integer(live as i64);
        if resp != expected {
            self.violation(&format!("PEXPIRE returned {:?}, expected {:?}", resp, expected));
            return;
        }
        if !live {
            return;
        }
        if ttl <= 0 {
            self.shadow.remove(key);
        } else if let Some(entry) = self.shadow.get_mut(key) {
            entry.deadline = Some(self.clock.now_ms() + ttl);
        }
    }

    fn op_persist(&mut self, key: &str) {
        self.result.writes += 1;
        self.result.last_op = Some(ExpireOp::Persist(key.to_string()));
        let had_ttl = self.shadow_live(key).map_or(false, |e| e.deadline.is_some());
        let resp = self.exec(&[b"PERSIST", key.as_bytes()]);
        self.reap_expired_notifications();
        let expected = RespValue::Integer(had_ttl as i64);
        if resp != expected {
            self.violation(&format!("PERSIST returned {:?}, expected {:?}", resp, expected));
            return;
        }
        if let Some(entry) = self.shadow.get_mut(key) {
            if had_ttl {
                entry.deadline = None;
            }
        }
    }

    fn op_get(&mut self, key: &str) {
        self.result.reads += 1;
        self.result.last_op = Some(ExpireOp::Get(key.to_string()));
        let expected = match self.shadow_live(key) {
            Some(entry) => RespValue::bulk(&entry.value),
            None => RespValue::nil(),
        };
        let resp = self.exec(&[b"GET", key.as_bytes()]);
        self.reap_expired_notifications();
        if resp != expected {
            self.violation(&format!("GET {} returned {:?}, expected {:?}", key, resp, expected));
        }
    }

    fn op_pttl(&mut self, key: &str) {
        self.result.reads += 1;
        self.result.last_op = Some(ExpireOp::PTtl(key.to_string()));
        let now = self.now();
        let expected = match self.shadow_live(key) {
            None => -2,
            Some(ShadowEntry { deadline: None, .. }) => -1,
            Some(ShadowEntry {
                deadline: Some(when),
                ..
            }) => when - now,
        };
        let resp = self.exec(&[b"PTTL", key.as_bytes()]);
        self.reap_expired_notifications();
        if resp != RespValue::Integer(expected) {
            self.violation(&format!("PTTL {} returned {:?}, expected {}", key, resp, expected));
        }
    }

    fn op_del(&mut self, key: &str) {
        self.result.writes += 1;
        self.result.last_op = Some(ExpireOp::Del(key.to_string()));
        let live = self.shadow_live(key).is_some();
        let resp = self.exec(&[b"DEL", key.as_bytes()]);
        self.reap_expired_notifications();
        if resp != RespValue::Integer(live as i64) {
            self.violation(&format!("DEL returned {:?}, live={}", resp, live));
        }
        self.shadow.remove(key);
    }

    fn op_advance(&mut self) {
        let ms = self.rng.gen_range(1, self.config.max_advance_ms + 1);
        self.result.last_op = Some(ExpireOp::Advance(ms));
        self.result.clock_jumps += 1;
        self.clock.advance_ms(ms);
    }

    fn op_cron(&mut self) {
        self.result.last_op = Some(ExpireOp::Cron);
        self.result.cron_ticks += 1;
        self.server.server_cron();
        self.server.before_sleep();
        self.reap_expired_notifications();

        // The active cycle must leave every live key in place.
        let live: Vec<String> = self
            .shadow
            .keys()
            .filter(|k| self.shadow_live(k).is_some())
            .cloned()
            .collect();
        for key in live {
            if !self.server.db(0).contains(key.as_bytes()) {
                self.violation(&format!("active expire removed live key {}", key));
            }
        }
    }

    // =========================================================================
    // Invariant Checks
    // =========================================================================

    /// Match `expired` events against the shadow: each must name a key whose
    /// deadline has passed. Matching entries leave the shadow.
    fn reap_expired_notifications(&mut self) {
        let now = self.now();
        for n in self.publisher.take() {
            if n.channel.as_ref() != b"__keyevent@0__:expired" {
                continue;
            }
            self.result.keys_expired += 1;
            let key = String::from_utf8_lossy(&n.payload).into_owned();
            match self.shadow.get(&key).and_then(|e| e.deadline) {
                Some(when) if now > when => {
                    self.shadow.remove(&key);
                }
                Some(when) => self.violation(&format!(
                    "{} expired at {} but its deadline is {}",
                    key, now, when
                )),
                None => self.violation(&format!("{} expired without a deadline", key)),
            }
        }
    }

    /// Every expiry is counted once and announced once.
    fn check_expired_accounting(&mut self) {
        let counted = self.server.stats().expired_keys;
        if counted != self.result.keys_expired {
            self.violation(&format!(
                "expired_keys is {} but {} expired events were published",
                counted, self.result.keys_expired
            ));
        }
    }

    fn check_tables(&mut self) {
        let now = self.now();
        let db = self.server.db(0);
        let mut problems = Vec::new();
        if db.expires_len() > db.len() {
            problems.push(format!(
                "{} keys with expiry but only {} keys",
                db.expires_len(),
                db.len()
            ));
        }
        // Keys the shadow already dropped must not linger as live keys.
        for key in db.keys() {
            let name = String::from_utf8_lossy(key).into_owned();
            let live = db.get_expire(key).map_or(true, |when| now <= when);
            if live && !self.shadow.contains_key(&name) {
                problems.push(format!("{} is stored but was deleted or expired", name));
            }
        }
        for msg in problems {
            self.violation(&msg);
        }
    }

    fn violation(&mut self, msg: &str) {
        self.result.invariant_violations.push(format!(
            "Op #{} at {}ms: {:?} - {}",
            self.result.total_operations,
            self.clock.now_ms() - START_MS,
            self.result.last_op,
            msg
        ));
    }

    // =========================================================================
    // Public API
    // =========================================================================

    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.result.total_operations += 1;
            self.run_single_op();
            if !self.result.invariant_violations.is_empty() {
                break;
            }
        }
    }

    /// Jump past every deadline and read each shadow key back: nothing with
    /// a deadline may still be visible.
    pub fn drain(&mut self) {
        self.clock.advance_ms(self.config.max_ttl_ms + 1);
        let keys: Vec<String> = self.shadow.keys().cloned().collect();
        for key in keys {
            self.result.total_operations += 1;
            self.op_get(&key);
        }
        if let Some((key, _)) = self.shadow.iter().find(|(_, e)| e.deadline.is_some()) {
            let key = key.clone();
            self.violation(&format!("{} outlived its deadline", key));
        }
    }

    pub fn result(&self) -> &ExpireDSTResult {
        &self.result
    }
}

/// Run a batch of expiration DST tests
pub fn run_expire_batch(
    start_seed: u64,
    num_seeds: usize,
    ops_per_seed: usize,
    config_fn: fn(u64) -> ExpireDSTConfig,
) -> Vec<ExpireDSTResult> {
    (0..num_seeds)
        .map(|i| {
            let seed = start_seed + i as u64;
            let mut harness = ExpireDSTHarness::new(config_fn(seed));
            harness.run(ops_per_seed);
            harness.drain();
            harness.result().clone()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_expire_batch(results: &[ExpireDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_expired: u64 = results.iter().map(|r| r.keys_expired).sum();

    let mut summary = format!(
        "Expiration DST Summary\n\
         ======================\n\
         Seeds: {} total, {} passed, {} failed\n\
         Total operations: {}\n\
         Keys expired: {}\n",
        total, passed, failed, total_ops, total_expired
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
