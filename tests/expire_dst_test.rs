//! Expiration Deterministic Simulation Tests
//!
//! Seeded runs of writes, TTL changes, reads, clock jumps and cron ticks
//! against a shadow of values and deadlines. Each run ends with a drain
//! that jumps past every deadline.

use redis_keyspace::redis::{
    run_expire_batch, summarize_expire_batch, ExpireDSTConfig, ExpireDSTHarness,
    ExpireDSTResult,
};

fn assert_all_passed(results: &[ExpireDSTResult], label: &str) {
    println!("{}", summarize_expire_batch(results));
    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, results.len(), "{}: every seed should pass", label);
}

#[test]
fn test_expire_dst_100_seeds_standard() {
    let results = run_expire_batch(0, 100, 300, ExpireDSTConfig::new);
    assert_all_passed(&results, "standard");
}

#[test]
fn test_expire_dst_100_seeds_churn() {
    let results = run_expire_batch(5000, 100, 300, ExpireDSTConfig::churn);
    assert_all_passed(&results, "churn");

    let expired: u64 = results.iter().map(|r| r.keys_expired).sum();
    assert!(expired > 100, "churn should reclaim many keys, got {}", expired);
}

#[test]
fn test_expire_dst_100_seeds_hot_keys() {
    let results = run_expire_batch(9000, 100, 300, ExpireDSTConfig::hot_keys);
    assert_all_passed(&results, "hot keys");
}

#[test]
fn test_expire_dst_stress_3000_ops() {
    let mut harness = ExpireDSTHarness::with_seed(2024);
    harness.run(3000);
    harness.drain();
    let result = harness.result();
    println!("3000 ops: {}", result.summary());
    assert!(result.is_success());
    assert!(result.cron_ticks > 0);
    assert!(result.clock_jumps > 0);
}

#[test]
fn test_expire_dst_active_cycle_alone() {
    // Every key carries a short TTL and jumps are long, so cron ticks find
    // plenty of dead keys to sample.
    let config = ExpireDSTConfig {
        seed: 31,
        num_keys: 500,
        max_ttl_ms: 100,
        max_advance_ms: 1_000,
        ttl_prob: 1.0,
        cron_prob: 0.4,
    };
    let mut harness = ExpireDSTHarness::new(config);
    harness.run(1000);
    harness.drain();
    let result = harness.result();
    println!("active cycle: {}", result.summary());
    assert!(result.is_success());
    assert!(result.keys_expired > 0);
}

#[test]
fn test_expire_dst_is_deterministic() {
    let run = |seed| {
        let mut harness = ExpireDSTHarness::new(ExpireDSTConfig::churn(seed));
        harness.run(400);
        harness.drain();
        harness.result().summary()
    };
    assert_eq!(run(808), run(808));
}

#[test]
#[ignore]
fn test_expire_dst_500_seeds() {
    let results = run_expire_batch(0, 500, 500, ExpireDSTConfig::new);
    assert_all_passed(&results, "500 seeds");
}
