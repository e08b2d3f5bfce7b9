//! Deterministic helpers for simulation tests.

mod rng;

pub use rng::DeterministicRng;
