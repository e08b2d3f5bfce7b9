//! Slow log: the most recent commands that exceeded a duration threshold.

use super::resp::RespValue;
use crate::config::SlowlogConfig;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::debug;

pub const SLOWLOG_ENTRY_MAX_ARGC: usize = 32;
pub const SLOWLOG_ENTRY_MAX_STRING: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowlogEntry {
    pub id: u64,
    /// Unix time in seconds.
    pub time: u64,
    pub duration_us: u64,
    pub argv: Vec<Bytes>,
}

impl SlowlogEntry {
    /// Keeps a bounded copy of the arguments: past the argument cap the last
    /// slot says how many were dropped, and long strings are cut.
    fn new(id: u64, time: u64, duration_us: u64, argv: &[Bytes]) -> Self {
        let argc = argv.len();
        let slargc = argc.min(SLOWLOG_ENTRY_MAX_ARGC);
        let mut kept = Vec::with_capacity(slargc);
        for (j, arg) in argv.iter().take(slargc).enumerate() {
            if slargc != argc && j == slargc - 1 {
                let marker = format!("... ({} more arguments)", argc - slargc + 1);
                kept.push(Bytes::from(marker));
            } else if arg.len() > SLOWLOG_ENTRY_MAX_STRING {
                let suffix = format!("... ({} more bytes)", arg.len() - SLOWLOG_ENTRY_MAX_STRING);
                let mut s = BytesMut::with_capacity(SLOWLOG_ENTRY_MAX_STRING + suffix.len());
                s.put_slice(&arg[..SLOWLOG_ENTRY_MAX_STRING]);
                s.put_slice(suffix.as_bytes());
                kept.push(s.freeze());
            } else {
                kept.push(arg.clone());
            }
        }
        SlowlogEntry {
            id,
            time,
            duration_us,
            argv: kept,
        }
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::array(vec![
            RespValue::Integer(self.id as i64),
            RespValue::Integer(self.time as i64),
            RespValue::Integer(self.duration_us as i64),
            RespValue::bulk_array(self.argv.iter()),
        ])
    }
}

#[derive(Debug)]
pub struct Slowlog {
    /// Newest first.
    entries: VecDeque<SlowlogEntry>,
    next_id: u64,
    log_slower_than_us: i64,
    max_len: usize,
}

impl Slowlog {
    pub fn new(config: &SlowlogConfig) -> Self {
        Slowlog {
            entries: VecDeque::new(),
            next_id: 0,
            log_slower_than_us: config.log_slower_than_us,
            max_len: config.max_len,
        }
    }

    /// Record the command if it ran at least as long as the threshold.
    pub fn push_if_needed(&mut self, argv: &[Bytes], duration_us: u64, now_secs: u64) -> bool {
        if self.log_slower_than_us < 0 || (duration_us as i64) < self.log_slower_than_us {
            return false;
        }
        let entry = SlowlogEntry::new(self.next_id, now_secs, duration_us, argv);
        debug!(
            id = entry.id,
            duration_us,
            command = %String::from_utf8_lossy(argv.first().map(|a| a.as_ref()).unwrap_or(b"")),
            "slowlog entry"
        );
        self.next_id += 1;
        self.entries.push_front(entry);
        while self.entries.len() > self.max_len {
            self.entries.pop_back();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Up to `count` entries, newest first.
    pub fn latest(&self, count: usize) -> impl Iterator<Item = &SlowlogEntry> {
        self.entries.iter().take(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_all() -> Slowlog {
        Slowlog::new(&SlowlogConfig {
            log_slower_than_us: 0,
            max_len: 3,
        })
    }

    #[test]
    fn test_threshold_and_disable() {
        let mut log = Slowlog::new(&SlowlogConfig {
            log_slower_than_us: 100,
            max_len: 10,
        });
        assert!(!log.push_if_needed(&[Bytes::from_static(b"GET")], 99, 0));
        assert!(log.push_if_needed(&[Bytes::from_static(b"GET")], 100, 0));

        let mut off = Slowlog::new(&SlowlogConfig {
            log_slower_than_us: -1,
            max_len: 10,
        });
        assert!(!off.push_if_needed(&[Bytes::from_static(b"GET")], 1_000_000, 0));
    }

    #[test]
    fn test_trims_to_max_len_newest_first() {
        let mut log = log_all();
        for i in 0..5u64 {
            log.push_if_needed(&[Bytes::from(format!("cmd{}", i))], i, 1);
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<u64> = log.latest(10).map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[test]
    fn test_argument_truncation() {
        let mut log = log_all();
        let argv: Vec<Bytes> = (0..40).map(|i| Bytes::from(format!("a{}", i))).collect();
        log.push_if_needed(&argv, 1, 0);
        let entry = log.latest(1).next().unwrap();
        assert_eq!(entry.argv.len(), SLOWLOG_ENTRY_MAX_ARGC);
        assert_eq!(entry.argv[31].as_ref(), b"... (9 more arguments)");
        assert_eq!(entry.argv[30].as_ref(), b"a30");
    }

    #[test]
    fn test_string_truncation() {
        let mut log = log_all();
        let long = Bytes::from(vec![b'x'; 200]);
        log.push_if_needed(&[Bytes::from_static(b"SET"), Bytes::from_static(b"k"), long], 1, 0);
        let entry = log.latest(1).next().unwrap();
        let arg = &entry.argv[2];
        assert!(arg.starts_with(&[b'x'; 128]));
        assert!(arg.ends_with(b"... (72 more bytes)"));
    }
}
