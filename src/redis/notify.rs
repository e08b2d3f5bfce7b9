//! Keyspace event notifications.
//!
//! Every event is published on up to two channels, each gated by its own
//! flag: `__keyspace@<db>__:<key>` carrying the event name and
//! `__keyevent@<db>__:<event>` carrying the key.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyFlags: u16 {
        const KEYSPACE = 1 << 0;
        const KEYEVENT = 1 << 1;
        const GENERIC = 1 << 2;
        const STRING = 1 << 3;
        const LIST = 1 << 4;
        const SET = 1 << 5;
        const HASH = 1 << 6;
        const ZSET = 1 << 7;
        const EXPIRED = 1 << 8;
        const EVICTED = 1 << 9;
        /// Every event class; `A` in the config string.
        const ALL = Self::GENERIC.bits()
            | Self::STRING.bits()
            | Self::LIST.bits()
            | Self::SET.bits()
            | Self::HASH.bits()
            | Self::ZSET.bits()
            | Self::EXPIRED.bits()
            | Self::EVICTED.bits();
    }
}

impl NotifyFlags {
    /// Parse a class string such as `"KEA"` or `"Kx"`. Returns the first
    /// unknown character on failure.
    pub fn parse(classes: &str) -> Result<NotifyFlags, char> {
        let mut flags = NotifyFlags::empty();
        for c in classes.chars() {
            let class = match c {
                'A' => NotifyFlags::ALL,
                'g' => NotifyFlags::GENERIC,
                '$' => NotifyFlags::STRING,
                'l' => NotifyFlags::LIST,
                's' => NotifyFlags::SET,
                'h' => NotifyFlags::HASH,
                'z' => NotifyFlags::ZSET,
                'x' => NotifyFlags::EXPIRED,
                'e' => NotifyFlags::EVICTED,
                'K' => NotifyFlags::KEYSPACE,
                'E' => NotifyFlags::KEYEVENT,
                other => return Err(other),
            };
            flags.insert(class);
        }
        Ok(flags)
    }

    /// Canonical class string; inverse of `parse`.
    pub fn to_class_string(self) -> String {
        let mut out = String::new();
        if self.contains(NotifyFlags::ALL) {
            out.push('A');
        } else {
            for (c, flag) in [
                ('g', NotifyFlags::GENERIC),
                ('$', NotifyFlags::STRING),
                ('l', NotifyFlags::LIST),
                ('s', NotifyFlags::SET),
                ('h', NotifyFlags::HASH),
                ('z', NotifyFlags::ZSET),
                ('x', NotifyFlags::EXPIRED),
                ('e', NotifyFlags::EVICTED),
            ] {
                if self.contains(flag) {
                    out.push(c);
                }
            }
        }
        if self.contains(NotifyFlags::KEYSPACE) {
            out.push('K');
        }
        if self.contains(NotifyFlags::KEYEVENT) {
            out.push('E');
        }
        out
    }
}

/// The pub/sub side of notifications.
pub trait NotificationPublisher {
    fn publish(&mut self, channel: Bytes, payload: Bytes);
}

/// Synthesize and publish the channels for one event.
pub fn notify_keyspace_event(
    publisher: &mut dyn NotificationPublisher,
    enabled: NotifyFlags,
    class: NotifyFlags,
    event: &str,
    key: &[u8],
    dbid: usize,
) {
    if !enabled.intersects(class) {
        return;
    }
    if enabled.contains(NotifyFlags::KEYSPACE) {
        let prefix = format!("__keyspace@{}__:", dbid);
        let mut chan = BytesMut::with_capacity(prefix.len() + key.len());
        chan.put_slice(prefix.as_bytes());
        chan.put_slice(key);
        publisher.publish(chan.freeze(), Bytes::copy_from_slice(event.as_bytes()));
    }
    if enabled.contains(NotifyFlags::KEYEVENT) {
        let chan = format!("__keyevent@{}__:{}", dbid, event);
        publisher.publish(Bytes::from(chan), Bytes::copy_from_slice(key));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: Bytes,
    pub payload: Bytes,
}

/// Records every published message. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    log: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.log.lock().clone()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl NotificationPublisher for InMemoryPublisher {
    fn publish(&mut self, channel: Bytes, payload: Bytes) {
        self.log.lock().push(Notification { channel, payload });
    }
}

/// Drops everything; used when no pub/sub layer is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl NotificationPublisher for NullPublisher {
    fn publish(&mut self, _channel: Bytes, _payload: Bytes) {}
}
