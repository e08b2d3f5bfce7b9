//! Propagation of executed writes to the append log and replicas.
//!
//! The engine decides what to propagate and on which channels; the sink owns
//! delivery. The sink must preserve call order.

use super::registry::CommandDescriptor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PropagateTargets: u8 {
        const AOF = 1 << 0;
        const REPL = 1 << 1;
        const BOTH = Self::AOF.bits() | Self::REPL.bits();
    }
}

pub trait PropagationSink {
    /// Called only with a non-empty `targets`.
    fn propagate(
        &mut self,
        cmd: &CommandDescriptor,
        dbid: usize,
        argv: &[Bytes],
        targets: PropagateTargets,
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagatedOp {
    /// Static command name, stable across renames.
    pub command: &'static str,
    pub dbid: usize,
    pub argv: Vec<Bytes>,
    pub targets: PropagateTargets,
}

impl PropagatedOp {
    /// Arguments as UTF-8 strings, for assertions.
    pub fn args(&self) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }
}

/// Records every propagated operation. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    ops: Arc<Mutex<Vec<PropagatedOp>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<PropagatedOp> {
        self.ops.lock().clone()
    }

    pub fn take(&self) -> Vec<PropagatedOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

impl PropagationSink for InMemorySink {
    fn propagate(
        &mut self,
        cmd: &CommandDescriptor,
        dbid: usize,
        argv: &[Bytes],
        targets: PropagateTargets,
    ) {
        debug_assert!(!targets.is_empty(), "propagate with no targets");
        self.ops.lock().push(PropagatedOp {
            command: cmd.name(),
            dbid,
            argv: argv.to_vec(),
            targets,
        });
    }
}

/// Discards everything; a standalone instance with no log and no replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PropagationSink for NullSink {
    fn propagate(&mut self, _: &CommandDescriptor, _: usize, _: &[Bytes], _: PropagateTargets) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::registry::CommandTable;

    #[test]
    fn test_target_masking() {
        let mut t = PropagateTargets::BOTH;
        t.remove(PropagateTargets::REPL);
        assert!(t.contains(PropagateTargets::AOF));
        assert!(!t.contains(PropagateTargets::REPL));
        t.remove(PropagateTargets::AOF);
        assert!(t.is_empty());
    }

    #[test]
    fn test_targets_accumulate() {
        let mut t = PropagateTargets::empty();
        assert!(t.is_empty());
        t.insert(PropagateTargets::REPL);
        t.insert(PropagateTargets::AOF);
        assert_eq!(t, PropagateTargets::BOTH);
        assert_eq!(PropagateTargets::default(), PropagateTargets::empty());
    }

    #[test]
    fn test_in_memory_sink_records_static_name() {
        let mut table = CommandTable::populate();
        table.rename("del", "remove").unwrap();
        let sink = InMemorySink::new();
        let mut handle = sink.clone();
        let del = table.lookup(b"remove").unwrap();
        handle.propagate(
            &del,
            2,
            &[Bytes::from_static(b"DEL"), Bytes::from_static(b"k")],
            PropagateTargets::BOTH,
        );
        let ops = sink.take();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].command, "del");
        assert_eq!(ops[0].dbid, 2);
        assert_eq!(ops[0].args(), vec!["DEL", "k"]);
        assert!(sink.is_empty());
    }
}
