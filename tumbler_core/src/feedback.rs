use crate::coverage::{CoverageMap, Probe};
use crate::guidance::FailureKind;
use std::collections::HashSet;

/// What a trial's coverage contributed that was never seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Novelty {
    pub new_probes: usize,
    pub new_trace: bool,
}

impl Novelty {
    pub fn is_interesting(&self) -> bool {
        self.new_probes > 0 || self.new_trace
    }
}

/// Accumulates campaign-wide coverage and judges each trial against it.
///
/// With `execution_indexed` set, a never-seen ordered probe trace is interesting even
/// when it reaches no new probe.
#[derive(Debug, Default)]
pub struct CoverageFeedback {
    seen: HashSet<Probe>,
    traces: HashSet<[u8; 16]>,
    execution_indexed: bool,
}

impl CoverageFeedback {
    pub fn new(execution_indexed: bool) -> Self {
        Self {
            execution_indexed,
            ..Default::default()
        }
    }

    pub fn observe(&mut self, coverage: &CoverageMap) -> Novelty {
        let mut novelty = Novelty::default();
        for probe in coverage.probes() {
            if !self.seen.contains(probe) {
                self.seen.insert(probe.clone());
                novelty.new_probes += 1;
            }
        }
        if self.execution_indexed {
            if let Some(fingerprint) = coverage.trace_fingerprint() {
                novelty.new_trace = self.traces.insert(fingerprint);
            }
        }
        novelty
    }

    pub fn total_probes(&self) -> usize {
        self.seen.len()
    }

    pub fn distinct_traces(&self) -> usize {
        self.traces.len()
    }
}

/// Deduplicates failures by the MD5 of their kind and cause.
#[derive(Debug, Default)]
pub struct UniqueFailureFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueFailureFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a (kind, cause) pair is reported.
    pub fn is_new(&mut self, kind: FailureKind, cause: Option<&str>) -> bool {
        let mut ctx = md5::Context::new();
        ctx.consume(kind.as_str().as_bytes());
        ctx.consume([0u8]);
        ctx.consume(cause.unwrap_or_default().as_bytes());
        self.known_hashes.insert(ctx.compute().0)
    }

    pub fn len(&self) -> usize {
        self.known_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_hashes.is_empty()
    }
}
