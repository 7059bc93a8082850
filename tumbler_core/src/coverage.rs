use std::collections::HashMap;

/// A single coverage probe: a site number inside a named code unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Probe {
    pub unit: String,
    pub site: u32,
}

/// Longest ordered trace kept per trial for execution-indexed feedback.
pub const MAX_TRACE_LEN: usize = 4096;

/// Coverage recorded during one trial.
///
/// `hits` counts how often each probe fired. `trace` is only filled when the loading
/// context was built with tracing enabled and holds probes in firing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageMap {
    hits: HashMap<Probe, u32>,
    trace: Vec<Probe>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, unit: &str, site: u32, traced: bool) {
        let probe = Probe {
            unit: unit.to_string(),
            site,
        };
        if traced && self.trace.len() < MAX_TRACE_LEN {
            self.trace.push(probe.clone());
        }
        let counter = self.hits.entry(probe).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn hit_count(&self, unit: &str, site: u32) -> u32 {
        self.hits
            .get(&Probe {
                unit: unit.to_string(),
                site,
            })
            .copied()
            .unwrap_or(0)
    }

    pub fn probes(&self) -> impl Iterator<Item = &Probe> {
        self.hits.keys()
    }

    pub fn trace(&self) -> &[Probe] {
        &self.trace
    }

    /// MD5 over the ordered trace, or `None` when no trace was recorded.
    pub fn trace_fingerprint(&self) -> Option<[u8; 16]> {
        if self.trace.is_empty() {
            return None;
        }
        let mut ctx = md5::Context::new();
        for probe in &self.trace {
            ctx.consume((probe.unit.len() as u64).to_le_bytes());
            ctx.consume(probe.unit.as_bytes());
            ctx.consume(probe.site.to_le_bytes());
        }
        Some(ctx.compute().0)
    }
}
