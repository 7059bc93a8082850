use crate::config::TargetIdentity;
use crate::environment::LoadingContext;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a harness may return to signal a failing trial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrialError {
    /// A property the target promises was violated.
    #[error("assertion failed: {0}")]
    Assertion(String),
    /// Any other error escaping the target.
    #[error("{0}")]
    Uncaught(String),
}

/// Everything a harness sees during one trial: the generated input and the probe
/// channel of the campaign's loading context.
pub struct TrialContext {
    trial: u64,
    input: Vec<u8>,
    cursor: usize,
    loading: Arc<dyn LoadingContext>,
}

impl TrialContext {
    /// A context outside any numbered trial, as used when calling a harness directly.
    pub fn new(input: Vec<u8>, loading: Arc<dyn LoadingContext>) -> Self {
        Self::for_trial(0, input, loading)
    }

    pub fn for_trial(trial: u64, input: Vec<u8>, loading: Arc<dyn LoadingContext>) -> Self {
        Self {
            trial,
            input,
            cursor: 0,
            loading,
        }
    }

    pub fn trial(&self) -> u64 {
        self.trial
    }

    /// The complete input of this trial.
    pub fn data(&self) -> &[u8] {
        &self.input
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.cursor
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.input.get(self.cursor)?;
        self.cursor += 1;
        Some(byte)
    }

    pub fn take(&mut self, len: usize) -> Option<&[u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(&self.input[start..self.cursor])
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reports that probe `site` of code unit `unit` was reached.
    pub fn probe(&self, unit: &str, site: u32) {
        self.loading.probe(self.trial, unit, site);
    }
}

pub type Harness = Arc<dyn Fn(&mut TrialContext) -> Result<(), TrialError> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No targets are registered under namespace '{0}'")]
    UnknownNamespace(String),
    #[error("Namespace '{namespace}' has no method '{method}' (known: {known})")]
    UnknownMethod {
        namespace: String,
        method: String,
        known: String,
    },
}

/// Harnesses addressable by [`TargetIdentity`].
#[derive(Default, Clone)]
pub struct TargetRegistry {
    targets: HashMap<String, HashMap<String, Harness>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `harness`, replacing any harness already registered under the same name.
    pub fn register<F>(&mut self, namespace: &str, method: &str, harness: F) -> &mut Self
    where
        F: Fn(&mut TrialContext) -> Result<(), TrialError> + Send + Sync + 'static,
    {
        self.targets
            .entry(namespace.to_string())
            .or_default()
            .insert(method.to_string(), Arc::new(harness));
        self
    }

    pub fn len(&self) -> usize {
        self.targets.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identities(&self) -> Vec<TargetIdentity> {
        let mut all: Vec<TargetIdentity> = self
            .targets
            .iter()
            .flat_map(|(ns, methods)| methods.keys().map(move |m| TargetIdentity::new(ns, m)))
            .collect();
        all.sort_by(|a, b| (&a.namespace, &a.method).cmp(&(&b.namespace, &b.method)));
        all
    }

    pub fn resolve(&self, target: &TargetIdentity) -> Result<Harness, ResolveError> {
        let methods = self
            .targets
            .get(&target.namespace)
            .ok_or_else(|| ResolveError::UnknownNamespace(target.namespace.clone()))?;
        methods.get(&target.method).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = methods.keys().map(String::as_str).collect();
            known.sort_unstable();
            ResolveError::UnknownMethod {
                namespace: target.namespace.clone(),
                method: target.method.clone(),
                known: known.join(", "),
            }
        })
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.identities()).finish()
    }
}
