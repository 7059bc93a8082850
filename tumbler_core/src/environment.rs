use crate::config::SessionConfig;
use crate::coverage::CoverageMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("No code roots were given")]
    NoCodeRoots,
    #[error("Malformed code root {path:?}: {reason}")]
    MalformedRoot { path: PathBuf, reason: &'static str },
    #[error("Empty namespace prefix in the {0} list")]
    EmptyPrefix(&'static str),
    #[error("Namespace prefix {0:?} is both excluded and included")]
    ConflictingPrefix(String),
    #[error("Failed to release loading context '{context}': {message}")]
    Release { context: &'static str, message: String },
}

/// Decides which code units get coverage probes.
///
/// A unit is excluded when an exclude prefix matches it, unless an include prefix that
/// is more specific (longer) than every matching exclude also matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationFilter {
    excludes: Vec<String>,
    includes: Vec<String>,
}

impl InstrumentationFilter {
    pub fn new(excludes: Vec<String>, includes: Vec<String>) -> Result<Self, EnvironmentError> {
        if excludes.iter().any(String::is_empty) {
            return Err(EnvironmentError::EmptyPrefix("excludes"));
        }
        if includes.iter().any(String::is_empty) {
            return Err(EnvironmentError::EmptyPrefix("includes"));
        }
        if let Some(conflict) = excludes.iter().find(|e| includes.contains(e)) {
            return Err(EnvironmentError::ConflictingPrefix(conflict.clone()));
        }
        Ok(Self { excludes, includes })
    }

    pub fn should_instrument(&self, unit: &str) -> bool {
        let longest = |prefixes: &[String]| {
            prefixes
                .iter()
                .filter(|p| unit.starts_with(p.as_str()))
                .map(String::len)
                .max()
        };
        match longest(&self.excludes) {
            None => true,
            Some(excluded) => longest(&self.includes).is_some_and(|included| included > excluded),
        }
    }
}

/// The code-loading context a campaign runs its target in.
///
/// Harnesses report probe events through [`LoadingContext::probe`]; what happens to
/// them depends on whether the context is instrumented. Every probe carries the number
/// of the trial that fired it, so a context only credits the trial it is collecting for.
pub trait LoadingContext: Send + Sync {
    fn name(&self) -> &'static str;
    fn code_roots(&self) -> &[PathBuf];
    fn is_instrumented(&self) -> bool;
    /// Starts collecting for `trial`, dropping whatever was recorded before.
    fn begin_trial(&self, _trial: u64) {}
    fn probe(&self, trial: u64, unit: &str, site: u32);
    /// Returns the coverage recorded since the previous call and starts a fresh map.
    fn take_coverage(&self) -> CoverageMap;
    fn close(&self) -> Result<(), EnvironmentError>;
}

/// Loads code as-is. Probe events are dropped.
#[derive(Debug)]
pub struct PassthroughContext {
    roots: Vec<PathBuf>,
}

impl PassthroughContext {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl LoadingContext for PassthroughContext {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn code_roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_instrumented(&self) -> bool {
        false
    }

    fn probe(&self, _trial: u64, _unit: &str, _site: u32) {}

    fn take_coverage(&self) -> CoverageMap {
        CoverageMap::new()
    }

    fn close(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TrialCoverage {
    trial: u64,
    map: CoverageMap,
}

/// Records probe events for units admitted by its [`InstrumentationFilter`].
#[derive(Debug)]
pub struct InstrumentingContext {
    roots: Vec<PathBuf>,
    filter: InstrumentationFilter,
    tracing: bool,
    current: Mutex<TrialCoverage>,
}

impl InstrumentingContext {
    pub fn new(roots: Vec<PathBuf>, filter: InstrumentationFilter, tracing: bool) -> Self {
        Self {
            roots,
            filter,
            tracing,
            current: Mutex::new(TrialCoverage::default()),
        }
    }

    pub fn filter(&self) -> &InstrumentationFilter {
        &self.filter
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }
}

impl LoadingContext for InstrumentingContext {
    fn name(&self) -> &'static str {
        "instrumenting"
    }

    fn code_roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_instrumented(&self) -> bool {
        true
    }

    fn begin_trial(&self, trial: u64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.trial = trial;
        current.map = CoverageMap::new();
    }

    fn probe(&self, trial: u64, unit: &str, site: u32) {
        if !self.filter.should_instrument(unit) {
            return;
        }
        // A poisoned map only means a harness panicked mid-record; keep collecting.
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.trial != trial {
            log::trace!("Dropping probe {unit}:{site} from finished trial {trial}");
            return;
        }
        current.map.record(unit, site, self.tracing);
    }

    fn take_coverage(&self) -> CoverageMap {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut current.map)
    }

    fn close(&self) -> Result<(), EnvironmentError> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.map = CoverageMap::new();
        Ok(())
    }
}

/// Owns the loading context for one campaign and releases it exactly once, either
/// through [`ExecutionEnvironment::release`] or on drop.
pub struct ExecutionEnvironment {
    context: Arc<dyn LoadingContext>,
    released: bool,
}

impl ExecutionEnvironment {
    pub fn new(context: Arc<dyn LoadingContext>) -> Self {
        Self {
            context,
            released: false,
        }
    }

    pub fn is_instrumented(&self) -> bool {
        self.context.is_instrumented()
    }

    pub fn context(&self) -> Arc<dyn LoadingContext> {
        Arc::clone(&self.context)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) -> Result<(), EnvironmentError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        log::debug!("Releasing {} loading context", self.context.name());
        self.context.close()
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{e}");
        }
    }
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("context", &self.context.name())
            .field("roots", &self.context.code_roots())
            .field("released", &self.released)
            .finish()
    }
}

/// Builds the execution environment for a validated session.
pub trait EnvironmentFactory {
    fn create(&self, config: &SessionConfig) -> Result<ExecutionEnvironment, EnvironmentError>;
}

/// Passthrough when coverage is disabled, instrumenting otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEnvironmentFactory;

impl EnvironmentFactory for DefaultEnvironmentFactory {
    fn create(&self, config: &SessionConfig) -> Result<ExecutionEnvironment, EnvironmentError> {
        validate_roots(&config.code_roots)?;
        let roots = config.code_roots.clone();

        let context: Arc<dyn LoadingContext> = if config.coverage_enabled {
            let filter =
                InstrumentationFilter::new(config.excludes.clone(), config.includes.clone())?;
            Arc::new(InstrumentingContext::new(
                roots,
                filter,
                config.tracing_enabled(),
            ))
        } else {
            Arc::new(PassthroughContext::new(roots))
        };
        log::info!(
            "Prepared {} loading context over {} code root(s)",
            context.name(),
            context.code_roots().len()
        );
        Ok(ExecutionEnvironment::new(context))
    }
}

fn validate_roots(roots: &[PathBuf]) -> Result<(), EnvironmentError> {
    if roots.is_empty() {
        return Err(EnvironmentError::NoCodeRoots);
    }
    for root in roots {
        check_root(root)?;
    }
    Ok(())
}

fn check_root(root: &Path) -> Result<(), EnvironmentError> {
    let malformed = |reason| EnvironmentError::MalformedRoot {
        path: root.to_path_buf(),
        reason,
    };
    if root.as_os_str().is_empty() {
        return Err(malformed("path is empty"));
    }
    if root.to_string_lossy().contains('\0') {
        return Err(malformed("path contains a NUL byte"));
    }
    Ok(())
}
