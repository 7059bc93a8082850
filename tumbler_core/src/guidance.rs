use crate::config::{GuidanceOptions, SessionConfig, TargetIdentity};
use crate::coverage::CoverageMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error("Seed directory {0:?} does not exist or is not a directory")]
    SeedDirMissing(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Guidance internal error: {0}")]
    Internal(String),
}

impl GuidanceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GuidanceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    AssertionFailure,
    UncaughtError,
    GuidanceInternalError,
}

impl FailureKind {
    /// `true` for failures raised by the target itself.
    pub fn is_target_originated(&self) -> bool {
        !matches!(self, FailureKind::GuidanceInternalError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AssertionFailure => "assertion-failure",
            FailureKind::UncaughtError => "uncaught-error",
            FailureKind::GuidanceInternalError => "guidance-internal-error",
        }
    }
}

/// The result of a single trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Success,
    Failure {
        kind: FailureKind,
        cause: Option<String>,
    },
}

impl TrialOutcome {
    pub fn failure(kind: FailureKind, cause: impl Into<String>) -> Self {
        TrialOutcome::Failure {
            kind,
            cause: Some(cause.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrialOutcome::Success)
    }
}

/// What a guidance engine is constructed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceSpec {
    pub target: TargetIdentity,
    /// `None` runs until the engine or the operator stops the campaign.
    pub duration: Option<Duration>,
    pub results_dir: PathBuf,
    pub seed_dir: Option<PathBuf>,
    pub options: GuidanceOptions,
}

impl GuidanceSpec {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            target: config.target.clone(),
            duration: config.duration,
            results_dir: config.results_dir.clone(),
            seed_dir: config.seed_dir.clone(),
            options: config.guidance_options(),
        }
    }
}

/// A feedback strategy supplying inputs to the trial loop.
///
/// The trial loop calls [`Guidance::has_input`], then [`Guidance::get_input`], runs the
/// target, and reports back through [`Guidance::handle_result`], strictly in that order
/// and one trial at a time. Returning `false` from `has_input` ends the campaign
/// normally. Errors from `get_input` or `handle_result` are faults of the engine, not of
/// the target.
pub trait Guidance: Send {
    fn name(&self) -> &'static str;

    /// Disables queue maintenance: every input is generated from scratch.
    fn set_blind(&mut self, blind: bool);

    fn has_input(&mut self) -> bool;

    fn get_input(&mut self) -> Result<Vec<u8>, GuidanceError>;

    fn handle_result(
        &mut self,
        outcome: &TrialOutcome,
        coverage: &CoverageMap,
    ) -> Result<(), GuidanceError>;

    /// Where the engine keeps corpus entries and failure artifacts.
    fn results_dir(&self) -> &Path;

    /// Whether failing inputs end up under [`Guidance::results_dir`].
    fn saves_failures(&self) -> bool {
        true
    }

    /// Flushes on-disk state. Called once the trial loop is over.
    fn close(&mut self) -> Result<(), GuidanceError>;
}

pub trait GuidanceFactory {
    fn create(&self, spec: &GuidanceSpec) -> Result<Box<dyn Guidance>, GuidanceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineKind, RawOptions};

    #[test]
    fn spec_is_derived_from_config() {
        let raw = RawOptions {
            class: Some("demo".into()),
            method: Some("m".into()),
            time: Some("5s".into()),
            engine: Some("indexed".into()),
            input_dir: Some(PathBuf::from("seeds")),
            ..Default::default()
        };
        let config = SessionConfig::from_options(&raw).unwrap();
        let spec = GuidanceSpec::from_config(&config);
        assert_eq!(spec.target, TargetIdentity::new("demo", "m"));
        assert_eq!(spec.duration, Some(Duration::from_secs(5)));
        assert_eq!(spec.seed_dir, Some(PathBuf::from("seeds")));
        assert_eq!(spec.results_dir, config.results_dir);
        assert_eq!(spec.options.engine, EngineKind::ExecutionIndexed);
        assert!(spec.options.trace_generators);
    }

    #[test]
    fn failure_kinds_are_classified() {
        assert!(FailureKind::AssertionFailure.is_target_originated());
        assert!(FailureKind::UncaughtError.is_target_originated());
        assert!(!FailureKind::GuidanceInternalError.is_target_originated());
        assert!(TrialOutcome::Success.is_success());
        assert!(!TrialOutcome::failure(FailureKind::UncaughtError, "x").is_success());
    }
}
