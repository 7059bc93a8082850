use crate::config::{ConfigError, USAGE};
use crate::environment::EnvironmentError;
use crate::executor::{RecordedFailure, RunError, RunSummary};
use crate::guidance::GuidanceError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The single terminal outcome of a campaign.
#[derive(Debug)]
pub enum CampaignVerdict {
    Clean,
    /// `count` target-originated failures; `first` is the earliest in trial order.
    TrialFailures {
        count: usize,
        first: RecordedFailure,
    },
    /// The guidance engine itself failed while the target did not.
    InternalError { cause: RecordedFailure },
    ConfigurationError(ConfigError),
    EnvironmentError(EnvironmentError),
    ResourceError(GuidanceError),
    BadRequest(RunError),
}

impl CampaignVerdict {
    /// Reduces the failure log of a finished trial loop.
    ///
    /// Target failures take precedence over a guidance fault recorded in the same run.
    pub fn reduce(summary: &RunSummary) -> Self {
        let mut target_failures = summary
            .failures
            .iter()
            .filter(|f| f.kind.is_target_originated());
        if let Some(first) = target_failures.next() {
            let count = 1 + target_failures.count();
            if let Some(fault) = summary
                .failures
                .iter()
                .find(|f| !f.kind.is_target_originated())
            {
                log::warn!(
                    "Guidance fault after trial {} is reported alongside target failures: {}",
                    fault.trial,
                    fault.cause.as_deref().unwrap_or("no cause")
                );
            }
            return CampaignVerdict::TrialFailures {
                count,
                first: first.clone(),
            };
        }
        match summary.failures.first() {
            Some(cause) => CampaignVerdict::InternalError {
                cause: cause.clone(),
            },
            None => CampaignVerdict::Clean,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, CampaignVerdict::Clean)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CampaignVerdict::Clean => "clean",
            CampaignVerdict::TrialFailures { .. } => "trial-failures",
            CampaignVerdict::InternalError { .. } => "internal-error",
            CampaignVerdict::ConfigurationError(_) => "configuration-error",
            CampaignVerdict::EnvironmentError(_) => "environment-error",
            CampaignVerdict::ResourceError(_) => "resource-error",
            CampaignVerdict::BadRequest(_) => "bad-request",
        }
    }
}

/// A fatal campaign result, worded for the operator.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Invalid configuration: {0}\nUsage: {usage}", usage = USAGE)]
    Configuration(#[source] ConfigError),

    #[error("Could not prepare the execution environment: {0}")]
    Environment(#[source] EnvironmentError),

    #[error("Could not start the guidance engine: {0}")]
    Resource(#[source] GuidanceError),

    #[error("Bad request: {0}")]
    BadRequest(#[source] RunError),

    #[error(
        "Internal fuzzer error (not a bug in the target) after trial {}: {}",
        .cause.trial,
        .cause.cause.as_deref().unwrap_or("no cause")
    )]
    Internal { cause: RecordedFailure },

    #[error(
        "{count} failing trial(s); first failure in trial {} ({}): {}{}",
        .first.trial,
        .first.kind.as_str(),
        .first.cause.as_deref().unwrap_or("no cause"),
        replay_hint(.failures_dir.as_deref())
    )]
    TrialFailures {
        count: usize,
        first: RecordedFailure,
        /// `None` when the run saved no failing inputs, as when replaying.
        failures_dir: Option<PathBuf>,
    },
}

impl FuzzError {
    /// `true` when the tool, not the target, is at fault.
    pub fn is_tooling_fault(&self) -> bool {
        !self.is_target_bug()
    }

    pub fn is_target_bug(&self) -> bool {
        matches!(self, FuzzError::TrialFailures { .. })
    }

    /// Converts a non-clean verdict into its report. `None` for [`CampaignVerdict::Clean`].
    ///
    /// `failures_dir` is where the campaign saved its failing inputs, if it saved any.
    pub fn from_verdict(verdict: CampaignVerdict, failures_dir: Option<PathBuf>) -> Option<Self> {
        Some(match verdict {
            CampaignVerdict::Clean => return None,
            CampaignVerdict::TrialFailures { count, first } => FuzzError::TrialFailures {
                count,
                first,
                failures_dir,
            },
            CampaignVerdict::InternalError { cause } => FuzzError::Internal { cause },
            CampaignVerdict::ConfigurationError(e) => FuzzError::Configuration(e),
            CampaignVerdict::EnvironmentError(e) => FuzzError::Environment(e),
            CampaignVerdict::ResourceError(e) => FuzzError::Resource(e),
            CampaignVerdict::BadRequest(e) => FuzzError::BadRequest(e),
        })
    }
}

fn replay_hint(failures_dir: Option<&Path>) -> String {
    match failures_dir {
        Some(dir) => format!(
            "\nFailing inputs are saved in {dir:?}; replay one with \
             `tumbler repro --class <class> --method <method> <input>`"
        ),
        None => String::new(),
    }
}

/// What a clean campaign reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSummary {
    pub trials: u64,
    pub results_dir: PathBuf,
    pub interrupted: bool,
}
