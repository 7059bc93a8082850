use crate::config::{RawOptions, SessionConfig};
use crate::corpus::failures_dir;
use crate::engine::BuiltinGuidanceFactory;
use crate::environment::{DefaultEnvironmentFactory, EnvironmentFactory, ExecutionEnvironment};
use crate::executor::{RecordedFailure, TrialRequest, TrialRunner};
use crate::guidance::{FailureKind, Guidance, GuidanceFactory, GuidanceSpec};
use crate::oracle::panic_message;
use crate::verdict::{CampaignSummary, CampaignVerdict, FuzzError};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    Configuring,
    EnvironmentReady,
    GuidanceReady,
    Running,
    Completed,
    Aborted,
}

/// Everything known about a campaign once it reached a terminal state.
#[derive(Debug)]
pub struct CampaignReport {
    pub state: CampaignState,
    pub verdict: CampaignVerdict,
    /// `None` when the options never validated.
    pub results_dir: Option<PathBuf>,
    pub trials: u64,
    pub interrupted: bool,
    /// The guidance engine wrote failing inputs under `results_dir`.
    pub failures_saved: bool,
}

impl CampaignReport {
    fn aborted(verdict: CampaignVerdict, results_dir: Option<PathBuf>) -> Self {
        Self {
            state: CampaignState::Aborted,
            verdict,
            results_dir,
            trials: 0,
            interrupted: false,
            failures_saved: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.verdict.is_clean()
    }

    /// Turns the verdict into the operator-facing result.
    pub fn into_result(self) -> Result<CampaignSummary, FuzzError> {
        let results_dir = self.results_dir.unwrap_or_default();
        let saved = self.failures_saved.then(|| failures_dir(&results_dir));
        if let Some(err) = FuzzError::from_verdict(self.verdict, saved) {
            return Err(err);
        }
        if self.interrupted {
            log::info!(
                "Campaign interrupted after {} trial(s) without failures",
                self.trials
            );
        }
        Ok(CampaignSummary {
            trials: self.trials,
            results_dir,
            interrupted: self.interrupted,
        })
    }
}

/// Drives one campaign at a time from options to verdict.
///
/// The environment built for a campaign is released exactly once whichever state the
/// campaign ends in, and the guidance engine is closed whenever one was built.
pub struct CampaignDriver {
    environments: Box<dyn EnvironmentFactory>,
    guidances: Box<dyn GuidanceFactory>,
    runner: Box<dyn TrialRunner>,
    sink: Option<Box<dyn Write + Send>>,
    states: Vec<CampaignState>,
}

impl CampaignDriver {
    pub fn new(runner: impl TrialRunner + 'static) -> Self {
        Self {
            environments: Box::new(DefaultEnvironmentFactory),
            guidances: Box::new(BuiltinGuidanceFactory),
            runner: Box::new(runner),
            sink: None,
            states: Vec::new(),
        }
    }

    pub fn with_environment_factory(mut self, factory: impl EnvironmentFactory + 'static) -> Self {
        self.environments = Box::new(factory);
        self
    }

    pub fn with_guidance_factory(mut self, factory: impl GuidanceFactory + 'static) -> Self {
        self.guidances = Box::new(factory);
        self
    }

    /// Per-trial lines are written to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// States entered by the most recent campaign, in order.
    pub fn states(&self) -> &[CampaignState] {
        &self.states
    }

    /// Validates `raw` and runs the resulting campaign.
    pub fn run_options(&mut self, raw: &RawOptions) -> CampaignReport {
        self.states.clear();
        self.enter(CampaignState::Configuring);
        match SessionConfig::from_options(raw) {
            Ok(config) => self.launch(&config),
            Err(e) => {
                log::error!("Rejected campaign options: {e}");
                self.enter(CampaignState::Aborted);
                CampaignReport::aborted(CampaignVerdict::ConfigurationError(e), None)
            }
        }
    }

    /// Runs an already validated campaign.
    pub fn run(&mut self, config: &SessionConfig) -> CampaignReport {
        self.states.clear();
        self.enter(CampaignState::Configuring);
        self.launch(config)
    }

    fn enter(&mut self, state: CampaignState) {
        log::debug!("Campaign state: {state:?}");
        self.states.push(state);
    }

    fn launch(&mut self, config: &SessionConfig) -> CampaignReport {
        let results_dir = Some(config.results_dir.clone());

        let mut environment = match self.environments.create(config) {
            Ok(environment) => environment,
            Err(e) => {
                log::error!("Execution environment for {} failed: {e}", config.target);
                self.enter(CampaignState::Aborted);
                return CampaignReport::aborted(CampaignVerdict::EnvironmentError(e), results_dir);
            }
        };
        self.enter(CampaignState::EnvironmentReady);

        let spec = GuidanceSpec::from_config(config);
        let mut guidance = match self.guidances.create(&spec) {
            Ok(guidance) => guidance,
            Err(e) => {
                log::error!("Guidance engine for {} failed: {e}", config.target);
                release(&mut environment);
                self.enter(CampaignState::Aborted);
                return CampaignReport::aborted(CampaignVerdict::ResourceError(e), results_dir);
            }
        };
        self.enter(CampaignState::GuidanceReady);
        guidance.set_blind(config.blind);

        self.enter(CampaignState::Running);
        log::info!(
            "Fuzzing {} with {} guidance ({})",
            config.target,
            guidance.name(),
            match config.duration {
                Some(limit) => format!("time limit {:?}", limit),
                None => "no time limit".to_string(),
            }
        );
        let failures_saved = guidance.saves_failures();
        let request = TrialRequest {
            target: &config.target,
            environment: &environment,
            run_timeout: config.run_timeout(),
            sink: self.sink.as_deref_mut().map(|s| s as &mut dyn Write),
        };
        let runner = &mut self.runner;
        let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(request, guidance.as_mut())));

        close(guidance.as_mut());
        release(&mut environment);

        match outcome {
            Ok(Ok(summary)) => {
                self.enter(CampaignState::Completed);
                let verdict = CampaignVerdict::reduce(&summary);
                log::info!(
                    "Campaign for {} completed after {} trial(s): {}",
                    config.target,
                    summary.trials,
                    verdict.label()
                );
                CampaignReport {
                    state: CampaignState::Completed,
                    verdict,
                    results_dir,
                    trials: summary.trials,
                    interrupted: summary.interrupted,
                    failures_saved,
                }
            }
            Ok(Err(e)) => {
                log::error!("Trial loop for {} aborted: {e}", config.target);
                self.enter(CampaignState::Aborted);
                CampaignReport::aborted(CampaignVerdict::BadRequest(e), results_dir)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Trial loop for {} panicked: {message}", config.target);
                self.enter(CampaignState::Aborted);
                let cause = RecordedFailure {
                    trial: 0,
                    kind: FailureKind::GuidanceInternalError,
                    cause: Some(format!("trial loop panicked: {message}")),
                };
                CampaignReport::aborted(CampaignVerdict::InternalError { cause }, results_dir)
            }
        }
    }
}

impl std::fmt::Debug for CampaignDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignDriver")
            .field("states", &self.states)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

fn release(environment: &mut ExecutionEnvironment) {
    if let Err(e) = environment.release() {
        log::warn!("{e}");
    }
}

fn close(guidance: &mut dyn Guidance) {
    match catch_unwind(AssertUnwindSafe(|| guidance.close())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Closing {} guidance failed: {e}", guidance.name()),
        Err(payload) => log::warn!(
            "Closing {} guidance panicked: {}",
            guidance.name(),
            panic_message(payload.as_ref())
        ),
    }
}
