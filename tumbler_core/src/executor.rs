use crate::config::TargetIdentity;
use crate::environment::{ExecutionEnvironment, LoadingContext};
use crate::guidance::{FailureKind, Guidance, GuidanceError, TrialOutcome};
use crate::oracle::classify;
use crate::target::{Harness, ResolveError, TargetRegistry, TrialContext};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Errors that prevent the trial loop from running at all.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Cannot run target {target}: {source}")]
    Resolve {
        target: TargetIdentity,
        #[source]
        source: ResolveError,
    },
    #[error("Illegal invocation: {0}")]
    IllegalInvocation(String),
    #[error("Failed to spawn trial worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// One failing trial in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    /// 1-based trial number. A guidance fault carries the number of the last trial run.
    pub trial: u64,
    pub kind: FailureKind,
    pub cause: Option<String>,
}

impl RecordedFailure {
    fn guidance_fault(trial: u64, err: &GuidanceError) -> Self {
        Self {
            trial,
            kind: FailureKind::GuidanceInternalError,
            cause: Some(err.to_string()),
        }
    }
}

/// What the trial loop observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub trials: u64,
    pub failures: Vec<RecordedFailure>,
    /// The stop flag ended the loop before the guidance ran out of input.
    pub interrupted: bool,
}

/// Everything the runner needs besides the guidance engine.
pub struct TrialRequest<'a> {
    pub target: &'a TargetIdentity,
    pub environment: &'a ExecutionEnvironment,
    pub run_timeout: Option<Duration>,
    /// Receives one line per trial when set.
    pub sink: Option<&'a mut dyn Write>,
}

/// Runs trials of a target until the guidance engine has no more input.
pub trait TrialRunner {
    fn run(
        &mut self,
        request: TrialRequest<'_>,
        guidance: &mut dyn Guidance,
    ) -> Result<RunSummary, RunError>;
}

/// Timed-out workers allowed to keep running before the loop stops starting trials.
pub const DEFAULT_MAX_STRAY_WORKERS: usize = 16;

/// Calls registered harnesses in the current process.
///
/// With a run timeout each trial gets its own worker thread. A worker that misses its
/// deadline cannot be killed and keeps running as a stray; its late probes are dropped
/// by the loading context since they carry a finished trial number.
pub struct InProcessTrialRunner {
    registry: TargetRegistry,
    stop: Arc<AtomicBool>,
    live_workers: Arc<AtomicUsize>,
    max_stray_workers: usize,
}

impl InProcessTrialRunner {
    pub fn new(registry: TargetRegistry) -> Self {
        Self {
            registry,
            stop: Arc::new(AtomicBool::new(false)),
            live_workers: Arc::new(AtomicUsize::new(0)),
            max_stray_workers: DEFAULT_MAX_STRAY_WORKERS,
        }
    }

    pub fn with_max_stray_workers(mut self, max: usize) -> Self {
        self.max_stray_workers = max.max(1);
        self
    }

    /// Worker threads that have not returned yet, timed-out ones included.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Shares `stop` with whoever may want to end the campaign early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    fn execute(
        &self,
        harness: &Harness,
        context: &Arc<dyn LoadingContext>,
        trial: u64,
        input: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<TrialOutcome, RunError> {
        let Some(timeout) = timeout else {
            let mut ctx = TrialContext::for_trial(trial, input, Arc::clone(context));
            return Ok(classify(catch_unwind(AssertUnwindSafe(|| {
                harness(&mut ctx)
            }))));
        };

        let (tx, rx) = mpsc::channel();
        let harness = Arc::clone(harness);
        let context = Arc::clone(context);
        let live = Arc::clone(&self.live_workers);
        live.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("trial-{trial}"))
            .spawn(move || {
                let mut ctx = TrialContext::for_trial(trial, input, context);
                let result = catch_unwind(AssertUnwindSafe(|| harness(&mut ctx)));
                live.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            self.live_workers.fetch_sub(1, Ordering::SeqCst);
            return Err(e.into());
        }

        Ok(match rx.recv_timeout(timeout) {
            Ok(result) => classify(result),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Trial {trial} timed out after {}ms; {} worker(s) still running",
                    timeout.as_millis(),
                    self.live_workers()
                );
                TrialOutcome::failure(
                    FailureKind::UncaughtError,
                    format!("trial timed out after {}ms", timeout.as_millis()),
                )
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => TrialOutcome::failure(
                FailureKind::UncaughtError,
                "trial worker exited without a result",
            ),
        })
    }
}

impl TrialRunner for InProcessTrialRunner {
    fn run(
        &mut self,
        request: TrialRequest<'_>,
        guidance: &mut dyn Guidance,
    ) -> Result<RunSummary, RunError> {
        if request.environment.is_released() {
            return Err(RunError::IllegalInvocation(
                "execution environment already released".to_string(),
            ));
        }
        let harness = self
            .registry
            .resolve(request.target)
            .map_err(|source| RunError::Resolve {
                target: request.target.clone(),
                source,
            })?;
        let context = request.environment.context();
        let mut sink = request.sink;
        let mut summary = RunSummary::default();

        log::debug!(
            "Running {} with {} guidance in {} context",
            request.target,
            guidance.name(),
            context.name()
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("Stop requested after {} trial(s)", summary.trials);
                summary.interrupted = true;
                break;
            }
            if !guidance.has_input() {
                break;
            }
            let stray = self.live_workers();
            if stray >= self.max_stray_workers {
                log::error!(
                    "{stray} timed-out trial worker(s) are still running; \
                     stopping after {} trial(s)",
                    summary.trials
                );
                break;
            }
            let input = match guidance.get_input() {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Guidance failed to produce an input: {e}");
                    summary
                        .failures
                        .push(RecordedFailure::guidance_fault(summary.trials, &e));
                    break;
                }
            };
            summary.trials += 1;
            let input_len = input.len();

            context.begin_trial(summary.trials);
            let outcome =
                self.execute(&harness, &context, summary.trials, input, request.run_timeout)?;
            let coverage = context.take_coverage();

            if let Some(out) = sink.as_deref_mut() {
                let status = match &outcome {
                    TrialOutcome::Success => "ok".to_string(),
                    TrialOutcome::Failure { kind, cause } => {
                        format!("{} {}", kind.as_str(), cause.as_deref().unwrap_or(""))
                    }
                };
                let _ = writeln!(
                    out,
                    "trial {} ({} bytes, {} probes): {}",
                    summary.trials,
                    input_len,
                    coverage.len(),
                    status.trim_end()
                );
            }

            if let TrialOutcome::Failure { kind, cause } = &outcome {
                summary.failures.push(RecordedFailure {
                    trial: summary.trials,
                    kind: *kind,
                    cause: cause.clone(),
                });
            }

            if let Err(e) = guidance.handle_result(&outcome, &coverage) {
                log::error!("Guidance failed to handle trial {}: {e}", summary.trials);
                summary
                    .failures
                    .push(RecordedFailure::guidance_fault(summary.trials, &e));
                break;
            }
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for InProcessTrialRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTrialRunner")
            .field("registry", &self.registry)
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageMap;
    use crate::environment::{InstrumentationFilter, InstrumentingContext, PassthroughContext};
    use crate::target::TrialError;
    use std::path::{Path, PathBuf};

    /// Hands out a fixed list of inputs and records what came back.
    #[derive(Default)]
    struct ScriptedGuidance {
        inputs: Vec<Vec<u8>>,
        outcomes: Vec<TrialOutcome>,
        probes_seen: Vec<usize>,
        coverage: Vec<CoverageMap>,
        fail_get_at: Option<usize>,
        fail_handle_at: Option<usize>,
        dir: PathBuf,
    }

    impl ScriptedGuidance {
        fn with_inputs(inputs: &[&[u8]]) -> Self {
            Self {
                inputs: inputs.iter().map(|i| i.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl Guidance for ScriptedGuidance {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn set_blind(&mut self, _blind: bool) {}
        fn has_input(&mut self) -> bool {
            self.outcomes.len() < self.inputs.len()
        }
        fn get_input(&mut self) -> Result<Vec<u8>, GuidanceError> {
            if self.fail_get_at == Some(self.outcomes.len()) {
                return Err(GuidanceError::Internal("no input".into()));
            }
            Ok(self.inputs[self.outcomes.len()].clone())
        }
        fn handle_result(
            &mut self,
            outcome: &TrialOutcome,
            coverage: &CoverageMap,
        ) -> Result<(), GuidanceError> {
            self.outcomes.push(outcome.clone());
            self.probes_seen.push(coverage.len());
            self.coverage.push(coverage.clone());
            if self.fail_handle_at == Some(self.outcomes.len() - 1) {
                return Err(GuidanceError::Internal("bookkeeping".into()));
            }
            Ok(())
        }
        fn results_dir(&self) -> &Path {
            &self.dir
        }
        fn close(&mut self) -> Result<(), GuidanceError> {
            Ok(())
        }
    }

    fn registry() -> TargetRegistry {
        let mut registry = TargetRegistry::new();
        registry
            .register("demo", "check", |ctx| {
                ctx.probe("demo", 1);
                match ctx.data() {
                    b"panic" => panic!("exploded"),
                    b"assert" => assert_eq!(1, 2),
                    b"err" => return Err(TrialError::Assertion("bad header".into())),
                    b"slow" => thread::sleep(Duration::from_millis(500)),
                    data if data.len() > 3 => ctx.probe("demo", 2),
                    _ => {}
                }
                Ok(())
            });
        registry
    }

    fn passthrough() -> ExecutionEnvironment {
        ExecutionEnvironment::new(Arc::new(PassthroughContext::new(vec![PathBuf::from(".")])))
    }

    fn instrumented() -> ExecutionEnvironment {
        let filter = InstrumentationFilter::new(Vec::new(), Vec::new()).unwrap();
        ExecutionEnvironment::new(Arc::new(InstrumentingContext::new(
            vec![PathBuf::from(".")],
            filter,
            false,
        )))
    }

    fn request<'a>(
        target: &'a TargetIdentity,
        environment: &'a ExecutionEnvironment,
    ) -> TrialRequest<'a> {
        TrialRequest {
            target,
            environment,
            run_timeout: None,
            sink: None,
        }
    }

    #[test]
    fn classifies_every_trial_and_logs_failures_in_order() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"ok", b"panic", b"assert", b"err"]);
        let mut runner = InProcessTrialRunner::new(registry());

        let summary = runner.run(request(&target, &env), &mut guidance).unwrap();
        assert_eq!(summary.trials, 4);
        assert!(!summary.interrupted);
        let kinds: Vec<_> = summary.failures.iter().map(|f| (f.trial, f.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (2, FailureKind::UncaughtError),
                (3, FailureKind::AssertionFailure),
                (4, FailureKind::AssertionFailure),
            ]
        );
        assert_eq!(summary.failures[0].cause.as_deref(), Some("exploded"));
        assert!(guidance.outcomes[0].is_success());
    }

    #[test]
    fn coverage_is_drained_per_trial() {
        let target = TargetIdentity::new("demo", "check");
        let env = instrumented();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"long-input", b"ab", b"abcd"]);
        let mut runner = InProcessTrialRunner::new(registry());
        runner.run(request(&target, &env), &mut guidance).unwrap();
        assert_eq!(guidance.probes_seen, vec![2, 1, 2]);
    }

    #[test]
    fn passthrough_context_reports_no_coverage() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"long-input"]);
        let mut runner = InProcessTrialRunner::new(registry());
        runner.run(request(&target, &env), &mut guidance).unwrap();
        assert_eq!(guidance.probes_seen, vec![0]);
    }

    #[test]
    fn slow_trials_time_out() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"slow", b"ok"]);
        let mut runner = InProcessTrialRunner::new(registry());
        let summary = runner
            .run(
                TrialRequest {
                    run_timeout: Some(Duration::from_millis(20)),
                    ..request(&target, &env)
                },
                &mut guidance,
            )
            .unwrap();
        assert_eq!(summary.trials, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(
            summary.failures[0].cause.as_deref(),
            Some("trial timed out after 20ms")
        );
        assert!(guidance.outcomes[1].is_success());
    }

    #[test]
    fn late_probes_of_a_timed_out_trial_are_not_credited_to_the_next() {
        let mut registry = TargetRegistry::new();
        registry.register("demo", "late", |ctx| {
            if ctx.data() == b"hang" {
                thread::sleep(Duration::from_millis(130));
                ctx.probe("straggler", 99);
            } else {
                ctx.probe("normal", 1);
                thread::sleep(Duration::from_millis(70));
            }
            Ok(())
        });
        let target = TargetIdentity::new("demo", "late");
        let env = instrumented();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"hang", b"ok"]);
        let mut runner = InProcessTrialRunner::new(registry);
        let summary = runner
            .run(
                TrialRequest {
                    run_timeout: Some(Duration::from_millis(100)),
                    ..request(&target, &env)
                },
                &mut guidance,
            )
            .unwrap();

        assert_eq!(summary.trials, 2);
        assert!(guidance.outcomes[1].is_success());
        let second = &guidance.coverage[1];
        assert_eq!(second.hit_count("normal", 1), 1);
        assert_eq!(second.hit_count("straggler", 99), 0);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn hanging_workers_are_capped() {
        let mut registry = TargetRegistry::new();
        registry.register("demo", "hang", |_| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let target = TargetIdentity::new("demo", "hang");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"a", b"b", b"c", b"d", b"e"]);
        let mut runner = InProcessTrialRunner::new(registry).with_max_stray_workers(2);
        let summary = runner
            .run(
                TrialRequest {
                    run_timeout: Some(Duration::from_millis(10)),
                    ..request(&target, &env)
                },
                &mut guidance,
            )
            .unwrap();

        assert_eq!(summary.trials, 2);
        assert_eq!(summary.failures.len(), 2);
        assert!(!summary.interrupted);
        assert_eq!(runner.live_workers(), 2);
    }

    #[test]
    fn unknown_target_is_rejected_before_any_trial() {
        let target = TargetIdentity::new("demo", "missing");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"ok"]);
        let mut runner = InProcessTrialRunner::new(registry());
        let err = runner.run(request(&target, &env), &mut guidance).unwrap_err();
        assert!(matches!(err, RunError::Resolve { .. }));
        assert!(guidance.outcomes.is_empty());
    }

    #[test]
    fn released_environment_is_an_illegal_invocation() {
        let target = TargetIdentity::new("demo", "check");
        let mut env = passthrough();
        env.release().unwrap();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"ok"]);
        let mut runner = InProcessTrialRunner::new(registry());
        assert!(matches!(
            runner.run(request(&target, &env), &mut guidance),
            Err(RunError::IllegalInvocation(_))
        ));
    }

    #[test]
    fn guidance_errors_end_the_loop_as_internal_failures() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut runner = InProcessTrialRunner::new(registry());

        let mut failing_get = ScriptedGuidance::with_inputs(&[b"ok", b"ok", b"ok"]);
        failing_get.fail_get_at = Some(1);
        let summary = runner.run(request(&target, &env), &mut failing_get).unwrap();
        assert_eq!(summary.trials, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, FailureKind::GuidanceInternalError);

        let mut failing_handle = ScriptedGuidance::with_inputs(&[b"panic", b"ok"]);
        failing_handle.fail_handle_at = Some(0);
        let summary = runner.run(request(&target, &env), &mut failing_handle).unwrap();
        assert_eq!(summary.trials, 1);
        let kinds: Vec<_> = summary.failures.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![FailureKind::UncaughtError, FailureKind::GuidanceInternalError]
        );
    }

    #[test]
    fn stop_flag_interrupts_the_loop() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"ok"]);
        let stop = Arc::new(AtomicBool::new(true));
        let mut runner = InProcessTrialRunner::new(registry()).with_stop_flag(Arc::clone(&stop));
        let summary = runner.run(request(&target, &env), &mut guidance).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.trials, 0);
    }

    #[test]
    fn sink_receives_one_line_per_trial() {
        let target = TargetIdentity::new("demo", "check");
        let env = passthrough();
        let mut guidance = ScriptedGuidance::with_inputs(&[b"ok", b"panic"]);
        let mut runner = InProcessTrialRunner::new(registry());
        let mut sink = Vec::new();
        runner
            .run(
                TrialRequest {
                    sink: Some(&mut sink),
                    ..request(&target, &env)
                },
                &mut guidance,
            )
            .unwrap();
        let text = String::from_utf8(sink).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "trial 1 (2 bytes, 0 probes): ok");
        assert!(lines[1].ends_with("uncaught-error exploded"));
    }
}
