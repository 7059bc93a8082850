use crate::config::EngineKind;
use crate::corpus::{CorpusError, ResultsStore, load_seed_inputs};
use crate::coverage::CoverageMap;
use crate::feedback::{CoverageFeedback, UniqueFailureFeedback};
use crate::guidance::{Guidance, GuidanceError, GuidanceFactory, GuidanceSpec, TrialOutcome};
use crate::mutator::{DEFAULT_INPUT_LEN, HavocMutator, Mutator, generate_input};
use crate::scheduler::{CyclingScheduler, RandomScheduler, Scheduler};
use crate::stats::{CampaignStats, ProgressPrinter};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Largest input generated from scratch when input sizes are not fixed.
const MAX_GENERATED_LEN: usize = 256;

impl From<CorpusError> for GuidanceError {
    fn from(err: CorpusError) -> Self {
        match err {
            CorpusError::Io { path, message } => {
                GuidanceError::io(path, std::io::Error::other(message))
            }
            CorpusError::Serialization(msg) => GuidanceError::Internal(msg),
        }
    }
}

/// The built-in coverage-guided engine.
///
/// Seeds run first. Afterwards every input is either generated from scratch (blind
/// mode, or nothing queued yet) or mutated from a queued parent. Inputs that reach new
/// coverage join the queue and `corpus/`; unique target failures go to `failures/`.
/// The execution-indexed variant also queues inputs with a never-seen probe trace.
pub struct CoverageGuidedEngine {
    spec: GuidanceSpec,
    blind: bool,
    store: ResultsStore,
    pending_seeds: VecDeque<Vec<u8>>,
    queue: Vec<Vec<u8>>,
    current: Option<(Vec<u8>, Option<usize>)>,
    rng: ChaCha8Rng,
    mutator: HavocMutator,
    scheduler: Box<dyn Scheduler>,
    coverage: CoverageFeedback,
    failures: UniqueFailureFeedback,
    fixed_len: usize,
    stats: CampaignStats,
    started: Instant,
    progress: ProgressPrinter,
    closed: bool,
}

impl CoverageGuidedEngine {
    pub fn new(spec: GuidanceSpec) -> Result<Self, GuidanceError> {
        let seed = time_seed() ^ target_seed(&spec);
        let progress =
            ProgressPrinter::stderr(spec.options.libfuzzer_compat_output, spec.options.quiet);
        Self::with_parts(spec, seed, progress)
    }

    /// Builds an engine with a fixed RNG seed and a caller-supplied progress sink.
    pub fn with_parts(
        spec: GuidanceSpec,
        rng_seed: u64,
        progress: ProgressPrinter,
    ) -> Result<Self, GuidanceError> {
        let seeds = match &spec.seed_dir {
            Some(dir) if !dir.is_dir() => return Err(GuidanceError::SeedDirMissing(dir.clone())),
            Some(dir) => load_seed_inputs(dir)?,
            None => Vec::new(),
        };
        let store = ResultsStore::open(&spec.results_dir, spec.options.save_all_inputs)?;

        let indexed = spec.options.engine == EngineKind::ExecutionIndexed;
        let scheduler: Box<dyn Scheduler> = if indexed {
            Box::new(RandomScheduler::new())
        } else {
            Box::new(CyclingScheduler::default())
        };
        let fixed_len = seeds.first().map_or(DEFAULT_INPUT_LEN, Vec::len);

        log::info!(
            "{} engine for {} writing to {} ({} seed input(s))",
            spec.options.engine,
            spec.target,
            spec.results_dir.display(),
            seeds.len()
        );

        Ok(Self {
            stats: CampaignStats {
                target: spec.target.to_string(),
                engine: spec.options.engine.to_string(),
                ..Default::default()
            },
            mutator: HavocMutator::new(spec.options.fixed_size_inputs),
            coverage: CoverageFeedback::new(indexed || spec.options.trace_generators),
            spec,
            blind: false,
            store,
            pending_seeds: seeds.into(),
            queue: Vec::new(),
            current: None,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            scheduler,
            failures: UniqueFailureFeedback::new(),
            fixed_len,
            started: Instant::now(),
            progress,
            closed: false,
        })
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn next_input(&mut self) -> (Vec<u8>, Option<usize>) {
        if let Some(seed) = self.pending_seeds.pop_front() {
            return (seed, None);
        }
        if !self.blind {
            if let Some(parent) = self.scheduler.next(self.queue.len(), &mut self.rng) {
                let child = self.mutator.mutate(&self.queue[parent], &mut self.rng);
                return (child, Some(parent));
            }
        }
        let len = if self.mutator.is_fixed_size() {
            self.fixed_len
        } else {
            self.rng.random_range(1..=MAX_GENERATED_LEN)
        };
        (generate_input(&mut self.rng, len), None)
    }

    fn refresh_stats(&mut self) {
        self.stats.blind = self.blind;
        self.stats.corpus_size = self.queue.len();
        self.stats.coverage_probes = self.coverage.total_probes();
        self.stats.elapsed_secs = self.started.elapsed().as_secs_f64();
    }
}

impl Guidance for CoverageGuidedEngine {
    fn name(&self) -> &'static str {
        match self.spec.options.engine {
            EngineKind::CoverageGuided => "coverage-guided",
            EngineKind::ExecutionIndexed => "execution-indexed",
        }
    }

    fn set_blind(&mut self, blind: bool) {
        self.blind = blind;
    }

    fn has_input(&mut self) -> bool {
        if self.spec.options.exit_on_crash && self.stats.failures > 0 {
            return false;
        }
        match self.spec.duration {
            Some(limit) => self.started.elapsed() < limit,
            None => true,
        }
    }

    fn get_input(&mut self) -> Result<Vec<u8>, GuidanceError> {
        if self.current.is_some() {
            return Err(GuidanceError::Internal(
                "input requested before the previous result was handled".to_string(),
            ));
        }
        let (input, parent) = self.next_input();
        self.current = Some((input.clone(), parent));
        Ok(input)
    }

    fn handle_result(
        &mut self,
        outcome: &TrialOutcome,
        coverage: &CoverageMap,
    ) -> Result<(), GuidanceError> {
        let (input, parent) = self.current.take().ok_or_else(|| {
            GuidanceError::Internal("result handled without a pending input".to_string())
        })?;
        self.stats.trials += 1;
        self.store.save_any(&input)?;

        let novelty = self.coverage.observe(coverage);
        let mut interesting = false;
        match outcome {
            TrialOutcome::Success => {
                if !self.blind && novelty.is_interesting() {
                    self.store.save_corpus(&input)?;
                    self.queue.push(input);
                    interesting = true;
                }
            }
            TrialOutcome::Failure { kind, cause } if kind.is_target_originated() => {
                self.stats.failures += 1;
                if self.failures.is_new(*kind, cause.as_deref()) {
                    self.stats.unique_failures += 1;
                    let path = self.store.save_failure(
                        &input,
                        self.stats.trials,
                        kind.as_str(),
                        cause.as_deref(),
                    )?;
                    log::warn!(
                        "Trial {} failed ({}): {}; input saved to {}",
                        self.stats.trials,
                        kind.as_str(),
                        cause.as_deref().unwrap_or("no cause"),
                        path.display()
                    );
                }
            }
            TrialOutcome::Failure { .. } => {}
        }
        if let Some(parent) = parent {
            self.scheduler.report_feedback(parent, interesting);
        }

        self.refresh_stats();
        if interesting {
            self.progress.new_coverage(&self.stats);
        }
        self.progress.tick(&self.stats);
        Ok(())
    }

    fn results_dir(&self) -> &Path {
        self.store.root()
    }

    fn close(&mut self) -> Result<(), GuidanceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.refresh_stats();
        self.progress.finish(&self.stats);
        let path = self.store.write_stats(&self.stats)?;
        log::debug!("Wrote campaign statistics to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Debug for CoverageGuidedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageGuidedEngine")
            .field("target", &self.spec.target)
            .field("blind", &self.blind)
            .field("queue", &self.queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Builds a [`CoverageGuidedEngine`] for either engine kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinGuidanceFactory;

impl GuidanceFactory for BuiltinGuidanceFactory {
    fn create(&self, spec: &GuidanceSpec) -> Result<Box<dyn Guidance>, GuidanceError> {
        Ok(Box::new(CoverageGuidedEngine::new(spec.clone())?))
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn target_seed(spec: &GuidanceSpec) -> u64 {
    let digest = md5::compute(spec.target.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuidanceOptions, TargetIdentity};
    use crate::corpus::{CORPUS_DIR, FAILURES_DIR, STATS_FILE};
    use crate::guidance::FailureKind;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spec(results_dir: PathBuf, options: GuidanceOptions) -> GuidanceSpec {
        GuidanceSpec {
            target: TargetIdentity::new("demo", "t"),
            duration: None,
            results_dir,
            seed_dir: None,
            options: GuidanceOptions {
                quiet: true,
                ..options
            },
        }
    }

    fn engine(spec: GuidanceSpec) -> CoverageGuidedEngine {
        CoverageGuidedEngine::with_parts(spec, 42, ProgressPrinter::stderr(false, true)).unwrap()
    }

    fn coverage(probes: &[u32]) -> CoverageMap {
        let mut map = CoverageMap::new();
        for site in probes {
            map.record("demo", *site, false);
        }
        map
    }

    #[test]
    fn missing_seed_dir_fails_construction() {
        let dir = tempdir().unwrap();
        let mut spec = spec(dir.path().join("out"), GuidanceOptions::default());
        spec.seed_dir = Some(dir.path().join("no-such-seeds"));
        assert!(matches!(
            CoverageGuidedEngine::with_parts(spec, 1, ProgressPrinter::stderr(false, true)),
            Err(GuidanceError::SeedDirMissing(_))
        ));
    }

    #[test]
    fn seeds_are_replayed_first() {
        let dir = tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), b"seed-a").unwrap();
        fs::write(seeds.join("b"), b"seed-b").unwrap();

        let mut spec = spec(dir.path().join("out"), GuidanceOptions::default());
        spec.seed_dir = Some(seeds);
        let mut engine = engine(spec);

        assert_eq!(engine.get_input().unwrap(), b"seed-a");
        engine.handle_result(&TrialOutcome::Success, &coverage(&[1])).unwrap();
        assert_eq!(engine.get_input().unwrap(), b"seed-b");
        engine.handle_result(&TrialOutcome::Success, &coverage(&[1])).unwrap();
        assert_eq!(engine.queue_len(), 1);
    }

    #[test]
    fn new_coverage_grows_queue_and_corpus_dir() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("out");
        let mut engine = engine(spec(results.clone(), GuidanceOptions::default()));

        for probes in [&[1u32][..], &[1], &[1, 2], &[]] {
            engine.get_input().unwrap();
            engine
                .handle_result(&TrialOutcome::Success, &coverage(probes))
                .unwrap();
        }
        assert_eq!(engine.queue_len(), 2);
        assert_eq!(fs::read_dir(results.join(CORPUS_DIR)).unwrap().count(), 2);
        assert_eq!(engine.stats().coverage_probes, 2);
        assert_eq!(engine.stats().trials, 4);
    }

    #[test]
    fn blind_mode_never_grows_queue_but_counts_coverage() {
        let dir = tempdir().unwrap();
        let mut engine = engine(spec(dir.path().join("out"), GuidanceOptions::default()));
        engine.set_blind(true);
        for site in 0..5 {
            engine.get_input().unwrap();
            engine
                .handle_result(&TrialOutcome::Success, &coverage(&[site]))
                .unwrap();
        }
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.stats().coverage_probes, 5);
    }

    #[test]
    fn unique_failures_are_saved_once() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("out");
        let mut engine = engine(spec(results.clone(), GuidanceOptions::default()));
        let boom = TrialOutcome::failure(FailureKind::UncaughtError, "boom");
        for _ in 0..3 {
            engine.get_input().unwrap();
            engine.handle_result(&boom, &CoverageMap::new()).unwrap();
        }
        assert_eq!(engine.stats().failures, 3);
        assert_eq!(engine.stats().unique_failures, 1);
        // input file plus its sidecar
        assert_eq!(fs::read_dir(results.join(FAILURES_DIR)).unwrap().count(), 2);
    }

    #[test]
    fn exit_on_crash_stops_after_first_failure() {
        let dir = tempdir().unwrap();
        let options = GuidanceOptions {
            exit_on_crash: true,
            ..Default::default()
        };
        let mut engine = engine(spec(dir.path().join("out"), options));
        assert!(engine.has_input());
        engine.get_input().unwrap();
        engine
            .handle_result(
                &TrialOutcome::failure(FailureKind::AssertionFailure, "bad"),
                &CoverageMap::new(),
            )
            .unwrap();
        assert!(!engine.has_input());
    }

    #[test]
    fn elapsed_duration_ends_the_campaign() {
        let dir = tempdir().unwrap();
        let mut spec = spec(dir.path().join("out"), GuidanceOptions::default());
        spec.duration = Some(Duration::ZERO);
        let mut engine = engine(spec);
        assert!(!engine.has_input());
    }

    #[test]
    fn fixed_size_inputs_keep_seed_length() {
        let dir = tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), b"0123456789").unwrap();
        let options = GuidanceOptions {
            fixed_size_inputs: true,
            ..Default::default()
        };
        let mut spec = spec(dir.path().join("out"), options);
        spec.seed_dir = Some(seeds);
        let mut engine = engine(spec);
        for site in 0..20 {
            let input = engine.get_input().unwrap();
            assert_eq!(input.len(), 10);
            engine
                .handle_result(&TrialOutcome::Success, &coverage(&[site % 4]))
                .unwrap();
        }
    }

    #[test]
    fn protocol_violations_are_internal_errors() {
        let dir = tempdir().unwrap();
        let mut engine = engine(spec(dir.path().join("out"), GuidanceOptions::default()));
        assert!(matches!(
            engine.handle_result(&TrialOutcome::Success, &CoverageMap::new()),
            Err(GuidanceError::Internal(_))
        ));
        engine.get_input().unwrap();
        assert!(matches!(
            engine.get_input(),
            Err(GuidanceError::Internal(_))
        ));
    }

    #[test]
    fn close_writes_stats_once() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("out");
        let mut engine = engine(spec(results.clone(), GuidanceOptions::default()));
        engine.get_input().unwrap();
        engine
            .handle_result(&TrialOutcome::Success, &CoverageMap::new())
            .unwrap();
        engine.close().unwrap();
        engine.close().unwrap();

        let stats: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(results.join(STATS_FILE)).unwrap()).unwrap();
        assert_eq!(stats["trials"], 1);
        assert_eq!(stats["target"], "demo::t");
    }

    #[test]
    fn factory_builds_engine_named_after_kind() {
        let dir = tempdir().unwrap();
        let options = GuidanceOptions {
            engine: EngineKind::ExecutionIndexed,
            trace_generators: true,
            ..Default::default()
        };
        let guidance = BuiltinGuidanceFactory
            .create(&spec(dir.path().join("out"), options))
            .unwrap();
        assert_eq!(guidance.name(), "execution-indexed");
        assert_eq!(guidance.results_dir(), dir.path().join("out"));
    }
}
