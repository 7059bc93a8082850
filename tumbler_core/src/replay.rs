use crate::coverage::CoverageMap;
use crate::guidance::{Guidance, GuidanceError, GuidanceFactory, GuidanceSpec, TrialOutcome};
use std::fs;
use std::path::{Path, PathBuf};

/// Runs a fixed list of saved inputs once each, in order.
///
/// Nothing is written to disk; the outcome of every replayed file is logged and kept
/// for inspection through [`ReplayGuidance::outcomes`].
#[derive(Debug)]
pub struct ReplayGuidance {
    inputs: Vec<PathBuf>,
    results_dir: PathBuf,
    next: usize,
    pending: Option<PathBuf>,
    outcomes: Vec<(PathBuf, TrialOutcome)>,
}

impl ReplayGuidance {
    pub fn new(inputs: Vec<PathBuf>, results_dir: PathBuf) -> Self {
        Self {
            inputs,
            results_dir,
            next: 0,
            pending: None,
            outcomes: Vec::new(),
        }
    }

    pub fn outcomes(&self) -> &[(PathBuf, TrialOutcome)] {
        &self.outcomes
    }
}

impl Guidance for ReplayGuidance {
    fn name(&self) -> &'static str {
        "replay"
    }

    // Replayed inputs are never generated, so blind mode has nothing to change.
    fn set_blind(&mut self, _blind: bool) {}

    fn has_input(&mut self) -> bool {
        self.next < self.inputs.len()
    }

    fn get_input(&mut self) -> Result<Vec<u8>, GuidanceError> {
        let path = self
            .inputs
            .get(self.next)
            .cloned()
            .ok_or_else(|| GuidanceError::Internal("no inputs left to replay".to_string()))?;
        self.next += 1;
        let bytes = fs::read(&path).map_err(|e| GuidanceError::io(&path, e))?;
        self.pending = Some(path);
        Ok(bytes)
    }

    fn handle_result(
        &mut self,
        outcome: &TrialOutcome,
        _coverage: &CoverageMap,
    ) -> Result<(), GuidanceError> {
        let path = self.pending.take().ok_or_else(|| {
            GuidanceError::Internal("result handled without a pending input".to_string())
        })?;
        match outcome {
            TrialOutcome::Success => log::info!("{}: ok", path.display()),
            TrialOutcome::Failure { kind, cause } => log::warn!(
                "{}: {} ({})",
                path.display(),
                kind.as_str(),
                cause.as_deref().unwrap_or("no cause")
            ),
        }
        self.outcomes.push((path, outcome.clone()));
        Ok(())
    }

    fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    fn saves_failures(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<(), GuidanceError> {
        let failed = self.outcomes.iter().filter(|(_, o)| !o.is_success()).count();
        log::info!("Replayed {} input(s), {} failed", self.outcomes.len(), failed);
        Ok(())
    }
}

/// Builds a [`ReplayGuidance`] over the same input files for every campaign.
#[derive(Debug, Clone)]
pub struct ReplayFactory {
    inputs: Vec<PathBuf>,
}

impl ReplayFactory {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self { inputs }
    }
}

impl GuidanceFactory for ReplayFactory {
    fn create(&self, spec: &GuidanceSpec) -> Result<Box<dyn Guidance>, GuidanceError> {
        if let Some(missing) = self.inputs.iter().find(|p| !p.is_file()) {
            return Err(GuidanceError::io(
                missing,
                std::io::Error::new(std::io::ErrorKind::NotFound, "input file not found"),
            ));
        }
        Ok(Box::new(ReplayGuidance::new(
            self.inputs.clone(),
            spec.results_dir.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuidanceOptions, TargetIdentity};
    use crate::guidance::FailureKind;
    use tempfile::tempdir;

    fn spec(results_dir: PathBuf) -> GuidanceSpec {
        GuidanceSpec {
            target: TargetIdentity::new("demo", "t"),
            duration: None,
            results_dir,
            seed_dir: None,
            options: GuidanceOptions::default(),
        }
    }

    #[test]
    fn replays_each_input_once_in_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();

        let mut replay = ReplayGuidance::new(vec![a.clone(), b.clone()], dir.path().into());
        assert_eq!(replay.get_input().unwrap(), b"first");
        replay
            .handle_result(&TrialOutcome::Success, &CoverageMap::new())
            .unwrap();
        assert!(replay.has_input());
        assert_eq!(replay.get_input().unwrap(), b"second");
        let crash = TrialOutcome::failure(FailureKind::UncaughtError, "boom");
        replay.handle_result(&crash, &CoverageMap::new()).unwrap();
        assert!(!replay.has_input());
        replay.close().unwrap();

        assert_eq!(
            replay.outcomes(),
            &[(a, TrialOutcome::Success), (b, crash)]
        );
    }

    #[test]
    fn factory_rejects_missing_inputs() {
        let dir = tempdir().unwrap();
        let factory = ReplayFactory::new(vec![dir.path().join("gone")]);
        assert!(matches!(
            factory.create(&spec(dir.path().into())),
            Err(GuidanceError::Io { .. })
        ));
    }

    #[test]
    fn replay_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"x").unwrap();
        let results = dir.path().join("results");
        let mut replay = ReplayFactory::new(vec![input])
            .create(&spec(results.clone()))
            .unwrap();
        replay.get_input().unwrap();
        replay
            .handle_result(&TrialOutcome::Success, &CoverageMap::new())
            .unwrap();
        replay.close().unwrap();
        assert!(!results.exists());
        assert_eq!(replay.results_dir(), results);
    }
}
