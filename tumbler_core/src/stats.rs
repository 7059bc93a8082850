use serde::Serialize;
use std::io::Write;
use std::time::{Duration, Instant};

/// Counters a guidance engine keeps for the status line and `fuzz_stats.json`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CampaignStats {
    pub target: String,
    pub engine: String,
    pub blind: bool,
    pub trials: u64,
    pub failures: u64,
    pub unique_failures: u64,
    pub corpus_size: usize,
    pub coverage_probes: usize,
    pub elapsed_secs: f64,
}

impl CampaignStats {
    pub fn execs_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.trials as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// One status line, AFL-like by default or in libFuzzer's `pulse` format.
    pub fn status_line(&self, libfuzzer_compat: bool) -> String {
        if libfuzzer_compat {
            format!(
                "#{}\tpulse  cov: {} corp: {} crashes: {} exec/s: {:.0}",
                self.trials,
                self.coverage_probes,
                self.corpus_size,
                self.unique_failures,
                self.execs_per_sec()
            )
        } else {
            format!(
                "Trials: {}, Corpus: {}, Coverage: {}, Failures: {} ({} unique), Execs/sec: {:.2}",
                self.trials,
                self.corpus_size,
                self.coverage_probes,
                self.failures,
                self.unique_failures,
                self.execs_per_sec()
            )
        }
    }
}

/// Streams status lines at most once per `interval`.
pub struct ProgressPrinter {
    out: Box<dyn Write + Send>,
    libfuzzer_compat: bool,
    quiet: bool,
    interval: Duration,
    last_print: Option<Instant>,
    printed_any: bool,
}

impl ProgressPrinter {
    pub fn new(out: Box<dyn Write + Send>, libfuzzer_compat: bool, quiet: bool) -> Self {
        Self {
            out,
            libfuzzer_compat,
            quiet,
            interval: Duration::from_secs(1),
            last_print: None,
            printed_any: false,
        }
    }

    pub fn stderr(libfuzzer_compat: bool, quiet: bool) -> Self {
        Self::new(Box::new(std::io::stderr()), libfuzzer_compat, quiet)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tick(&mut self, stats: &CampaignStats) {
        if self.quiet {
            return;
        }
        let due = self
            .last_print
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.print(stats);
        }
    }

    /// libFuzzer prints a `NEW` line whenever coverage grows.
    pub fn new_coverage(&mut self, stats: &CampaignStats) {
        if self.quiet || !self.libfuzzer_compat {
            return;
        }
        let _ = writeln!(
            self.out,
            "#{}\tNEW    cov: {} corp: {} exec/s: {:.0}",
            stats.trials,
            stats.coverage_probes,
            stats.corpus_size,
            stats.execs_per_sec()
        );
    }

    pub fn finish(&mut self, stats: &CampaignStats) {
        if self.quiet {
            return;
        }
        self.print(stats);
        if !self.libfuzzer_compat && self.printed_any {
            let _ = writeln!(self.out);
        }
        let _ = self.out.flush();
    }

    fn print(&mut self, stats: &CampaignStats) {
        let line = stats.status_line(self.libfuzzer_compat);
        let _ = if self.libfuzzer_compat {
            writeln!(self.out, "{line}")
        } else {
            write!(self.out, "\r{line}   ")
        };
        let _ = self.out.flush();
        self.last_print = Some(Instant::now());
        self.printed_any = true;
    }
}

impl std::fmt::Debug for ProgressPrinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPrinter")
            .field("libfuzzer_compat", &self.libfuzzer_compat)
            .field("quiet", &self.quiet)
            .field("interval", &self.interval)
            .finish()
    }
}
