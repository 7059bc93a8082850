use crate::duration::{DurationParseError, parse_duration};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const USAGE: &str = "tumbler fuzz --class=demo::parser --method=parse_header";

/// Errors raised while turning raw options into a [`SessionConfig`].
///
/// These are always detected before any environment or guidance engine is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Option --class is required")]
    MissingClass,
    #[error("Option --method is required")]
    MissingMethod,
    #[error("Option --runTimeout must be a non-negative integer, got {0:?}")]
    InvalidRunTimeout(String),
    #[error("Option --time is invalid ({value:?}): {source}")]
    InvalidTime {
        value: String,
        #[source]
        source: DurationParseError,
    },
    #[error("Option --engine is invalid, expected 'coverage-guided' or 'execution-indexed', got {0:?}")]
    InvalidEngine(String),
    #[error("Failed to read options file {path:?}: {message}")]
    ReadFile { path: PathBuf, message: String },
    #[error("Failed to parse TOML from options file {path:?}: {message}")]
    ParseFile { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    #[default]
    CoverageGuided,
    ExecutionIndexed,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::CoverageGuided => "coverage-guided",
            EngineKind::ExecutionIndexed => "execution-indexed",
        }
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coverage-guided" | "coverage" => Ok(EngineKind::CoverageGuided),
            "execution-indexed" | "indexed" => Ok(EngineKind::ExecutionIndexed),
            _ => Err(ConfigError::InvalidEngine(s.to_string())),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The harness a campaign fuzzes: a method registered under a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub namespace: String,
    pub method: String,
}

impl TargetIdentity {
    pub fn new(namespace: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.method)
    }
}

/// Option values exactly as the user supplied them, before any validation.
///
/// Field names follow the command-line spelling so the same record can be read from
/// a TOML options file.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RawOptions {
    pub class: Option<String>,
    pub method: Option<String>,
    pub time: Option<String>,
    pub run_timeout: Option<String>,
    pub engine: Option<String>,
    pub blind: bool,
    pub no_cov: bool,
    #[serde(rename = "in")]
    pub input_dir: Option<PathBuf>,
    #[serde(rename = "out")]
    pub output_dir: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub save_all: bool,
    pub lib_fuzzer_compat_output: bool,
    pub quiet: bool,
    pub exit_on_crash: bool,
    pub fixed_size: bool,
    pub excludes: Option<String>,
    pub includes: Option<String>,
    pub code_roots: Vec<PathBuf>,
}

impl RawOptions {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Applies `overrides` on top of `self`. Values present in `overrides` win and
    /// switches are OR-ed, so a switch set in either source stays set.
    pub fn overlay(mut self, overrides: RawOptions) -> Self {
        fn take<T>(base: &mut Option<T>, over: Option<T>) {
            if over.is_some() {
                *base = over;
            }
        }
        take(&mut self.class, overrides.class);
        take(&mut self.method, overrides.method);
        take(&mut self.time, overrides.time);
        take(&mut self.run_timeout, overrides.run_timeout);
        take(&mut self.engine, overrides.engine);
        take(&mut self.input_dir, overrides.input_dir);
        take(&mut self.output_dir, overrides.output_dir);
        take(&mut self.target, overrides.target);
        take(&mut self.excludes, overrides.excludes);
        take(&mut self.includes, overrides.includes);
        if !overrides.code_roots.is_empty() {
            self.code_roots = overrides.code_roots;
        }
        self.blind |= overrides.blind;
        self.no_cov |= overrides.no_cov;
        self.save_all |= overrides.save_all;
        self.lib_fuzzer_compat_output |= overrides.lib_fuzzer_compat_output;
        self.quiet |= overrides.quiet;
        self.exit_on_crash |= overrides.exit_on_crash;
        self.fixed_size |= overrides.fixed_size;
        self
    }
}

pub fn default_results_root() -> PathBuf {
    PathBuf::from("target")
}

pub fn default_output_dir(target: &TargetIdentity) -> PathBuf {
    PathBuf::from("fuzz-results")
        .join(&target.namespace)
        .join(&target.method)
}

/// Flags handed to the guidance engine's constructor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuidanceOptions {
    pub engine: EngineKind,
    pub trace_generators: bool,
    pub save_all_inputs: bool,
    pub libfuzzer_compat_output: bool,
    pub quiet: bool,
    pub exit_on_crash: bool,
    pub run_timeout_ms: u64,
    pub fixed_size_inputs: bool,
}

/// A validated, immutable description of one fuzzing campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub target: TargetIdentity,
    pub duration: Option<Duration>,
    pub run_timeout_ms: u64,
    pub engine: EngineKind,
    pub blind: bool,
    pub coverage_enabled: bool,
    pub code_roots: Vec<PathBuf>,
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub seed_dir: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub exit_on_crash: bool,
    pub save_all_inputs: bool,
    pub libfuzzer_compat_output: bool,
    pub fixed_size_inputs: bool,
    pub quiet: bool,
}

impl SessionConfig {
    /// Validates `raw`. Has no side effects.
    pub fn from_options(raw: &RawOptions) -> Result<Self, ConfigError> {
        let namespace = non_empty(raw.class.as_deref()).ok_or(ConfigError::MissingClass)?;
        let method = non_empty(raw.method.as_deref()).ok_or(ConfigError::MissingMethod)?;
        let target = TargetIdentity::new(namespace, method);

        let run_timeout_ms = match non_empty(raw.run_timeout.as_deref()) {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidRunTimeout(value.to_string()))?,
            None => 0,
        };

        let duration = match non_empty(raw.time.as_deref()) {
            Some(value) => Some(parse_duration(value).map_err(|source| ConfigError::InvalidTime {
                value: value.to_string(),
                source,
            })?),
            None => None,
        };

        let engine = match non_empty(raw.engine.as_deref()) {
            Some(value) => value.parse()?,
            None => EngineKind::default(),
        };

        let results_root = raw.target.clone().unwrap_or_else(default_results_root);
        let output_dir = match &raw.output_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => default_output_dir(&target),
        };
        let code_roots = if raw.code_roots.is_empty() {
            vec![results_root.clone()]
        } else {
            raw.code_roots.clone()
        };

        Ok(Self {
            target,
            duration,
            run_timeout_ms,
            engine,
            blind: raw.blind,
            coverage_enabled: !raw.no_cov,
            code_roots,
            excludes: split_prefixes(raw.excludes.as_deref()),
            includes: split_prefixes(raw.includes.as_deref()),
            seed_dir: raw.input_dir.clone(),
            results_dir: results_root.join(output_dir),
            exit_on_crash: raw.exit_on_crash,
            save_all_inputs: raw.save_all,
            libfuzzer_compat_output: raw.lib_fuzzer_compat_output,
            fixed_size_inputs: raw.fixed_size,
            quiet: raw.quiet,
        })
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_ms > 0).then(|| Duration::from_millis(self.run_timeout_ms))
    }

    /// Whether the loading context should record ordered probe traces.
    pub fn tracing_enabled(&self) -> bool {
        self.engine == EngineKind::ExecutionIndexed
    }

    pub fn guidance_options(&self) -> GuidanceOptions {
        GuidanceOptions {
            engine: self.engine,
            trace_generators: self.tracing_enabled(),
            save_all_inputs: self.save_all_inputs,
            libfuzzer_compat_output: self.libfuzzer_compat_output,
            quiet: self.quiet,
            exit_on_crash: self.exit_on_crash,
            run_timeout_ms: self.run_timeout_ms,
            fixed_size_inputs: self.fixed_size_inputs,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn split_prefixes(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
