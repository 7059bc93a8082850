pub mod campaign;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod duration;
pub mod engine;
pub mod environment;
pub mod executor;
pub mod feedback;
pub mod guidance;
pub mod mutator;
pub mod oracle;
pub mod replay;
pub mod scheduler;
pub mod stats;
pub mod target;
pub mod verdict;

pub use campaign::{CampaignDriver, CampaignReport, CampaignState};
pub use config::{
    ConfigError, EngineKind, GuidanceOptions, RawOptions, SessionConfig, TargetIdentity,
};
pub use corpus::{CorpusError, FailureRecord, ResultsStore};
pub use coverage::{CoverageMap, Probe};
pub use duration::{DurationParseError, parse_duration};
pub use engine::{BuiltinGuidanceFactory, CoverageGuidedEngine};
pub use environment::{
    DefaultEnvironmentFactory, EnvironmentError, EnvironmentFactory, ExecutionEnvironment,
    InstrumentationFilter, LoadingContext,
};
pub use executor::{
    InProcessTrialRunner, RecordedFailure, RunError, RunSummary, TrialRequest, TrialRunner,
};
pub use guidance::{
    FailureKind, Guidance, GuidanceError, GuidanceFactory, GuidanceSpec, TrialOutcome,
};
pub use replay::{ReplayFactory, ReplayGuidance};
pub use target::{Harness, ResolveError, TargetRegistry, TrialContext, TrialError};
pub use verdict::{CampaignSummary, CampaignVerdict, FuzzError};
