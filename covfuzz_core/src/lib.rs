pub mod config;
pub mod corpus;
pub mod decoder;
pub mod engine;
pub mod harness;
pub mod input;
pub mod mutator;
pub mod reporter;

pub use config::{ConfigError, FuzzConfig};
pub use corpus::{Corpus, CorpusError, InMemorySeedCorpus, SeedKey};
pub use decoder::{ArgValue, DecodeError, ParamType, decode, encode_text_args};
pub use engine::{FuzzSession, SessionError, SessionEvent, SessionState, SessionSummary};
pub use harness::{
    CoverageSignature, FailureKind, Harness, HarnessError, InProcessHarness, Outcome, Probe,
    RaisedError, ResolvedTarget, TargetFailure, TargetSpec,
};
pub use input::Input;
pub use mutator::{MarkupMutator, MutationProbabilities, Mutator, MutatorError};
pub use reporter::{CrashReport, CrashReporter, ReportError};
