//! The time-bounded trial loop.
//!
//! Each trial picks a base buffer (a mutated corpus seed, or fresh random
//! bytes), decodes it into arguments, invokes the target through the
//! [`Harness`] and feeds the observed coverage signature and failure back
//! into the corpus and the crash reporter. Exactly one trial is in flight at
//! any time, and every random decision comes from the session's seeded PRNG.

use crate::config::{ConfigError, FuzzConfig};
use crate::corpus::{Corpus, CorpusError, InMemorySeedCorpus, SeedKey, read_seed_files};
use crate::decoder::{DecodeError, decode, encode_text_args};
use crate::harness::{
    CoverageSignature, Harness, HarnessError, Outcome, ResolvedTarget, TargetSpec,
};
use crate::mutator::{MarkupMutator, Mutator, MutatorError};
use crate::reporter::{CrashReporter, ReportError};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Trials between two progress log lines.
const PROGRESS_INTERVAL: u64 = 10_000;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error("Target cannot be driven: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Mutator(#[from] MutatorError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Failed to write instrumentation artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Session has already been run")]
    AlreadyRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
}

/// Something new the session found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NewCoverage {
        trial: u64,
        signature: CoverageSignature,
        input_len: usize,
        input_digest: String,
    },
    NewFailure {
        trial: u64,
        identity: String,
        report_path: PathBuf,
    },
}

/// Aggregate counts reported when the loop ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub seed: u64,
    pub trials: u64,
    pub skipped_trials: u64,
    pub failure_occurrences: u64,
    pub seed_count: usize,
    pub coverage_seed_count: usize,
    pub distinct_errors: usize,
    pub error_identities: Vec<String>,
    pub elapsed: Duration,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PRNG seed:           {}", self.seed)?;
        writeln!(f, "Trials:              {}", self.trials)?;
        writeln!(f, "Skipped trials:      {}", self.skipped_trials)?;
        writeln!(f, "Failure occurrences: {}", self.failure_occurrences)?;
        writeln!(
            f,
            "Seeds:               {} ({} by coverage)",
            self.seed_count, self.coverage_seed_count
        )?;
        writeln!(f, "Distinct errors:     {}", self.distinct_errors)?;
        for identity in &self.error_identities {
            writeln!(f, "  - {identity}")?;
        }
        write!(f, "Elapsed:             {:.2?}", self.elapsed)
    }
}

/// One fuzzing run against one target.
pub struct FuzzSession<H: Harness> {
    harness: H,
    target_spec: TargetSpec,
    config: FuzzConfig,
    seed: u64,
    rng: ChaCha8Rng,
    mutator: MarkupMutator,
    corpus: InMemorySeedCorpus<Vec<u8>>,
    reporter: CrashReporter,
    events: Vec<SessionEvent>,
    state: SessionState,
    next_sentinel: u32,
    trials: u64,
    skipped_trials: u64,
}

impl<H: Harness> FuzzSession<H> {
    /// Validates `config` and seeds the PRNG. The seed is drawn at random
    /// when the config does not fix one; read it back with [`Self::seed`].
    pub fn new(harness: H, target_spec: TargetSpec, config: FuzzConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let mutator = MarkupMutator::new(config.mutation)?;
        let seed = config.session.seed.unwrap_or_else(rand::random);
        let corpus = InMemorySeedCorpus::with_capacity_limit(config.corpus.max_entries);
        let reporter = CrashReporter::new(config.report.report_dir.clone());

        Ok(Self {
            harness,
            target_spec,
            config,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            mutator,
            corpus,
            reporter,
            events: Vec::new(),
            state: SessionState::Idle,
            next_sentinel: 0,
            trials: 0,
            skipped_trials: 0,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn corpus(&self) -> &InMemorySeedCorpus<Vec<u8>> {
        &self.corpus
    }

    pub fn reporter(&self) -> &CrashReporter {
        &self.reporter
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    pub fn harness(&self) -> &H {
        &self.harness
    }

    /// Adds a raw buffer under the next sentinel key. Only meaningful before
    /// [`Self::run`].
    pub fn add_seed(&mut self, buffer: Vec<u8>) -> bool {
        let key = SeedKey::Sentinel(self.next_sentinel);
        self.next_sentinel += 1;
        self.corpus.try_insert(key, buffer)
    }

    /// Resolves and instruments the target, then runs trials until the
    /// time budget or the trial cap is reached.
    pub fn run(&mut self) -> Result<SessionSummary, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyRun);
        }
        self.state = SessionState::Running;
        let result = self.run_inner();
        self.state = SessionState::Completed;
        if let Err(e) = &result {
            warn!(error = %e, "Fuzz session aborted");
        }
        result
    }

    fn run_inner(&mut self) -> Result<SessionSummary, SessionError> {
        let target = self.harness.resolve(&self.target_spec)?;
        let unit = self.harness.instrument(&target)?;
        debug!(unit = %unit.unit_name, members = unit.members.len(), "Target instrumented");
        if let Some(path) = &self.config.report.instrumented_artifact_path {
            std::fs::write(path, unit.listing.as_bytes()).map_err(|source| {
                SessionError::Artifact {
                    path: path.clone(),
                    source,
                }
            })?;
            info!(path = ?path, "Wrote instrumentation artifact");
        }

        self.load_initial_seeds(&target)?;

        let budget = Duration::from_secs(self.config.session.time_budget_secs);
        info!(
            target = %target.qualified_name,
            seed = self.seed,
            budget_secs = budget.as_secs(),
            max_trials = ?self.config.session.max_trials,
            initial_seeds = self.corpus.len(),
            "Starting fuzz session"
        );

        let start = Instant::now();
        while !self.should_stop(start.elapsed(), budget) {
            self.trials += 1;
            self.run_trial(&target)?;
            if self.trials % PROGRESS_INTERVAL == 0 {
                info!(
                    trials = self.trials,
                    seeds = self.corpus.len(),
                    distinct_errors = self.reporter.distinct_count(),
                    elapsed = ?start.elapsed(),
                    "Progress"
                );
            }
        }

        let summary = self.summary(start.elapsed());
        info!(
            trials = summary.trials,
            seeds = summary.seed_count,
            distinct_errors = summary.distinct_errors,
            elapsed = ?summary.elapsed,
            "Fuzz session completed"
        );
        Ok(summary)
    }

    fn should_stop(&self, elapsed: Duration, budget: Duration) -> bool {
        elapsed >= budget
            || self
                .config
                .session
                .max_trials
                .is_some_and(|max| self.trials >= max)
    }

    fn load_initial_seeds(&mut self, target: &ResolvedTarget) -> Result<(), SessionError> {
        let arity = target.param_types.len();
        let literals = self.config.corpus.literal_seeds.clone();
        for literal in &literals {
            let texts = vec![literal.as_str(); arity];
            self.add_seed(encode_text_args(&texts));
        }

        let files = read_seed_files(&self.config.corpus.seed_paths)?;
        for (path, bytes) in files {
            debug!(path = ?path, len = bytes.len(), "Loaded seed file");
            self.add_seed(bytes);
        }
        Ok(())
    }

    fn next_candidate(&mut self) -> Result<Vec<u8>, SessionError> {
        let occupancy = self.corpus.len();
        let from_corpus = occupancy > 0 && self.rng.random_range(0..=occupancy) < occupancy;
        if from_corpus {
            if let Some(base) = self.corpus.pick_random(&mut self.rng).cloned() {
                let mut candidate = self.mutator.mutate(&base, &mut self.rng)?;
                if let Some(max_len) = self.config.corpus.max_input_len {
                    candidate.truncate(max_len);
                }
                return Ok(candidate);
            }
        }

        let mut fresh = vec![0u8; self.config.session.random_input_len];
        self.rng.fill(fresh.as_mut_slice());
        Ok(fresh)
    }

    fn run_trial(&mut self, target: &ResolvedTarget) -> Result<(), SessionError> {
        let candidate = self.next_candidate()?;

        let args = match decode(&candidate, &target.param_types) {
            Ok(args) => args,
            Err(e) if e.is_recoverable() => {
                self.skipped_trials += 1;
                debug!(trial = self.trials, len = candidate.len(), reason = %e, "Skipping trial");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.harness.reset_coverage();
        let result = self.harness.invoke(target, &args);
        let signature = self.harness.coverage();

        let input_len = candidate.len();
        let outcome = Outcome::from_invocation(result, signature);

        if self
            .corpus
            .try_insert(SeedKey::Coverage(signature), candidate.clone())
        {
            let digest = format!("{:x}", md5::compute(&candidate));
            info!(
                trial = self.trials,
                signature = format_args!("{signature:#x}"),
                len = input_len,
                md5 = %digest,
                "New coverage"
            );
            self.events.push(SessionEvent::NewCoverage {
                trial: self.trials,
                signature,
                input_len,
                input_digest: digest,
            });
        }

        if let Outcome::Failed(failure) = outcome {
            let report =
                self.reporter
                    .observe(&failure, &target.routine_name, &args, &candidate)?;
            if let Some(report) = report {
                info!(
                    trial = self.trials,
                    identity = %report.identity,
                    report = ?report.path,
                    md5 = %report.input_digest,
                    "New failure"
                );
                self.events.push(SessionEvent::NewFailure {
                    trial: self.trials,
                    identity: report.identity,
                    report_path: report.path,
                });
            }
        }
        Ok(())
    }

    fn summary(&self, elapsed: Duration) -> SessionSummary {
        SessionSummary {
            seed: self.seed,
            trials: self.trials,
            skipped_trials: self.skipped_trials,
            failure_occurrences: self.reporter.total_occurrences(),
            seed_count: self.corpus.len(),
            coverage_seed_count: self.corpus.coverage_len(),
            distinct_errors: self.reporter.distinct_count(),
            error_identities: self.reporter.identities(),
            elapsed,
        }
    }
}
