//! The boundary between the fuzz engine and the code under test.
//!
//! A [`Harness`] resolves a target routine, instruments it so that executed
//! statements feed a coverage accumulator, and invokes it with decoded
//! arguments. The engine resets and reads the accumulator explicitly around
//! every invocation; nothing here is global.

use crate::decoder::{ArgValue, ParamType};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Additive fingerprint of the positions executed during one invocation.
pub type CoverageSignature = u64;

/// Identity used for every caught panic.
pub const PANIC_IDENTITY: &str = "panic";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error("Malformed method signature '{0}': expected name(Type, ...)")]
    Signature(String),
    #[error("Failed to resolve target: {0}")]
    Resolution(String),
    #[error("Failed to instrument target: {0}")]
    Instrumentation(String),
}

/// Sums position markers. Collisions are possible and marker order does
/// not matter; two paths with equal sums are indistinguishable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoverageAccumulator {
    value: CoverageSignature,
}

impl CoverageAccumulator {
    pub const BASELINE: CoverageSignature = 0;

    pub fn reset(&mut self) {
        self.value = Self::BASELINE;
    }

    pub fn add(&mut self, position: u64) {
        self.value = self.value.wrapping_add(position);
    }

    pub fn value(&self) -> CoverageSignature {
        self.value
    }
}

/// What the user asked to fuzz: a type name, a method signature string and
/// a search path the harness may load code from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub type_name: String,
    pub signature: String,
    pub search_path: Vec<PathBuf>,
}

/// A parsed `name(Type, ...)` signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub param_types: Vec<ParamType>,
}

impl MethodSignature {
    pub fn parse(signature: &str) -> Result<Self, HarnessError> {
        let malformed = || HarnessError::Signature(signature.to_string());
        let trimmed = signature.trim();
        let (name, rest) = trimmed.split_once('(').ok_or_else(malformed)?;
        let params = rest.strip_suffix(')').ok_or_else(malformed)?;
        let name = name.trim();
        if name.is_empty() || params.contains(['(', ')']) {
            return Err(malformed());
        }
        let param_types = if params.trim().is_empty() {
            Vec::new()
        } else {
            let mut types = Vec::new();
            for param in params.split(',') {
                if param.trim().is_empty() {
                    return Err(malformed());
                }
                types.push(ParamType::from_name(param));
            }
            types
        };
        Ok(Self {
            name: name.to_string(),
            param_types,
        })
    }
}

/// A routine the harness found and can invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// `type_name.routine_name`
    pub qualified_name: String,
    pub routine_name: String,
    pub param_types: Vec<ParamType>,
    /// Harness-specific handle; meaningless to other harnesses.
    pub handle: usize,
}

impl ResolvedTarget {
    /// First `.`-separated segment of the qualified name.
    pub fn namespace_prefix(&self) -> &str {
        namespace_prefix(&self.qualified_name)
    }
}

fn namespace_prefix(qualified_name: &str) -> &str {
    qualified_name
        .split_once('.')
        .map_or(qualified_name, |(prefix, _)| prefix)
}

/// Result of instrumenting a target: the set of units that now report
/// coverage plus a human-readable listing of the transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedUnit {
    pub unit_name: String,
    pub members: Vec<String>,
    pub listing: String,
}

/// Stable classification of a target failure and the key reports are
/// deduplicated on. A routine raising a kind named `panic` is still
/// distinct from [`FailureKind::Panic`]; only their display text matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The routine panicked.
    Panic,
    /// The routine returned an error of the named kind.
    Raised(String),
}

impl FailureKind {
    pub fn identity(&self) -> &str {
        match self {
            FailureKind::Panic => PANIC_IDENTITY,
            FailureKind::Raised(kind) => kind,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

/// A failure observed while invoking the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
}

impl TargetFailure {
    pub fn identity(&self) -> &str {
        self.kind.identity()
    }
}

/// What one trial observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(CoverageSignature),
    Failed(TargetFailure),
}

impl Outcome {
    pub fn from_invocation(
        result: Result<(), TargetFailure>,
        signature: CoverageSignature,
    ) -> Self {
        match result {
            Ok(()) => Outcome::Completed(signature),
            Err(failure) => Outcome::Failed(failure),
        }
    }
}

/// Adapter that loads, instruments and invokes a target for the engine.
///
/// Implementations own the coverage accumulator. The engine calls
/// `reset_coverage` before and `coverage` once after each `invoke`, and
/// never runs two invocations at the same time.
pub trait Harness {
    fn resolve(&mut self, target: &TargetSpec) -> Result<ResolvedTarget, HarnessError>;

    fn instrument(&mut self, target: &ResolvedTarget) -> Result<InstrumentedUnit, HarnessError>;

    fn reset_coverage(&mut self);

    fn coverage(&self) -> CoverageSignature;

    fn invoke(&mut self, target: &ResolvedTarget, args: &[ArgValue]) -> Result<(), TargetFailure>;
}

/// Error returned by an in-process routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedError {
    pub kind: String,
    pub message: String,
}

impl RaisedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Handle through which an in-process routine reports executed positions.
///
/// Marks are dropped unless the routine's unit has been instrumented.
pub struct Probe<'a> {
    accumulator: &'a mut CoverageAccumulator,
    enabled: bool,
}

impl Probe<'_> {
    pub fn mark(&mut self, position: u32) {
        if self.enabled {
            self.accumulator.add(u64::from(position));
        }
    }
}

pub type Routine = Box<dyn Fn(&mut Probe<'_>, &[ArgValue]) -> Result<(), RaisedError>>;

struct RegisteredRoutine {
    qualified_name: String,
    param_types: Vec<ParamType>,
    routine: Routine,
}

/// A [`Harness`] for Rust closures registered under fully-qualified names.
///
/// Resolution matches `type_name.method` and the declared parameter types.
/// Instrumenting a target enables probes for every registered routine that
/// shares its top-level namespace prefix. Panics are caught with
/// `catch_unwind` and reported as [`FailureKind::Panic`].
#[derive(Default)]
pub struct InProcessHarness {
    routines: Vec<RegisteredRoutine>,
    accumulator: CoverageAccumulator,
    instrumented_prefixes: HashSet<String>,
}

impl InProcessHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, qualified_name: &str, param_types: Vec<ParamType>, routine: F)
    where
        F: Fn(&mut Probe<'_>, &[ArgValue]) -> Result<(), RaisedError> + 'static,
    {
        self.routines.push(RegisteredRoutine {
            qualified_name: qualified_name.to_string(),
            param_types,
            routine: Box::new(routine),
        });
    }

    pub fn registered_names(&self) -> impl Iterator<Item = &str> {
        self.routines.iter().map(|r| r.qualified_name.as_str())
    }

    fn is_instrumented(&self, qualified_name: &str) -> bool {
        self.instrumented_prefixes
            .contains(namespace_prefix(qualified_name))
    }
}

impl Harness for InProcessHarness {
    fn resolve(&mut self, target: &TargetSpec) -> Result<ResolvedTarget, HarnessError> {
        let signature = MethodSignature::parse(&target.signature)?;
        let qualified_name = format!("{}.{}", target.type_name, signature.name);
        if !target.search_path.is_empty() {
            debug!(
                search_path = ?target.search_path,
                "in-process harness ignores the search path"
            );
        }

        let mut matches = self.routines.iter().enumerate().filter(|(_, r)| {
            r.qualified_name == qualified_name && r.param_types == signature.param_types
        });
        let (handle, routine) = matches.next().ok_or_else(|| {
            HarnessError::Resolution(format!(
                "no routine {}({}) is registered",
                qualified_name,
                type_list(&signature.param_types)
            ))
        })?;
        if matches.next().is_some() {
            return Err(HarnessError::Resolution(format!(
                "more than one routine matches {}({})",
                qualified_name,
                type_list(&signature.param_types)
            )));
        }

        Ok(ResolvedTarget {
            qualified_name: routine.qualified_name.clone(),
            routine_name: signature.name,
            param_types: routine.param_types.clone(),
            handle,
        })
    }

    fn instrument(&mut self, target: &ResolvedTarget) -> Result<InstrumentedUnit, HarnessError> {
        let owned = self
            .routines
            .get(target.handle)
            .is_some_and(|r| r.qualified_name == target.qualified_name);
        if !owned {
            return Err(HarnessError::Instrumentation(format!(
                "{} was not resolved by this harness",
                target.qualified_name
            )));
        }

        let prefix = target.namespace_prefix().to_string();
        let members: Vec<String> = self
            .routines
            .iter()
            .filter(|r| namespace_prefix(&r.qualified_name) == prefix)
            .map(|r| format!("{}({})", r.qualified_name, type_list(&r.param_types)))
            .collect();

        let mut listing = format!("instrumented unit: {prefix}\n");
        for member in &members {
            listing.push_str("  probe -> ");
            listing.push_str(member);
            listing.push('\n');
        }

        self.instrumented_prefixes.insert(prefix.clone());
        Ok(InstrumentedUnit {
            unit_name: prefix,
            members,
            listing,
        })
    }

    fn reset_coverage(&mut self) {
        self.accumulator.reset();
    }

    fn coverage(&self) -> CoverageSignature {
        self.accumulator.value()
    }

    fn invoke(&mut self, target: &ResolvedTarget, args: &[ArgValue]) -> Result<(), TargetFailure> {
        let enabled = self.is_instrumented(&target.qualified_name);
        let Some(registered) = self
            .routines
            .get(target.handle)
            .filter(|r| r.qualified_name == target.qualified_name)
        else {
            return Err(TargetFailure {
                kind: FailureKind::Raised("UnknownRoutine".to_string()),
                message: format!("handle {} is not registered here", target.handle),
                trace: format!("UnknownRoutine: {}", target.qualified_name),
            });
        };
        let mut probe = Probe {
            accumulator: &mut self.accumulator,
            enabled,
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            (registered.routine)(&mut probe, args)
        }));

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(raised)) => Err(TargetFailure {
                trace: format!(
                    "{}: {}\n    at {}",
                    raised.kind, raised.message, registered.qualified_name
                ),
                kind: FailureKind::Raised(raised.kind),
                message: raised.message,
            }),
            Err(panic_payload) => {
                let message = panic_message(panic_payload.as_ref());
                Err(TargetFailure {
                    kind: FailureKind::Panic,
                    trace: format!(
                        "panicked: {}\n    at {}",
                        message, registered.qualified_name
                    ),
                    message,
                })
            }
        }
    }
}

fn panic_message(panic_payload: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

fn type_list(param_types: &[ParamType]) -> String {
    param_types
        .iter()
        .map(ParamType::name)
        .collect::<Vec<_>>()
        .join(", ")
}
