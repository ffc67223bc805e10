use crate::decoder::ArgValue;
use crate::harness::{FailureKind, TargetFailure};
use crate::input::Input;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Numbered variants tried for one report name before giving up.
const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create report directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write report {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No free report file name for '{identity}' in {dir:?}")]
    NamesExhausted { identity: String, dir: PathBuf },
}

/// A report persisted for the first occurrence of a failure identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub identity: String,
    pub path: PathBuf,
    /// MD5 hex digest of the triggering buffer.
    pub input_digest: String,
}

/// Deduplicates failures by [`FailureKind`] and writes one report per kind.
///
/// Only the first occurrence of a kind is reported. Later occurrences are
/// counted in [`CrashReporter::total_occurrences`] and otherwise dropped,
/// even when they would make a better reproduction. Report files are
/// created with `create_new`; an existing file is never replaced.
#[derive(Debug)]
pub struct CrashReporter {
    report_dir: PathBuf,
    seen: HashSet<FailureKind>,
    total_occurrences: u64,
}

impl CrashReporter {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
            seen: HashSet::new(),
            total_occurrences: 0,
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Records a failure. Returns the written report when `failure` carries
    /// a kind not seen before, `None` otherwise.
    pub fn observe<I: Input>(
        &mut self,
        failure: &TargetFailure,
        routine_name: &str,
        args: &[ArgValue],
        input: &I,
    ) -> Result<Option<CrashReport>, ReportError> {
        self.total_occurrences += 1;
        if self.seen.contains(&failure.kind) {
            return Ok(None);
        }

        fs::create_dir_all(&self.report_dir).map_err(|source| ReportError::CreateDir {
            path: self.report_dir.clone(),
            source,
        })?;
        let identity = failure.identity();
        let (path, mut file) = self.create_report_file(identity)?;
        let contents = render_report(failure, routine_name, args, input.as_bytes());
        file.write_all(&contents)
            .map_err(|source| ReportError::Write {
                path: path.clone(),
                source,
            })?;

        self.seen.insert(failure.kind.clone());
        Ok(Some(CrashReport {
            identity: identity.to_string(),
            path,
            input_digest: format!("{:x}", md5::compute(input.as_bytes())),
        }))
    }

    /// Opens the first free name among `<name>.txt`, `<name>.1.txt`, ...
    fn create_report_file(&self, identity: &str) -> Result<(PathBuf, File), ReportError> {
        let stem = report_file_stem(identity);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.txt")
            } else {
                format!("{stem}.{attempt}.txt")
            };
            let path = self.report_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(ReportError::Write { path, source }),
            }
        }
        Err(ReportError::NamesExhausted {
            identity: identity.to_string(),
            dir: self.report_dir.clone(),
        })
    }

    pub fn is_known(&self, kind: &FailureKind) -> bool {
        self.seen.contains(kind)
    }

    pub fn distinct_count(&self) -> usize {
        self.seen.len()
    }

    pub fn total_occurrences(&self) -> u64 {
        self.total_occurrences
    }

    /// Identities of the known kinds in sorted order.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.seen.iter().map(FailureKind::to_string).collect();
        identities.sort();
        identities
    }
}

/// Preferred report file name for an identity.
///
/// Identities made of `[A-Za-z0-9._-]` are used as is. Anything else is
/// replaced by `_` and the first 8 hex digits of the identity's MD5 are
/// appended, so `io/Error` and `io:Error` get different names.
pub fn report_file_name(identity: &str) -> String {
    format!("{}.txt", report_file_stem(identity))
}

fn report_file_stem(identity: &str) -> String {
    let sanitized: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let usable = sanitized == identity && !sanitized.chars().all(|c| c == '.');
    if usable {
        sanitized
    } else {
        let digest = format!("{:x}", md5::compute(identity.as_bytes()));
        format!("_{sanitized}-{}", &digest[..8])
    }
}

/// Report body: the trace, `routine: [args]`, the debug-rendered buffer,
/// then the raw buffer bytes.
pub fn render_report(
    failure: &TargetFailure,
    routine_name: &str,
    args: &[ArgValue],
    buffer: &[u8],
) -> Vec<u8> {
    let rendered_args = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = Vec::with_capacity(failure.trace.len() + buffer.len() * 5 + 64);
    out.extend_from_slice(failure.trace.as_bytes());
    if !failure.trace.ends_with('\n') {
        out.push(b'\n');
    }
    out.extend_from_slice(format!("{routine_name}: [{rendered_args}]\n").as_bytes());
    out.extend_from_slice(format!("{buffer:?}\n").as_bytes());
    out.extend_from_slice(buffer);
    out
}
