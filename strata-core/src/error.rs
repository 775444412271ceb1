#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use std::fmt;

use miette::Diagnostic;
use strata_ast::Span;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unification failure, bad coercion, ill-formed expression.
    Type,
    /// Use of uninitialized storage, escape of uninitialized memory.
    Flow,
    /// Re-consumption of a unique pointer.
    Unique,
    /// Region lifetime or capability violation.
    Region,
    /// Unresolved break/continue/goto/fallthru.
    Jump,
    Kind,
    /// Undeclared or ambiguous identifier.
    Name,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Type => "type",
            ErrorKind::Flow => "flow",
            ErrorKind::Unique => "uniqueness",
            ErrorKind::Region => "region",
            ErrorKind::Jump => "jump",
            ErrorKind::Kind => "kind",
            ErrorKind::Name => "name",
        })
    }
}

#[derive(Clone, Debug, Error, Diagnostic)]
#[error("{kind} error: {message}")]
#[diagnostic(code(strata::check))]
#[allow(unused_assignments)]
pub struct CheckError {
    pub kind: ErrorKind,
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Clone, Debug, Error, Diagnostic)]
#[error("warning: {message}")]
#[diagnostic(code(strata::warn), severity(Warning))]
#[allow(unused_assignments)]
pub struct CheckWarning {
    pub message: String,
    #[label]
    pub span: Span,
}

/// Every error recorded while checking a compilation unit.
#[derive(Debug, Error, Diagnostic)]
#[error("checking failed with {} error(s)", errors.len())]
#[diagnostic(code(strata::failed))]
pub struct CheckFailure {
    #[related]
    pub errors: Vec<CheckError>,
    pub warnings: Vec<CheckWarning>,
}

impl CheckFailure {
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|e| e.kind == kind).count()
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read checker configuration {path}: {source}")]
    #[diagnostic(code(strata::config::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checker configuration: {0}")]
    #[diagnostic(code(strata::config::parse))]
    Parse(#[from] toml::de::Error),
}

/// Reports a violated internal invariant and aborts.
///
/// Never used for user errors: those are recorded through the diagnostics
/// sink and checking continues.
#[track_caller]
pub fn impos(msg: impl fmt::Display) -> ! {
    tracing::error!(target: "strata::impos", "{msg}");
    panic!("internal compiler error: {msg}")
}
