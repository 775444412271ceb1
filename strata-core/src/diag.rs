use std::collections::HashSet;

use strata_ast::Span;

use crate::config::CheckerConfig;
use crate::error::{CheckError, CheckFailure, CheckWarning, ErrorKind};

/// Diagnostics sink for one checking run.
///
/// Identical `(span, message)` pairs are recorded once, so re-analysing a
/// loop body or a function never duplicates a report.
#[derive(Debug)]
pub struct Diagnostics {
    errors: Vec<CheckError>,
    warnings: Vec<CheckWarning>,
    seen: HashSet<(usize, usize, String)>,
    max_errors: usize,
    fail_fast: bool,
    warnings_enabled: bool,
    gave_up: bool,
}

impl Diagnostics {
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            seen: HashSet::new(),
            max_errors: config.max_errors,
            fail_fast: config.fail_fast,
            warnings_enabled: config.warnings,
            gave_up: false,
        }
    }

    pub fn error(&mut self, kind: ErrorKind, span: Span, message: impl Into<String>) {
        if self.gave_up {
            return;
        }
        let message = message.into();
        if !self
            .seen
            .insert((span.offset(), span.len(), message.clone()))
        {
            return;
        }
        tracing::debug!(%kind, offset = span.offset(), %message, "recorded error");
        self.errors.push(CheckError {
            kind,
            message,
            span,
        });
        if self.max_errors > 0 && self.errors.len() >= self.max_errors {
            tracing::warn!(limit = self.max_errors, "error limit reached, giving up");
            self.warnings.push(CheckWarning {
                message: format!("too many errors ({}); checking stopped", self.errors.len()),
                span,
            });
            self.gave_up = true;
        }
    }

    pub fn warn(&mut self, span: Span, message: impl Into<String>) {
        if !self.warnings_enabled {
            return;
        }
        let message = message.into();
        if !self
            .seen
            .insert((span.offset(), span.len(), format!("warning: {message}")))
        {
            return;
        }
        self.warnings.push(CheckWarning { message, span });
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// True once no further checking should be attempted.
    pub fn should_stop(&self) -> bool {
        self.gave_up || (self.fail_fast && !self.errors.is_empty())
    }

    pub fn errors(&self) -> &[CheckError] {
        &self.errors
    }

    pub fn warnings(&self) -> &[CheckWarning] {
        &self.warnings
    }

    pub fn into_result(self) -> Result<Vec<CheckWarning>, CheckFailure> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(CheckFailure {
                errors: self.errors,
                warnings: self.warnings,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::span;

    #[test]
    fn duplicates_are_dropped() {
        let mut d = Diagnostics::new(&CheckerConfig::default());
        d.error(ErrorKind::Flow, span(3, 1), "uninitialized");
        d.error(ErrorKind::Flow, span(3, 1), "uninitialized");
        d.error(ErrorKind::Flow, span(4, 1), "uninitialized");
        assert_eq!(d.error_count(), 2);
    }

    #[test]
    fn limit_stops_recording() {
        let cfg = CheckerConfig {
            max_errors: 2,
            ..CheckerConfig::default()
        };
        let mut d = Diagnostics::new(&cfg);
        for i in 0..5 {
            d.error(ErrorKind::Type, span(i, 1), "bad");
        }
        assert_eq!(d.error_count(), 2);
        assert!(d.should_stop());
        assert!(d.warnings().iter().any(|w| w.message.contains("too many errors")));
    }

    #[test]
    fn fail_fast_stops_after_first() {
        let cfg = CheckerConfig {
            fail_fast: true,
            ..CheckerConfig::default()
        };
        let mut d = Diagnostics::new(&cfg);
        assert!(!d.should_stop());
        d.error(ErrorKind::Name, span(0, 1), "undeclared identifier x");
        assert!(d.should_stop());
    }

    #[test]
    fn disabled_warnings_are_not_recorded() {
        let cfg = CheckerConfig {
            warnings: false,
            ..CheckerConfig::default()
        };
        let mut d = Diagnostics::new(&cfg);
        d.warn(span(0, 1), "unused");
        assert!(d.warnings().is_empty());
        assert!(d.into_result().is_ok());
    }
}
