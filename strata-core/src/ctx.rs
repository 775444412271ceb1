use std::cell::{Cell, RefCell};

use strata_ast::{Span, Ty};

use crate::config::CheckerConfig;
use crate::diag::Diagnostics;
use crate::error::{CheckError, ErrorKind};

/// Why the last unification failed, kept for `explain_failure`.
#[derive(Clone, Debug)]
pub struct UnifyFailure {
    pub t1: Ty,
    pub t2: Ty,
    pub reason: Option<String>,
}

/// Process-scoped state shared by every pass of one checking run.
///
/// Passes borrow the context immutably; the diagnostics sink and the
/// unification explanation live behind cells.
#[derive(Debug)]
pub struct Ctx {
    pub config: CheckerConfig,
    diag: RefCell<Diagnostics>,
    pub(crate) unify_failure: RefCell<Option<UnifyFailure>>,
    alias_counter: Cell<u32>,
}

impl Ctx {
    pub fn new(config: CheckerConfig) -> Self {
        let diag = Diagnostics::new(&config);
        Self {
            config,
            diag: RefCell::new(diag),
            unify_failure: RefCell::new(None),
            alias_counter: Cell::new(0),
        }
    }

    pub fn error(&self, kind: ErrorKind, span: Span, message: impl Into<String>) {
        self.diag.borrow_mut().error(kind, span, message);
    }

    pub fn warn(&self, span: Span, message: impl Into<String>) {
        self.diag.borrow_mut().warn(span, message);
    }

    pub fn error_count(&self) -> usize {
        self.diag.borrow().error_count()
    }

    pub fn should_stop(&self) -> bool {
        self.diag.borrow().should_stop()
    }

    pub fn errors(&self) -> Vec<CheckError> {
        self.diag.borrow().errors().to_vec()
    }

    pub fn into_diagnostics(self) -> Diagnostics {
        self.diag.into_inner()
    }

    /// Fresh name for checker-introduced temporaries.
    pub fn fresh_alias_name(&self) -> String {
        let n = self.alias_counter.get();
        self.alias_counter.set(n + 1);
        format!("_alias{n}")
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new(CheckerConfig::default())
    }
}
