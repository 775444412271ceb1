#![forbid(unsafe_code)]

//! Static checking for a region-annotated C dialect: type checking with
//! unification, region capabilities and outlives constraints, and a
//! dataflow analysis for definite initialization, NULL and unique-pointer
//! consumption.
//!
//! The usual entry point is [`Checker::check_program`].

pub mod config;
pub mod ctx;
pub mod diag;
pub mod error;
pub mod flow;
pub mod rgnorder;
pub mod tc;
pub mod tcenv;
pub mod tcutil;

use strata_ast::DeclRef;

pub use config::CheckerConfig;
pub use ctx::Ctx;
pub use error::{CheckError, CheckFailure, CheckWarning, ConfigError, ErrorKind};
pub use tcenv::Tenv;

/// Checks whole compilation units.
#[derive(Clone, Debug, Default)]
pub struct Checker {
    config: CheckerConfig,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Checks `decls` as one compilation unit, annotating the tree in place.
    /// Returns the warnings on success and every error otherwise.
    pub fn check_program(&self, decls: &[DeclRef]) -> Result<Vec<CheckWarning>, CheckFailure> {
        let ctx = Ctx::new(self.config.clone());
        let te = Tenv::new();
        tracing::debug!(decls = decls.len(), "checking compilation unit");
        tc::tc(&ctx, &te, decls);
        ctx.into_diagnostics().into_result()
    }
}
