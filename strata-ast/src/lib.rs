#![forbid(unsafe_code)]

//! Abstract syntax shared by every pass of the checker.
//!
//! Nodes are reference counted and mostly immutable once parsed. The handful
//! of slots that later passes fill in (expression types, evar resolutions,
//! jump targets, declaration links) live behind `RefCell`/`Cell` so that the
//! tree can be annotated in place. Back edges (jump targets, non-local
//! predecessors) are `Weak` so a tree always tears down without cycles.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use miette::SourceSpan;

pub mod build;
mod conref;
mod copy;
mod decl;
mod display;
mod exp;
mod stmt;
mod types;

pub use conref::{Conref, ConrefCycle, Constraint};
pub use copy::{copy_exp, copy_stmt, copy_type, CopyOptions};
pub use decl::{
    AggrDecl, AggrDeclImpl, AggrField, AggrKind, DatatypeDecl, DatatypeField, Decl, DeclKind,
    DeclRef, EnumDecl, EnumField, FnDecl, FnRef, Scope, TypedefDecl, VarDecl, VarRef,
};
pub use exp::{
    Annot, Binding, Cnst, Coercion, Exp, ExpKind, ExpRef, FieldInit, Incrementor, MallocInfo,
    Pat, PatKind, PatRef, Primop,
};
pub use stmt::{ClauseRef, JumpTarget, LoopCond, Stmt, StmtKind, StmtRef, SwitchClause};
pub use types::{
    AggrInfo, AggrRef, ArrayInfo, Bounds, DatatypeFieldInfo, DatatypeFieldRef, DatatypeInfo,
    DatatypeRef, Evar, FloatKind, FnArg, FnAttr, FnInfo, IntSize, Kind, KindBound, PtrAtts,
    PtrInfo, Sign, Tqual, Tvar, Ty, Type, TypedefInfo, VarargInfo,
};

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

/// Span used for nodes the checker synthesizes (builtins, inserted casts).
pub fn dummy_span() -> Span {
    span(0, 0)
}

static NEXT_IDENTITY: AtomicU32 = AtomicU32::new(1);

/// Fresh identity for type variables and evars.
///
/// Identities only need to be distinct; they carry no other meaning, so a
/// process-wide counter keeps node construction free of context plumbing.
pub fn fresh_identity() -> u32 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Namespace part of a qualified name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nmspace {
    /// Plain, unqualified name; resolved against the current scope.
    Loc,
    /// Relative path such as `Core::List::x`.
    Rel(Vec<String>),
    /// Absolute path, produced by resolution.
    Abs(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualName {
    pub ns: Nmspace,
    pub name: String,
}

impl QualName {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            ns: Nmspace::Loc,
            name: name.into(),
        }
    }

    pub fn rel(path: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            ns: Nmspace::Rel(path),
            name: name.into(),
        }
    }

    pub fn abs(path: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            ns: Nmspace::Abs(path),
            name: name.into(),
        }
    }

    /// Compares two names the way resolution sees them: `Loc` and an empty
    /// `Rel` denote the same name.
    pub fn same(&self, other: &QualName) -> bool {
        if self.name != other.name {
            return false;
        }
        let path = |ns: &Nmspace| -> (bool, Vec<String>) {
            match ns {
                Nmspace::Loc => (false, Vec::new()),
                Nmspace::Rel(p) => (false, p.clone()),
                Nmspace::Abs(p) => (true, p.clone()),
            }
        };
        path(&self.ns) == path(&other.ns)
    }

    pub fn is_local(&self) -> bool {
        matches!(&self.ns, Nmspace::Loc) || matches!(&self.ns, Nmspace::Rel(p) if p.is_empty())
    }
}

impl fmt::Display for QualName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Nmspace::Loc => {}
            Nmspace::Rel(p) | Nmspace::Abs(p) => {
                for part in p {
                    write!(f, "{part}::")?;
                }
            }
        }
        f.write_str(&self.name)
    }
}
