use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::decl::{DeclRef, VarRef};
use crate::exp::{ExpRef, PatRef};
use crate::types::Tvar;
use crate::Span;

pub type StmtRef = Rc<Stmt>;
pub type ClauseRef = Rc<SwitchClause>;

/// Resolved destination of a jump, filled in by the type environment.
///
/// For `break` and `continue` the target is the enclosing loop or switch;
/// for `goto` the labelled statement; for `fallthru` the body of the next
/// clause.
#[derive(Debug, Default)]
pub struct JumpTarget(RefCell<Option<Weak<Stmt>>>);

impl JumpTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<StmtRef> {
        self.0.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn set(&self, target: &StmtRef) {
        *self.0.borrow_mut() = Some(Rc::downgrade(target));
    }

    pub fn is_resolved(&self) -> bool {
        self.get().is_some()
    }
}

/// Loop condition together with the statement `continue` jumps to.
#[derive(Debug)]
pub struct LoopCond {
    pub exp: ExpRef,
    pub point: StmtRef,
}

#[derive(Debug)]
pub struct SwitchClause {
    pub span: Span,
    pub pat: PatRef,
    /// Variables bound by `pat`, filled in by pattern checking.
    pub pat_vars: RefCell<Option<Vec<VarRef>>>,
    pub guard: Option<ExpRef>,
    pub body: StmtRef,
}

#[derive(Debug)]
pub enum StmtKind {
    Skip,
    Exp(ExpRef),
    Seq(StmtRef, StmtRef),
    Return(Option<ExpRef>),
    IfThenElse(ExpRef, StmtRef, StmtRef),
    While(LoopCond, StmtRef),
    Break(JumpTarget),
    Continue(JumpTarget),
    Goto(String, JumpTarget),
    For {
        init: ExpRef,
        cond: LoopCond,
        step: LoopCond,
        body: StmtRef,
    },
    Switch(ExpRef, Vec<ClauseRef>),
    Fallthru(JumpTarget),
    Decl(DeclRef, StmtRef),
    Label(String, StmtRef),
    Do(StmtRef, LoopCond),
    TryCatch(StmtRef, Vec<ClauseRef>),
    /// `region <'r> h { body }`.
    Region {
        tvar: Tvar,
        vd: VarRef,
        resetable: bool,
        body: StmtRef,
    },
    ResetRegion(ExpRef),
}

#[derive(Debug)]
pub struct Stmt {
    pub span: Span,
    pub kind: StmtKind,
    /// Jumps that reach this statement other than by falling into it.
    pub non_local_preds: RefCell<Vec<Weak<Stmt>>>,
    pub try_depth: Cell<u32>,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> StmtRef {
        Rc::new(Stmt {
            span,
            kind,
            non_local_preds: RefCell::new(Vec::new()),
            try_depth: Cell::new(0),
        })
    }

    pub fn add_non_local_pred(&self, pred: &StmtRef) {
        let mut preds = self.non_local_preds.borrow_mut();
        if !preds
            .iter()
            .any(|p| std::ptr::eq(p.as_ptr(), Rc::as_ptr(pred)))
        {
            preds.push(Rc::downgrade(pred));
        }
    }

    pub fn jump_target(&self) -> Option<&JumpTarget> {
        match &self.kind {
            StmtKind::Break(t)
            | StmtKind::Continue(t)
            | StmtKind::Goto(_, t)
            | StmtKind::Fallthru(t) => Some(t),
            _ => None,
        }
    }
}
