//! Node construction helpers.
//!
//! The checker uses these to synthesize nodes; tests use them in place of a
//! parser. Every node made through a [`Builder`] gets a distinct one-byte
//! span so diagnostics can be attributed to individual nodes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::decl::{
    AggrDecl, AggrDeclImpl, AggrField, AggrKind, Decl, DeclKind, DeclRef, FnDecl, Scope,
    TypedefDecl, VarDecl, VarRef,
};
use crate::exp::{
    Cnst, Exp, ExpKind, ExpRef, FieldInit, Incrementor, MallocInfo, Pat, PatKind, PatRef, Primop,
};
use crate::stmt::{JumpTarget, LoopCond, Stmt, StmtKind, StmtRef, SwitchClause};
use crate::types::{FnArg, FnAttr, Kind, Sign, Tqual, Tvar, Ty, Type};
use crate::{span, QualName, Span};

#[derive(Debug, Default)]
pub struct Builder {
    next: Cell<usize>,
}

/// Signature of a function built with [`Builder::fn_decl_sig`].
#[derive(Clone, Debug)]
pub struct FnSig {
    pub sc: Scope,
    pub tvars: Vec<Tvar>,
    pub params: Vec<(String, Ty)>,
    pub ret: Ty,
    pub effect: Option<Ty>,
    pub rgn_po: Vec<(Ty, Ty)>,
    pub attributes: Vec<FnAttr>,
}

impl FnSig {
    pub fn new(ret: Ty) -> Self {
        Self {
            sc: Scope::Public,
            tvars: Vec::new(),
            params: Vec::new(),
            ret,
            effect: None,
            rgn_po: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, ty: Ty) -> Self {
        self.params.push((name.to_string(), ty));
        self
    }

    pub fn tvar(mut self, tv: &Tvar) -> Self {
        self.tvars.push(tv.clone());
        self
    }

    pub fn attr(mut self, attr: FnAttr) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn outlives(mut self, eff: Ty, rgn: Ty) -> Self {
        self.rgn_po.push((eff, rgn));
        self
    }

    pub fn effect(mut self, eff: Ty) -> Self {
        self.effect = Some(eff);
        self
    }

    pub fn scope(mut self, sc: Scope) -> Self {
        self.sc = sc;
        self
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sp(&self) -> Span {
        let at = self.next.get();
        self.next.set(at + 1);
        span(at, 1)
    }

    fn e(&self, kind: ExpKind) -> ExpRef {
        Exp::new(kind, self.sp())
    }

    fn s(&self, kind: StmtKind) -> StmtRef {
        Stmt::new(kind, self.sp())
    }

    // ---- expressions ----

    pub fn int(&self, i: i64) -> ExpRef {
        self.e(ExpKind::Const(Cnst::Int(Sign::Signed, i)))
    }

    pub fn null(&self) -> ExpRef {
        self.e(ExpKind::Const(Cnst::Null))
    }

    pub fn string(&self, s: &str) -> ExpRef {
        self.e(ExpKind::Const(Cnst::Str(s.to_string())))
    }

    pub fn var(&self, name: &str) -> ExpRef {
        self.e(ExpKind::UnknownId(QualName::local(name)))
    }

    pub fn qvar(&self, name: QualName) -> ExpRef {
        self.e(ExpKind::UnknownId(name))
    }

    pub fn prim(&self, op: Primop, args: Vec<ExpRef>) -> ExpRef {
        self.e(ExpKind::Primop(op, args))
    }

    pub fn eq(&self, a: ExpRef, b: ExpRef) -> ExpRef {
        self.prim(Primop::Eq, vec![a, b])
    }

    pub fn assign(&self, lhs: ExpRef, rhs: ExpRef) -> ExpRef {
        self.e(ExpKind::AssignOp(lhs, None, rhs))
    }

    pub fn assign_op(&self, lhs: ExpRef, op: Primop, rhs: ExpRef) -> ExpRef {
        self.e(ExpKind::AssignOp(lhs, Some(op), rhs))
    }

    pub fn incr(&self, e: ExpRef, inc: Incrementor) -> ExpRef {
        self.e(ExpKind::Increment(e, inc))
    }

    pub fn cond(&self, c: ExpRef, a: ExpRef, b: ExpRef) -> ExpRef {
        self.e(ExpKind::Conditional(c, a, b))
    }

    pub fn and(&self, a: ExpRef, b: ExpRef) -> ExpRef {
        self.e(ExpKind::And(a, b))
    }

    pub fn or(&self, a: ExpRef, b: ExpRef) -> ExpRef {
        self.e(ExpKind::Or(a, b))
    }

    pub fn seq_exp(&self, a: ExpRef, b: ExpRef) -> ExpRef {
        self.e(ExpKind::SeqExp(a, b))
    }

    pub fn call(&self, func: ExpRef, args: Vec<ExpRef>) -> ExpRef {
        self.e(ExpKind::UnknownCall(func, args))
    }

    pub fn call_named(&self, name: &str, args: Vec<ExpRef>) -> ExpRef {
        let func = self.var(name);
        self.call(func, args)
    }

    pub fn instantiate(&self, e: ExpRef, targs: Vec<Ty>) -> ExpRef {
        self.e(ExpKind::Instantiate(e, targs))
    }

    pub fn throw(&self, e: ExpRef) -> ExpRef {
        self.e(ExpKind::Throw(e))
    }

    pub fn cast(&self, ty: Ty, e: ExpRef) -> ExpRef {
        self.e(ExpKind::Cast(ty, e, true, crate::exp::Coercion::Unknown))
    }

    pub fn addr(&self, e: ExpRef) -> ExpRef {
        self.e(ExpKind::Address(e))
    }

    pub fn new_(&self, e: ExpRef) -> ExpRef {
        self.e(ExpKind::New(None, e))
    }

    pub fn rnew(&self, rgn: ExpRef, e: ExpRef) -> ExpRef {
        self.e(ExpKind::New(Some(rgn), e))
    }

    /// `malloc(sizeof(elt))`, or `rmalloc(rgn, sizeof(elt))` with a region.
    pub fn malloc(&self, rgn: Option<ExpRef>, elt: Ty) -> ExpRef {
        let num = self.e(ExpKind::Sizeoftyp(elt.clone()));
        self.e(ExpKind::Malloc(MallocInfo {
            is_calloc: false,
            rgn,
            elt_type: RefCell::new(Some(elt)),
            num_elts: num,
            fat_result: false,
        }))
    }

    pub fn sizeof_ty(&self, t: Ty) -> ExpRef {
        self.e(ExpKind::Sizeoftyp(t))
    }

    pub fn deref(&self, e: ExpRef) -> ExpRef {
        self.e(ExpKind::Deref(e))
    }

    pub fn member(&self, e: ExpRef, field: &str) -> ExpRef {
        self.e(ExpKind::AggrMember(e, field.to_string()))
    }

    pub fn arrow(&self, e: ExpRef, field: &str) -> ExpRef {
        self.e(ExpKind::AggrArrow(e, field.to_string()))
    }

    pub fn subscript(&self, a: ExpRef, i: ExpRef) -> ExpRef {
        self.e(ExpKind::Subscript(a, i))
    }

    pub fn tuple(&self, es: Vec<ExpRef>) -> ExpRef {
        self.e(ExpKind::Tuple(es))
    }

    /// `Name{.f = e, ...}`; unnamed inits fill fields in order.
    pub fn aggregate(&self, name: &str, fields: Vec<(Option<&str>, ExpRef)>) -> ExpRef {
        self.e(ExpKind::UnresolvedMem(
            Some(QualName::local(name)),
            fields
                .into_iter()
                .map(|(f, exp)| FieldInit {
                    field: f.map(str::to_string),
                    exp,
                })
                .collect(),
        ))
    }

    pub fn swap(&self, a: ExpRef, b: ExpRef) -> ExpRef {
        self.e(ExpKind::Swap(a, b))
    }

    pub fn stmt_exp(&self, s: StmtRef) -> ExpRef {
        self.e(ExpKind::StmtExp(s))
    }

    // ---- statements ----

    pub fn skip(&self) -> StmtRef {
        self.s(StmtKind::Skip)
    }

    pub fn exp_s(&self, e: ExpRef) -> StmtRef {
        self.s(StmtKind::Exp(e))
    }

    /// Right-nested sequence; an empty list is `skip`.
    pub fn seq(&self, stmts: Vec<StmtRef>) -> StmtRef {
        let mut iter = stmts.into_iter().rev();
        let Some(mut acc) = iter.next() else {
            return self.skip();
        };
        for s in iter {
            acc = self.s(StmtKind::Seq(s, acc));
        }
        acc
    }

    pub fn ret(&self, e: Option<ExpRef>) -> StmtRef {
        self.s(StmtKind::Return(e))
    }

    pub fn if_(&self, c: ExpRef, then: StmtRef, els: StmtRef) -> StmtRef {
        self.s(StmtKind::IfThenElse(c, then, els))
    }

    fn loop_cond(&self, exp: ExpRef) -> LoopCond {
        LoopCond {
            exp,
            point: self.skip(),
        }
    }

    pub fn while_(&self, c: ExpRef, body: StmtRef) -> StmtRef {
        let cond = self.loop_cond(c);
        self.s(StmtKind::While(cond, body))
    }

    pub fn for_(&self, init: ExpRef, c: ExpRef, step: ExpRef, body: StmtRef) -> StmtRef {
        let cond = self.loop_cond(c);
        let step = self.loop_cond(step);
        self.s(StmtKind::For {
            init,
            cond,
            step,
            body,
        })
    }

    pub fn do_(&self, body: StmtRef, c: ExpRef) -> StmtRef {
        let cond = self.loop_cond(c);
        self.s(StmtKind::Do(body, cond))
    }

    pub fn break_(&self) -> StmtRef {
        self.s(StmtKind::Break(JumpTarget::new()))
    }

    pub fn continue_(&self) -> StmtRef {
        self.s(StmtKind::Continue(JumpTarget::new()))
    }

    pub fn goto(&self, label: &str) -> StmtRef {
        self.s(StmtKind::Goto(label.to_string(), JumpTarget::new()))
    }

    pub fn fallthru(&self) -> StmtRef {
        self.s(StmtKind::Fallthru(JumpTarget::new()))
    }

    pub fn label(&self, label: &str, body: StmtRef) -> StmtRef {
        self.s(StmtKind::Label(label.to_string(), body))
    }

    pub fn vardecl(&self, name: &str, ty: Ty, init: Option<ExpRef>) -> VarRef {
        VarDecl::new(self.sp(), QualName::local(name), ty, init)
    }

    pub fn decl_s(&self, d: DeclRef, body: StmtRef) -> StmtRef {
        self.s(StmtKind::Decl(d, body))
    }

    /// `ty name = init; body`
    pub fn local(&self, name: &str, ty: Ty, init: Option<ExpRef>, body: StmtRef) -> StmtRef {
        let vd = self.vardecl(name, ty, init);
        let d = Decl::new(DeclKind::Var(vd), self.sp());
        self.decl_s(d, body)
    }

    /// `let pat = init; body`
    pub fn let_(&self, pat: PatRef, init: ExpRef, body: StmtRef) -> StmtRef {
        let d = Decl::new(
            DeclKind::Let {
                pat,
                pat_vars: RefCell::new(None),
                init,
            },
            self.sp(),
        );
        self.decl_s(d, body)
    }

    /// `region <tv> handle { body }`
    pub fn region(&self, tv: &Tvar, handle: &str, resetable: bool, body: StmtRef) -> StmtRef {
        let vd = self.vardecl(handle, Type::rgn_handle(Type::var(tv)), None);
        self.s(StmtKind::Region {
            tvar: tv.clone(),
            vd,
            resetable,
            body,
        })
    }

    pub fn reset_region(&self, handle: ExpRef) -> StmtRef {
        self.s(StmtKind::ResetRegion(handle))
    }

    pub fn clause(&self, pat: PatRef, guard: Option<ExpRef>, body: StmtRef) -> Rc<SwitchClause> {
        Rc::new(SwitchClause {
            span: self.sp(),
            pat,
            pat_vars: RefCell::new(None),
            guard,
            body,
        })
    }

    pub fn switch(&self, e: ExpRef, clauses: Vec<Rc<SwitchClause>>) -> StmtRef {
        self.s(StmtKind::Switch(e, clauses))
    }

    pub fn try_catch(&self, body: StmtRef, clauses: Vec<Rc<SwitchClause>>) -> StmtRef {
        self.s(StmtKind::TryCatch(body, clauses))
    }

    // ---- patterns ----

    fn p(&self, kind: PatKind) -> PatRef {
        Pat::new(kind, self.sp())
    }

    pub fn pwild(&self) -> PatRef {
        self.p(PatKind::Wild)
    }

    /// Pattern variable; its type is an evar fixed by pattern checking.
    pub fn pvar(&self, name: &str) -> PatRef {
        let vd = self.vardecl(name, Type::evar(Some(Kind::Any), None), None);
        self.p(PatKind::Var(vd))
    }

    pub fn palias(&self, tv: &Tvar, name: &str, ty: Ty) -> PatRef {
        let vd = self.vardecl(name, ty, None);
        self.p(PatKind::Alias(tv.clone(), vd))
    }

    pub fn ptuple(&self, ps: Vec<PatRef>) -> PatRef {
        self.p(PatKind::Tuple(ps))
    }

    pub fn pptr(&self, p: PatRef) -> PatRef {
        self.p(PatKind::Pointer(p))
    }

    pub fn pint(&self, i: i64) -> PatRef {
        self.p(PatKind::Int(Sign::Signed, i))
    }

    pub fn pnull(&self) -> PatRef {
        self.p(PatKind::Null)
    }

    pub fn pid(&self, name: &str) -> PatRef {
        self.p(PatKind::UnknownId(QualName::local(name)))
    }

    pub fn pcall(&self, name: &str, ps: Vec<PatRef>) -> PatRef {
        self.p(PatKind::UnknownCall(QualName::local(name), ps))
    }

    // ---- declarations ----

    pub fn fn_decl(&self, name: &str, params: Vec<(&str, Ty)>, ret: Ty, body: StmtRef) -> DeclRef {
        let sig = params
            .into_iter()
            .fold(FnSig::new(ret), |sig, (n, t)| sig.param(n, t));
        self.fn_decl_sig(name, sig, body)
    }

    pub fn fn_decl_sig(&self, name: &str, sig: FnSig, body: StmtRef) -> DeclRef {
        let span = self.sp();
        let fd = Rc::new(FnDecl {
            span,
            sc: sig.sc,
            is_inline: false,
            name: QualName::local(name),
            tvars: sig.tvars,
            effect: RefCell::new(sig.effect),
            ret_tq: Tqual::default(),
            ret: sig.ret,
            args: sig
                .params
                .into_iter()
                .map(|(n, ty)| FnArg {
                    name: Some(n),
                    tq: Tqual::default(),
                    ty,
                })
                .collect(),
            c_varargs: false,
            cyc_varargs: None,
            rgn_po: sig.rgn_po,
            body,
            attributes: sig.attributes,
            param_vardecls: RefCell::new(None),
            fn_ty: RefCell::new(None),
        });
        Decl::new(DeclKind::Fn(fd), span)
    }

    pub fn global(&self, name: &str, ty: Ty, init: Option<ExpRef>) -> DeclRef {
        let vd = self.vardecl(name, ty, init);
        Decl::new(DeclKind::Var(vd), self.sp())
    }

    pub fn aggr_decl(&self, kind: AggrKind, name: &str, fields: Vec<(&str, Ty)>) -> Rc<AggrDecl> {
        Rc::new(AggrDecl {
            span: self.sp(),
            kind,
            sc: Scope::Public,
            name: QualName::local(name),
            tvars: Vec::new(),
            imp: Some(AggrDeclImpl {
                exist_vars: Vec::new(),
                rgn_po: Vec::new(),
                fields: fields
                    .into_iter()
                    .map(|(n, ty)| AggrField {
                        name: n.to_string(),
                        tq: Tqual::default(),
                        ty,
                        width: None,
                    })
                    .collect(),
                tagged: false,
            }),
        })
    }

    pub fn struct_decl(&self, name: &str, fields: Vec<(&str, Ty)>) -> DeclRef {
        let ad = self.aggr_decl(AggrKind::Struct, name, fields);
        Decl::new(DeclKind::Aggr(ad), self.sp())
    }

    pub fn typedef(&self, name: &str, tvars: Vec<Tvar>, defn: Ty) -> DeclRef {
        let td = Rc::new(TypedefDecl {
            span: self.sp(),
            name: QualName::local(name),
            tq: Tqual::default(),
            tvars,
            defn: Some(defn),
            kind: None,
        });
        Decl::new(DeclKind::Typedef(td), self.sp())
    }

    pub fn namespace(&self, name: &str, decls: Vec<DeclRef>) -> DeclRef {
        Decl::new(DeclKind::Namespace(name.to_string(), decls), self.sp())
    }

    pub fn using(&self, path: QualName, decls: Vec<DeclRef>) -> DeclRef {
        Decl::new(DeclKind::Using(path, decls), self.sp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_are_distinct_and_increasing() {
        let b = Builder::new();
        let x = b.var("x");
        let y = b.var("y");
        assert!(x.span.offset() < y.span.offset());
    }

    #[test]
    fn seq_nests_to_the_right() {
        let b = Builder::new();
        let s = b.seq(vec![b.skip(), b.skip(), b.skip()]);
        let StmtKind::Seq(_, rest) = &s.kind else {
            panic!("expected sequence")
        };
        assert!(matches!(rest.kind, StmtKind::Seq(..)));
    }
}
