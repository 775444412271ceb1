//! Deep copies of types, expressions and statements.
//!
//! Evar cells are shared between the original and the copy unless
//! `share_evars` is off, in which case every unresolved evar is replaced by a
//! fresh one with the same kind and dependencies (resolved evars are copied
//! through their resolution). Expression type slots are re-shared by default
//! and duplicated with `copy_types`.
//!
//! Copied declarations get fresh `VarDecl`s; references to locals inside the
//! copied tree are reset to `Binding::Unresolved` so that checking the copy
//! binds them to the new declarations. Jump targets are left unresolved.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::conref::Conref;
use crate::decl::{Decl, DeclKind, VarDecl, VarRef};
use crate::exp::{Binding, Exp, ExpKind, ExpRef, FieldInit, MallocInfo, Pat, PatKind, PatRef};
use crate::stmt::{JumpTarget, LoopCond, Stmt, StmtKind, StmtRef, SwitchClause};
use crate::types::{
    AggrInfo, ArrayInfo, DatatypeFieldInfo, DatatypeInfo, Evar, FnArg, FnInfo, PtrAtts, PtrInfo,
    Ty, Type, TypedefInfo, VarargInfo,
};

#[derive(Clone, Copy, Debug)]
pub struct CopyOptions {
    pub share_evars: bool,
    pub copy_types: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            share_evars: true,
            copy_types: false,
        }
    }
}

struct Copier {
    opts: CopyOptions,
    /// Unshared evars already replaced, keyed by evar id, so that one evar
    /// occurring twice maps to one fresh evar.
    evars: HashMap<u32, Ty>,
    vars: HashMap<*const VarDecl, VarRef>,
}

pub fn copy_type(t: &Ty, opts: CopyOptions) -> Ty {
    Copier::new(opts).ty(t)
}

pub fn copy_exp(e: &ExpRef, opts: CopyOptions) -> ExpRef {
    Copier::new(opts).exp(e)
}

pub fn copy_stmt(s: &StmtRef, opts: CopyOptions) -> StmtRef {
    Copier::new(opts).stmt(s)
}

fn copy_conref<T: Clone>(c: &Conref<T>) -> Conref<T> {
    match c.value() {
        Ok(Some(v)) => Conref::eq(v),
        // An unconstrained or broken chain copies as a fresh, unconstrained cell.
        Ok(None) | Err(_) => Conref::empty(),
    }
}

impl Copier {
    fn new(opts: CopyOptions) -> Self {
        Self {
            opts,
            evars: HashMap::new(),
            vars: HashMap::new(),
        }
    }

    fn tys(&mut self, ts: &[Ty]) -> Vec<Ty> {
        ts.iter().map(|t| self.ty(t)).collect()
    }

    fn ty(&mut self, t: &Ty) -> Ty {
        let copied = match &**t {
            Type::Void
            | Type::Int(..)
            | Type::Float(_)
            | Type::HeapRgn
            | Type::UniqueRgn
            | Type::Var(_) => return t.clone(),
            Type::Evar(ev) => return self.evar(t, ev),
            Type::Pointer(p) => Type::Pointer(PtrInfo {
                elt: self.ty(&p.elt),
                elt_tq: p.elt_tq,
                atts: PtrAtts {
                    rgn: self.ty(&p.atts.rgn),
                    nullable: copy_conref(&p.atts.nullable),
                    bounds: copy_conref(&p.atts.bounds),
                    zero_term: copy_conref(&p.atts.zero_term),
                },
            }),
            Type::Array(a) => Type::Array(ArrayInfo {
                elt: self.ty(&a.elt),
                tq: a.tq,
                num_elts: a.num_elts.as_ref().map(|e| self.exp(e)),
                zero_term: copy_conref(&a.zero_term),
            }),
            Type::Fn(f) => Type::Fn(self.fn_info(f)),
            Type::Tuple(ts) => Type::Tuple(ts.iter().map(|(tq, t)| (*tq, self.ty(t))).collect()),
            Type::Aggr(a) => Type::Aggr(AggrInfo {
                aggr: RefCell::new(a.aggr.borrow().clone()),
                targs: self.tys(&a.targs),
            }),
            Type::AnonAggr(k, fields) => {
                let fields = fields
                    .iter()
                    .map(|f| crate::decl::AggrField {
                        name: f.name.clone(),
                        tq: f.tq,
                        ty: self.ty(&f.ty),
                        width: f.width.as_ref().map(|e| self.exp(e)),
                    })
                    .collect();
                Type::AnonAggr(*k, fields)
            }
            Type::Enum(name, decl) => Type::Enum(name.clone(), RefCell::new(decl.borrow().clone())),
            Type::AnonEnum(fields) => Type::AnonEnum(fields.clone()),
            Type::Datatype(d) => Type::Datatype(DatatypeInfo {
                dt: RefCell::new(d.dt.borrow().clone()),
                targs: self.tys(&d.targs),
            }),
            Type::DatatypeField(d) => Type::DatatypeField(DatatypeFieldInfo {
                field: RefCell::new(d.field.borrow().clone()),
                targs: self.tys(&d.targs),
            }),
            Type::RgnHandle(r) => Type::RgnHandle(self.ty(r)),
            Type::AccessEff(r) => Type::AccessEff(self.ty(r)),
            Type::JoinEff(es) => Type::JoinEff(self.tys(es)),
            Type::RgnsEff(t) => Type::RgnsEff(self.ty(t)),
            Type::Typedef(td) => Type::Typedef(TypedefInfo {
                name: td.name.clone(),
                args: self.tys(&td.args),
                decl: RefCell::new(td.decl.borrow().clone()),
                expanded: RefCell::new(td.expanded.borrow().as_ref().map(|t| self.ty(t))),
            }),
        };
        Rc::new(copied)
    }

    fn evar(&mut self, t: &Ty, ev: &Rc<Evar>) -> Ty {
        let resolved = ev.resolved.borrow().clone();
        if let Some(r) = resolved {
            return if self.opts.share_evars { t.clone() } else { self.ty(&r) };
        }
        if self.opts.share_evars {
            return t.clone();
        }
        if let Some(fresh) = self.evars.get(&ev.id) {
            return fresh.clone();
        }
        let fresh = Type::evar(*ev.kind.borrow(), ev.deps.borrow().clone());
        self.evars.insert(ev.id, fresh.clone());
        fresh
    }

    fn fn_info(&mut self, f: &FnInfo) -> FnInfo {
        FnInfo {
            tvars: f.tvars.clone(),
            effect: RefCell::new(f.effect.borrow().as_ref().map(|e| self.ty(e))),
            ret_tq: f.ret_tq,
            ret: self.ty(&f.ret),
            args: f
                .args
                .iter()
                .map(|a| FnArg {
                    name: a.name.clone(),
                    tq: a.tq,
                    ty: self.ty(&a.ty),
                })
                .collect(),
            c_varargs: f.c_varargs,
            cyc_varargs: f.cyc_varargs.as_ref().map(|v| VarargInfo {
                name: v.name.clone(),
                tq: v.tq,
                ty: self.ty(&v.ty),
                inject: v.inject,
            }),
            rgn_po: f
                .rgn_po
                .iter()
                .map(|(e, r)| (self.ty(e), self.ty(r)))
                .collect(),
            attributes: f.attributes.clone(),
        }
    }

    fn exps(&mut self, es: &[ExpRef]) -> Vec<ExpRef> {
        es.iter().map(|e| self.exp(e)).collect()
    }

    fn field_inits(&mut self, fs: &[FieldInit]) -> Vec<FieldInit> {
        fs.iter()
            .map(|f| FieldInit {
                field: f.field.clone(),
                exp: self.exp(&f.exp),
            })
            .collect()
    }

    fn binding(&self, b: &Binding) -> Binding {
        match b {
            Binding::Param(vd) | Binding::Local(vd) | Binding::Pat(vd) => {
                match self.vars.get(&Rc::as_ptr(vd)) {
                    Some(_) => Binding::Unresolved,
                    None => b.clone(),
                }
            }
            Binding::Unresolved | Binding::Global(_) | Binding::Fun(_) => b.clone(),
        }
    }

    fn exp(&mut self, e: &ExpRef) -> ExpRef {
        let kind = match &*e.kind.borrow() {
            ExpKind::Const(c) => ExpKind::Const(c.clone()),
            ExpKind::Var(q, b) => match self.binding(b) {
                Binding::Unresolved => ExpKind::UnknownId(q.clone()),
                b => ExpKind::Var(q.clone(), b),
            },
            ExpKind::UnknownId(q) => ExpKind::UnknownId(q.clone()),
            ExpKind::Primop(p, es) => ExpKind::Primop(*p, self.exps(es)),
            ExpKind::AssignOp(l, p, r) => ExpKind::AssignOp(self.exp(l), *p, self.exp(r)),
            ExpKind::Increment(e1, i) => ExpKind::Increment(self.exp(e1), *i),
            ExpKind::Conditional(a, b, c) => {
                ExpKind::Conditional(self.exp(a), self.exp(b), self.exp(c))
            }
            ExpKind::And(a, b) => ExpKind::And(self.exp(a), self.exp(b)),
            ExpKind::Or(a, b) => ExpKind::Or(self.exp(a), self.exp(b)),
            ExpKind::SeqExp(a, b) => ExpKind::SeqExp(self.exp(a), self.exp(b)),
            ExpKind::UnknownCall(f, es) => ExpKind::UnknownCall(self.exp(f), self.exps(es)),
            ExpKind::FnCall(f, es) => ExpKind::FnCall(self.exp(f), self.exps(es)),
            ExpKind::Throw(e1) => ExpKind::Throw(self.exp(e1)),
            ExpKind::NoInstantiate(e1) => ExpKind::NoInstantiate(self.exp(e1)),
            ExpKind::Instantiate(e1, ts) => ExpKind::Instantiate(self.exp(e1), self.tys(ts)),
            ExpKind::Cast(t, e1, user, c) => ExpKind::Cast(self.ty(t), self.exp(e1), *user, *c),
            ExpKind::Address(e1) => ExpKind::Address(self.exp(e1)),
            ExpKind::New(r, e1) => ExpKind::New(r.as_ref().map(|r| self.exp(r)), self.exp(e1)),
            ExpKind::Sizeoftyp(t) => ExpKind::Sizeoftyp(self.ty(t)),
            ExpKind::Sizeofexp(e1) => ExpKind::Sizeofexp(self.exp(e1)),
            ExpKind::Deref(e1) => ExpKind::Deref(self.exp(e1)),
            ExpKind::AggrMember(e1, f) => ExpKind::AggrMember(self.exp(e1), f.clone()),
            ExpKind::AggrArrow(e1, f) => ExpKind::AggrArrow(self.exp(e1), f.clone()),
            ExpKind::Subscript(a, b) => ExpKind::Subscript(self.exp(a), self.exp(b)),
            ExpKind::Tuple(es) => ExpKind::Tuple(self.exps(es)),
            ExpKind::Aggregate {
                name,
                targs,
                fields,
                decl,
            } => ExpKind::Aggregate {
                name: name.clone(),
                targs: self.tys(targs),
                fields: self.field_inits(fields),
                decl: decl.clone(),
            },
            ExpKind::AnonStruct(t, fs) => ExpKind::AnonStruct(self.ty(t), self.field_inits(fs)),
            ExpKind::Datatype(es, dt, f) => ExpKind::Datatype(self.exps(es), dt.clone(), f.clone()),
            ExpKind::Enum(ed, i) => ExpKind::Enum(ed.clone(), *i),
            ExpKind::AnonEnum(t, f) => ExpKind::AnonEnum(self.ty(t), f.clone()),
            ExpKind::Malloc(m) => ExpKind::Malloc(MallocInfo {
                is_calloc: m.is_calloc,
                rgn: m.rgn.as_ref().map(|r| self.exp(r)),
                elt_type: RefCell::new(m.elt_type.borrow().as_ref().map(|t| self.ty(t))),
                num_elts: self.exp(&m.num_elts),
                fat_result: m.fat_result,
            }),
            ExpKind::Swap(a, b) => ExpKind::Swap(self.exp(a), self.exp(b)),
            ExpKind::UnresolvedMem(q, fs) => {
                ExpKind::UnresolvedMem(q.clone(), self.field_inits(fs))
            }
            ExpKind::StmtExp(s) => ExpKind::StmtExp(self.stmt(s)),
            ExpKind::Array(es) => ExpKind::Array(self.exps(es)),
        };
        let copy = Exp::new(kind, e.span);
        let ty = e.ty();
        if let Some(t) = ty {
            let t = if self.opts.copy_types { self.ty(&t) } else { t };
            copy.set_ty(t);
        }
        copy
    }

    fn vardecl(&mut self, vd: &VarRef) -> VarRef {
        let ty = self.ty(&vd.ty());
        let copy = Rc::new(VarDecl {
            span: vd.span,
            sc: vd.sc,
            name: vd.name.clone(),
            tq: vd.tq,
            ty: RefCell::new(ty),
            initializer: vd.initializer.as_ref().map(|e| self.exp(e)),
            rgn: RefCell::new(vd.rgn.borrow().clone()),
            escapes: Cell::new(false),
        });
        self.vars.insert(Rc::as_ptr(vd), copy.clone());
        copy
    }

    fn pat(&mut self, p: &PatRef) -> PatRef {
        let kind = match &*p.kind.borrow() {
            PatKind::Wild => PatKind::Wild,
            PatKind::Var(vd) => PatKind::Var(self.vardecl(vd)),
            PatKind::Alias(tv, vd) => PatKind::Alias(tv.clone(), self.vardecl(vd)),
            PatKind::Tuple(ps) => PatKind::Tuple(ps.iter().map(|p| self.pat(p)).collect()),
            PatKind::Pointer(p) => PatKind::Pointer(self.pat(p)),
            PatKind::Aggr { name, fields, decl } => PatKind::Aggr {
                name: name.clone(),
                fields: fields.iter().map(|(f, p)| (f.clone(), self.pat(p))).collect(),
                decl: decl.clone(),
            },
            PatKind::Datatype(dt, f, ps) => {
                PatKind::Datatype(dt.clone(), f.clone(), ps.iter().map(|p| self.pat(p)).collect())
            }
            PatKind::Null => PatKind::Null,
            PatKind::Int(s, i) => PatKind::Int(*s, *i),
            PatKind::Char(c) => PatKind::Char(*c),
            PatKind::Float(f) => PatKind::Float(f.clone()),
            PatKind::Enum(ed, i) => PatKind::Enum(ed.clone(), *i),
            PatKind::AnonEnum(t, f) => PatKind::AnonEnum(self.ty(t), f.clone()),
            PatKind::UnknownId(q) => PatKind::UnknownId(q.clone()),
            PatKind::UnknownCall(q, ps) => {
                PatKind::UnknownCall(q.clone(), ps.iter().map(|p| self.pat(p)).collect())
            }
        };
        Pat::new(kind, p.span)
    }

    fn clause(&mut self, c: &SwitchClause) -> Rc<SwitchClause> {
        Rc::new(SwitchClause {
            span: c.span,
            pat: self.pat(&c.pat),
            pat_vars: RefCell::new(None),
            guard: c.guard.as_ref().map(|g| self.exp(g)),
            body: self.stmt(&c.body),
        })
    }

    fn loop_cond(&mut self, c: &LoopCond) -> LoopCond {
        LoopCond {
            exp: self.exp(&c.exp),
            point: Stmt::new(StmtKind::Skip, c.point.span),
        }
    }

    fn stmt(&mut self, s: &StmtRef) -> StmtRef {
        let kind = match &s.kind {
            StmtKind::Skip => StmtKind::Skip,
            StmtKind::Exp(e) => StmtKind::Exp(self.exp(e)),
            StmtKind::Seq(a, b) => StmtKind::Seq(self.stmt(a), self.stmt(b)),
            StmtKind::Return(e) => StmtKind::Return(e.as_ref().map(|e| self.exp(e))),
            StmtKind::IfThenElse(c, a, b) => {
                StmtKind::IfThenElse(self.exp(c), self.stmt(a), self.stmt(b))
            }
            StmtKind::While(c, body) => StmtKind::While(self.loop_cond(c), self.stmt(body)),
            StmtKind::Break(_) => StmtKind::Break(JumpTarget::new()),
            StmtKind::Continue(_) => StmtKind::Continue(JumpTarget::new()),
            StmtKind::Goto(l, _) => StmtKind::Goto(l.clone(), JumpTarget::new()),
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => StmtKind::For {
                init: self.exp(init),
                cond: self.loop_cond(cond),
                step: self.loop_cond(step),
                body: self.stmt(body),
            },
            StmtKind::Switch(e, cs) => {
                StmtKind::Switch(self.exp(e), cs.iter().map(|c| self.clause(c)).collect())
            }
            StmtKind::Fallthru(_) => StmtKind::Fallthru(JumpTarget::new()),
            StmtKind::Decl(d, body) => {
                let kind = match &d.kind {
                    DeclKind::Var(vd) => DeclKind::Var(self.vardecl(vd)),
                    DeclKind::Let { pat, init, .. } => DeclKind::Let {
                        init: self.exp(init),
                        pat: self.pat(pat),
                        pat_vars: RefCell::new(None),
                    },
                    // Nested type and function declarations are shared.
                    DeclKind::Fn(f) => DeclKind::Fn(f.clone()),
                    DeclKind::Aggr(a) => DeclKind::Aggr(a.clone()),
                    DeclKind::Datatype(a) => DeclKind::Datatype(a.clone()),
                    DeclKind::Enum(a) => DeclKind::Enum(a.clone()),
                    DeclKind::Typedef(a) => DeclKind::Typedef(a.clone()),
                    DeclKind::Namespace(n, ds) => DeclKind::Namespace(n.clone(), ds.clone()),
                    DeclKind::Using(q, ds) => DeclKind::Using(q.clone(), ds.clone()),
                };
                let d = Decl::new(kind, d.span);
                StmtKind::Decl(d, self.stmt(body))
            }
            StmtKind::Label(l, body) => StmtKind::Label(l.clone(), self.stmt(body)),
            StmtKind::Do(body, c) => {
                let body = self.stmt(body);
                StmtKind::Do(body, self.loop_cond(c))
            }
            StmtKind::TryCatch(body, cs) => {
                StmtKind::TryCatch(self.stmt(body), cs.iter().map(|c| self.clause(c)).collect())
            }
            StmtKind::Region {
                tvar,
                vd,
                resetable,
                body,
            } => StmtKind::Region {
                tvar: tvar.clone(),
                vd: self.vardecl(vd),
                resetable: *resetable,
                body: self.stmt(body),
            },
            StmtKind::ResetRegion(e) => StmtKind::ResetRegion(self.exp(e)),
        };
        Stmt::new(kind, s.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Kind;
    use crate::{span, QualName};

    #[test]
    fn evars_are_shared_by_default() {
        let ev = Type::evar(Some(Kind::Box), None);
        let t = Type::star(ev.clone(), Type::heap_rgn());
        let copy = copy_type(&t, CopyOptions::default());
        let Type::Pointer(p) = &*copy else {
            panic!("expected pointer")
        };
        assert!(Rc::ptr_eq(&p.elt, &ev));
    }

    #[test]
    fn unshared_evars_map_consistently() {
        let ev = Type::evar(Some(Kind::Box), None);
        let t = Type::tuple(vec![ev.clone(), ev.clone()]);
        let copy = copy_type(
            &t,
            CopyOptions {
                share_evars: false,
                copy_types: false,
            },
        );
        let Type::Tuple(fields) = &*copy else {
            panic!("expected tuple")
        };
        assert!(!Rc::ptr_eq(&fields[0].1, &ev));
        assert!(Rc::ptr_eq(&fields[0].1, &fields[1].1));
    }

    #[test]
    fn type_slot_is_reshared_or_duplicated() {
        let e = Exp::new(ExpKind::UnknownId(QualName::local("x")), span(0, 1));
        let t = Type::tuple(vec![Type::sint()]);
        e.set_ty(t.clone());

        let shared = copy_exp(&e, CopyOptions::default());
        assert!(Rc::ptr_eq(&shared.ty().unwrap(), &t));

        let dup = copy_exp(
            &e,
            CopyOptions {
                share_evars: true,
                copy_types: true,
            },
        );
        assert!(!Rc::ptr_eq(&dup.ty().unwrap(), &t));
    }

    #[test]
    fn statements_copy_to_fresh_nodes() {
        let b = crate::build::Builder::new();
        let s = b.seq(vec![b.exp_s(b.var("x")), b.ret(None)]);
        let copy = copy_stmt(&s, CopyOptions::default());
        assert!(!Rc::ptr_eq(&copy, &s));
        assert_eq!(copy.span, s.span);
        assert!(matches!(&copy.kind, StmtKind::Seq(..)));
    }
}
