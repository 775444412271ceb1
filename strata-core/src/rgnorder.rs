//! Region lifetime partial order for one function body.
//!
//! An order records, for every region variable in scope, the effects known
//! to outlive it. Queries take the transitive closure on demand; orders are
//! small (one entry per region block plus the function's own parameters),
//! so no closure is cached.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use strata_ast::{Kind, Tvar, Ty, Type};
use thiserror::Error;

use crate::error::impos;
use crate::tcutil::{compress, normalize_effect, tvar_kind, typecmp, type_kind};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RgnOrderError {
    #[error("bad region lifetime assertion (circularity): {eff} > {rgn}")]
    Circular { eff: String, rgn: String },
    #[error("{0} is not a region")]
    NotARegion(String),
    #[error("region {0} is not in scope")]
    UnknownRegion(String),
}

#[derive(Clone, Debug)]
struct RgnInfo {
    /// Normalized effect atoms that outlive this region.
    these_outlive: Vec<Ty>,
    resetable: bool,
}

#[derive(Clone, Debug)]
pub struct RgnPO {
    d: HashMap<Tvar, RgnInfo>,
    these_outlive_heap: Vec<Ty>,
    these_outlive_unique: Vec<Ty>,
    youngest: Tvar,
}

fn push_atoms(into: &mut Vec<Ty>, eff: &Ty) {
    for atom in normalize_effect(eff) {
        if !into.iter().any(|a| typecmp(a, &atom)) {
            into.push(atom);
        }
    }
}

impl RgnPO {
    /// The order at function entry: the region parameters among `tvars`,
    /// the declared `(effect, region)` constraints, and the function's own
    /// region `fst_rgn`, which everything in `effect` outlives.
    pub fn initial_fn_po(
        tvars: &[Tvar],
        po: &[(Ty, Ty)],
        effect: &Ty,
        fst_rgn: &Tvar,
    ) -> Result<RgnPO, RgnOrderError> {
        let mut d = HashMap::new();
        for tv in tvars {
            if tvar_kind(tv, Kind::Box) == Kind::Rgn {
                d.insert(
                    tv.clone(),
                    RgnInfo {
                        these_outlive: Vec::new(),
                        resetable: false,
                    },
                );
            }
        }
        let mut fst = RgnInfo {
            these_outlive: Vec::new(),
            resetable: false,
        };
        push_atoms(&mut fst.these_outlive, effect);
        d.insert(fst_rgn.clone(), fst);
        let mut res = RgnPO {
            d,
            these_outlive_heap: Vec::new(),
            these_outlive_unique: Vec::new(),
            youngest: fst_rgn.clone(),
        };
        for (eff, rgn) in po {
            res = res.add_outlives_constraint(eff, rgn)?;
        }
        tracing::trace!(po = %res, "initial region order");
        Ok(res)
    }

    /// Records that `eff` outlives `rgn`.
    pub fn add_outlives_constraint(&self, eff: &Ty, rgn: &Ty) -> Result<RgnPO, RgnOrderError> {
        let rgn = compress(rgn);
        for atom in normalize_effect(eff) {
            if let Type::AccessEff(r) = &*atom {
                if !typecmp(r, &rgn) && self.rgn_outlives_rgn(&rgn, r) {
                    return Err(RgnOrderError::Circular {
                        eff: atom.to_string(),
                        rgn: rgn.to_string(),
                    });
                }
            }
        }
        let mut res = self.clone();
        match &*rgn {
            Type::Var(tv) => match res.d.get_mut(tv) {
                Some(info) => push_atoms(&mut info.these_outlive, eff),
                None => return Err(RgnOrderError::UnknownRegion(rgn.to_string())),
            },
            Type::HeapRgn => push_atoms(&mut res.these_outlive_heap, eff),
            Type::UniqueRgn => push_atoms(&mut res.these_outlive_unique, eff),
            _ => return Err(RgnOrderError::NotARegion(rgn.to_string())),
        }
        Ok(res)
    }

    /// Opens a region block: every region already in the order outlives `rgn`.
    pub fn add_youngest(&self, rgn: &Tvar, resetable: bool) -> RgnPO {
        if self.d.contains_key(rgn) {
            impos(format!("region {} added to the order twice", rgn.name));
        }
        let mut res = self.clone();
        res.d.insert(
            rgn.clone(),
            RgnInfo {
                these_outlive: vec![Type::access_eff(Type::var(&self.youngest))],
                resetable,
            },
        );
        res.youngest = rgn.clone();
        res
    }

    /// Adds a region unrelated to every other region (alias pattern regions).
    pub fn add_unordered(&self, rgn: &Tvar) -> RgnPO {
        if self.d.contains_key(rgn) {
            return self.clone();
        }
        let mut res = self.clone();
        res.d.insert(
            rgn.clone(),
            RgnInfo {
                these_outlive: Vec::new(),
                resetable: false,
            },
        );
        res
    }

    pub fn youngest(&self) -> &Tvar {
        &self.youngest
    }

    pub fn contains(&self, rgn: &Tvar) -> bool {
        self.d.contains_key(rgn)
    }

    pub fn is_region_resetable(&self, r: &Tvar) -> bool {
        match self.d.get(r) {
            Some(info) => info.resetable,
            None => impos(format!("is_region_resetable: region {} not in order", r.name)),
        }
    }

    /// Every atom known to outlive `rgn`, following region atoms transitively.
    fn outliving_atoms(&self, rgn: &Ty) -> Vec<Ty> {
        let mut atoms: Vec<Ty> = Vec::new();
        let mut visited: Vec<Ty> = Vec::new();
        let mut work = VecDeque::from([compress(rgn)]);
        while let Some(r) = work.pop_front() {
            if visited.iter().any(|v| typecmp(v, &r)) {
                continue;
            }
            visited.push(r.clone());
            let direct: &[Ty] = match &*r {
                Type::Var(tv) => match self.d.get(tv) {
                    Some(info) => &info.these_outlive,
                    None => &[],
                },
                Type::HeapRgn => &self.these_outlive_heap,
                Type::UniqueRgn => &self.these_outlive_unique,
                _ => &[],
            };
            for atom in direct {
                let atom = compress(atom);
                if let Type::AccessEff(inner) = &*atom {
                    work.push_back(compress(inner));
                }
                if !atoms.iter().any(|a| typecmp(a, &atom)) {
                    atoms.push(atom);
                }
            }
        }
        atoms
    }

    /// Does `rgn1` live at least as long as `rgn2`?
    pub fn rgn_outlives_rgn(&self, rgn1: &Ty, rgn2: &Ty) -> bool {
        let rgn1 = compress(rgn1);
        let rgn2 = compress(rgn2);
        if typecmp(&rgn1, &rgn2) {
            return true;
        }
        match (&*rgn1, &*rgn2) {
            (Type::HeapRgn, _) => return true,
            (Type::UniqueRgn, r2) if !matches!(r2, Type::HeapRgn) => return true,
            _ => {}
        }
        self.outliving_atoms(&rgn2).iter().any(|a| match &**a {
            Type::AccessEff(r) => typecmp(r, &rgn1),
            _ => false,
        })
    }

    /// Does every region in `eff` outlive `rgn`?
    pub fn effect_outlives(&self, eff: &Ty, rgn: &Ty) -> bool {
        let mut closure: Option<Vec<Ty>> = None;
        normalize_effect(eff).iter().all(|atom| match &**atom {
            Type::AccessEff(r) => self.rgn_outlives_rgn(r, rgn),
            _ => closure
                .get_or_insert_with(|| self.outliving_atoms(rgn))
                .iter()
                .any(|a| typecmp(a, atom)),
        })
    }

    /// Does every region in `eff1` outlive every region in `eff2`?
    pub fn eff_outlives_eff(&self, eff1: &Ty, eff2: &Ty) -> bool {
        let lhs = normalize_effect(eff1);
        normalize_effect(eff2).iter().all(|atom2| match &**atom2 {
            Type::AccessEff(r) => self.effect_outlives(eff1, r),
            // Nothing is known about the regions behind an effect variable
            // beyond itself.
            _ => lhs.iter().all(|atom1| typecmp(atom1, atom2)),
        })
    }

    /// Checks `(effect, region)` constraints from a callee or aggregate
    /// against this order. With `do_pin`, unresolved region evars are first
    /// fixed: a constrained region to `default_bound`, an effect-side region
    /// to the constraint's region.
    pub fn satisfies_constraints(
        &self,
        constraints: &[(Ty, Ty)],
        default_bound: &Ty,
        do_pin: bool,
    ) -> bool {
        constraints.iter().all(|(eff, rgn)| {
            if do_pin {
                pin(rgn, default_bound);
                for atom in normalize_effect(eff) {
                    match &*atom {
                        Type::AccessEff(r) => pin(r, rgn),
                        Type::Evar(_) => pin(&atom, &Type::access_eff(rgn.clone())),
                        _ => {}
                    }
                }
            }
            self.effect_outlives(eff, rgn)
        })
    }
}

/// Resolves `t` to `to` when `t` is an unresolved evar that may take it.
pub(crate) fn pin(t: &Ty, to: &Ty) {
    let t = compress(t);
    let Type::Evar(ev) = &*t else { return };
    let to = compress(to);
    if let Type::Evar(other) = &*to {
        if other.id == ev.id {
            return;
        }
    }
    if let Some(k) = *ev.kind.borrow() {
        if !type_kind(&to).leq(k) {
            return;
        }
    }
    if let Some(deps) = &*ev.deps.borrow() {
        if crate::tcutil::free_tvars(&to).iter().any(|tv| !deps.contains(tv)) {
            return;
        }
    }
    tracing::trace!(evar = ev.id, to = %to, "pinning region evar");
    *ev.resolved.borrow_mut() = Some(to);
}

impl fmt::Display for RgnPO {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.d.iter().collect();
        entries.sort_by_key(|(tv, _)| tv.identity);
        let atoms = |f: &mut fmt::Formatter<'_>, atoms: &[Ty]| -> fmt::Result {
            f.write_str("{")?;
            for (i, a) in atoms.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{a}")?;
            }
            f.write_str("}")
        };
        f.write_str("[")?;
        for (tv, info) in entries {
            write!(f, "{} > ", tv.name)?;
            atoms(f, &info.these_outlive)?;
            if info.resetable {
                f.write_str(" (resetable)")?;
            }
            f.write_str("; ")?;
        }
        if !self.these_outlive_heap.is_empty() {
            f.write_str("`H > ")?;
            atoms(f, &self.these_outlive_heap)?;
            f.write_str("; ")?;
        }
        if !self.these_outlive_unique.is_empty() {
            f.write_str("`U > ")?;
            atoms(f, &self.these_outlive_unique)?;
            f.write_str("; ")?;
        }
        write!(f, "youngest {}]", self.youngest.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgn(name: &str) -> Tvar {
        Tvar::new(name, Kind::Rgn)
    }

    fn acc(tv: &Tvar) -> Ty {
        Type::access_eff(Type::var(tv))
    }

    fn empty_po(fst: &Tvar) -> RgnPO {
        RgnPO::initial_fn_po(&[], &[], &Type::join_eff(vec![]), fst).unwrap()
    }

    #[test]
    fn fn_effect_outlives_function_region() {
        let r = rgn("`r");
        let f = rgn("`f");
        let po = RgnPO::initial_fn_po(&[r.clone()], &[], &acc(&r), &f).unwrap();
        assert!(po.rgn_outlives_rgn(&Type::var(&r), &Type::var(&f)));
        assert!(!po.rgn_outlives_rgn(&Type::var(&f), &Type::var(&r)));
    }

    #[test]
    fn heap_outlives_everything() {
        let f = rgn("`f");
        let po = empty_po(&f);
        assert!(po.rgn_outlives_rgn(&Type::heap_rgn(), &Type::var(&f)));
        assert!(po.rgn_outlives_rgn(&Type::unique_rgn(), &Type::var(&f)));
        assert!(!po.rgn_outlives_rgn(&Type::unique_rgn(), &Type::heap_rgn()));
        assert!(!po.rgn_outlives_rgn(&Type::var(&f), &Type::heap_rgn()));
    }

    #[test]
    fn youngest_is_outlived_by_all_prior_regions() {
        let f = rgn("`f");
        let a = rgn("`a");
        let b = rgn("`b");
        let po = empty_po(&f).add_youngest(&a, false).add_youngest(&b, true);
        assert_eq!(po.youngest(), &b);
        for older in [&f, &a] {
            assert!(po.effect_outlives(&acc(older), &Type::var(&b)));
            assert!(!po.effect_outlives(&acc(&b), &Type::var(older)));
        }
        assert!(po.is_region_resetable(&b));
        assert!(!po.is_region_resetable(&a));
    }

    #[test]
    fn circular_assertion_is_rejected() {
        let f = rgn("`f");
        let r = rgn("`r");
        let s = rgn("`s");
        let po = RgnPO::initial_fn_po(
            &[r.clone(), s.clone()],
            &[(acc(&r), Type::var(&s))],
            &Type::join_eff(vec![]),
            &f,
        )
        .unwrap();
        let err = po.add_outlives_constraint(&acc(&s), &Type::var(&r)).unwrap_err();
        assert!(matches!(err, RgnOrderError::Circular { .. }));
    }

    #[test]
    fn outlives_on_non_region_is_rejected() {
        let f = rgn("`f");
        let po = empty_po(&f);
        let err = po
            .add_outlives_constraint(&acc(&f), &Type::sint())
            .unwrap_err();
        assert!(matches!(err, RgnOrderError::NotARegion(_)));
    }

    #[test]
    fn effect_variables_outlive_only_by_assertion() {
        let f = rgn("`f");
        let e = Tvar::new("`e", Kind::Eff);
        let r = rgn("`r");
        let po = RgnPO::initial_fn_po(
            &[r.clone(), e.clone()],
            &[(Type::var(&e), Type::var(&r))],
            &Type::join_eff(vec![]),
            &f,
        )
        .unwrap();
        assert!(po.effect_outlives(&Type::var(&e), &Type::var(&r)));
        assert!(!po.effect_outlives(&Type::var(&e), &Type::var(&f)));
        assert!(po.eff_outlives_eff(&Type::var(&e), &Type::var(&e)));
    }

    #[test]
    fn pinning_fixes_region_evars() {
        let f = rgn("`f");
        let po = empty_po(&f);
        let rv = Type::evar(Some(Kind::Rgn), None);
        let ev = Type::evar(Some(Kind::Rgn), None);
        let ok = po.satisfies_constraints(
            &[(Type::access_eff(ev.clone()), rv.clone())],
            &Type::heap_rgn(),
            true,
        );
        assert!(ok);
        assert!(matches!(&*compress(&rv), Type::HeapRgn));
        assert!(matches!(&*compress(&ev), Type::HeapRgn));
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn resetable_query_on_unknown_region_is_internal() {
        let f = rgn("`f");
        empty_po(&f).is_region_resetable(&rgn("`nowhere"));
    }
}
