use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

#[derive(Clone, Debug)]
pub enum Constraint<T> {
    NoConstr,
    Eq(T),
    Forward(Conref<T>),
}

/// Shared single-assignment constraint cell.
///
/// Cells only ever move from `NoConstr` to `Eq` or `Forward`; following
/// `Forward` links reaches the representative.
#[derive(Debug)]
pub struct Conref<T>(Rc<RefCell<Constraint<T>>>);

impl<T> Clone for Conref<T> {
    fn clone(&self) -> Self {
        Conref(self.0.clone())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("constraint forward chain is cyclic")]
pub struct ConrefCycle;

impl<T: Clone> Conref<T> {
    pub fn empty() -> Self {
        Conref(Rc::new(RefCell::new(Constraint::NoConstr)))
    }

    pub fn eq(v: T) -> Self {
        Conref(Rc::new(RefCell::new(Constraint::Eq(v))))
    }

    pub fn ptr_eq(&self, other: &Conref<T>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn constraint(&self) -> Constraint<T> {
        self.0.borrow().clone()
    }

    /// Follows forward links to the representative cell, compressing the
    /// path on the way.
    pub fn compress(&self) -> Result<Conref<T>, ConrefCycle> {
        let mut visited: Vec<Conref<T>> = Vec::new();
        let mut cur = self.clone();
        loop {
            let next = match &*cur.0.borrow() {
                Constraint::Forward(next) => next.clone(),
                Constraint::NoConstr | Constraint::Eq(_) => break,
            };
            visited.push(cur);
            if visited.iter().any(|v| v.ptr_eq(&next)) {
                return Err(ConrefCycle);
            }
            cur = next;
        }
        // The last visited cell already forwards to `cur`.
        for cell in visited.iter().rev().skip(1) {
            *cell.0.borrow_mut() = Constraint::Forward(cur.clone());
        }
        Ok(cur)
    }

    pub fn value(&self) -> Result<Option<T>, ConrefCycle> {
        let rep = self.compress()?;
        let v = match &*rep.0.borrow() {
            Constraint::Eq(v) => Some(v.clone()),
            Constraint::NoConstr | Constraint::Forward(_) => None,
        };
        Ok(v)
    }

    pub fn value_or(&self, default: T) -> Result<T, ConrefCycle> {
        Ok(self.value()?.unwrap_or(default))
    }

    /// Constrains an unconstrained representative to `v`. Returns `false`
    /// when the cell already holds a value.
    pub fn set(&self, v: T) -> Result<bool, ConrefCycle> {
        let rep = self.compress()?;
        let mut cell = rep.0.borrow_mut();
        match &*cell {
            Constraint::NoConstr => {
                *cell = Constraint::Eq(v);
                Ok(true)
            }
            Constraint::Eq(_) | Constraint::Forward(_) => Ok(false),
        }
    }

    /// Makes this cell's representative forward to `target`. The
    /// representative must be unconstrained.
    pub fn forward_to(&self, target: &Conref<T>) -> Result<bool, ConrefCycle> {
        let rep = self.compress()?;
        let target = target.compress()?;
        if rep.ptr_eq(&target) {
            return Ok(true);
        }
        let mut cell = rep.0.borrow_mut();
        match &*cell {
            Constraint::NoConstr => {
                *cell = Constraint::Forward(target.clone());
                Ok(true)
            }
            Constraint::Eq(_) | Constraint::Forward(_) => Ok(false),
        }
    }

    /// Overwrites the cell unconditionally. Only unification rollback uses
    /// this; everything else goes through `set`/`forward_to`.
    pub fn restore(&self, c: Constraint<T>) {
        *self.0.borrow_mut() = c;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_chain_compresses_to_representative() {
        let a: Conref<bool> = Conref::empty();
        let b = Conref::empty();
        let c = Conref::eq(true);
        assert!(a.forward_to(&b).unwrap());
        assert!(b.forward_to(&c).unwrap());
        assert_eq!(a.value().unwrap(), Some(true));
        assert!(a.compress().unwrap().ptr_eq(&c));
        assert!(matches!(a.constraint(), Constraint::Forward(f) if f.ptr_eq(&c)));
    }

    #[test]
    fn set_is_monotone() {
        let a = Conref::empty();
        assert!(a.set(3u8).unwrap());
        assert!(!a.set(4u8).unwrap());
        assert_eq!(a.value().unwrap(), Some(3));
    }

    #[test]
    fn cycle_is_detected() {
        let a: Conref<bool> = Conref::empty();
        let b: Conref<bool> = Conref::empty();
        a.restore(Constraint::Forward(b.clone()));
        b.restore(Constraint::Forward(a.clone()));
        assert_eq!(a.compress().unwrap_err(), ConrefCycle);
    }
}
