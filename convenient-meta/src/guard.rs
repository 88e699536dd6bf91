//! Cycle guard for in-flight evaluations
//!
//! An explicit stack of the variables currently being evaluated in one scope.
//! Each frame also accumulates the names consulted by that evaluation, which
//! become the dependency set of its cache entry.
//!
//! Evaluation recurses natively, so the stack is also bounded: pushing past
//! `max_depth` frames fails with [`MetaError::DepthExceeded`] instead of
//! exhausting the thread's stack.

use crate::error::{MetaError, MetaResult};
use crate::variable::Variable;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Identity of a variable on the guard stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ident {
    Named(String),
    /// Anonymous variables are identified by address; they are never cached
    /// and never outlive the borrow that evaluates them.
    Anonymous(usize),
}

impl Ident {
    pub fn of(var: &Variable) -> Self {
        match var.name() {
            Some(name) => Ident::Named(name.to_string()),
            None => Ident::Anonymous(std::ptr::from_ref(var) as usize),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Named(name) => f.write_str(name),
            Ident::Anonymous(addr) => write!(f, "<anonymous@{addr:x}>"),
        }
    }
}

#[derive(Debug)]
struct Frame {
    ident: Ident,
    deps: HashSet<String>,
}

/// Nesting limit of a guard built with [`CycleGuard::new`].
pub const DEFAULT_MAX_DEPTH: usize = 100;

#[derive(Debug)]
pub struct CycleGuard {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl Default for CycleGuard {
    fn default() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    fn chain_with(&self, ident: &Ident) -> Vec<String> {
        let mut chain: Vec<String> = self
            .frames
            .iter()
            .map(|frame| frame.ident.to_string())
            .collect();
        chain.push(ident.to_string());
        chain
    }

    /// Enter the evaluation of `ident`, failing if it is already in flight
    /// or if the stack is full.
    pub fn push(&mut self, ident: Ident) -> MetaResult<()> {
        if self.frames.iter().any(|frame| frame.ident == ident) {
            let chain = self.chain_with(&ident);
            warn!("Recursive evaluation detected: {}", chain.join(" -> "));
            return Err(MetaError::RecursiveEvaluation { chain });
        }
        if self.frames.len() >= self.max_depth {
            let chain = self.chain_with(&ident);
            warn!(
                "Evaluation of {} nested deeper than {} variables",
                ident, self.max_depth
            );
            return Err(MetaError::DepthExceeded {
                limit: self.max_depth,
                chain,
            });
        }
        self.frames.push(Frame {
            ident,
            deps: HashSet::new(),
        });
        Ok(())
    }

    /// Leave the innermost evaluation, returning what it consulted.
    pub fn pop(&mut self) -> HashSet<String> {
        self.frames.pop().map(|frame| frame.deps).unwrap_or_default()
    }

    /// Record that the innermost evaluation consulted `name`.
    ///
    /// Outside any evaluation this is a no-op.
    pub fn depend(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            if !frame.deps.contains(name) {
                let _ = frame.deps.insert(name.to_string());
            }
        }
    }

    pub fn depend_all<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.deps.extend(names.into_iter().cloned());
        }
    }

    /// Forget everything the innermost evaluation consulted so far.
    pub fn clear_deps(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.deps.clear();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A fresh guard: cloning a scope never carries in-flight frames over.
impl Clone for CycleGuard {
    fn clone(&self) -> Self {
        Self::with_max_depth(self.max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentry_reports_chain() {
        let mut guard = CycleGuard::new();
        guard.push(Ident::Named("FOO".into())).unwrap();
        guard.push(Ident::Named("BAR".into())).unwrap();
        match guard.push(Ident::Named("FOO".into())) {
            Err(MetaError::RecursiveEvaluation { chain }) => {
                assert_eq!(chain, vec!["FOO", "BAR", "FOO"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(guard.depth(), 2);
    }

    #[test]
    fn test_depth_limit() {
        let mut guard = CycleGuard::with_max_depth(2);
        guard.push(Ident::Named("A".into())).unwrap();
        guard.push(Ident::Named("B".into())).unwrap();
        match guard.push(Ident::Named("C".into())) {
            Err(MetaError::DepthExceeded { limit, chain }) => {
                assert_eq!(limit, 2);
                assert_eq!(chain, vec!["A", "B", "C"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(guard.depth(), 2);
        assert_eq!(guard.clone().max_depth(), 2);
    }

    #[test]
    fn test_deps_belong_to_innermost_frame() {
        let mut guard = CycleGuard::new();
        guard.depend("IGNORED");
        guard.push(Ident::Named("A".into())).unwrap();
        guard.depend("X");
        guard.push(Ident::Named("B".into())).unwrap();
        guard.depend("Y");
        let inner = guard.pop();
        assert_eq!(inner, HashSet::from(["Y".to_string()]));
        guard.clear_deps();
        guard.depend("Z");
        let outer = guard.pop();
        assert_eq!(outer, HashSet::from(["Z".to_string()]));
        assert!(guard.is_idle());
    }
}
