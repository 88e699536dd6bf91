//! Scopes of metadata variables
//!
//! A [`Scope`] owns its variables, the evaluation cache and the cycle guard.
//! Every mutation goes through the scope so the cache entry of the mutated
//! name, and everything that consulted it, is dropped before the change is
//! applied.

use crate::cache::{CacheStats, EvalCache};
use crate::config::MetaConfig;
use crate::error::{MetaError, MetaResult};
use crate::eval::{Evaluator, OVERRIDES};
use crate::guard::CycleGuard;
use crate::value::{ExpandMode, Kind, Value, split_fields};
use crate::variable::{Conditional, RawValue, Variable};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, trace};

/// One side of a `+` composition.
#[derive(Debug, Clone)]
pub enum Operand<'a> {
    /// A variable of the scope, by name.
    Named(&'a str),
    /// A variable held outside the scope, usually anonymous.
    Var(&'a Variable),
    Literal(Value),
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub(crate) config: MetaConfig,
    pub(crate) vars: BTreeMap<String, Variable>,
    cache: EvalCache,
    guard: CycleGuard,
    pub(crate) signature: Option<String>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self::with_config(MetaConfig::default())
    }

    /// Create a scope holding only an empty `OVERRIDES` list.
    pub fn with_config(config: MetaConfig) -> Self {
        let mut scope = Self::bare(config);
        let overrides = scope.fresh_var(OVERRIDES);
        let _ = scope.vars.insert(OVERRIDES.to_string(), overrides);
        if let Some(var) = scope.vars.get_mut(OVERRIDES) {
            let _ = var.set(Some(RawValue::Literal(Value::List(Vec::new()))));
        }
        scope
    }

    /// A scope with no variables at all, for importing snapshots.
    pub(crate) fn bare(config: MetaConfig) -> Self {
        Self {
            guard: CycleGuard::with_max_depth(config.max_depth),
            config,
            vars: BTreeMap::new(),
            cache: EvalCache::new(),
            signature: None,
        }
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// Fork an independent scope.
    ///
    /// Variables are copied, the cache is copied as a snapshot and is
    /// invalidated independently from then on.
    pub fn derive(&self) -> Scope {
        debug!(
            "Deriving scope with {} variables and {} cached values",
            self.vars.len(),
            self.cache.len()
        );
        self.clone()
    }

    fn evaluator(&mut self) -> Evaluator<'_> {
        Evaluator::new(&self.vars, &mut self.cache, &mut self.guard)
    }

    /// Fully resolved value of `name`.
    pub fn get(&mut self, name: &str) -> MetaResult<Value> {
        self.evaluator().get(name)
    }

    /// Fully resolved value of `name`, or `None` if it is not defined.
    pub fn lookup(&mut self, name: &str) -> MetaResult<Option<Value>> {
        self.evaluator().lookup(name)
    }

    /// Resolve a variable held outside this scope against it. Never cached.
    pub fn evaluate(&mut self, var: &Variable) -> MetaResult<Value> {
        self.evaluator().evaluate(var)
    }

    /// Interpolate `text` against this scope.
    pub fn expand(&mut self, text: &str, mode: ExpandMode) -> MetaResult<String> {
        self.evaluator().expand(text, mode)
    }

    /// The active override tags.
    pub fn overrides(&mut self) -> MetaResult<Vec<String>> {
        self.evaluator().overrides()
    }

    pub fn set_overrides<I, S>(&mut self, tags: I) -> MetaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        debug!("OVERRIDES = {:?}", tags);
        self.set(OVERRIDES, Value::List(tags))
    }

    fn fresh_var(&self, name: &str) -> Variable {
        Variable::unset(name)
            .with_expand(self.config.default_expand)
            .with_separator(self.config.default_separator.clone())
    }

    /// Drop cached values that depend on `name`.
    fn touch(&mut self, name: &str) {
        let evicted = self.cache.invalidate(name);
        trace!("Mutating {} (evicted {})", name, evicted);
        self.signature = None;
    }

    /// Invalidate `name`, then apply `f` to its variable. A variable created
    /// for the call is only kept if `f` succeeds.
    fn mutate<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Variable) -> MetaResult<T>,
    ) -> MetaResult<T> {
        self.touch(name);
        if let Some(var) = self.vars.get_mut(name) {
            return f(var);
        }
        let mut var = self.fresh_var(name);
        let out = f(&mut var)?;
        let _ = self.vars.insert(name.to_string(), var);
        Ok(out)
    }

    /// Assign `name`. An existing variable keeps its identity and kind.
    pub fn set(&mut self, name: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        let value = value.into();
        self.mutate(name, |var| var.set(Some(value)))
    }

    /// Unset the base value of `name`, keeping conditionals and flags.
    pub fn unset(&mut self, name: &str) -> MetaResult<()> {
        self.mutate(name, |var| var.set(None))
    }

    /// Assign only if `name` has no base value and nothing queued.
    pub fn weak_set(&mut self, name: &str, value: impl Into<RawValue>) -> MetaResult<bool> {
        let value = value.into();
        self.mutate(name, |var| var.weak_set(value))
    }

    /// Fix the kind of `name`, creating it unset if needed.
    pub fn declare(&mut self, name: &str, kind: Kind) -> MetaResult<()> {
        self.mutate(name, |var| match var.kind {
            None => {
                var.kind = Some(kind);
                Ok(())
            }
            Some(existing) if existing == kind => Ok(()),
            Some(existing) => Err(MetaError::mismatch(var.label(), existing, kind)),
        })
    }

    /// Copy the evaluated value of `source` into `target`.
    pub fn assign_from(&mut self, target: &str, source: &str) -> MetaResult<()> {
        let value = self.get(source)?;
        self.set(target, value)
    }

    pub fn prepend(&mut self, name: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        let value = value.into();
        self.mutate(name, |var| var.prepend(value))
    }

    pub fn append(&mut self, name: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        let value = value.into();
        self.mutate(name, |var| var.append(value))
    }

    /// Write into one of the conditional tables of `name`.
    pub fn set_if(
        &mut self,
        cond: Conditional,
        name: &str,
        tag: &str,
        value: impl Into<RawValue>,
    ) -> MetaResult<()> {
        let value = value.into();
        self.mutate(name, |var| var.set_if(cond, tag, value))
    }

    pub fn unset_if(&mut self, cond: Conditional, name: &str, tag: &str) -> Option<RawValue> {
        if !self.vars.contains_key(name) {
            return None;
        }
        self.touch(name);
        self.vars.get_mut(name)?.unset_if(cond, tag)
    }

    pub fn override_if(&mut self, name: &str, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.set_if(Conditional::Override, name, tag, value)
    }

    pub fn prepend_if(&mut self, name: &str, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.set_if(Conditional::Prepend, name, tag, value)
    }

    pub fn append_if(&mut self, name: &str, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.set_if(Conditional::Append, name, tag, value)
    }

    pub fn update_if(&mut self, name: &str, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.set_if(Conditional::Update, name, tag, value)
    }

    /// Join `value` in front of the `override_if` entry of `name` for `tag`,
    /// or set the entry if there is none.
    ///
    /// Only literal string entries can be joined.
    pub fn prepend_override(
        &mut self,
        name: &str,
        tag: &str,
        value: &str,
        separator: &str,
    ) -> MetaResult<()> {
        let current = self
            .vars
            .get(name)
            .and_then(|var| var.table(Conditional::Override).get(tag));
        let joined = match current {
            Some(RawValue::Literal(Value::Str(current))) => format!("{value}{separator}{current}"),
            Some(current) => {
                let target = current.literal_kind().unwrap_or(Kind::Str);
                return Err(MetaError::unsupported(name, "prepend", Kind::Str, target));
            }
            None => value.to_string(),
        };
        self.override_if(name, tag, joined)
    }

    pub fn set_expand(&mut self, name: &str, mode: ExpandMode) -> MetaResult<()> {
        self.mutate(name, |var| {
            var.set_expand(mode);
            Ok(())
        })
    }

    pub fn set_separator(&mut self, name: &str, separator: &str) -> MetaResult<()> {
        self.mutate(name, |var| {
            var.set_separator(separator.to_string());
            Ok(())
        })
    }

    /// Remove `name` and its variable from the scope.
    pub fn delete(&mut self, name: &str) -> Option<Variable> {
        self.touch(name);
        self.vars.remove(name)
    }

    /// Set a flag on `name`.
    ///
    /// Flags do not take part in evaluation, except `expand`, which sets the
    /// variable's expansion mode.
    pub fn set_flag(&mut self, name: &str, flag: &str, value: impl Into<Value>) -> MetaResult<()> {
        let value = value.into();
        if flag == "expand" {
            let mode = match &value {
                Value::Str(mode) => mode.parse::<ExpandMode>(),
                Value::Bool(true) => Ok(ExpandMode::Full),
                Value::Bool(false) => Ok(ExpandMode::No),
                other => Err(format!("expected a mode name, found {}", other.kind())),
            }
            .map_err(|message| MetaError::InvalidFlag {
                var: name.to_string(),
                flag: flag.to_string(),
                message,
            })?;
            self.set_expand(name, mode)?;
        }

        self.signature = None;
        if !self.vars.contains_key(name) {
            // A new name changes what `lookup` reports for it.
            self.touch(name);
            let var = self.fresh_var(name);
            let _ = self.vars.insert(name.to_string(), var);
        }
        if let Some(var) = self.vars.get_mut(name) {
            let _ = var.flags_mut().insert(flag.to_string(), value);
        }
        Ok(())
    }

    /// Append `value` to the string flag of `name`, joined by `separator`,
    /// or set the flag if it is absent.
    pub fn append_flag(
        &mut self,
        name: &str,
        flag: &str,
        value: &str,
        separator: &str,
    ) -> MetaResult<()> {
        let joined = match self.get_flag(name, flag) {
            None => value.to_string(),
            Some(Value::Str(current)) => format!("{current}{separator}{value}"),
            Some(other) => {
                return Err(MetaError::InvalidFlag {
                    var: name.to_string(),
                    flag: flag.to_string(),
                    message: format!("cannot append to a {} flag", other.kind()),
                });
            }
        };
        self.set_flag(name, flag, joined)
    }

    pub fn get_flag(&self, name: &str, flag: &str) -> Option<&Value> {
        self.vars.get(name)?.flags().get(flag)
    }

    pub fn del_flag(&mut self, name: &str, flag: &str) -> Option<Value> {
        let removed = self.vars.get_mut(name)?.flags_mut().remove(flag);
        if removed.is_some() {
            self.signature = None;
        }
        removed
    }

    /// Names of variables whose `flag` is truthy, sorted.
    pub fn vars_with_flag(&self, flag: &str) -> Vec<String> {
        self.vars
            .iter()
            .filter(|(_, var)| var.flags().get(flag).is_some_and(Value::is_truthy))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn exported_vars(&self) -> Vec<String> {
        self.vars_with_flag("export")
    }

    /// Variable names, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Raw, unevaluated variable.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.vars.iter().map(|(name, var)| (name.as_str(), var))
    }

    /// Handle on an existing variable that invalidates on every mutation.
    pub fn var_mut(&mut self, name: &str) -> Option<VarMut<'_>> {
        if !self.vars.contains_key(name) {
            return None;
        }
        Some(VarMut {
            scope: self,
            name: name.to_string(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.contains(name)
    }

    /// Dependency set recorded for the cached value of `name`.
    pub fn cached_deps(&self, name: &str) -> Option<&HashSet<String>> {
        self.cache.peek(name).map(|entry| &entry.deps)
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn operand(&mut self, operand: Operand<'_>) -> MetaResult<(Value, String)> {
        match operand {
            Operand::Named(name) => {
                let separator = self
                    .vars
                    .get(name)
                    .map_or_else(|| self.config.default_separator.clone(), |v| v.separator().to_string());
                Ok((self.get(name)?, separator))
            }
            Operand::Var(var) => Ok((self.evaluate(var)?, var.separator().to_string())),
            Operand::Literal(value) => Ok((value, self.config.default_separator.clone())),
        }
    }

    /// `lhs + rhs` over evaluated values, as a new anonymous variable.
    ///
    /// Defined for two values of the same sequence kind, and for a list
    /// followed by a string, which is split on the list's separator.
    pub fn concat(&mut self, lhs: Operand<'_>, rhs: Operand<'_>) -> MetaResult<Variable> {
        let (lhs, separator) = self.operand(lhs)?;
        let (rhs, _) = self.operand(rhs)?;
        let sum = match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Value::List(a)
            }
            (Value::List(mut a), Value::Str(b)) => {
                a.extend(split_fields(&b, &separator));
                Value::List(a)
            }
            (a, b) if !a.kind().is_sequence() => {
                return Err(MetaError::unsupported("'+'", "add", b.kind(), a.kind()));
            }
            (a, b) => return Err(MetaError::mismatch("'+'", a.kind(), b.kind())),
        };
        Ok(Variable::anonymous(sum).with_separator(separator))
    }
}

/// Mutable handle on one variable of a scope.
pub struct VarMut<'a> {
    scope: &'a mut Scope,
    name: String,
}

impl VarMut<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variable(&self) -> Option<&Variable> {
        self.scope.variable(&self.name)
    }

    pub fn get(&mut self) -> MetaResult<Value> {
        self.scope.get(&self.name)
    }

    pub fn set(&mut self, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.set(&self.name, value)
    }

    pub fn unset(&mut self) -> MetaResult<()> {
        self.scope.unset(&self.name)
    }

    pub fn weak_set(&mut self, value: impl Into<RawValue>) -> MetaResult<bool> {
        self.scope.weak_set(&self.name, value)
    }

    pub fn prepend(&mut self, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.prepend(&self.name, value)
    }

    pub fn append(&mut self, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.append(&self.name, value)
    }

    pub fn override_if(&mut self, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.override_if(&self.name, tag, value)
    }

    pub fn prepend_if(&mut self, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.prepend_if(&self.name, tag, value)
    }

    pub fn append_if(&mut self, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.append_if(&self.name, tag, value)
    }

    pub fn update_if(&mut self, tag: &str, value: impl Into<RawValue>) -> MetaResult<()> {
        self.scope.update_if(&self.name, tag, value)
    }

    pub fn unset_if(&mut self, cond: Conditional, tag: &str) -> Option<RawValue> {
        self.scope.unset_if(cond, &self.name, tag)
    }
}
