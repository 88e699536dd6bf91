//! The evaluation engine
//!
//! [`Evaluator`] borrows a scope's variables immutably and its cache and
//! cycle guard mutably, so a `get()` can recurse into other variables while
//! recording what it consulted.

use crate::cache::EvalCache;
use crate::error::{MetaError, MetaResult};
use crate::expr::Expr;
use crate::guard::{CycleGuard, Ident};
use crate::value::{ExpandMode, Kind, Value, split_fields};
use crate::variable::{RawValue, Variable};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, trace};

/// Name of the list of active override tags.
pub const OVERRIDES: &str = "OVERRIDES";

static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(?:@(?P<expr>[^}]+)|(?P<name>[A-Za-z0-9_.+\-/~:]+))\}")
        .expect("interpolation pattern is valid")
});

#[derive(Debug, Clone, Copy)]
enum Side {
    Prepend,
    Append,
}

impl Side {
    fn op(self) -> &'static str {
        match self {
            Side::Prepend => "prepend",
            Side::Append => "append",
        }
    }
}

pub struct Evaluator<'s> {
    vars: &'s BTreeMap<String, Variable>,
    cache: &'s mut EvalCache,
    guard: &'s mut CycleGuard,
}

impl<'s> Evaluator<'s> {
    pub(crate) fn new(
        vars: &'s BTreeMap<String, Variable>,
        cache: &'s mut EvalCache,
        guard: &'s mut CycleGuard,
    ) -> Self {
        Self { vars, cache, guard }
    }

    /// Resolve the variable `name`, failing if it is not defined.
    pub fn get(&mut self, name: &str) -> MetaResult<Value> {
        self.lookup(name)?
            .ok_or_else(|| MetaError::UndefinedVariable(name.to_string()))
    }

    /// Resolve the variable `name`, or `None` if it is not defined.
    ///
    /// The lookup is recorded as a dependency either way, so defining the
    /// name later invalidates whatever consulted it.
    pub fn lookup(&mut self, name: &str) -> MetaResult<Option<Value>> {
        if let Some(entry) = self.cache.lookup(name) {
            self.guard.depend(name);
            self.guard.depend_all(&entry.deps);
            return Ok(Some(entry.value.clone()));
        }
        let vars = self.vars;
        match vars.get(name) {
            Some(var) => self.evaluate(var).map(Some),
            None => {
                trace!("Lookup of undefined variable {}", name);
                self.guard.depend(name);
                Ok(None)
            }
        }
    }

    /// Resolve `var` to its concrete value.
    ///
    /// Named variables owned by this scope are cached under their name.
    /// The guard frame is popped on every exit path.
    pub fn evaluate(&mut self, var: &Variable) -> MetaResult<Value> {
        self.guard.push(Ident::of(var))?;
        let result = self.resolve(var);
        let deps = self.guard.pop();

        if let Some(name) = var.name() {
            self.guard.depend(name);
        }
        self.guard.depend_all(&deps);

        let value = result?;
        if let Some(name) = var.name() {
            let owned = self
                .vars
                .get(name)
                .is_some_and(|held| std::ptr::eq(held, var));
            if owned {
                self.cache.store(name, value.clone(), deps);
            }
        }
        Ok(value)
    }

    /// The evaluated override tags, in priority order.
    pub fn overrides(&mut self) -> MetaResult<Vec<String>> {
        match self.lookup(OVERRIDES)? {
            None => Ok(Vec::new()),
            Some(Value::List(tags)) => Ok(tags),
            Some(Value::Str(tags)) => Ok(split_fields(&tags, crate::variable::DEFAULT_SEPARATOR)),
            Some(other) => Err(MetaError::mismatch(OVERRIDES, Kind::List, other.kind())),
        }
    }

    fn resolve(&mut self, var: &Variable) -> MetaResult<Value> {
        trace!("Evaluating {}", var.label());

        // With neither base nor kind, the first amendment becomes the value.
        let mut value = match (var.base(), var.kind()) {
            (Some(raw), _) => Some(self.resolve_typed(var, raw)?),
            (None, Some(kind)) => Some(Value::empty(kind)),
            (None, None) => None,
        };

        for raw in var.prepends() {
            let amend = self.resolve_raw(raw)?;
            value = Some(self.extend(var, value, amend, Side::Prepend)?);
        }
        for raw in var.appends() {
            let amend = self.resolve_raw(raw)?;
            value = Some(self.extend(var, value, amend, Side::Append)?);
        }

        if var.has_conditionals() {
            value = self.apply_conditionals(var, value)?;
        }

        let mut value = value.unwrap_or_else(|| Value::empty(Kind::Str));
        if let Value::Str(text) = value {
            value = Value::Str(self.expand(&text, var.expand())?);
        }
        Ok(value)
    }

    fn apply_conditionals(
        &mut self,
        var: &Variable,
        mut value: Option<Value>,
    ) -> MetaResult<Option<Value>> {
        let overrides = self.overrides()?;

        if !var.override_if.is_empty() {
            let matched = overrides
                .iter()
                .find_map(|tag| var.override_if.get(tag).map(|raw| (tag, raw)));
            if let Some((tag, raw)) = matched {
                debug!("{}: override_if {} replaces value", var.label(), tag);
                // A total replacement: nothing consulted so far matters.
                self.guard.clear_deps();
                let _ = self.overrides()?;
                value = Some(self.resolve_typed(var, raw)?);
            }
        }

        for tag in &overrides {
            if let Some(raw) = var.prepend_if.get(tag) {
                let amend = self.resolve_raw(raw)?;
                value = Some(self.extend(var, value, amend, Side::Prepend)?);
            }
        }
        for tag in &overrides {
            if let Some(raw) = var.append_if.get(tag) {
                let amend = self.resolve_raw(raw)?;
                value = Some(self.extend(var, value, amend, Side::Append)?);
            }
        }

        if !var.update_if.is_empty() {
            for tag in overrides.iter().rev() {
                let Some(raw) = var.update_if.get(tag) else {
                    continue;
                };
                let update = self.resolve_raw(raw)?;
                if !update.is_truthy() {
                    continue;
                }
                value = match (value, update) {
                    (None, Value::Map(update)) => Some(Value::Map(update)),
                    (Some(Value::Map(mut map)), Value::Map(update)) => {
                        map.extend(update);
                        Some(Value::Map(map))
                    }
                    (target, update) => {
                        return Err(MetaError::unsupported(
                            var.label(),
                            "update",
                            update.kind(),
                            target.map_or(Kind::Str, |target| target.kind()),
                        ));
                    }
                };
            }
        }

        Ok(value)
    }

    fn resolve_raw(&mut self, raw: &RawValue) -> MetaResult<Value> {
        match raw {
            RawValue::Literal(value) => Ok(value.clone()),
            RawValue::Deferred(deferred) => deferred.evaluate(self),
        }
    }

    /// Resolve a replacement value (base or override) and check it against
    /// the variable's kind, applying the string-to-list fixup.
    fn resolve_typed(&mut self, var: &Variable, raw: &RawValue) -> MetaResult<Value> {
        let value = self.resolve_raw(raw)?;
        let Some(kind) = var.kind() else {
            return Ok(value);
        };
        match value {
            value if value.kind() == kind => Ok(value),
            Value::Str(text) if kind.accepts_fixup(Kind::Str) => {
                Ok(Value::List(self.fixup(var, &text)?))
            }
            other => Err(MetaError::mismatch(var.label(), kind, other.kind())),
        }
    }

    fn fixup(&mut self, var: &Variable, text: &str) -> MetaResult<Vec<String>> {
        let expanded = self.expand(text, var.expand())?;
        Ok(split_fields(&expanded, var.separator()))
    }

    /// Amend `value`, or start from `amend` when there is no value yet.
    fn extend(
        &mut self,
        var: &Variable,
        value: Option<Value>,
        amend: Value,
        side: Side,
    ) -> MetaResult<Value> {
        match value {
            Some(value) => self.amend(var, value, amend, side),
            None if amend.kind().is_sequence() => Ok(amend),
            None => {
                let kind = amend.kind();
                Err(MetaError::unsupported(var.label(), side.op(), kind, kind))
            }
        }
    }

    fn amend(&mut self, var: &Variable, value: Value, amend: Value, side: Side) -> MetaResult<Value> {
        let amended = match (value, amend) {
            (Value::Str(base), Value::Str(amend)) => match side {
                Side::Prepend => Value::Str(amend + &base),
                Side::Append => Value::Str(base + &amend),
            },
            (Value::List(base), Value::List(amend)) => Value::List(join(base, amend, side)),
            (Value::List(base), Value::Str(amend)) => {
                let amend = self.fixup(var, &amend)?;
                Value::List(join(base, amend, side))
            }
            (target, amend) => {
                return Err(MetaError::unsupported(
                    var.label(),
                    side.op(),
                    amend.kind(),
                    target.kind(),
                ));
            }
        };
        Ok(amended)
    }

    /// Interpolate `${NAME}` and `${@expr}` references in `text`.
    pub fn expand(&mut self, text: &str, mode: ExpandMode) -> MetaResult<String> {
        if mode == ExpandMode::No || !text.contains("${") {
            return Ok(text.to_string());
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let captures: Vec<Captures<'_>> = INTERPOLATION.captures_iter(text).collect();
        for caps in captures {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            if let Some(source) = caps.name("expr") {
                let value = Expr::parse(source.as_str())?.evaluate(self)?;
                out.push_str(&self.text_of(source.as_str(), &value)?);
                continue;
            }
            let Some(name) = caps.name("name").map(|m| m.as_str()) else {
                continue;
            };
            match mode {
                ExpandMode::Full => {
                    let value = self.get(name)?;
                    out.push_str(&self.text_of(name, &value)?);
                }
                ExpandMode::Partial | ExpandMode::Clean => match self.lookup(name)? {
                    Some(value) => out.push_str(&self.text_of(name, &value)?),
                    None if mode == ExpandMode::Partial => out.push_str(whole.as_str()),
                    None => {}
                },
                ExpandMode::No => out.push_str(whole.as_str()),
            }
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    fn text_of(&self, context: &str, value: &Value) -> MetaResult<String> {
        value
            .to_text()
            .ok_or_else(|| MetaError::mismatch(context, Kind::Str, value.kind()))
    }
}

fn join(base: Vec<String>, amend: Vec<String>, side: Side) -> Vec<String> {
    match side {
        Side::Prepend => {
            let mut joined = amend;
            joined.extend(base);
            joined
        }
        Side::Append => {
            let mut joined = base;
            joined.extend(amend);
            joined
        }
    }
}
