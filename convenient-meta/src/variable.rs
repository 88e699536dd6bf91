//! Metadata variables
//!
//! A [`Variable`] is a passive cell: a base value, queued amendments and
//! conditional tables keyed by override tag. It never evaluates itself;
//! resolution happens in [`crate::eval::Evaluator`] against the owning scope.
//! Mutations here only validate kinds eagerly where the value is literal.
//! Cache invalidation is the scope's job.

use crate::error::{MetaError, MetaResult};
use crate::expr::Deferred;
use crate::value::{ExpandMode, Kind, Value};
use std::collections::BTreeMap;

/// Default list separator characters.
pub const DEFAULT_SEPARATOR: &str = " \t\n";

/// A possibly deferred value, as written by an assignment.
#[derive(Debug, Clone)]
pub enum RawValue {
    Literal(Value),
    Deferred(Deferred),
}

impl RawValue {
    /// The kind of a literal; deferred values are only known after evaluation.
    pub fn literal_kind(&self) -> Option<Kind> {
        match self {
            RawValue::Literal(value) => Some(value.kind()),
            RawValue::Deferred(_) => None,
        }
    }

    /// Parse expression source into a deferred value.
    pub fn expr(text: impl Into<String>) -> MetaResult<Self> {
        Deferred::parse(text).map(RawValue::Deferred)
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Literal(value)
    }
}

impl From<Deferred> for RawValue {
    fn from(deferred: Deferred) -> Self {
        RawValue::Deferred(deferred)
    }
}

macro_rules! raw_from_literal {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RawValue {
            fn from(v: $ty) -> Self {
                RawValue::Literal(Value::from(v))
            }
        })*
    };
}

raw_from_literal!(&str, String, Vec<String>, Vec<&str>, BTreeMap<String, Value>, bool, i64);

/// The four conditional tables a variable carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conditional {
    /// First matching tag in OVERRIDES order replaces the value.
    Override,
    /// Every matching tag prepends, in OVERRIDES order.
    Prepend,
    /// Every matching tag appends, in OVERRIDES order.
    Append,
    /// Every matching tag merges a sub-map, in reverse OVERRIDES order.
    Update,
}

impl Conditional {
    pub fn as_str(self) -> &'static str {
        match self {
            Conditional::Override => "override_if",
            Conditional::Prepend => "prepend_if",
            Conditional::Append => "append_if",
            Conditional::Update => "update_if",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub(crate) name: Option<String>,
    pub(crate) kind: Option<Kind>,
    pub(crate) base: Option<RawValue>,
    pub(crate) prepends: Vec<RawValue>,
    pub(crate) appends: Vec<RawValue>,
    pub(crate) override_if: BTreeMap<String, RawValue>,
    pub(crate) prepend_if: BTreeMap<String, RawValue>,
    pub(crate) append_if: BTreeMap<String, RawValue>,
    pub(crate) update_if: BTreeMap<String, RawValue>,
    pub(crate) expand: ExpandMode,
    pub(crate) separator: String,
    pub(crate) flags: BTreeMap<String, Value>,
}

impl Variable {
    fn empty(name: Option<String>) -> Self {
        Self {
            name,
            kind: None,
            base: None,
            prepends: Vec::new(),
            appends: Vec::new(),
            override_if: BTreeMap::new(),
            prepend_if: BTreeMap::new(),
            append_if: BTreeMap::new(),
            update_if: BTreeMap::new(),
            expand: ExpandMode::default(),
            separator: DEFAULT_SEPARATOR.to_string(),
            flags: BTreeMap::new(),
        }
    }

    /// A named variable with an unset base and no established kind.
    pub fn unset(name: impl Into<String>) -> Self {
        Self::empty(Some(name.into()))
    }

    /// A named variable holding `value`; the kind is inferred from a literal.
    pub fn new(name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        let mut var = Self::unset(name);
        var.base = Some(value.into());
        var.kind = var.base.as_ref().and_then(RawValue::literal_kind);
        var
    }

    /// A named variable of a fixed kind with an unset base.
    pub fn declare(name: impl Into<String>, kind: Kind) -> Self {
        let mut var = Self::unset(name);
        var.kind = Some(kind);
        var
    }

    /// An anonymous variable. Never entered into a scope or cached.
    pub fn anonymous(value: impl Into<RawValue>) -> Self {
        let mut var = Self::empty(None);
        var.base = Some(value.into());
        var.kind = var.base.as_ref().and_then(RawValue::literal_kind);
        var
    }

    pub fn with_expand(mut self, mode: ExpandMode) -> Self {
        self.expand = mode;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for diagnostics.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    pub fn kind(&self) -> Option<Kind> {
        self.kind
    }

    pub fn base(&self) -> Option<&RawValue> {
        self.base.as_ref()
    }

    pub fn prepends(&self) -> &[RawValue] {
        &self.prepends
    }

    pub fn appends(&self) -> &[RawValue] {
        &self.appends
    }

    pub fn table(&self, cond: Conditional) -> &BTreeMap<String, RawValue> {
        match cond {
            Conditional::Override => &self.override_if,
            Conditional::Prepend => &self.prepend_if,
            Conditional::Append => &self.append_if,
            Conditional::Update => &self.update_if,
        }
    }

    fn table_mut(&mut self, cond: Conditional) -> &mut BTreeMap<String, RawValue> {
        match cond {
            Conditional::Override => &mut self.override_if,
            Conditional::Prepend => &mut self.prepend_if,
            Conditional::Append => &mut self.append_if,
            Conditional::Update => &mut self.update_if,
        }
    }

    pub fn has_conditionals(&self) -> bool {
        !(self.override_if.is_empty()
            && self.prepend_if.is_empty()
            && self.append_if.is_empty()
            && self.update_if.is_empty())
    }

    pub fn has_amendments(&self) -> bool {
        !(self.prepends.is_empty() && self.appends.is_empty())
    }

    pub fn expand(&self) -> ExpandMode {
        self.expand
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn flags(&self) -> &BTreeMap<String, Value> {
        &self.flags
    }

    pub(crate) fn set_expand(&mut self, mode: ExpandMode) {
        self.expand = mode;
    }

    pub(crate) fn set_separator(&mut self, separator: String) {
        self.separator = separator;
    }

    pub(crate) fn flags_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.flags
    }

    /// Check a literal replacement value against the established kind,
    /// establishing it on first assignment.
    fn accept(&mut self, value: &RawValue) -> MetaResult<()> {
        let Some(found) = value.literal_kind() else {
            return Ok(());
        };
        match self.kind {
            None => {
                self.kind = Some(found);
                Ok(())
            }
            Some(kind) if kind == found || kind.accepts_fixup(found) => Ok(()),
            Some(kind) => Err(MetaError::mismatch(self.label(), kind, found)),
        }
    }

    /// Check a literal prepend/append value against the target kind.
    fn accept_amendment(&mut self, op: &'static str, value: &RawValue) -> MetaResult<()> {
        let amend = value.literal_kind();
        match (self.kind, amend) {
            (Some(kind), _) if !kind.is_sequence() => Err(MetaError::unsupported(
                self.label(),
                op,
                amend.unwrap_or(kind),
                kind,
            )),
            (Some(kind), Some(amend)) if kind != amend && !kind.accepts_fixup(amend) => {
                Err(MetaError::unsupported(self.label(), op, amend, kind))
            }
            (None, Some(amend)) if !amend.is_sequence() => Err(MetaError::unsupported(
                self.label(),
                op,
                amend,
                amend,
            )),
            (None, Some(amend)) if self.base.is_none() => {
                self.kind = Some(amend);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn accept_update(&mut self, value: &RawValue) -> MetaResult<()> {
        let amend = value.literal_kind();
        match (self.kind, amend) {
            (Some(Kind::Map), Some(Kind::Map) | None) => Ok(()),
            (Some(kind), _) => Err(MetaError::unsupported(
                self.label(),
                "update",
                amend.unwrap_or(Kind::Map),
                kind,
            )),
            (None, Some(Kind::Map)) => {
                if self.base.is_none() {
                    self.kind = Some(Kind::Map);
                }
                Ok(())
            }
            (None, Some(amend)) => Err(MetaError::unsupported(self.label(), "update", amend, Kind::Map)),
            (None, None) => Ok(()),
        }
    }

    /// Replace the base value, discarding queued amendments.
    ///
    /// `None` unsets the base so the value comes from amendments and
    /// conditionals alone.
    pub fn set(&mut self, value: Option<RawValue>) -> MetaResult<()> {
        if let Some(value) = &value {
            self.accept(value)?;
        }
        self.base = value;
        self.prepends.clear();
        self.appends.clear();
        Ok(())
    }

    /// Set the base only if it is unset and nothing is queued against it.
    /// Returns whether the value was applied.
    pub fn weak_set(&mut self, value: RawValue) -> MetaResult<bool> {
        if self.base.is_some() {
            return Ok(false);
        }
        if self.kind.is_none_or(Kind::is_sequence) && self.has_amendments() {
            return Ok(false);
        }
        self.set(Some(value))?;
        Ok(true)
    }

    pub fn prepend(&mut self, value: RawValue) -> MetaResult<()> {
        self.accept_amendment("prepend", &value)?;
        self.prepends.push(value);
        Ok(())
    }

    pub fn append(&mut self, value: RawValue) -> MetaResult<()> {
        self.accept_amendment("append", &value)?;
        self.appends.push(value);
        Ok(())
    }

    /// Write `value` into a conditional table under `tag`.
    pub fn set_if(
        &mut self,
        cond: Conditional,
        tag: impl Into<String>,
        value: RawValue,
    ) -> MetaResult<()> {
        match cond {
            Conditional::Override => self.accept(&value)?,
            Conditional::Prepend => self.accept_amendment("prepend", &value)?,
            Conditional::Append => self.accept_amendment("append", &value)?,
            Conditional::Update => self.accept_update(&value)?,
        }
        let _ = self.table_mut(cond).insert(tag.into(), value);
        Ok(())
    }

    pub fn unset_if(&mut self, cond: Conditional, tag: &str) -> Option<RawValue> {
        self.table_mut(cond).remove(tag)
    }
}
