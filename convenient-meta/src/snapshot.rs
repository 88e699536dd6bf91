//! Serializable snapshots of a scope
//!
//! A snapshot carries the configuration and the raw variables. Cached values
//! and the cycle guard are never part of it, so an imported scope starts
//! cold. Deferred expressions are stored as source text and re-parsed on
//! import; native closures cannot be stored.

use crate::config::MetaConfig;
use crate::error::{MetaError, MetaResult};
use crate::expr::Deferred;
use crate::scope::Scope;
use crate::value::{ExpandMode, Kind, Value};
use crate::variable::{Conditional, RawValue, Variable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum RawSnapshot {
    Literal(Value),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<RawSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepends: Vec<RawSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appends: Vec<RawSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub override_if: BTreeMap<String, RawSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prepend_if: BTreeMap<String, RawSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_if: BTreeMap<String, RawSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub update_if: BTreeMap<String, RawSnapshot>,
    #[serde(default)]
    pub expand: ExpandMode,
    /// Falls back to the configured default separator when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    #[serde(default)]
    pub config: MetaConfig,
    pub variables: BTreeMap<String, VariableSnapshot>,
}

fn export_raw(name: &str, raw: &RawValue) -> MetaResult<RawSnapshot> {
    match raw {
        RawValue::Literal(value) => Ok(RawSnapshot::Literal(value.clone())),
        RawValue::Deferred(deferred) => deferred
            .source()
            .map(|text| RawSnapshot::Expr(text.to_string()))
            .ok_or_else(|| MetaError::Snapshot(format!("{name} holds a native expression"))),
    }
}

fn export_table(
    name: &str,
    table: &BTreeMap<String, RawValue>,
) -> MetaResult<BTreeMap<String, RawSnapshot>> {
    table
        .iter()
        .map(|(tag, raw)| Ok((tag.clone(), export_raw(name, raw)?)))
        .collect()
}

fn import_raw(raw: RawSnapshot) -> MetaResult<RawValue> {
    match raw {
        RawSnapshot::Literal(value) => Ok(RawValue::Literal(value)),
        RawSnapshot::Expr(text) => Ok(RawValue::Deferred(Deferred::parse(text)?)),
    }
}

impl VariableSnapshot {
    fn export(name: &str, var: &Variable, default_separator: &str) -> MetaResult<Self> {
        Ok(Self {
            kind: var.kind,
            base: var.base.as_ref().map(|raw| export_raw(name, raw)).transpose()?,
            prepends: var
                .prepends
                .iter()
                .map(|raw| export_raw(name, raw))
                .collect::<MetaResult<_>>()?,
            appends: var
                .appends
                .iter()
                .map(|raw| export_raw(name, raw))
                .collect::<MetaResult<_>>()?,
            override_if: export_table(name, &var.override_if)?,
            prepend_if: export_table(name, &var.prepend_if)?,
            append_if: export_table(name, &var.append_if)?,
            update_if: export_table(name, &var.update_if)?,
            expand: var.expand,
            separator: (var.separator != default_separator).then(|| var.separator.clone()),
            flags: var.flags.clone(),
        })
    }

    /// Rebuild the variable through its own mutators, so every literal is
    /// checked against the recorded kind.
    fn import(self, name: &str, default_separator: &str) -> MetaResult<Variable> {
        let mut var = Variable::unset(name)
            .with_expand(self.expand)
            .with_separator(self.separator.unwrap_or_else(|| default_separator.to_string()));
        var.kind = self.kind;
        if let Some(base) = self.base {
            var.set(Some(import_raw(base)?))?;
        }
        for raw in self.prepends {
            var.prepend(import_raw(raw)?)?;
        }
        for raw in self.appends {
            var.append(import_raw(raw)?)?;
        }
        let tables = [
            (Conditional::Override, self.override_if),
            (Conditional::Prepend, self.prepend_if),
            (Conditional::Append, self.append_if),
            (Conditional::Update, self.update_if),
        ];
        for (cond, table) in tables {
            for (tag, raw) in table {
                var.set_if(cond, tag, import_raw(raw)?)?;
            }
        }
        var.flags = self.flags;
        Ok(var)
    }
}

impl ScopeSnapshot {
    pub fn to_json(&self) -> MetaResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> MetaResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> MetaResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved {} variables to {:?}", self.variables.len(), path);
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> MetaResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot = Self::from_json(&json)?;
        info!("Loaded {} variables from {:?}", snapshot.variables.len(), path);
        Ok(snapshot)
    }
}

impl Scope {
    /// Raw variables and configuration of this scope, without cached values.
    pub fn export(&self) -> MetaResult<ScopeSnapshot> {
        let separator = self.config.default_separator.as_str();
        let variables = self
            .vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), VariableSnapshot::export(name, var, separator)?)))
            .collect::<MetaResult<_>>()?;
        Ok(ScopeSnapshot {
            config: self.config.clone(),
            variables,
        })
    }

    /// Rebuild a scope from a snapshot. The new scope starts with an empty
    /// cache.
    pub fn import(snapshot: ScopeSnapshot) -> MetaResult<Scope> {
        let mut scope = Scope::bare(snapshot.config);
        for (name, var) in snapshot.variables {
            let var = var.import(&name, &scope.config.default_separator)?;
            let _ = scope.vars.insert(name, var);
        }
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::OVERRIDES;

    fn sample() -> Scope {
        let mut scope = Scope::new();
        scope.set("PN", "busybox").unwrap();
        scope.set("P", RawValue::expr("PN + '-' + PV").unwrap()).unwrap();
        scope.set("PV", "1.36").unwrap();
        scope.append("DEPENDS", vec!["zlib"]).unwrap();
        scope.append_if("DEPENDS", "USE_ssl", "openssl").unwrap();
        scope.set_separator("DEPENDS", ",").unwrap();
        scope.set_flag("PN", "export", true).unwrap();
        scope
    }

    #[test]
    fn test_export_import_preserves_behaviour() {
        let mut scope = sample();
        let mut imported = Scope::import(scope.export().unwrap()).unwrap();

        assert_eq!(imported.keys(), scope.keys());
        assert_eq!(imported.stats().stores, 0);
        assert_eq!(imported.get("P").unwrap(), Value::from("busybox-1.36"));
        assert_eq!(imported.get("DEPENDS").unwrap(), Value::from(vec!["zlib"]));

        imported.set_overrides(["USE_ssl"]).unwrap();
        scope.set_overrides(["USE_ssl"]).unwrap();
        assert_eq!(
            imported.get("DEPENDS").unwrap(),
            Value::from(vec!["zlib", "openssl"])
        );
        assert_eq!(imported.signature().unwrap(), scope.signature().unwrap());
        assert_eq!(imported.exported_vars(), vec!["PN"]);
    }

    #[test]
    fn test_json_shape() {
        let snapshot = sample().export().unwrap();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains(r#""type": "expr""#));
        assert_eq!(snapshot.variables["DEPENDS"].separator.as_deref(), Some(","));
        assert_eq!(snapshot.variables["PN"].separator, None);
        assert_eq!(ScopeSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn test_native_expression_cannot_be_exported() {
        let mut scope = Scope::new();
        scope
            .set("N", Deferred::native(|_| Ok(Value::Int(1))))
            .unwrap();
        assert!(matches!(scope.export(), Err(MetaError::Snapshot(_))));
    }

    #[test]
    fn test_import_rejects_inconsistent_kind() {
        let json = r#"{
            "variables": {
                "FOO": { "kind": "int", "base": { "type": "literal", "value": { "kind": "str", "value": "x" } } }
            }
        }"#;
        let snapshot = ScopeSnapshot::from_json(json).unwrap();
        assert!(matches!(
            Scope::import(snapshot),
            Err(MetaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_import_rejects_inconsistent_amendments() {
        let append = r#"{
            "variables": {
                "PN": {
                    "kind": "str",
                    "base": { "type": "literal", "value": { "kind": "str", "value": "busybox" } },
                    "appends": [ { "type": "literal", "value": { "kind": "list", "value": ["x"] } } ]
                }
            }
        }"#;
        assert!(matches!(
            Scope::import(ScopeSnapshot::from_json(append).unwrap()),
            Err(MetaError::UnsupportedAmendment { .. })
        ));

        let update = r#"{
            "variables": {
                "DEPENDS": {
                    "kind": "list",
                    "update_if": { "USE_x": { "type": "literal", "value": { "kind": "map", "value": {} } } }
                }
            }
        }"#;
        assert!(matches!(
            Scope::import(ScopeSnapshot::from_json(update).unwrap()),
            Err(MetaError::UnsupportedAmendment { .. })
        ));

        let overridden = r#"{
            "variables": {
                "JOBS": {
                    "kind": "int",
                    "override_if": { "USE_x": { "type": "literal", "value": { "kind": "bool", "value": true } } }
                }
            }
        }"#;
        assert!(matches!(
            Scope::import(ScopeSnapshot::from_json(overridden).unwrap()),
            Err(MetaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_import_without_overrides() {
        let snapshot = ScopeSnapshot::from_json(r#"{"variables": {}}"#).unwrap();
        let mut scope = Scope::import(snapshot).unwrap();
        assert!(!scope.contains(OVERRIDES));
        assert!(scope.overrides().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        let mut scope = sample();
        scope.export().unwrap().save(&path).unwrap();

        let mut loaded = Scope::import(ScopeSnapshot::load(&path).unwrap()).unwrap();
        assert_eq!(loaded.get("P").unwrap(), scope.get("P").unwrap());
        assert!(matches!(
            ScopeSnapshot::load(dir.path().join("missing.json")),
            Err(MetaError::Io { .. })
        ));
    }
}
