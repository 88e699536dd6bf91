//! Scope configuration
//!
//! Loaded from YAML, e.g.
//!
//! ```yaml
//! default_separator: " \t\n"
//! default_expand: full
//! env_whitelist: [PATH, PWD, SHELL, TERM]
//! max_depth: 100
//! ```

use crate::error::{MetaError, MetaResult};
use crate::guard::DEFAULT_MAX_DEPTH;
use crate::value::ExpandMode;
use crate::variable::DEFAULT_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Variables that never contribute to a scope signature.
const BUILTIN_NOHASH: &[&str] = &[
    "OE_REMOTES",
    "OE_MODULES",
    "OE_ENV_WHITELIST",
    "PATH",
    "PWD",
    "SHELL",
    "TERM",
    "TOPDIR",
    "TMPDIR",
    "OEPATH",
    "OEPATH_PRETTY",
    "OERECIPES",
    "OERECIPES_PRETTY",
    "FILE",
    "COMPATIBLE_BUILD_ARCHS",
    "COMPATIBLE_HOST_ARCHS",
    "COMPATIBLE_TARGET_ARCHS",
    "COMPATIBLE_BUILD_CPU_FAMILIES",
    "COMPATIBLE_HOST_CPU_FAMILIES",
    "COMPATIBLE_TARGET_CPU_FAMILIES",
    "COMPATIBLE_MACHINES",
    "INCOMPATIBLE_RECIPES",
    "COMPATIBLE_IF_FLAGS",
    "_task_deps",
];

const BUILTIN_NOHASH_PREFIXES: &[&str] = &["OE_REMOTE_", "OE_MODULE_"];

const BUILTIN_ENV_WHITELIST: &[&str] = &["PATH", "PWD", "SHELL", "TERM"];

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Characters a string is split on when it stands in for a list.
    pub default_separator: String,
    /// Expansion mode given to newly created variables.
    pub default_expand: ExpandMode,
    /// Environment variables `import_env` may copy into a scope.
    pub env_whitelist: Vec<String>,
    /// Variables excluded from signatures.
    pub nohash: Vec<String>,
    pub nohash_prefixes: Vec<String>,
    /// Deepest chain of variable references a single `get` may follow.
    pub max_depth: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            default_separator: DEFAULT_SEPARATOR.to_string(),
            default_expand: ExpandMode::Full,
            env_whitelist: to_strings(BUILTIN_ENV_WHITELIST),
            nohash: to_strings(BUILTIN_NOHASH),
            nohash_prefixes: to_strings(BUILTIN_NOHASH_PREFIXES),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl MetaConfig {
    pub fn from_yaml_str(yaml: &str) -> MetaResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> MetaResult<Self> {
        let path = path.as_ref();
        info!("Loading metadata configuration: {:?}", path);
        let yaml = std::fs::read_to_string(path).map_err(|source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Whether `name` is excluded from signatures by configuration alone.
    pub fn is_nohash(&self, name: &str) -> bool {
        self.nohash.iter().any(|n| n == name)
            || self
                .nohash_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }
}
