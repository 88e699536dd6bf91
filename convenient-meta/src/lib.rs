//! Lazy, dependency-tracked metadata variables for recipe build systems.
//!
//! A [`Scope`] holds named variables whose values may reference other
//! variables (`${NAME}` interpolation, deferred expressions) and may carry
//! amendments that apply only when an override tag is active.
//!
//! # Features
//!
//! - Lazy evaluation with memoized results
//! - Per-value dependency sets and transitive invalidation on mutation
//! - Conditional overrides, prepends, appends and map updates keyed by `OVERRIDES`
//! - Cycle detection that leaves the scope usable afterwards
//! - Kind enforcement, with strings standing in for lists
//! - Signatures over the resolved scope and JSON snapshots
//!
//! # Example
//!
//! ```
//! use convenient_meta::{Scope, Value};
//!
//! let mut scope = Scope::new();
//! scope.set("FOO", "foo").unwrap();
//! scope.set("BAR", "${FOO}bar").unwrap();
//! scope.append_if("BAR", "USE_baz", " baz").unwrap();
//!
//! assert_eq!(scope.get("BAR").unwrap(), Value::from("foobar"));
//!
//! // Changing the active overrides invalidates everything that consulted them
//! scope.set_overrides(["USE_baz"]).unwrap();
//! assert_eq!(scope.get("BAR").unwrap(), Value::from("foobar baz"));
//!
//! // So does changing a dependency
//! scope.set("FOO", "x").unwrap();
//! assert_eq!(scope.get("BAR").unwrap(), Value::from("xbar baz"));
//! ```

#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod error;
pub mod eval;
pub mod expr;
pub mod guard;
pub mod scope;
pub mod signature;
pub mod snapshot;
pub mod value;
pub mod variable;

pub use cache::CacheStats;
pub use config::MetaConfig;
pub use error::{MetaError, MetaResult};
pub use eval::{Evaluator, OVERRIDES};
pub use expr::{Deferred, Expr};
pub use guard::DEFAULT_MAX_DEPTH;
pub use scope::{Operand, Scope, VarMut};
pub use signature::{
    DYNAMIC_VARS, DumpOptions, ENV_SIGNATURE, ENV_WHITELIST_VAR, SIGNATURE_IGNORE_FLAGS,
};
pub use snapshot::{RawSnapshot, ScopeSnapshot, VariableSnapshot};
pub use value::{ExpandMode, Kind, Value};
pub use variable::{Conditional, RawValue, Variable};
