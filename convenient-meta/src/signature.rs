//! Dumps, signatures and environment import
//!
//! A scope signature is the SHA-256 of its filtered dump: every variable that
//! is not marked `nohash` and resolves to a non-empty value, one line each,
//! in name order. Variables whose name starts with `__` are internal and
//! never dumped. Values of build-directory variables such as `WORKDIR` are
//! written back as `${WORKDIR}` so signatures do not depend on where a build
//! runs.

use crate::error::{MetaError, MetaResult};
use crate::scope::Scope;
use crate::value::{ExpandMode, Kind, Value};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Name of the variable `import_env` stores its signature in.
pub const ENV_SIGNATURE: &str = "__env_signature";

/// Extra whitelist entries a scope, or the environment itself, may define
/// for `import_env`.
pub const ENV_WHITELIST_VAR: &str = "OE_ENV_WHITELIST";

/// Flags left out of signatures, matched at the start of the flag name.
pub const SIGNATURE_IGNORE_FLAGS: &[&str] = &["__", "emit$", "omit$", "filename"];

/// Variables whose values are replaced by a reference to themselves in dumps.
pub const DYNAMIC_VARS: &[&str] = &[
    "WORKDIR",
    "TOPDIR",
    "DATETIME",
    "MANIFEST_ORIGIN_URL",
    "MANIFEST_ORIGIN_SRCURI",
    "MANIFEST_ORIGIN_PARAMS",
];

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Also write `NAME[flag]=value` lines.
    pub flags: bool,
    /// Skip variables excluded from signatures.
    pub signature: bool,
    /// Regexes of flag names not to write, matched at the start of the name.
    /// The `expand` flag is never written.
    pub ignore_flags: Vec<String>,
    /// Restrict the dump to these variables.
    pub only: Option<Vec<String>>,
}

impl DumpOptions {
    /// The options a signature is computed with.
    pub fn signature() -> Self {
        Self {
            flags: true,
            signature: true,
            ignore_flags: SIGNATURE_IGNORE_FLAGS.iter().map(|s| s.to_string()).collect(),
            only: None,
        }
    }

    fn flag_filter(&self) -> MetaResult<Option<Regex>> {
        if self.ignore_flags.is_empty() {
            return Ok(None);
        }
        let pattern = format!("^(?:{})", self.ignore_flags.join("|"));
        Ok(Some(Regex::new(&pattern)?))
    }
}

fn io_error(source: std::io::Error) -> MetaError {
    MetaError::Io {
        path: "<dump>".into(),
        source,
    }
}

fn substitute(value: Value, dynvars: &[(&str, String)]) -> Value {
    let replace = |mut text: String| {
        for (name, expanded) in dynvars {
            if text.contains(expanded.as_str()) {
                text = text.replace(expanded.as_str(), &format!("${{{name}}}"));
            }
        }
        text
    };
    match value {
        Value::Str(text) => Value::Str(replace(text)),
        Value::List(items) => Value::List(items.into_iter().map(replace).collect()),
        other => other,
    }
}

impl Scope {
    /// Whether `name` is left out of signatures.
    pub fn is_nohash(&self, name: &str) -> bool {
        self.config.is_nohash(name)
            || self
                .variable(name)
                .and_then(|var| var.flags().get("nohash"))
                .is_some_and(Value::is_truthy)
    }

    fn dynamic_vars(&mut self) -> MetaResult<Vec<(&'static str, String)>> {
        let mut dynvars = Vec::new();
        for &name in DYNAMIC_VARS {
            let text = self.lookup(name)?.and_then(|value| value.to_text());
            if let Some(text) = text.filter(|text| !text.is_empty()) {
                dynvars.push((name, text));
            }
        }
        Ok(dynvars)
    }

    /// Write the resolved variables of this scope to `out`.
    ///
    /// Variables resolving to an empty or false value only contribute their
    /// flags.
    pub fn dump<W: Write>(&mut self, out: &mut W, options: &DumpOptions) -> MetaResult<()> {
        let ignore_flags = options.flag_filter()?;
        let dynvars = self.dynamic_vars()?;

        let names: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|name| !name.starts_with("__"))
            .filter(|name| {
                options
                    .only
                    .as_ref()
                    .is_none_or(|only| only.iter().any(|n| n == name))
            })
            .filter(|name| !(options.signature && self.is_nohash(name)))
            .collect();

        for name in names {
            if options.flags {
                let flags: Vec<(String, Value)> = self
                    .variable(&name)
                    .map(|var| {
                        var.flags()
                            .iter()
                            .filter(|(flag, _)| flag.as_str() != "expand")
                            .filter(|(flag, _)| {
                                ignore_flags.as_ref().is_none_or(|re| !re.is_match(flag))
                            })
                            .map(|(flag, value)| (flag.clone(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                for (flag, value) in flags {
                    writeln!(out, "{name}[{flag}]={value}").map_err(io_error)?;
                }
            }
            let value = self.get(&name)?;
            if !value.is_truthy() {
                continue;
            }
            let value = substitute(value, &dynvars);
            writeln!(out, "{name}={value}").map_err(io_error)?;
        }
        Ok(())
    }

    /// Hex SHA-256 over the signature dump, memoized until the next mutation.
    pub fn signature(&mut self) -> MetaResult<String> {
        if let Some(signature) = &self.signature {
            return Ok(signature.clone());
        }
        let mut hasher = Sha256::new();
        self.dump(&mut hasher, &DumpOptions::signature())?;
        let signature = format!("{:x}", hasher.finalize());
        debug!("Scope signature: {}", signature);
        self.signature = Some(signature.clone());
        Ok(signature)
    }

    /// Compute the signature and keep the dump it was computed from in
    /// `path`, creating parent directories as needed.
    pub fn signature_with_dump<P: AsRef<Path>>(&mut self, path: P) -> MetaResult<String> {
        let path = path.as_ref();
        let mut dump = Vec::new();
        self.dump(&mut dump, &DumpOptions::signature())?;

        let io = |source| MetaError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        std::fs::write(path, &dump).map_err(io)?;
        info!("Wrote signature dump to {:?}", path);

        let signature = format!("{:x}", Sha256::digest(&dump));
        self.signature = Some(signature.clone());
        Ok(signature)
    }

    /// Copy whitelisted variables from `env` into the scope.
    ///
    /// The whitelist is the configured one, extended by `OE_ENV_WHITELIST`
    /// from `env` and from the scope. Only names not already defined are
    /// copied. The imported pairs are hashed into `__env_signature`, which is
    /// returned.
    pub fn import_env<I, K, V>(&mut self, env: I) -> MetaResult<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env: BTreeMap<String, String> = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut whitelist = self.config.env_whitelist.clone();
        if let Some(extra) = env.get(ENV_WHITELIST_VAR) {
            whitelist.extend(extra.split_whitespace().map(str::to_string));
        }
        match self.lookup(ENV_WHITELIST_VAR)? {
            Some(Value::List(extra)) => whitelist.extend(extra),
            Some(Value::Str(extra)) => {
                whitelist.extend(extra.split_whitespace().map(str::to_string));
            }
            Some(other) => {
                return Err(MetaError::mismatch(ENV_WHITELIST_VAR, Kind::List, other.kind()));
            }
            None => {}
        }
        debug!("Environment whitelist: {:?}", whitelist);

        let mut hasher = Sha256::new();
        let mut imported = 0;
        let mut seen = Vec::new();
        for name in whitelist {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            if self.contains(&name) {
                continue;
            }
            let Some(value) = env.get(&name) else {
                continue;
            };
            self.set(&name, value.as_str())?;
            // Environment values are taken verbatim.
            self.set_expand(&name, ExpandMode::No)?;
            hasher.update(format!("{name}={value:?}\n").as_bytes());
            imported += 1;
        }

        let signature = format!("{:x}", hasher.finalize());
        self.set(ENV_SIGNATURE, signature.as_str())?;
        self.set_flag(ENV_SIGNATURE, "nohash", true)?;
        info!("Imported {} environment variables", imported);
        Ok(signature)
    }

    pub fn env_signature(&self) -> Option<&str> {
        match self.variable(ENV_SIGNATURE)?.base()? {
            crate::variable::RawValue::Literal(Value::Str(signature)) => Some(signature),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_to_string(scope: &mut Scope, options: &DumpOptions) -> String {
        let mut out = Vec::new();
        scope.dump(&mut out, options).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_dump_is_sorted_and_resolved() {
        let mut scope = Scope::new();
        scope.set("PN", "busybox").unwrap();
        scope.set("BP", "${PN}-${PV}").unwrap();
        scope.set("PV", "1.36").unwrap();
        scope.set("__internal", "hidden").unwrap();
        scope.set_flag("PN", "export", true).unwrap();
        scope.set_flag("PN", "expand", "full").unwrap();

        let dump = dump_to_string(&mut scope, &DumpOptions::default());
        assert_eq!(dump, "BP=\"busybox-1.36\"\nPN=\"busybox\"\nPV=\"1.36\"\n");

        let with_flags = dump_to_string(
            &mut scope,
            &DumpOptions {
                flags: true,
                ..DumpOptions::default()
            },
        );
        assert!(with_flags.contains("PN[export]=true\n"));
        assert!(!with_flags.contains("[expand]"));
    }

    #[test]
    fn test_dump_skips_empty_values() {
        let mut scope = Scope::new();
        scope.set("EMPTY", "").unwrap();
        scope.set("NONE", Vec::<String>::new()).unwrap();
        scope.set("OFF", false).unwrap();
        scope.set("ON", true).unwrap();
        scope.set_flag("EMPTY", "doc", "still listed").unwrap();

        let dump = dump_to_string(
            &mut scope,
            &DumpOptions {
                flags: true,
                ..DumpOptions::default()
            },
        );
        assert_eq!(dump, "EMPTY[doc]=\"still listed\"\nON=true\n");
    }

    #[test]
    fn test_dump_only() {
        let mut scope = Scope::new();
        scope.set("PN", "busybox").unwrap();
        scope.set("PV", "1.36").unwrap();
        scope.set("SRC_URI", "http://example.com/${PN}-${PV}.tar.bz2").unwrap();

        let dump = dump_to_string(
            &mut scope,
            &DumpOptions {
                only: Some(vec!["PV".to_string(), "MISSING".to_string()]),
                ..DumpOptions::default()
            },
        );
        assert_eq!(dump, "PV=\"1.36\"\n");
    }

    #[test]
    fn test_signature_ignores_flags() {
        let mut scope = Scope::new();
        scope.set("do_install", "install -d ${D}").unwrap();
        scope.set_expand("do_install", ExpandMode::No).unwrap();
        let base = scope.signature().unwrap();

        scope.set_flag("do_install", "filename", "/layers/meta/busybox.bb").unwrap();
        scope.set_flag("do_install", "emit", "image").unwrap();
        scope.set_flag("do_install", "__lineno", 42_i64).unwrap();
        assert_eq!(scope.signature().unwrap(), base);

        scope.set_flag("do_install", "dirs", "${B}").unwrap();
        assert_ne!(scope.signature().unwrap(), base);

        let options = DumpOptions {
            ignore_flags: vec!["(".to_string()],
            ..DumpOptions::signature()
        };
        assert!(matches!(
            scope.dump(&mut Vec::<u8>::new(), &options),
            Err(MetaError::Pattern(_))
        ));
    }

    #[test]
    fn test_dynamic_paths_are_written_as_references() {
        let mut first = Scope::new();
        first.set("TOPDIR", "/home/alice/build").unwrap();
        first.set("WORKDIR", "${TOPDIR}/tmp/work/busybox").unwrap();
        first.set("S", "${WORKDIR}/busybox-1.36").unwrap();
        first.set("FILES", vec!["/usr/bin"]).unwrap();
        first.append("FILES", "${WORKDIR}/extra").unwrap();

        let dump = dump_to_string(&mut first, &DumpOptions::signature());
        assert!(dump.contains("S=\"${WORKDIR}/busybox-1.36\"\n"), "{dump}");
        assert!(dump.contains("WORKDIR=\"${WORKDIR}\"\n"), "{dump}");
        assert!(
            dump.contains("FILES=[\"/usr/bin\", \"${WORKDIR}/extra\"]\n"),
            "{dump}"
        );

        let mut second = first.derive();
        second.set("TOPDIR", "/srv/ci/build").unwrap();
        assert_eq!(
            first.get("S").unwrap(),
            Value::from("/home/alice/build/tmp/work/busybox/busybox-1.36")
        );
        assert_eq!(second.signature().unwrap(), first.signature().unwrap());
    }

    #[test]
    fn test_signature_skips_nohash() {
        let mut scope = Scope::new();
        scope.set("SRC_URI", "git://example.com/foo.git").unwrap();
        let base = scope.signature().unwrap();
        assert_eq!(base.len(), 64);

        scope.set("PATH", "/usr/bin").unwrap();
        scope.set("LOCAL", "/home/me").unwrap();
        scope.set("COMPATIBLE_IF_FLAGS", "USE_x").unwrap();
        scope.set_flag("LOCAL", "nohash", true).unwrap();
        assert_eq!(scope.signature().unwrap(), base);

        scope.set("SRC_URI", "git://example.com/bar.git").unwrap();
        assert_ne!(scope.signature().unwrap(), base);
    }

    #[test]
    fn test_signature_follows_overrides() {
        let mut scope = Scope::new();
        scope.set("CFLAGS", "-O2").unwrap();
        scope.append_if("CFLAGS", "debug", " -g").unwrap();
        let release = scope.signature().unwrap();
        scope.set_overrides(["debug"]).unwrap();
        assert_ne!(scope.signature().unwrap(), release);
        scope.set_overrides(Vec::<String>::new()).unwrap();
        assert_eq!(scope.signature().unwrap(), release);
    }

    #[test]
    fn test_signature_is_the_hash_of_the_dump() {
        let mut scope = Scope::new();
        scope.set("PN", "busybox").unwrap();
        scope.set_flag("PN", "export", true).unwrap();

        let mut dump = Vec::new();
        scope.dump(&mut dump, &DumpOptions::signature()).unwrap();
        let expected = format!("{:x}", Sha256::digest(&dump));
        assert_eq!(scope.signature().unwrap(), expected);
    }

    #[test]
    fn test_signature_with_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sig").join("busybox.dump");
        let mut scope = Scope::new();
        scope.set("PN", "busybox").unwrap();

        let signature = scope.signature_with_dump(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "PN=\"busybox\"\n");

        let mut fresh = Scope::new();
        fresh.set("PN", "busybox").unwrap();
        assert_eq!(fresh.signature().unwrap(), signature);
    }

    #[test]
    fn test_import_env() {
        let mut scope = Scope::new();
        scope.set("SHELL", "/bin/sh").unwrap();
        scope.set(ENV_WHITELIST_VAR, "HOME").unwrap();

        let env = [
            ("PATH", "/usr/bin:${NOT_EXPANDED}"),
            ("SHELL", "/bin/zsh"),
            ("HOME", "/home/builder"),
            ("SECRET", "hunter2"),
            ("OE_ENV_WHITELIST", "http_proxy  MAKEFLAGS"),
            ("http_proxy", "http://proxy:3128"),
        ];
        let signature = scope.import_env(env).unwrap();

        assert_eq!(
            scope.get("PATH").unwrap(),
            Value::from("/usr/bin:${NOT_EXPANDED}")
        );
        assert_eq!(scope.get("SHELL").unwrap(), Value::from("/bin/sh"));
        assert_eq!(scope.get("HOME").unwrap(), Value::from("/home/builder"));
        assert_eq!(scope.get("http_proxy").unwrap(), Value::from("http://proxy:3128"));
        assert!(!scope.contains("MAKEFLAGS"));
        assert!(!scope.contains("SECRET"));
        assert_eq!(scope.env_signature(), Some(signature.as_str()));
        assert!(scope.is_nohash(ENV_SIGNATURE));

        let mut again = Scope::new();
        again.set(ENV_WHITELIST_VAR, "HOME").unwrap();
        again.set("SHELL", "/bin/sh").unwrap();
        assert_eq!(again.import_env(env).unwrap(), signature);
    }
}
