use clap::{Parser, Subcommand, crate_version};
use convenient_meta::{DumpOptions, MetaConfig, MetaResult, Scope, ScopeSnapshot};
use std::io::Write;
use std::path::PathBuf;
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

/// Inspect a metadata scope snapshot.
#[derive(Parser)]
#[clap(version = crate_version!(), author = "Ralf Anton Beier")]
struct Opts {
    /// YAML configuration replacing the one stored in the snapshot.
    #[clap(short, long, env = "CONVENIENT_META_CONFIG")]
    config: Option<PathBuf>,

    /// Comma separated override tags replacing OVERRIDES.
    #[clap(short, long, value_delimiter = ',')]
    overrides: Option<Vec<String>>,

    /// Import whitelisted variables from the process environment.
    #[clap(short = 'e', long)]
    import_env: bool,

    /// Print debug information
    #[clap(short, long)]
    debug: bool,

    /// Log level, e.g. "info" or "trace". Takes precedence over `-d`.
    #[clap(long, env = "CONVENIENT_META_LOG")]
    log_level: Option<String>,

    /// Snapshot file written by `ScopeSnapshot::save`.
    snapshot: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved value of one variable.
    Get { name: String },
    /// Print every resolved variable.
    Dump {
        /// Include variable flags.
        #[clap(long)]
        flags: bool,
        /// Only variables that contribute to the signature.
        #[clap(long)]
        signature_only_vars: bool,
        /// Comma separated variable names to restrict the dump to.
        #[clap(long, value_delimiter = ',')]
        only: Option<Vec<String>>,
    },
    /// Print the scope signature.
    Signature {
        /// Also write the dump the signature is computed from.
        #[clap(long)]
        dump: Option<PathBuf>,
    },
    /// List variable names.
    Keys {
        /// Only variables with this flag set.
        #[clap(long)]
        flag: Option<String>,
    },
}

/// Gets the log level enum variant from a level string, e.g. "DEBUG", "INFO".
pub fn get_log_level(level: &str) -> Level {
    match level.to_uppercase().as_ref() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        "FATAL" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn load_scope(opts: &Opts) -> MetaResult<Scope> {
    let mut snapshot = ScopeSnapshot::load(&opts.snapshot)?;
    if let Some(path) = &opts.config {
        snapshot.config = MetaConfig::load(path)?;
    }
    let mut scope = Scope::import(snapshot)?;
    if let Some(overrides) = &opts.overrides {
        info!("Replacing OVERRIDES with {:?}", overrides);
        scope.set_overrides(overrides.iter().map(|tag| tag.trim()))?;
    }
    if opts.import_env {
        let signature = scope.import_env(std::env::vars())?;
        debug!("Environment signature: {}", signature);
    }
    Ok(scope)
}

fn write_line<W: Write>(out: &mut W, line: impl std::fmt::Display) -> MetaResult<()> {
    writeln!(out, "{line}").map_err(|source| convenient_meta::MetaError::Io {
        path: "<stdout>".into(),
        source,
    })
}

fn run<W: Write>(opts: &Opts, out: &mut W) -> MetaResult<()> {
    let mut scope = load_scope(opts)?;
    match &opts.command {
        Command::Get { name } => {
            let value = scope.get(name)?;
            write_line(out, value)?;
        }
        Command::Dump {
            flags,
            signature_only_vars,
            only,
        } => {
            let options = DumpOptions {
                flags: *flags,
                signature: *signature_only_vars,
                only: only.clone(),
                ..DumpOptions::default()
            };
            scope.dump(out, &options)?;
        }
        Command::Signature { dump } => {
            let signature = match dump {
                Some(path) => scope.signature_with_dump(path)?,
                None => scope.signature()?,
            };
            write_line(out, signature)?;
        }
        Command::Keys { flag } => {
            let keys = match flag {
                Some(flag) => scope.vars_with_flag(flag),
                None => scope.keys(),
            };
            for key in keys {
                write_line(out, key)?;
            }
        }
    }
    Ok(())
}

fn main() {
    // Get the command line arguments
    let opts: Opts = Opts::parse();

    let log_level = match &opts.log_level {
        Some(level) => level.clone(),
        None if opts.debug => "debug".to_string(),
        None => "warn".to_string(),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(get_log_level(&log_level))
        .with_writer(std::io::stderr)
        .with_file(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    let stdout = std::io::stdout();
    if let Err(e) = run(&opts, &mut stdout.lock()) {
        error!("{}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
