use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jostle::listener::{create_listener, listener_names};
use jostle::loader::split_classpath;
use jostle::mutater::MutationKind;
use jostle::{EngineConfig, FastRunner, SchedulerError};

/// Class-level mutation testing: mutate CLASS, re-run its tests, report the
/// kill score.
#[derive(Debug, Parser)]
#[command(name = "jostle", version)]
struct Cli {
    /// Fully qualified target class.
    class: String,

    /// Test classes to run; defaults to the conventional `<Class>Test`.
    tests: Vec<String>,

    /// Emit progress diagnostics to stderr.
    #[arg(long)]
    verbose: bool,

    /// Additional method names never mutated.
    #[arg(long, value_delimiter = ',', value_name = "METHOD")]
    exclude: Vec<String>,

    /// Enable return-value mutations.
    #[arg(long = "return-vals")]
    return_vals: bool,

    /// Enable inline-constant mutations.
    #[arg(long = "inline-consts")]
    inline_consts: bool,

    /// Enable increment mutations.
    #[arg(long)]
    increments: bool,

    /// Enable constant-pool mutations.
    #[arg(long)]
    cpool: bool,

    /// Enable switch-target mutations.
    #[arg(long = "switch")]
    switch_targets: bool,

    /// Enable store-redirect mutations.
    #[arg(long)]
    stores: bool,

    /// Use the emacs-format listener.
    #[arg(long, conflicts_with = "printer")]
    emacs: bool,

    /// Use a named listener.
    #[arg(long, value_name = "NAME")]
    printer: Option<String>,

    /// First mutation index to run.
    #[arg(long = "first-mutation", value_name = "N", default_value_t = 0)]
    first_mutation: usize,

    /// Classpath for the target, its tests, and the worker.
    #[arg(long, value_name = "PATH")]
    classpath: Option<String>,

    /// Keep the warm-up enumeration order instead of fastest-first.
    #[arg(long = "no-order")]
    no_order: bool,

    /// Do not write cache manifests.
    #[arg(long = "no-save-cache")]
    no_save_cache: bool,

    /// Do not read cache manifests.
    #[arg(long = "no-load-cache")]
    no_load_cache: bool,

    /// Do not touch the cache at all.
    #[arg(long = "no-use-cache")]
    no_use_cache: bool,

    /// Defer a class-name prefix to the parent loader (repeatable).
    #[arg(long = "defer-class", value_name = "NAME")]
    defer_class: Vec<String>,

    /// Worker batch size cap.
    #[arg(long = "max-external-mutations", value_name = "N")]
    max_external_mutations: Option<usize>,

    /// Argument forwarded to the worker runtime (repeatable).
    #[arg(long = "jvm-arg", value_name = "ARG")]
    jvm_arg: Vec<String>,

    /// `name=value` property forwarded to the worker runtime (repeatable).
    #[arg(long = "define-property", value_name = "PROP")]
    define_property: Vec<String>,

    /// Test harness command driven by the worker.
    #[arg(long, value_name = "CMD")]
    harness: Option<String>,

    /// Cache manifest directory.
    #[arg(long = "cache-dir", value_name = "PATH")]
    cache_dir: Option<PathBuf>,
}

fn build_config(cli: &Cli) -> EngineConfig {
    let mut config = EngineConfig::default();
    if cli.return_vals {
        config.kinds.enable(MutationKind::ReturnValues);
    }
    if cli.inline_consts {
        config.kinds.enable(MutationKind::InlineConstants);
    }
    if cli.increments {
        config.kinds.enable(MutationKind::Increments);
    }
    if cli.cpool {
        config.kinds.enable(MutationKind::ConstantPool);
    }
    if cli.switch_targets {
        config.kinds.enable(MutationKind::Switch);
    }
    if cli.stores {
        config.kinds.enable(MutationKind::Stores);
    }
    config = config
        .exclude_methods(cli.exclude.iter().cloned())
        .defer_prefixes(cli.defer_class.iter().cloned())
        .with_first_mutation(cli.first_mutation);
    if let Some(cap) = cli.max_external_mutations {
        config = config.with_max_external_mutations(cap);
    }
    if let Some(classpath) = &cli.classpath {
        config.classpath = split_classpath(classpath);
    }
    if let Some(harness) = &cli.harness {
        config.harness = harness.split_whitespace().map(String::from).collect();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    config.jvm_args = cli.jvm_arg.clone();
    config.properties = cli.define_property.clone();
    config.order_tests = !cli.no_order;
    config.load_cache = !(cli.no_load_cache || cli.no_use_cache);
    config.save_cache = !(cli.no_save_cache || cli.no_use_cache);
    config
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "jostle=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let printer = if cli.emacs {
        "emacs"
    } else {
        cli.printer.as_deref().unwrap_or("default")
    };
    let Some(listener) = create_listener(printer) else {
        eprintln!(
            "unknown printer {printer:?}; available: {}",
            listener_names().join(", ")
        );
        std::process::exit(2);
    };

    let config = build_config(&cli);
    let tests = if cli.tests.is_empty() {
        vec![config.default_test_class(&cli.class)]
    } else {
        cli.tests.clone()
    };

    let mut runner = FastRunner::new(config, listener);
    match runner.run(&cli.class, &tests) {
        Ok(report) => {
            if report.interrupted {
                eprintln!("interrupted after {} verdicts", report.verdicts.len());
            }
            Ok(())
        }
        Err(SchedulerError::Baseline { test, message }) => {
            bail!("baseline test {test} failed ({message}); fix the suite before scoring mutants")
        }
        Err(err) => bail!(err),
    }
}
