mod targets;

use clap::{Args, Parser, Subcommand};
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tumbler_core::{CampaignDriver, InProcessTrialRunner, RawOptions, ReplayFactory};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing campaign against one target.
    Fuzz(FuzzArgs),
    /// Replay saved inputs against one target.
    Repro(ReproArgs),
    /// List the targets built into this binary.
    Targets,
}

#[derive(Args, Debug)]
struct FuzzArgs {
    /// TOML file with campaign options; command-line values take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Target namespace.
    #[arg(long)]
    class: Option<String>,
    /// Target method.
    #[arg(long)]
    method: Option<String>,
    /// Time limit such as `2h30m` or `60s`. Unbounded when absent.
    #[arg(long)]
    time: Option<String>,
    /// Per-trial timeout in milliseconds, 0 for none.
    #[arg(long = "runTimeout")]
    run_timeout: Option<String>,
    /// `coverage-guided` or `execution-indexed`.
    #[arg(long)]
    engine: Option<String>,
    #[arg(long)]
    blind: bool,
    /// Disable instrumentation.
    #[arg(long = "noCov")]
    no_cov: bool,
    /// Seed input directory.
    #[arg(long = "in")]
    input_dir: Option<PathBuf>,
    /// Results directory, relative to --target.
    #[arg(long = "out")]
    output_dir: Option<PathBuf>,
    /// Results root.
    #[arg(long)]
    target: Option<PathBuf>,
    #[arg(long = "saveAll")]
    save_all: bool,
    #[arg(long = "libFuzzerCompatOutput")]
    lib_fuzzer_compat_output: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long = "exitOnCrash")]
    exit_on_crash: bool,
    #[arg(long = "fixedSize")]
    fixed_size: bool,
    /// Comma-separated namespace prefixes to leave uninstrumented.
    #[arg(long)]
    excludes: Option<String>,
    /// Comma-separated namespace prefixes that override a shorter exclude.
    #[arg(long)]
    includes: Option<String>,
    /// Code root for the loading context; may be repeated.
    #[arg(long = "codeRoot")]
    code_roots: Vec<PathBuf>,
}

impl FuzzArgs {
    fn into_options(self) -> (Option<PathBuf>, RawOptions) {
        let raw = RawOptions {
            class: self.class,
            method: self.method,
            time: self.time,
            run_timeout: self.run_timeout,
            engine: self.engine,
            blind: self.blind,
            no_cov: self.no_cov,
            input_dir: self.input_dir,
            output_dir: self.output_dir,
            target: self.target,
            save_all: self.save_all,
            lib_fuzzer_compat_output: self.lib_fuzzer_compat_output,
            quiet: self.quiet,
            exit_on_crash: self.exit_on_crash,
            fixed_size: self.fixed_size,
            excludes: self.excludes,
            includes: self.includes,
            code_roots: self.code_roots,
        };
        (self.config, raw)
    }
}

#[derive(Args, Debug)]
struct ReproArgs {
    #[arg(long)]
    class: String,
    #[arg(long)]
    method: String,
    #[arg(long)]
    quiet: bool,
    /// Saved inputs to run, in order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

impl Cli {
    fn quiet(&self) -> bool {
        match &self.command {
            Command::Fuzz(args) => args.quiet,
            Command::Repro(args) => args.quiet,
            Command::Targets => false,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_env = Env::default()
        .default_filter_or(if cli.quiet() { "warn" } else { "info" })
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    match cli.command {
        Command::Fuzz(args) => fuzz(args),
        Command::Repro(args) => repro(args),
        Command::Targets => {
            for target in targets::registry().identities() {
                println!("{target}");
            }
            Ok(())
        }
    }
}

fn fuzz(args: FuzzArgs) -> anyhow::Result<()> {
    let (config_file, overrides) = args.into_options();
    let raw = match config_file {
        Some(path) => {
            log::info!("Loading campaign options from {path:?}");
            RawOptions::load_from_file(&path)?.overlay(overrides)
        }
        None => overrides,
    };

    let runner = InProcessTrialRunner::new(targets::registry()).with_stop_flag(stop_flag()?);
    let mut driver = CampaignDriver::new(runner);
    if log::log_enabled!(log::Level::Debug) {
        driver = driver.with_sink(Box::new(std::io::stderr()));
    }

    let summary = driver.run_options(&raw).into_result()?;
    log::info!(
        "No failures in {} trial(s){}; results in {:?}",
        summary.trials,
        if summary.interrupted { " (interrupted)" } else { "" },
        summary.results_dir
    );
    Ok(())
}

fn repro(args: ReproArgs) -> anyhow::Result<()> {
    let raw = RawOptions {
        class: Some(args.class),
        method: Some(args.method),
        no_cov: true,
        quiet: args.quiet,
        ..Default::default()
    };
    let count = args.inputs.len();
    let mut driver = CampaignDriver::new(InProcessTrialRunner::new(targets::registry()))
        .with_guidance_factory(ReplayFactory::new(args.inputs));
    driver.run_options(&raw).into_result()?;
    log::info!("All {count} input(s) passed");
    Ok(())
}

/// Set on the first SIGINT/SIGTERM; a second one terminates the process.
fn stop_flag() -> anyhow::Result<Arc<AtomicBool>> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::flag;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&stop))?;
        flag::register(*sig, Arc::clone(&stop))?;
    }
    Ok(stop)
}
