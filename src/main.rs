#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("steptrace requires Linux (ptrace). This binary was built for a non-Linux target.");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    linux::run()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::PathBuf;

    use anyhow::Context;
    use clap::{Parser, Subcommand};
    use colored::Colorize;
    use tracing_subscriber::EnvFilter;

    use steptrace::cache::DEFAULT_CACHE_CAPACITY;
    use steptrace::record::TraceSummary;
    use steptrace::stepper::Stepper;
    use steptrace::trace::DEFAULT_TRACE_PATH;
    use steptrace::tracer::{self, TraceConfig};

    #[derive(Parser)]
    #[command(name = "steptrace", about = "Instruction-level execution tracer for Linux x86_64")]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Run a program and trace every instruction it executes
        Run {
            /// Trace file (truncated)
            #[arg(short, long, env = "STEPTRACE_OUTPUT", default_value = DEFAULT_TRACE_PATH)]
            output: PathBuf,

            /// Compiled instructions kept before the code cache is flushed
            #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
            cache_capacity: usize,

            /// Program to trace
            program: PathBuf,

            /// Arguments to pass to the program
            #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
            args: Vec<String>,
        },
        /// Read a trace file back and check its structure
        Check {
            /// Trace file to check
            trace: PathBuf,
        },
    }

    pub fn run() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("steptrace=info")),
            )
            .with_writer(std::io::stderr)
            .init();

        let cli = Cli::parse();
        match cli.command {
            Command::Run {
                output,
                cache_capacity,
                program,
                args,
            } => cmd_run(
                TraceConfig {
                    output,
                    cache_capacity,
                },
                program,
                args,
            ),
            Command::Check { trace } => cmd_check(trace),
        }
    }

    fn cmd_run(config: TraceConfig, program: PathBuf, args: Vec<String>) -> anyhow::Result<()> {
        let outcome = tracer::run(&config, |cfg| {
            Stepper::launch(&program, &args, cfg.cache_capacity)
        })
        .with_context(|| format!("tracing {}", program.display()))?;

        eprintln!(
            "{} {} exited with {}",
            "steptrace".bold().cyan(),
            program.display(),
            outcome.exit_code.to_string().yellow()
        );
        eprintln!(
            "  {} step, {} regs, {} imgload records -> {}",
            outcome.counts.steps.to_string().green(),
            outcome.counts.regs.to_string().green(),
            outcome.counts.imgloads.to_string().green(),
            config.output.display()
        );

        std::process::exit(outcome.exit_code);
    }

    fn cmd_check(trace: PathBuf) -> anyhow::Result<()> {
        let file = File::open(&trace).with_context(|| format!("opening {}", trace.display()))?;
        let summary = TraceSummary::collect(BufReader::new(file))
            .with_context(|| format!("reading {}", trace.display()))?;

        println!(
            "{} {}",
            "trace".bold().cyan(),
            trace.display()
        );
        println!(
            "  records:   {} step, {} regs, {} imgload",
            summary.counts.steps, summary.counts.regs, summary.counts.imgloads
        );
        println!(
            "  addresses: {} distinct, {} compiled more than once",
            summary.distinct_addresses(),
            summary.recompiled()
        );
        for (name, low, high) in &summary.images {
            println!("  image:     {} {:x}-{:x}", name, low, high);
        }

        if summary.violations.is_empty() {
            println!("  {}", "ok".green());
            return Ok(());
        }
        for violation in &summary.violations {
            println!("  {}: {}", "violation".red(), violation);
        }
        std::process::exit(1);
    }
}
