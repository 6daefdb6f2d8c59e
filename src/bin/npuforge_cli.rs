use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use npuforge::config::{BackendKind, RunConfig};
use npuforge::kernels::{KernelKind, KernelOutput};
use npuforge::{cosimulate, run_kernel};
use serde::Serialize;

/// Values printed per output line
const VALUES_PER_LINE: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "npuforge-cli", version)]
#[command(about = "Run and cosimulate npuforge kernels on a simulated NPU grid", long_about = None)]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GridArgs {
    /// Number of cores (defaults to NPUFORGE_CORES or 1)
    #[arg(long)]
    cores: Option<usize>,
    /// Threads per core (defaults to NPUFORGE_THREADS or 1)
    #[arg(long)]
    threads: Option<usize>,
    /// Scratchpad capacity per unit in bytes
    #[arg(long)]
    scratchpad_bytes: Option<usize>,
}

impl GridArgs {
    fn to_config(&self) -> RunConfig {
        let mut config = RunConfig::from_env();
        if let Some(cores) = self.cores {
            config.cores = cores;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(bytes) = self.scratchpad_bytes {
            config.scratchpad_bytes = bytes;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one kernel on the selected backend and print its output
    Run {
        /// Kernel name (see `list`)
        #[arg(short, long)]
        kernel: String,
        /// Backend: parallel or sequential
        #[arg(long)]
        backend: Option<String>,
        #[command(flatten)]
        grid: GridArgs,
    },
    /// Run one kernel (or all) on both backends and compare outputs
    Cosim {
        /// Kernel name, or "all"
        #[arg(short, long)]
        kernel: String,
        /// Relative tolerance for float kernels
        #[arg(long)]
        tolerance: Option<f32>,
        #[command(flatten)]
        grid: GridArgs,
    },
    /// List available kernels
    List,
}

#[derive(Debug, Serialize)]
struct KernelListing {
    name: &'static str,
    description: &'static str,
    float: bool,
}

fn main() -> anyhow::Result<()> {
    npuforge::logging::init_logging_default();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            kernel,
            backend,
            grid,
        } => {
            let kind: KernelKind = kernel.parse()?;
            let mut config = grid.to_config();
            if let Some(backend) = backend {
                config = config.with_backend(backend.parse::<BackendKind>()?);
            }
            let (report, output) = run_kernel(kind, &config)
                .with_context(|| format!("running {} on {}", kind, config.backend))?;

            if cli.json {
                let body = serde_json::json!({ "report": report, "output": output });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!(
                    "kernel: {} backend: {} grid: {} phases: {} elapsed: {}us",
                    report.kernel,
                    report.backend,
                    report.grid,
                    report.phases_executed,
                    report.elapsed_us
                );
                print_output(&output);
            }
        }
        Commands::Cosim {
            kernel,
            tolerance,
            grid,
        } => {
            let mut config = grid.to_config();
            if let Some(tolerance) = tolerance {
                config = config.with_tolerance(tolerance);
            }
            let kinds: Vec<KernelKind> = if kernel.eq_ignore_ascii_case("all") {
                KernelKind::ALL.to_vec()
            } else {
                vec![kernel.parse()?]
            };

            let mut reports = Vec::with_capacity(kinds.len());
            for kind in kinds {
                let report = cosimulate(kind, &config)
                    .with_context(|| format!("cosimulating {}", kind))?;
                if !cli.json {
                    println!(
                        "{}: PASS ({} elements, max |diff| {:e}, reference {}us, parallel {}us)",
                        report.kernel,
                        report.comparison.compared,
                        report.comparison.max_abs_diff,
                        report.reference.elapsed_us,
                        report.parallel.elapsed_us
                    );
                }
                reports.push(report);
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
        }
        Commands::List => {
            let listing: Vec<KernelListing> = KernelKind::ALL
                .iter()
                .map(|kind| KernelListing {
                    name: kind.name(),
                    description: kind.description(),
                    float: kind.is_float(),
                })
                .collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for entry in listing {
                    println!("{:<20} {}", entry.name, entry.description);
                }
            }
        }
    }

    Ok(())
}

fn print_output(output: &KernelOutput) {
    println!("output ({} x {}):", output.len(), output.element_type());
    for chunk in output.to_strings().chunks(VALUES_PER_LINE) {
        println!("{}", chunk.join(" "));
    }
}
