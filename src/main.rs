use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use argh::FromArgs;

use fzalloc::harness::script::parse_script;
use fzalloc::harness::{run_script_on, IndexKind, RunConfig};

#[derive(FromArgs)]
#[argh(description = "replay allocator trace scripts and report heap utilization")]
struct App {
    #[argh(
        switch,
        short = 'q',
        description = "skip per-operation validation and payload checks"
    )]
    quiet: bool,

    #[argh(switch, short = 'v', description = "display debug messages")]
    verbose: bool,

    #[argh(
        option,
        short = 'i',
        default = "IndexKind::SegList",
        description = "free index backing the allocator: seglist, rbstack or rbtopdown"
    )]
    index: IndexKind,

    #[argh(
        option,
        short = 's',
        default = "1 << 20",
        description = "segment size in bytes"
    )]
    segment: usize,

    #[argh(positional, description = "trace scripts to replay")]
    scripts: Vec<PathBuf>,
}

fn run(app: &App) -> anyhow::Result<u8> {
    let config = RunConfig {
        segment_bytes: app.segment,
        quiet: app.quiet,
    };

    let mut failed = 0u8;
    let mut utilization_sum = 0.0;
    let mut passed = 0u32;

    for path in &app.scripts {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let ops = parse_script(&source)
            .with_context(|| format!("cannot parse {}", path.display()))?;

        let report = run_script_on(app.index, &ops, &config);
        let name = path.display();

        if report.ok {
            passed += 1;
            utilization_sum += report.utilization;

            if app.quiet {
                println!(
                    "ok     {name}: {} ops in {:?}, utilization {:.1}%",
                    report.ops,
                    report.elapsed,
                    report.utilization * 100.0
                );
            } else {
                println!(
                    "ok     {name}: {} ops, utilization {:.1}%",
                    report.ops,
                    report.utilization * 100.0
                );
            }
        } else {
            failed = failed.saturating_add(1);
            println!(
                "failed {name}: {}",
                report.failure.as_deref().unwrap_or("unknown failure")
            );
        }
    }

    if passed > 0 {
        println!(
            "average utilization over {passed} scripts: {:.1}%",
            utilization_sum / f64::from(passed) * 100.0
        );
    }

    Ok(failed)
}

fn main() -> ExitCode {
    let app: App = argh::from_env();

    env_logger::Builder::from_default_env()
        .filter_level(if app.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if app.scripts.is_empty() {
        eprintln!("no scripts given");
        return ExitCode::from(1);
    }

    match run(&app) {
        Ok(failed) => ExitCode::from(failed),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}
