#![cfg(target_os = "linux")]

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use steptrace::record::{Record, TraceReader, TraceSummary};
use steptrace::stepper::Stepper;
use steptrace::tracer::{self, TraceConfig, TraceOutcome};

const DEMO: &str = env!("CARGO_BIN_EXE_memory-demo");

fn trace_demo(args: &[&str], dir: &tempfile::TempDir) -> (TraceOutcome, TraceConfig) {
    let config = TraceConfig {
        output: dir.path().join("demo.trace"),
        ..TraceConfig::default()
    };
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let outcome = tracer::run(&config, |cfg| {
        Stepper::launch(Path::new(DEMO), &args, cfg.cache_capacity)
    })
    .unwrap();
    (outcome, config)
}

fn records(config: &TraceConfig) -> Vec<Record> {
    TraceReader::new(BufReader::new(File::open(&config.output).unwrap()))
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn summary(config: &TraceConfig) -> TraceSummary {
    TraceSummary::collect(BufReader::new(File::open(&config.output).unwrap())).unwrap()
}

fn step_addresses_with_code(records: &[Record], wanted: &[u8]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|record| match record {
            Record::Step { addr, code } if code == wanted => Some(*addr),
            _ => None,
        })
        .collect()
}

#[test]
fn interrupted_instruction_is_snapshotted_once() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, config) = trace_demo(&["signal"], &dir);
    assert_eq!(outcome.exit_code, 0, "handler did not run exactly once");

    let marker = step_addresses_with_code(&records(&config), &[0x0f, 0x1f, 0x80, 0x5a, 0x5a, 0x5a, 0x5a]);
    assert_eq!(marker.len(), 1, "marker compiled {} times", marker.len());

    let summary = summary(&config);
    assert!(summary.violations.is_empty(), "{:?}", &summary.violations[..summary.violations.len().min(5)]);
    assert_eq!(summary.steps_at(marker[0]), 1);
    assert_eq!(summary.regs_at(marker[0]), 1);
}

#[test]
fn remapped_code_is_compiled_again() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, config) = trace_demo(&["remap"], &dir);
    assert_eq!(outcome.exit_code, 3);

    let records = records(&config);
    let first = step_addresses_with_code(&records, &[0xb8, 0x01, 0x00, 0x00, 0x00]);
    let second = step_addresses_with_code(&records, &[0x48, 0xc7, 0xc0, 0x02, 0x00, 0x00, 0x00]);
    assert_eq!(first.len(), 1);
    assert_eq!(second, first);

    let summary = summary(&config);
    assert!(summary.violations.is_empty());
    assert_eq!(summary.steps_at(first[0]), 2);
    assert_eq!(summary.regs_at(first[0]), 2);
}

#[test]
fn images_are_reported_before_their_code_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, config) = trace_demo(&[], &dir);
    assert_eq!(outcome.exit_code, 0);

    let mut loaded: Vec<(String, u64, u64)> = Vec::new();
    for record in records(&config) {
        match record {
            Record::ImageLoad { name, low, high } => loaded.push((name, low, high)),
            Record::Step { addr, .. } => assert!(
                loaded.iter().any(|(_, low, high)| addr >= *low && addr < *high),
                "step at {:x} before its image was reported",
                addr
            ),
            Record::Regs { values, .. } => assert_eq!(values.len(), 15),
        }
    }
    assert!(loaded.iter().any(|(name, _, _)| name.ends_with("memory-demo")));

    let summary = summary(&config);
    assert!(summary.violations.is_empty(), "{:?}", &summary.violations[..summary.violations.len().min(5)]);
    assert_eq!(summary.counts, outcome.counts);
}
