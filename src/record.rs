//! Reading trace files back.
//!
//! Parses the line format produced by [`crate::trace::TraceWriter`] and
//! checks a trace against the properties every consumer relies on:
//!
//! - `code` fields are whole bytes (an even number of hex digits);
//! - every `regs` record lists `rip` plus the fixed register set in order;
//! - image bounds satisfy `low <= high`;
//! - a `regs` record only appears for an address that already has a `step`.
//!
//! Step and regs counts per address are kept separately, since they are
//! not expected to match.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;

use crate::error::{Error, Result};
use crate::registers::TRACED_REGISTERS;
use crate::trace::{RecordCounts, IMGLOAD_TAG, REGS_TAG, STEP_TAG};

/// One parsed trace line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Step { addr: u64, code: Vec<u8> },
    Regs { rip: u64, values: Vec<(String, u64)> },
    ImageLoad { name: String, low: u64, high: u64 },
}

impl Record {
    /// Parse one line (without its terminator).
    pub fn parse(line: &str) -> std::result::Result<Record, String> {
        let (tag, rest) = line
            .split_once('|')
            .ok_or_else(|| format!("missing record tag in {:?}", line))?;

        match tag {
            STEP_TAG => parse_step(rest),
            REGS_TAG => parse_regs(rest),
            IMGLOAD_TAG => parse_imgload(rest),
            other => Err(format!("unknown record tag {:?}", other)),
        }
    }
}

fn parse_step(rest: &str) -> std::result::Result<Record, String> {
    let (adr, code) = rest
        .split_once('|')
        .ok_or("step record needs adr and code fields")?;
    let addr = parse_hex(field(adr, "adr")?)?;
    let code = parse_hex_bytes(field(code, "code")?)?;
    Ok(Record::Step { addr, code })
}

fn parse_regs(rest: &str) -> std::result::Result<Record, String> {
    let mut fields = rest.split('|');
    let rip = parse_hex(field(fields.next().unwrap_or(""), "rip")?)?;

    let mut values = Vec::with_capacity(TRACED_REGISTERS.len());
    for pair in fields {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("register field {:?} has no value", pair))?;
        values.push((name.to_string(), parse_hex(value)?));
    }
    Ok(Record::Regs { rip, values })
}

fn parse_imgload(rest: &str) -> std::result::Result<Record, String> {
    // The name is free text and may itself contain '|', so split from
    // the right.
    let mut parts = rest.rsplitn(3, '|');
    let high = parts.next().ok_or("imgload record needs a high bound")?;
    let low = parts.next().ok_or("imgload record needs a low bound")?;
    let name = parts.next().ok_or("imgload record needs a name")?;
    Ok(Record::ImageLoad {
        name: unescape_name(name),
        low: parse_hex(low)?,
        high: parse_hex(high)?,
    })
}

/// Undo the escaping applied to image names on write. Unknown escapes
/// are kept verbatim.
fn unescape_name(text: &str) -> String {
    let mut name = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            name.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => name.push('\\'),
            Some('n') => name.push('\n'),
            Some('r') => name.push('\r'),
            Some(other) => {
                name.push('\\');
                name.push(other);
            }
            None => name.push('\\'),
        }
    }
    name
}

fn field<'a>(text: &'a str, key: &str) -> std::result::Result<&'a str, String> {
    text.strip_prefix(key)
        .and_then(|t| t.strip_prefix('='))
        .ok_or_else(|| format!("expected {}=..., found {:?}", key, text))
}

fn parse_hex(text: &str) -> std::result::Result<u64, String> {
    if text.is_empty() || text.len() > 16 {
        return Err(format!("bad hex value {:?}", text));
    }
    u64::from_str_radix(text, 16).map_err(|e| format!("bad hex value {:?}: {}", text, e))
}

fn parse_hex_bytes(text: &str) -> std::result::Result<Vec<u8>, String> {
    if text.len() % 2 != 0 {
        return Err(format!("code field {:?} has an odd number of digits", text));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("bad code byte in {:?}", text))
        })
        .collect()
}

/// Iterator over the records of a trace.
pub struct TraceReader<R: BufRead> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        TraceReader {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(e.into())),
        };
        self.line_no += 1;
        Some(Record::parse(&line).map_err(|reason| Error::Parse {
            line: self.line_no,
            reason,
        }))
    }
}

/// Aggregate view of a trace plus any property violations found.
#[derive(Debug, Default)]
pub struct TraceSummary {
    pub counts: RecordCounts,
    pub images: Vec<(String, u64, u64)>,
    pub violations: Vec<String>,
    steps: HashMap<u64, u64>,
    regs: HashMap<u64, u64>,
}

impl TraceSummary {
    /// Read a whole trace. Malformed lines are an error; well-formed lines
    /// that break a trace property are collected in `violations`.
    pub fn collect<R: BufRead>(reader: R) -> Result<Self> {
        let mut summary = TraceSummary::default();
        let mut seen_steps = HashSet::new();

        for (index, record) in TraceReader::new(reader).enumerate() {
            let line = index + 1;
            match record? {
                Record::Step { addr, .. } => {
                    summary.counts.steps += 1;
                    *summary.steps.entry(addr).or_default() += 1;
                    seen_steps.insert(addr);
                }
                Record::Regs { rip, values } => {
                    summary.counts.regs += 1;
                    *summary.regs.entry(rip).or_default() += 1;
                    if !has_fixed_layout(&values) {
                        summary
                            .violations
                            .push(format!("line {}: regs fields out of order or incomplete", line));
                    }
                    if !seen_steps.contains(&rip) {
                        summary
                            .violations
                            .push(format!("line {}: regs for {:x} before any step", line, rip));
                    }
                }
                Record::ImageLoad { name, low, high } => {
                    summary.counts.imgloads += 1;
                    if low > high {
                        summary.violations.push(format!(
                            "line {}: image {} has low {:x} above high {:x}",
                            line, name, low, high
                        ));
                    }
                    summary.images.push((name, low, high));
                }
            }
        }
        Ok(summary)
    }

    /// Number of step records for `addr` (its compilation count).
    pub fn steps_at(&self, addr: u64) -> u64 {
        self.steps.get(&addr).copied().unwrap_or(0)
    }

    /// Number of regs records for `addr` (its execution count).
    pub fn regs_at(&self, addr: u64) -> u64 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    /// Addresses that were compiled more than once.
    pub fn recompiled(&self) -> usize {
        self.steps.values().filter(|&&n| n > 1).count()
    }

    pub fn distinct_addresses(&self) -> usize {
        self.steps.len()
    }
}

fn has_fixed_layout(values: &[(String, u64)]) -> bool {
    values.len() == TRACED_REGISTERS.len()
        && values
            .iter()
            .zip(TRACED_REGISTERS)
            .all(|((name, _), reg)| name == reg.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGS_LINE: &str = "regs|rip=401010|rdi=1|rsi=2|rdx=3|rcx=4|r8=5|r9=6|rbx=7|rbp=8\
                             |rsp=9|r10=a|r11=b|r12=c|r13=d|r14=e|r15=f";

    #[test]
    fn parse_step() {
        assert_eq!(
            Record::parse("step|adr=401010|code=4889c3").unwrap(),
            Record::Step {
                addr: 0x401010,
                code: vec![0x48, 0x89, 0xc3]
            }
        );
    }

    #[test]
    fn parse_empty_code() {
        assert_eq!(
            Record::parse("step|adr=10|code=").unwrap(),
            Record::Step {
                addr: 0x10,
                code: vec![]
            }
        );
    }

    #[test]
    fn parse_regs() {
        match Record::parse(REGS_LINE).unwrap() {
            Record::Regs { rip, values } => {
                assert_eq!(rip, 0x401010);
                assert_eq!(values.len(), 15);
                assert_eq!(values[0], ("rdi".to_string(), 1));
                assert_eq!(values[14], ("r15".to_string(), 0xf));
                assert!(has_fixed_layout(&values));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn parse_imgload_with_pipe_in_name() {
        assert_eq!(
            Record::parse("imgload|weird|name|7f00|8000").unwrap(),
            Record::ImageLoad {
                name: "weird|name".into(),
                low: 0x7f00,
                high: 0x8000
            }
        );
    }

    #[test]
    fn imgload_names_are_unescaped() {
        match Record::parse("imgload|a\\\\nb\\nc\\x|1|2").unwrap() {
            Record::ImageLoad { name, .. } => assert_eq!(name, "a\\nb\nc\\x"),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Record::parse("").is_err());
        assert!(Record::parse("jump|adr=1").is_err());
        assert!(Record::parse("step|adr=10|code=489").is_err());
        assert!(Record::parse("step|adr=zz|code=90").is_err());
        assert!(Record::parse("step|code=90|adr=10").is_err());
        assert!(Record::parse("regs|rdi=1").is_err());
        assert!(Record::parse("imgload|1|2").is_err());
        assert!(Record::parse("regs|rip=1|rdi=10000000000000000").is_err());
    }

    #[test]
    fn reader_reports_line_numbers() {
        let text = "step|adr=1|code=90\nbogus\n";
        let results: Vec<_> = TraceReader::new(text.as_bytes()).collect();
        assert!(results[0].is_ok());
        match &results[1] {
            Err(Error::Parse { line, .. }) => assert_eq!(*line, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn summary_of_clean_trace() {
        let text = format!(
            "imgload|demo|400000|401000\nstep|adr=401010|code=4889c3\n{}\n{}\n",
            REGS_LINE, REGS_LINE
        );
        let summary = TraceSummary::collect(text.as_bytes()).unwrap();
        assert!(summary.violations.is_empty(), "{:?}", summary.violations);
        assert_eq!(summary.counts.steps, 1);
        assert_eq!(summary.counts.regs, 2);
        assert_eq!(summary.images, vec![("demo".to_string(), 0x400000, 0x401000)]);
        assert_eq!(summary.steps_at(0x401010), 1);
        assert_eq!(summary.regs_at(0x401010), 2);
        assert_eq!(summary.recompiled(), 0);
        assert_eq!(summary.distinct_addresses(), 1);
    }

    #[test]
    fn summary_flags_property_violations() {
        let text = "imgload|bad|2000|1000\n\
                    regs|rip=10|rdi=0\n\
                    step|adr=10|code=90\n\
                    step|adr=10|code=90\n";
        let summary = TraceSummary::collect(text.as_bytes()).unwrap();
        assert_eq!(summary.violations.len(), 3);
        assert!(summary.violations[0].contains("low 2000 above high 1000"));
        assert!(summary.violations[1].contains("out of order"));
        assert!(summary.violations[2].contains("before any step"));
        assert_eq!(summary.recompiled(), 1);
    }
}
