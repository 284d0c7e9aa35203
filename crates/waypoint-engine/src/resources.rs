//! Process resource sampling for execution records.

use serde::{Deserialize, Serialize};

/// Resource usage at one instant. Fields are `None` when the platform cannot
/// report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_bytes: Option<u64>,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// Reads resident set size from the `VmRSS` line of `/proc/self/status`.
///
/// The kernel reports it in kB, so the result does not depend on page size.
/// Off Linux, or when the file is unreadable, reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatusProbe;

impl ResourceProbe for ProcStatusProbe {
    fn sample(&self) -> ResourceSnapshot {
        let memory_bytes = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|raw| parse_vm_rss(&raw));
        ResourceSnapshot { memory_bytes }
    }
}

/// `VmRSS:   12345 kB` to bytes.
fn parse_vm_rss(raw: &str) -> Option<u64> {
    let line = raw.lines().find_map(|l| l.strip_prefix("VmRSS:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") => value.checked_mul(1024),
        _ => None,
    }
}

/// Probe that never reports anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn sample(&self) -> ResourceSnapshot {
        ResourceSnapshot::default()
    }
}
