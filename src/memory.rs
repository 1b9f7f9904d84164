//! Memory footprint tracking, refined continuously from upstream log output.
//!
//! Footprints are keyed by a per-model signature (id + expanded cmd) so a
//! command change invalidates old measurements. Partial observations merge
//! field-wise: a zero field never overwrites a non-zero prior value.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFootprint {
    pub vram_mb: u64,
    pub cpu_mb: u64,
    pub recorded_at: SystemTime,
}

impl Default for MemoryFootprint {
    fn default() -> Self {
        MemoryFootprint {
            vram_mb: 0,
            cpu_mb: 0,
            recorded_at: SystemTime::UNIX_EPOCH,
        }
    }
}

impl MemoryFootprint {
    pub fn new(vram_mb: u64, cpu_mb: u64) -> Self {
        MemoryFootprint {
            vram_mb,
            cpu_mb,
            recorded_at: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Field-wise replace-if-nonzero: `update` wins wherever it carries a value,
/// `base` fills the rest. Merging a zero footprint is the identity.
pub fn merge(base: MemoryFootprint, update: MemoryFootprint) -> MemoryFootprint {
    MemoryFootprint {
        vram_mb: if update.vram_mb != 0 {
            update.vram_mb
        } else {
            base.vram_mb
        },
        cpu_mb: if update.cpu_mb != 0 {
            update.cpu_mb
        } else {
            base.cpu_mb
        },
        recorded_at: base.recorded_at.max(update.recorded_at),
    }
}

/// Opaque per-model key for the tracker.
pub fn signature_for_model(model_id: &str, cmd: &str) -> String {
    format!("{model_id}|{cmd}")
}

#[derive(Default)]
pub struct MemoryTracker {
    footprints: RwLock<HashMap<String, MemoryFootprint>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, signature: &str, footprint: MemoryFootprint) {
        self.footprints
            .write()
            .expect("memory tracker lock poisoned")
            .insert(signature.to_string(), footprint);
    }

    pub fn get(&self, signature: &str) -> Option<MemoryFootprint> {
        self.footprints
            .read()
            .expect("memory tracker lock poisoned")
            .get(signature)
            .copied()
    }

    /// Parse a log line for a memory report. On a match, merge it with any
    /// existing entry and return the merged footprint; `None` means the line
    /// carried no recognizable measurement.
    pub fn observe(&self, signature: &str, line: &str) -> Option<MemoryFootprint> {
        let observed = parse_memory_from_log(line)?;
        let mut footprints = self
            .footprints
            .write()
            .expect("memory tracker lock poisoned");
        let base = footprints.get(signature).copied().unwrap_or_default();
        let mut merged = merge(base, observed);
        merged.recorded_at = SystemTime::now();
        footprints.insert(signature.to_string(), merged);
        Some(merged)
    }
}

static PLAIN_VRAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(vram|gpu)\b\s+(used|memory)\s*[:=]\s*([0-9.]+)\s*(mi?b|gi?b)").unwrap()
});
static PLAIN_CPU: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(cpu|ram)\b\s+(used|memory)\s*[:=]\s*([0-9.]+)\s*(mi?b|gi?b)").unwrap()
});
// No trailing word boundary: device labels like "CUDA0" must still match.
static LLAMA_VRAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(cuda|vram|gpu)[^\n]*?([0-9]+(?:\.[0-9]+)?)\s*(mi?b|gi?b)\b").unwrap()
});
static LLAMA_CPU: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(cpu|host|ram)[^\n]*?([0-9]+(?:\.[0-9]+)?)\s*(mi?b|gi?b)\b").unwrap()
});

const JSON_VRAM_KEYS: [&str; 4] = ["vram_used_mb", "gpu_used_mb", "vram_mb", "gpu_mb"];
const JSON_CPU_KEYS: [&str; 4] = ["cpu_used_mb", "ram_used_mb", "cpu_mb", "ram_mb"];

/// Parse one log line for VRAM / host-RAM usage. Rules are applied in order,
/// first match wins: JSON object line, labeled plain text, llama.cpp-style
/// buffer-size lines.
pub fn parse_memory_from_log(line: &str) -> Option<MemoryFootprint> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{')
        && line.ends_with('}')
        && let Ok(payload) = serde_json::from_str::<serde_json::Value>(line)
        && let Some(object) = payload.as_object()
    {
        let vram = find_mb(object, &JSON_VRAM_KEYS);
        let cpu = find_mb(object, &JSON_CPU_KEYS);
        if vram > 0 || cpu > 0 {
            return Some(MemoryFootprint::new(vram, cpu));
        }
    }

    if let Some(captures) = PLAIN_VRAM.captures(line)
        && let Some(vram) = parse_size_to_mb(&captures[3], &captures[4])
    {
        let cpu = PLAIN_CPU
            .captures(line)
            .and_then(|c| parse_size_to_mb(&c[3], &c[4]))
            .unwrap_or(0);
        return Some(MemoryFootprint::new(vram, cpu));
    }

    let vram = LLAMA_VRAM
        .captures(line)
        .and_then(|c| parse_size_to_mb(&c[2], &c[3]))
        .unwrap_or(0);
    let cpu = LLAMA_CPU
        .captures(line)
        .and_then(|c| parse_size_to_mb(&c[2], &c[3]))
        .unwrap_or(0);
    if vram > 0 || cpu > 0 {
        return Some(MemoryFootprint::new(vram, cpu));
    }

    None
}

fn find_mb(payload: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> u64 {
    for key in keys {
        if let Some(value) = payload.get(*key)
            && let Some(parsed) = parse_any_to_mb(value)
        {
            return parsed;
        }
    }
    0
}

fn parse_any_to_mb(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => {
            let v = n.as_f64()?;
            if v <= 0.0 { None } else { Some(v as u64) }
        }
        serde_json::Value::String(s) => parse_size_string_to_mb(s),
        _ => None,
    }
}

fn parse_size_string_to_mb(value: &str) -> Option<u64> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    match parts.as_slice() {
        [] => None,
        [number] => {
            let parsed: f64 = number.parse().ok()?;
            if parsed <= 0.0 {
                None
            } else {
                Some(parsed as u64)
            }
        }
        [number, unit, ..] => parse_size_to_mb(number, unit),
    }
}

fn parse_size_to_mb(value: &str, unit: &str) -> Option<u64> {
    let parsed: f64 = value.parse().ok()?;
    if parsed <= 0.0 {
        return None;
    }
    match unit.trim().to_ascii_lowercase().as_str() {
        "mb" | "mib" => Some(parsed as u64),
        "gb" | "gib" => Some((parsed * 1024.0) as u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_from_log() {
        struct Case {
            name: &'static str,
            line: &'static str,
            expected: Option<(u64, u64)>,
        }
        let cases = [
            Case {
                name: "json vram/cpu used mb",
                line: r#"{"vram_used_mb":12345,"cpu_used_mb":67890}"#,
                expected: Some((12345, 67890)),
            },
            Case {
                name: "json gpu/ram mb",
                line: r#"{"gpu_mb":2048,"ram_mb":4096}"#,
                expected: Some((2048, 4096)),
            },
            Case {
                name: "json string with unit",
                line: r#"{"vram_mb":"12.5 GiB"}"#,
                expected: Some((12800, 0)),
            },
            Case {
                name: "plain text gib",
                line: "VRAM used: 12.5 GiB CPU used: 64 GiB",
                expected: Some((12800, 65536)),
            },
            Case {
                name: "plain text mib",
                line: "GPU memory: 8000 MiB RAM used: 16000 MiB",
                expected: Some((8000, 16000)),
            },
            Case {
                name: "llama load tensors",
                line: "load_tensors: CUDA0 model buffer size = 23347.06 MiB",
                expected: Some((23347, 0)),
            },
            Case {
                name: "llama host buffer only",
                line: "load_tensors: host buffer size = 512.00 MiB",
                expected: Some((0, 512)),
            },
            Case {
                name: "empty line",
                line: "",
                expected: None,
            },
            Case {
                name: "no measurement",
                line: "starting server on port 8080",
                expected: None,
            },
        ];

        for case in cases {
            let got = parse_memory_from_log(case.line).map(|f| (f.vram_mb, f.cpu_mb));
            assert_eq!(got, case.expected, "case: {}", case.name);
        }
    }

    #[test]
    fn round_trips_both_units() {
        for (line, vram) in [
            ("VRAM used: 2048 MiB", 2048),
            ("VRAM used: 2048 MB", 2048),
            ("VRAM used: 2 GiB", 2048),
            ("VRAM used: 2 GB", 2048),
        ] {
            let footprint = parse_memory_from_log(line).unwrap();
            assert_eq!(footprint.vram_mb, vram, "line: {line}");
        }
    }

    #[test]
    fn merges_partial_updates() {
        let tracker = MemoryTracker::new();

        // load-tensors line: VRAM only
        tracker
            .observe("sig", "load_tensors: CUDA0 model buffer size = 23347.06 MiB")
            .unwrap();
        let footprint = tracker.get("sig").unwrap();
        assert_eq!((footprint.vram_mb, footprint.cpu_mb), (23347, 0));

        // kv-cache line: the latest VRAM slice replaces, CPU is newly set
        tracker
            .observe(
                "sig",
                "llama_kv_cache_init: CUDA0 KV buffer size = 2048.00 MiB, host buffer size = 512.00 MiB",
            )
            .unwrap();
        let footprint = tracker.get("sig").unwrap();
        assert_eq!((footprint.vram_mb, footprint.cpu_mb), (2048, 512));
    }

    #[test]
    fn cpu_only_line_keeps_prior_vram() {
        let tracker = MemoryTracker::new();
        tracker.observe("sig", r#"{"vram_mb":9000}"#).unwrap();
        tracker.observe("sig", r#"{"cpu_mb":3000}"#).unwrap();
        let footprint = tracker.get("sig").unwrap();
        assert_eq!((footprint.vram_mb, footprint.cpu_mb), (9000, 3000));
    }

    #[test]
    fn unmatched_line_leaves_tracker_unchanged() {
        let tracker = MemoryTracker::new();
        tracker.set("sig", MemoryFootprint::new(100, 200));
        assert!(tracker.observe("sig", "").is_none());
        assert!(tracker.observe("sig", "nothing to see here").is_none());
        let footprint = tracker.get("sig").unwrap();
        assert_eq!((footprint.vram_mb, footprint.cpu_mb), (100, 200));
    }

    #[test]
    fn merge_is_associative_with_zero_identity() {
        let a = MemoryFootprint::new(1, 0);
        let b = MemoryFootprint::new(0, 2);
        let c = MemoryFootprint::new(3, 0);

        assert_eq!(merge(merge(a, b), c), merge(a, merge(b, c)));
        assert_eq!(merge(a, MemoryFootprint::new(0, 0)), a);
        assert_eq!(merge(MemoryFootprint::new(0, 0), b), b);
    }

    #[test]
    fn signature_depends_on_cmd() {
        let sig_a = signature_for_model("m", "server --ctx 4096");
        let sig_b = signature_for_model("m", "server --ctx 8192");
        assert_ne!(sig_a, sig_b);
    }
}
