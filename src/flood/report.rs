//! Human-readable flood results.

use crate::analysis::Perf;
use crate::dispatch::Node;

fn format_rate(bytes_per_sec: f64) -> String {
    let bits = bytes_per_sec * 8.0;
    if bits >= 1e9 {
        format!("{:.2} Gbit/s", bits / 1e9)
    } else {
        format!("{:.1} Mbit/s", bits / 1e6)
    }
}

/// One-line summary of a tier result against `addr`.
pub fn format_summary(addr: &str, perf: &Perf) -> String {
    format!(
        "{}: {} avg ({} p50, {} max), latency {:.3}s avg / {:.3}s p99 over {} sample{}",
        addr,
        format_rate(perf.throughput.avg),
        format_rate(perf.throughput.p50),
        format_rate(perf.throughput.max),
        perf.latency.avg,
        perf.latency.p99,
        perf.samples,
        if perf.samples == 1 { "" } else { "s" },
    )
}

/// Render a populated dispatch result set, one line per measurement.
pub fn format_nodes(nodes: &[Node]) -> String {
    let mut lines = Vec::new();
    for node in nodes {
        if node.perf.is_empty() {
            lines.push(format!("{}: no result", node.addr));
            continue;
        }
        let mut keys: Vec<&String> = node.perf.keys().collect();
        keys.sort();
        for key in keys {
            lines.push(format_summary(key, &node.perf[key]));
        }
    }
    lines.join("\n")
}
