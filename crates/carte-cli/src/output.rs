//! Formatted output helpers for CLI commands.
//!
//! Provides table formatting for listings and human-readable byte counts.

use std::fmt::Write as _;

use carte_runtime::ImageSummary;
use carte_runtime::container::ContainerSummary;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

/// Renders `ps` rows, one container per line after a header.
#[must_use]
pub fn container_table(containers: &[ContainerSummary]) -> String {
    let mut out = format!(
        "{:<20} {:<24} {:<8} {:<8} {:<15} {:<6} {:<12} {}\n",
        "NAME", "IMAGE", "STATUS", "PID", "IP", "CPU", "MEMORY", "CREATED"
    );
    for c in containers {
        let pid = c.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        let _ = writeln!(
            out,
            "{:<20} {:<24} {:<8} {:<8} {:<15} {:<6} {:<12} {}",
            c.name,
            c.image,
            c.status,
            pid,
            or_dash(&c.ip_address),
            c.resources.cpu,
            c.resources.memory,
            c.created_at
        );
    }
    out
}

/// Renders `images` rows.
#[must_use]
pub fn image_table(images: &[ImageSummary]) -> String {
    let mut out = format!(
        "{:<32} {:<14} {:<7} {:<10} {}\n",
        "IMAGE", "ID", "LAYERS", "SIZE", "CREATED"
    );
    for i in images {
        let _ = writeln!(
            out,
            "{:<32} {:<14} {:<7} {:<10} {}",
            i.reference,
            i.id,
            i.layers,
            format_bytes(i.size_bytes),
            i.created_at
        );
    }
    out
}
