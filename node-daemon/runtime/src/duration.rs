use anyhow::{anyhow, bail, Context, Result};
use tokio::time;

/// Parses flag values like `500ms`, `30s`, `2m`, or `1h`. A bare `0` is
/// accepted as zero.
pub(crate) fn parse_duration(s: &str) -> Result<time::Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (magnitude, unit) = s.split_at(split);
    if magnitude.is_empty() {
        bail!("duration {s:?} must start with a whole number");
    }
    let magnitude = magnitude
        .parse::<u32>()
        .with_context(|| format!("invalid duration {s:?}"))?;

    let unit = match unit {
        "" if magnitude == 0 => time::Duration::ZERO,
        "ms" => time::Duration::from_millis(1),
        "s" => time::Duration::from_secs(1),
        "m" => time::Duration::from_secs(60),
        "h" => time::Duration::from_secs(60 * 60),
        _ => bail!("duration {s:?} must end with one of 'ms', 's', 'm', or 'h'"),
    };
    unit.checked_mul(magnitude)
        .ok_or_else(|| anyhow!("duration {s:?} is too large"))
}
