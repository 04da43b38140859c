use std::time::Duration;

pub(crate) const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid grpc-timeout {0:?}")]
pub struct InvalidTimeout(pub String);

/// Reads the caller's deadline from request metadata, if one was set.
pub(crate) fn from_metadata(
    metadata: &tonic::metadata::MetadataMap,
) -> Option<Result<Duration, InvalidTimeout>> {
    let value = metadata.get(GRPC_TIMEOUT_HEADER)?;
    Some(
        value
            .to_str()
            .map_err(|_| InvalidTimeout(format!("{value:?}")))
            .and_then(parse),
    )
}

/// Parses a `grpc-timeout` header value: at most eight ASCII digits followed by
/// a unit (`H`, `M`, `S`, `m`, `u`, or `n`).
pub fn parse(s: &str) -> Result<Duration, InvalidTimeout> {
    let invalid = || InvalidTimeout(s.to_string());
    if s.len() < 2 || s.len() > 9 || !s.is_ascii() {
        return Err(invalid());
    }

    let (magnitude, unit) = s.split_at(s.len() - 1);
    if !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let magnitude = magnitude.parse::<u64>().map_err(|_| invalid())?;

    let timeout = match unit {
        "H" => Duration::from_secs(magnitude * 60 * 60),
        "M" => Duration::from_secs(magnitude * 60),
        "S" => Duration::from_secs(magnitude),
        "m" => Duration::from_millis(magnitude),
        "u" => Duration::from_micros(magnitude),
        "n" => Duration::from_nanos(magnitude),
        _ => return Err(invalid()),
    };
    Ok(timeout)
}
