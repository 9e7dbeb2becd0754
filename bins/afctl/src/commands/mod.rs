//! afctl command implementations.

pub mod caps;
pub mod encode;
pub mod send;
pub mod serve;

/// Format bytes as space-separated lowercase hex.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a payload for display: text when printable, hex otherwise.
pub(crate) fn printable(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.chars().any(|c| c.is_control() && c != '\n' && c != '\t') => s.to_string(),
        _ => hex(bytes),
    }
}

/// Print a JSON value, pretty or compact.
pub(crate) fn print_json(value: &serde_json::Value, pretty: bool) -> anyhow::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
