//! Hex formatting for traffic dumps

use std::fmt::Write;

/// Space-separated uppercase hex, truncated after `limit` bytes
/// Example: [0x00, 0x01, 0xFF] -> "00 01 FF"
pub fn format_pretty(data: &[u8], limit: usize) -> String {
    let shown = data.len().min(limit);
    let mut result = String::with_capacity(shown * 3 + 16);
    for (i, byte) in data[..shown].iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    if data.len() > shown {
        let _ = write!(&mut result, " ... (+{} bytes)", data.len() - shown);
    }
    result
}
