//! Logging helpers that keep secrets out of log output.
//!
//! Wrap anything derived from key material in one of these before handing
//! it to a `tracing` field.

use std::fmt;

/// A wrapper that redacts its contents when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Show only the first four bytes of an identifier in hex.
///
/// Enough to correlate log lines for one peer without printing the full id.
pub struct ShortHex<'a>(pub &'a [u8]);

impl<'a> fmt::Display for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len().min(4);
        write!(f, "{}…", hex::encode(&self.0[..n]))
    }
}

impl<'a> fmt::Debug for ShortHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        assert_eq!(format!("{}", Redacted("room-psk")), "[REDACTED]");
        assert_eq!(format!("{:?}", Redacted([1u8; 32])), "[REDACTED]");
    }

    #[test]
    fn test_redacted_bytes_shows_length_only() {
        let key = [7u8; 32];
        assert_eq!(format!("{}", RedactedBytes(&key)), "[32 bytes]");
    }

    #[test]
    fn test_short_hex_truncates() {
        let id = [0xab_u8; 16];
        assert_eq!(format!("{}", ShortHex(&id)), "abababab…");
    }
}
