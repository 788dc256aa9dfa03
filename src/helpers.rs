//! Small data-transformation helpers shared across the catalog, codec and
//! sink modules.

/// Converts bytes into a lower-case hex string with no separators.
///
/// `to_hex(&fromHex) == id` for any even-length hex string, per the
/// round-trip law in `SPEC_FULL.md` §8.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Parses a hex string (no separators, no `0x` prefix) back into bytes.
///
/// Returns `None` if the string has odd length or contains non-hex digits.
pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

/// Sanitizes a symbolic DID id for use as a publish-view key: any character
/// outside `[A-Za-z0-9_]` is replaced with `_`, and `.` is likewise folded
/// to `_` (see `SPEC_FULL.md` §4.3).
pub fn sanitize_symbolic_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let data = vec![0x00, 0x01, 0xFF, 0xAB, 0xCD];
        let hex = to_hex(&data);
        assert_eq!(hex, "0001ffabcd");
        assert_eq!(from_hex(&hex).unwrap(), data);
    }

    #[test]
    fn from_hex_rejects_odd_length() {
        assert_eq!(from_hex("abc"), None);
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        assert_eq!(from_hex("zz"), None);
    }

    #[test]
    fn sanitize_replaces_dots_and_punctuation() {
        assert_eq!(sanitize_symbolic_id("outside.temp-1"), "outside_temp_1");
        assert_eq!(sanitize_symbolic_id("burner.state"), "burner_state");
    }
}
