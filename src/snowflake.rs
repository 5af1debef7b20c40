//! Snowflake conversion at the platform boundary
//!
//! Internal state always carries ids as `u64`. These helpers convert to and
//! from the decimal strings the platform speaks.

/// Parse a snowflake from its decimal string form.
///
/// Returns `None` for an empty string, any non-digit byte, or overflow.
#[must_use]
pub fn parse(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse a snowflake, mapping anything unparseable to 0 (the "unknown" id).
#[must_use]
pub fn parse_or_zero(s: &str) -> u64 {
    parse(s).unwrap_or(0)
}

/// Append the decimal form of `id` to `buf` without an intermediate allocation.
pub fn push_decimal(buf: &mut String, id: u64) {
    if id == 0 {
        buf.push('0');
        return;
    }

    let mut digits = [0u8; 20];
    let mut n = id;
    let mut i = digits.len();
    while n > 0 {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    for &d in &digits[i..] {
        buf.push(char::from(d));
    }
}

/// Decimal string form of `id`.
#[must_use]
pub fn to_string(id: u64) -> String {
    let mut s = String::with_capacity(20);
    push_decimal(&mut s, id);
    s
}
