//! Integer literal syntax shared by the source language and the listings.
//!
//! Bases: 2 (`0b` or `%`), 4 (`0q`), 8 (`0o`), 10, 16 (`0x` or `$`).

/// Parses a literal in any supported base. Returns `None` on malformed
/// input rather than guessing.
pub fn parse_integer(text: &str) -> Option<i64> {
    let (digits, radix) = if let Some(rest) = text.strip_prefix("0x").or(text.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = text.strip_prefix('$') {
        (rest, 16)
    } else if let Some(rest) = text.strip_prefix("0b").or(text.strip_prefix("0B")) {
        (rest, 2)
    } else if let Some(rest) = text.strip_prefix('%') {
        (rest, 2)
    } else if let Some(rest) = text.strip_prefix("0q").or(text.strip_prefix("0Q")) {
        (rest, 4)
    } else if let Some(rest) = text.strip_prefix("0o").or(text.strip_prefix("0O")) {
        (rest, 8)
    } else {
        (text, 10)
    };
    if digits.is_empty() {
        return None;
    }
    i64::from_str_radix(digits, radix).ok()
}

/// Formats a nonnegative value back into the given base, with the base's
/// canonical prefix. Round-trips through [`parse_integer`] modulo leading
/// zeros.
pub fn format_integer(value: i64, base: u32) -> String {
    let magnitude = value.unsigned_abs();
    let sign = if value < 0 { "-" } else { "" };
    match base {
        2 => format!("{}0b{:b}", sign, magnitude),
        4 => {
            let mut digits = String::new();
            let mut v = magnitude;
            loop {
                digits.insert(0, char::from_digit((v % 4) as u32, 4).unwrap());
                v /= 4;
                if v == 0 {
                    break;
                }
            }
            format!("{}0q{}", sign, digits)
        }
        8 => format!("{}0o{:o}", sign, magnitude),
        16 => format!("{}0x{:x}", sign, magnitude),
        _ => format!("{}", value),
    }
}

#[cfg(test)]
mod tests {
    use yare::parameterized;

    use super::*;

    #[parameterized(
        decimal = { "42", 42 },
        hex = { "0x2a", 42 },
        hex_dollar = { "$2A", 42 },
        binary = { "0b101010", 42 },
        binary_percent = { "%101010", 42 },
        quaternary = { "0q222", 42 },
        octal = { "0o52", 42 },
    )]
    fn parses_every_base(text: &str, expected: i64) {
        assert_eq!(parse_integer(text), Some(expected));
    }

    #[test]
    fn rejects_junk() {
        assert_eq!(parse_integer(""), None);
        assert_eq!(parse_integer("$"), None);
        assert_eq!(parse_integer("0xZZ"), None);
        assert_eq!(parse_integer("0q4"), None);
    }

    #[parameterized(
        base_2 = { 2 },
        base_4 = { 4 },
        base_8 = { 8 },
        base_10 = { 10 },
        base_16 = { 16 },
    )]
    fn format_then_parse_is_identity(base: u32) {
        for value in [0i64, 1, 42, 255, 256, 0xc000, 65535] {
            let text = format_integer(value, base);
            assert_eq!(parse_integer(&text), Some(value), "{}", text);
        }
    }
}
