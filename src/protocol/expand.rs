//! Text expansion for scripts and templates
//!
//! - `$VAR` / `${VAR}` substitution from a property lookup
//! - backslash escapes (`\r`, `\n`, `\t`, `\\`, `\"`, octal `\002`, hex `\x1b`)
//! - Java-style date patterns (`yyMMdd HHmmss`) rendered with chrono

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Replace `$VAR` and `${VAR}` using `lookup`; unknown names stay as written
pub fn expand_vars<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = tail.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            (&tail[..end], end)
        };

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => {
                out.push_str(&value);
                rest = &tail[consumed..];
            }
            _ => {
                out.push('$');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve backslash escapes into raw bytes
pub fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' || i + 1 == bytes.len() {
            out.push(b);
            i += 1;
            continue;
        }
        let next = bytes[i + 1];
        i += 2;
        match next {
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            b'x' => {
                let hex: String = text[i..]
                    .chars()
                    .take(2)
                    .take_while(|c| c.is_ascii_hexdigit())
                    .collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(v) => {
                        out.push(v);
                        i += hex.len();
                    }
                    Err(_) => out.extend_from_slice(b"\\x"),
                }
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    out
}

/// Render `t` with a Java-style date pattern
///
/// Letters: `yyyy yy MM dd HH mm ss SSS DDD Z`; text in single quotes is
/// literal. A pattern containing `%` is taken as a strftime string instead.
/// An unusable strftime string is returned unchanged.
pub fn format_java_date<Tz>(pattern: &str, t: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let strftime = if pattern.contains('%') {
        pattern.to_string()
    } else {
        java_to_strftime(pattern)
    };
    let items: Vec<Item> = StrftimeItems::new(&strftime).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return pattern.to_string();
    }
    t.format_with_items(items.into_iter()).to_string()
}

fn java_to_strftime(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // Quoted literal; '' is a single quote
            let mut j = i + 1;
            if j < chars.len() && chars[j] == '\'' {
                out.push('\'');
                i = j + 1;
                continue;
            }
            while j < chars.len() && chars[j] != '\'' {
                out.push(chars[j]);
                j += 1;
            }
            i = j + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            out.push(c);
            i += 1;
            continue;
        }

        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let spec = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1 | 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', _) => "%d",
            ('H', _) => "%H",
            ('h', _) => "%I",
            ('m', _) => "%M",
            ('s', _) => "%S",
            ('S', _) => "%3f",
            ('D', _) => "%j",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('Z', _) => "%z",
            ('z', _) => "%Z",
            _ => "",
        };
        if spec.is_empty() {
            for _ in 0..run {
                out.push(c);
            }
        } else {
            out.push_str(spec);
        }
        i += run;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use std::collections::HashMap;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("USERNAME".to_string(), "ops".to_string()),
            ("HOURS".to_string(), "6".to_string()),
        ])
    }

    fn lookup(name: &str) -> Option<String> {
        vars().get(&name.to_ascii_uppercase()).cloned()
    }

    #[test]
    fn test_expand_vars() {
        assert_eq!(expand_vars("LOGIN $USERNAME\\r", lookup), "LOGIN ops\\r");
        assert_eq!(expand_vars("D${hours}H", lookup), "D6H");
        assert_eq!(expand_vars("cost $5 $NOPE ${", lookup), "cost $5 $NOPE ${");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("PING\\r\\n"), b"PING\r\n");
        assert_eq!(unescape("\\002data\\003"), vec![2, b'd', b'a', b't', b'a', 3]);
        assert_eq!(unescape("say \\\"hi\\\""), b"say \"hi\"");
        assert_eq!(unescape("\\x1b[0m"), vec![0x1b, b'[', b'0', b'm']);
        assert_eq!(unescape("\\q trailing\\"), b"\\q trailing\\");
    }

    #[test]
    fn test_java_date_patterns() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_java_date("yyMMdd HHmmss Z", &t), "240309 140507 +0000");
        assert_eq!(format_java_date("yyyy/MM/dd-DDD", &t), "2024/03/09-069");
        assert_eq!(format_java_date("'T'HH:mm", &t), "T14:05");

        let mst = FixedOffset::west_opt(7 * 3600).unwrap();
        assert_eq!(format_java_date("MM/dd HH", &t.with_timezone(&mst)), "03/09 07");
    }

    #[test]
    fn test_strftime_passthrough() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_java_date("%Y-%m-%dT%H", &t), "2024-03-09T14");
        assert_eq!(format_java_date("%Q broken", &t), "%Q broken");
    }
}
