use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An ordered tuple of non-negative integers parsed from a dot-separated
/// string.
///
/// Comparison is lexicographic with implicit zero padding, so `1.2 == 1.2.0`
/// and `1.10 > 1.9`. Unparseable or empty strings yield a distinct *invalid*
/// code, not zero: an invalid code compares equal to another invalid code,
/// and `partial_cmp` against a valid code is `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VersionCode {
    parts: Option<Vec<u32>>,
}

impl VersionCode {
    pub fn new(parts: &[u32]) -> VersionCode {
        if parts.is_empty() {
            return VersionCode::invalid();
        }
        VersionCode {
            parts: Some(parts.to_vec()),
        }
    }

    pub fn invalid() -> VersionCode {
        VersionCode { parts: None }
    }

    pub fn zero() -> VersionCode {
        VersionCode::new(&[0])
    }

    pub fn parse(text: &str) -> VersionCode {
        let text = text.trim();
        if text.is_empty() {
            return VersionCode::invalid();
        }

        let mut parts = Vec::with_capacity(4);
        for piece in text.split('.') {
            if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return VersionCode::invalid();
            }
            match piece.parse::<u32>() {
                Ok(value) => parts.push(value),
                Err(_) => return VersionCode::invalid(),
            }
        }

        VersionCode { parts: Some(parts) }
    }

    pub fn is_valid(&self) -> bool {
        self.parts.is_some()
    }

    fn compare_valid(a: &[u32], b: &[u32]) -> Ordering {
        let len = a.len().max(b.len());
        for i in 0..len {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            match x.cmp(&y) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for VersionCode {
    fn eq(&self, other: &Self) -> bool {
        match (&self.parts, &other.parts) {
            (Some(a), Some(b)) => VersionCode::compare_valid(a, b) == Ordering::Equal,
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for VersionCode {}

impl PartialOrd for VersionCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (&self.parts, &other.parts) {
            (Some(a), Some(b)) => Some(VersionCode::compare_valid(a, b)),
            (None, None) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for VersionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parts {
            None => Ok(()),
            Some(parts) => {
                let mut first = true;
                for part in parts {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{part}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for VersionCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(VersionCode::parse(s))
    }
}

impl From<String> for VersionCode {
    fn from(s: String) -> Self {
        VersionCode::parse(&s)
    }
}

impl From<&str> for VersionCode {
    fn from(s: &str) -> Self {
        VersionCode::parse(s)
    }
}

impl From<VersionCode> for String {
    fn from(v: VersionCode) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_padding_makes_versions_equal() {
        assert_eq!(VersionCode::parse("1.2"), VersionCode::parse("1.2.0"));
        assert_eq!(VersionCode::parse("1.2.0.0"), VersionCode::parse("1.2"));
    }

    #[test]
    fn numeric_not_textual_ordering() {
        assert!(VersionCode::parse("1.10") > VersionCode::parse("1.9"));
        assert!(VersionCode::parse("2.0") > VersionCode::parse("1.99.99"));
        assert!(VersionCode::parse("1.2.1") > VersionCode::parse("1.2"));
    }

    #[test]
    fn invalid_codes() {
        let bad = VersionCode::parse("1.a.2");
        assert!(!bad.is_valid());
        assert!(!VersionCode::parse("").is_valid());
        assert!(!VersionCode::parse("1..2").is_valid());
        assert!(!VersionCode::parse("-1.2").is_valid());

        let good = VersionCode::parse("1.0");
        assert_eq!(bad.partial_cmp(&good), None);
        assert!(bad != good);
        assert_eq!(bad, VersionCode::invalid());
    }

    #[test]
    fn display_round_trip() {
        let v = VersionCode::parse(" 1.2.3 ");
        assert_eq!(v.to_string(), "1.2.3");
        assert_eq!(VersionCode::invalid().to_string(), "");
    }

    #[test]
    fn serde_as_string() {
        let v: VersionCode = serde_json::from_str("\"1.4.0\"").unwrap();
        assert_eq!(v, VersionCode::new(&[1, 4]));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.4.0\"");
    }
}
