use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A named text collation. BINARY is the default everywhere a column
/// or index part doesn't declare one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collation {
    #[default]
    Binary,
    NoCase,
    Rtrim,
}

#[derive(thiserror::Error, Debug)]
#[error("unknown collation {0:?}")]
pub struct UnknownCollation(pub String);

impl Collation {
    pub fn parse(name: &str) -> Result<Self, UnknownCollation> {
        match name.to_ascii_lowercase().as_str() {
            "binary" => Ok(Collation::Binary),
            "nocase" => Ok(Collation::NoCase),
            "rtrim" => Ok(Collation::Rtrim),
            _ => Err(UnknownCollation(name.to_string())),
        }
    }

    pub fn compare_text(&self, lhs: &str, rhs: &str) -> Ordering {
        match self {
            Collation::Binary => lhs.as_bytes().cmp(rhs.as_bytes()),
            Collation::NoCase => lhs
                .bytes()
                .map(|b| b.to_ascii_lowercase())
                .cmp(rhs.bytes().map(|b| b.to_ascii_lowercase())),
            Collation::Rtrim => lhs
                .trim_end_matches(' ')
                .as_bytes()
                .cmp(rhs.trim_end_matches(' ').as_bytes()),
        }
    }

    /// Fold text into its canonical key form, so that collation-equal
    /// strings produce byte-equal keys.
    pub fn fold(&self, text: &str) -> Arc<str> {
        match self {
            Collation::Binary => Arc::from(text),
            Collation::NoCase => Arc::from(text.to_ascii_lowercase().as_str()),
            Collation::Rtrim => Arc::from(text.trim_end_matches(' ')),
        }
    }
}

impl fmt::Display for Collation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collation::Binary => write!(f, "BINARY"),
            Collation::NoCase => write!(f, "NOCASE"),
            Collation::Rtrim => write!(f, "RTRIM"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_fold() {
        assert_eq!(Collation::parse("NOCASE").unwrap(), Collation::NoCase);
        assert!(Collation::parse("latin1").is_err());
        assert_eq!(&*Collation::NoCase.fold("AbC"), "abc");
        assert_eq!(&*Collation::Rtrim.fold("ab  "), "ab");
        assert_eq!(&*Collation::Binary.fold("AbC"), "AbC");
    }
}
