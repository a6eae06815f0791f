//! Normalized instrument replies.
//!
//! Every query-style command goes through [`Reply::parse`]:
//!
//! 1. cut at the last `\n` (dropping it and anything after),
//! 2. cut at the last `;` (dropping unit suffixes and trailing fields),
//! 3. try a float, demoted to an integer when the value is integral,
//! 4. otherwise keep the text.
//!
//! The order is significant: `"12.5;Hz"` must become `12.5`, so stripping
//! happens before numeric parsing.

use std::fmt;

/// A query reply after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Integral numeric reply.
    Int(i64),
    /// Non-integral numeric reply.
    Float(f64),
    /// Anything that did not parse as a number.
    Text(String),
}

impl Reply {
    /// Normalize a raw reply string.
    pub fn parse(raw: &str) -> Self {
        let mut text = raw;
        if let Some(pos) = text.rfind('\n') {
            text = &text[..pos];
        }
        if let Some(pos) = text.rfind(';') {
            text = &text[..pos];
        }
        Self::coerce(text)
    }

    /// Numeric coercion without any stripping. Used for individual fields of
    /// a comma-separated reply.
    pub fn coerce(field: &str) -> Self {
        let trimmed = field.trim();
        match trimmed.parse::<f64>() {
            Ok(value) if is_integral(value) => Reply::Int(value as i64),
            Ok(value) => Reply::Float(value),
            Err(_) => Reply::Text(field.to_string()),
        }
    }

    /// Numeric value, if the reply is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reply::Int(v) => Some(*v as f64),
            Reply::Float(v) => Some(*v),
            Reply::Text(_) => None,
        }
    }

    /// Integral value, if the reply is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if the reply was not numeric.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn is_integral(value: f64) -> bool {
    value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Int(v) => write!(f, "{}", v),
            Reply::Float(v) => write!(f, "{}", v),
            Reply::Text(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_float_is_demoted() {
        assert_eq!(Reply::parse("3.0000\n"), Reply::Int(3));
    }

    #[test]
    fn fractional_float_stays_float() {
        assert_eq!(Reply::parse("3.5000\n"), Reply::Float(3.5));
    }

    #[test]
    fn semicolon_suffix_is_stripped_before_parsing() {
        assert_eq!(Reply::parse("ERROR;garbage"), Reply::Text("ERROR".into()));
        assert_eq!(Reply::parse("12.5;\n"), Reply::Float(12.5));
    }

    #[test]
    fn identification_string_passes_through() {
        let reply = Reply::parse("Stanford_Research_Systems,SR830,s/n12345,ver1.07 \n");
        assert_eq!(
            reply.as_text(),
            Some("Stanford_Research_Systems,SR830,s/n12345,ver1.07 ")
        );
        assert_eq!(reply.as_f64(), None);
    }

    #[test]
    fn scientific_notation_is_numeric() {
        assert_eq!(Reply::parse("1.5e-6\n").as_f64(), Some(1.5e-6));
        assert_eq!(Reply::parse("-2E3\n"), Reply::Int(-2000));
    }

    #[test]
    fn only_last_newline_is_cut() {
        assert_eq!(Reply::parse("7\n\n"), Reply::Int(7));
        assert_eq!(Reply::parse("line one\n4\n"), Reply::Text("line one\n4".into()));
    }

    #[test]
    fn coerce_trims_field_whitespace() {
        assert_eq!(Reply::coerce(" 0.25 "), Reply::Float(0.25));
        assert_eq!(Reply::coerce("n/a"), Reply::Text("n/a".into()));
    }
}
