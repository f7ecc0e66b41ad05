use super::ValidationError;
use serde::Deserialize;

pub const DEFAULT_MAX_REQUEST_BODY: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_HEADER_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_MAX_HEADER_COUNT: usize = 100;

/// Per-domain request limits. Sizes are strings like `"10MB"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    pub max_request_body: Option<String>,
    pub max_header_size: Option<String>,
    pub max_header_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ByteSizeError {
    #[error("size is empty")]
    Empty,
    #[error("size must be a positive whole number followed by an optional unit")]
    Malformed,
    #[error("size must be greater than zero")]
    NotPositive,
    #[error("unknown unit {0:?}, want B, KB, MB, GB or TB")]
    UnknownUnit(String),
    #[error("size overflows 64 bits")]
    Overflow,
}

/// Parse `<digits><unit>` with 1024-based units `B`, `KB`, `MB`, `GB`, `TB`.
/// A missing unit means bytes.
pub fn parse_byte_size(s: &str) -> Result<u64, ByteSizeError> {
    if s.is_empty() {
        return Err(ByteSizeError::Empty);
    }
    if s.starts_with('-') {
        return Err(ByteSizeError::NotPositive);
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return Err(ByteSizeError::Malformed);
    }

    let (digits, unit) = s.split_at(digits_end);
    let value: u64 = digits.parse().map_err(|_| ByteSizeError::Overflow)?;

    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        other => return Err(ByteSizeError::UnknownUnit(other.to_string())),
    };

    if value == 0 {
        return Err(ByteSizeError::NotPositive);
    }

    value
        .checked_mul(multiplier)
        .ok_or(ByteSizeError::Overflow)
}

impl Limits {
    pub fn valid(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();

        for (field, value) in [
            ("max_request_body", &self.max_request_body),
            ("max_header_size", &self.max_header_size),
        ] {
            if let Some(value) = value {
                if let Err(source) = parse_byte_size(value) {
                    errs.push(ValidationError::InvalidSize {
                        field,
                        value: value.clone(),
                        source,
                    });
                }
            }
        }

        if let Some(count) = self.max_header_count {
            if count < 0 {
                errs.push(ValidationError::NegativeHeaderCount(count));
            }
        }

        ValidationError::join(errs)
    }

    pub fn max_request_body_bytes(&self) -> u64 {
        size_or(&self.max_request_body, DEFAULT_MAX_REQUEST_BODY)
    }

    pub fn max_header_size_bytes(&self) -> u64 {
        size_or(&self.max_header_size, DEFAULT_MAX_HEADER_SIZE)
    }

    /// Configured header count; zero or unset means the default.
    pub fn max_header_count(&self) -> usize {
        match self.max_header_count {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
            _ => DEFAULT_MAX_HEADER_COUNT,
        }
    }
}

fn size_or(value: &Option<String>, default: u64) -> u64 {
    value
        .as_deref()
        .and_then(|v| parse_byte_size(v).ok())
        .unwrap_or(default)
}
