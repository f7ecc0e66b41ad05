use super::ValidationError;
use crate::logging::filter::CompiledFilter;
use serde::Deserialize;
use std::path::PathBuf;

/// Access log destination and rotation, plus log filters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    /// Combined-format access log; unset disables it
    pub access_log: Option<PathBuf>,

    #[serde(default)]
    pub max_size_mb: i64,
    #[serde(default)]
    pub max_age_days: i64,
    #[serde(default)]
    pub max_backups: i64,
    #[serde(default)]
    pub compress: bool,

    #[serde(default, rename = "filter")]
    pub filters: Vec<Filter>,
}

/// An expression evaluated against every log record; `true` drops the record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub name: String,
    pub expression: String,
}

impl Filter {
    pub fn compile(&self) -> Result<CompiledFilter, ValidationError> {
        CompiledFilter::compile(&self.name, &self.expression).map_err(|source| {
            ValidationError::FilterDoesntCompile {
                name: self.name.clone(),
                expression: self.expression.clone(),
                source,
            }
        })
    }
}

impl Logging {
    pub fn valid(&self) -> Result<(), ValidationError> {
        let mut errs = Vec::new();

        if !(0..=512).contains(&self.max_size_mb) {
            errs.push(ValidationError::WrongValue(format!(
                "max_size_mb must be between 0 and 512, got {}",
                self.max_size_mb
            )));
        }
        if self.max_age_days < 0 {
            errs.push(ValidationError::WrongValue(format!(
                "max_age_days must not be negative, got {}",
                self.max_age_days
            )));
        }
        if self.max_backups < 0 {
            errs.push(ValidationError::WrongValue(format!(
                "max_backups must not be negative, got {}",
                self.max_backups
            )));
        }

        for filter in &self.filters {
            if let Err(e) = filter.compile() {
                errs.push(e);
            }
        }

        ValidationError::join(errs)
    }

    /// Compile every filter, failing on the first one that doesn't compile.
    pub fn compile_filters(&self) -> Result<Vec<CompiledFilter>, ValidationError> {
        self.filters.iter().map(Filter::compile).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        let logging = Logging {
            max_size_mb: 513,
            max_age_days: -1,
            max_backups: -2,
            ..Default::default()
        };
        let err = logging.valid().unwrap_err();
        assert_eq!(err.leaves().len(), 3);
        assert!(err.to_string().contains("max_size_mb"));

        Logging {
            max_size_mb: 512,
            ..Default::default()
        }
        .valid()
        .unwrap();
    }

    #[test]
    fn test_filters_must_compile() {
        let logging: Logging = toml::from_str(
            r#"
[[filter]]
name = "ok"
expression = 'level == "DEBUG"'

[[filter]]
name = "broken"
expression = 'msg == '
"#,
        )
        .unwrap();

        let err = logging.valid().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("filter does not compile: broken"), "{message}");
        assert!(!message.contains(": ok "), "{message}");
        assert!(logging.compile_filters().is_err());
    }

    #[test]
    fn test_empty_expression_rejected() {
        let filter = Filter {
            name: "empty".into(),
            expression: "   ".into(),
        };
        assert!(filter.compile().is_err());
    }
}
