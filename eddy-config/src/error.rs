//! Errors raised while layering, extracting or validating an [`EddyConfig`].
//!
//! [`EddyConfig`]: crate::EddyConfig

use std::path::PathBuf;
use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    #[error("config rejected:\n{}", format_validation_errors(.0))]
    Validation(#[from] ValidationErrors),

    #[error("config could not be extracted: {0}")]
    Parsing(#[from] figment::Error),

    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Flattens nested section errors into `section.field: message` lines.
fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut output = String::new();
    collect(errors, "", &mut output);
    output
}

fn collect(errors: &ValidationErrors, prefix: &str, output: &mut String) {
    use std::fmt::Write;

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = match &error.message {
                        Some(msg) => msg.to_string(),
                        None => error.code.to_string(),
                    };
                    let _ = writeln!(output, "  - {path}: {message}");
                }
            }
            ValidationErrorsKind::Struct(inner) => collect(inner, &path, output),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect(inner, &format!("{path}[{index}]"), output);
                }
            }
        }
    }
}
