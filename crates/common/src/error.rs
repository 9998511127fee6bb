//! Configuration error types

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_carries_reason() {
        let err = Error::Config("max_attempts must be at least 1".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_attempts must be at least 1"
        );
    }

    #[test]
    fn toml_error_converts_with_question_mark() {
        fn parse(input: &str) -> Result<toml::Table> {
            Ok(toml::from_str(input)?)
        }

        let err = parse("[server\nlisten_addr = 1").unwrap_err();
        assert!(
            err.to_string().starts_with("TOML parse error:"),
            "got: {err}"
        );
    }

    #[test]
    fn io_error_converts_and_keeps_variant() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        let debug = format!("{err:?}");
        assert!(debug.contains("Io"), "got: {debug}");
    }
}
