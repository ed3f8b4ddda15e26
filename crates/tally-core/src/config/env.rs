//! Typed reads of environment variables with defaults.
//!
//! Every setting has a default, so a missing or empty variable is never an
//! error. A variable that is set but does not parse is recorded, and all
//! such problems are reported together by [`EnvReader::finish`].

use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Reads configuration values from the process environment (or a custom lookup).
pub struct EnvReader {
    lookup: Lookup,
    errors: Vec<String>,
}

impl Default for EnvReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvReader {
    /// Reader backed by `std::env`.
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Reader backed by an arbitrary lookup function.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            errors: Vec::new(),
        }
    }

    /// Value of `var`, or `None` when unset or empty.
    pub fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.trim().is_empty())
    }

    /// Value of `var`, or `default` when unset or empty.
    pub fn string(&self, var: &str, default: impl Into<String>) -> String {
        self.optional(var).unwrap_or_else(|| default.into())
    }

    /// Parsed value of `var`, or `default` when unset.
    ///
    /// A value that fails to parse is recorded and `default` is returned so
    /// that the remaining variables are still checked.
    pub fn parse<T>(&mut self, var: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.optional(var) else {
            return default;
        };

        match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                self.errors.push(
                    ConfigError::InvalidEnvVar {
                        var: var.to_string(),
                        value: raw,
                        reason: e.to_string(),
                    }
                    .to_string(),
                );
                default
            }
        }
    }

    /// Report every parse error recorded so far.
    pub fn finish(self) -> Result<(), ConfigError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MultipleErrors {
                errors: self.errors,
            })
        }
    }
}
