// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Domain names, carrying "partial" vs. "fully-qualified" as a tagged
//! property of the value itself, rather than as a side flag callers can
//! forget to check. Only the presentation-format subset needed by the
//! meta/geo engine's CNAME handling is implemented; wire-format encoding
//! is left to the authoritative answer path elsewhere in the daemon.

use thiserror::Error;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnameError {
    #[error("domain name exceeds {MAX_NAME_LEN} bytes")]
    TooLong,
    #[error("label exceeds {MAX_LABEL_LEN} bytes")]
    LabelTooLong,
    #[error("empty label in domain name")]
    EmptyLabel,
    #[error("domain name is empty")]
    Empty,
    #[error("cannot complete an already fully-qualified name")]
    AlreadyFull,
    #[error("origin used to complete a partial name must itself be fully-qualified")]
    OriginNotFull,
}

/// A domain name in presentation form, tagged as partial or fully-qualified.
/// A `Full` name always ends in a trailing dot; a `Partial` one never does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dname {
    Partial(String),
    Full(String),
}

impl Dname {
    /// Parses presentation-format text into a tagged, validated `Dname`.
    /// Text ending in `.` is fully-qualified; anything else is partial.
    pub fn parse(text: &str) -> Result<Self, DnameError> {
        if text.is_empty() {
            return Err(DnameError::Empty);
        }
        let is_full = text.ends_with('.');
        let trimmed = text.strip_suffix('.').unwrap_or(text);
        validate_labels(trimmed)?;

        if trimmed.len() > MAX_NAME_LEN {
            return Err(DnameError::TooLong);
        }

        if is_full {
            Ok(Dname::Full(format!("{}.", trimmed.to_ascii_lowercase())))
        } else {
            Ok(Dname::Partial(trimmed.to_ascii_lowercase()))
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Dname::Partial(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Dname::Partial(s) | Dname::Full(s) => s,
        }
    }

    /// Completes a partial name by appending `origin`, validating the
    /// result. `origin` must itself be fully-qualified.
    pub fn complete(&self, origin: &Dname) -> Result<Dname, DnameError> {
        let Dname::Partial(label) = self else {
            return Err(DnameError::AlreadyFull);
        };
        let Dname::Full(origin_text) = origin else {
            return Err(DnameError::OriginNotFull);
        };

        let combined = format!("{label}.{origin_text}");
        if combined.len() > MAX_NAME_LEN + 1 {
            return Err(DnameError::TooLong);
        }
        Ok(Dname::Full(combined))
    }
}

fn validate_labels(trimmed: &str) -> Result<(), DnameError> {
    if trimmed.is_empty() {
        // the root name; nothing further to validate
        return Ok(());
    }
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(DnameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(DnameError::LabelTooLong);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_partial() {
        let full = Dname::parse("example.com.").unwrap();
        assert!(!full.is_partial());
        assert_eq!(full.as_str(), "example.com.");

        let partial = Dname::parse("foo").unwrap();
        assert!(partial.is_partial());
        assert_eq!(partial.as_str(), "foo");
    }

    #[test]
    fn partial_completion_appends_origin() {
        let partial = Dname::parse("foo").unwrap();
        let origin = Dname::parse("example.com.").unwrap();
        let completed = partial.complete(&origin).unwrap();
        assert_eq!(completed.as_str(), "foo.example.com.");
        assert!(!completed.is_partial());
    }

    #[test]
    fn completing_a_full_name_is_an_error() {
        let full = Dname::parse("example.com.").unwrap();
        let origin = Dname::parse("example.org.").unwrap();
        assert_eq!(full.complete(&origin), Err(DnameError::AlreadyFull));
    }

    #[test]
    fn origin_must_be_full() {
        let partial = Dname::parse("foo").unwrap();
        let partial_origin = Dname::parse("bar").unwrap();
        assert_eq!(
            partial.complete(&partial_origin),
            Err(DnameError::OriginNotFull)
        );
    }

    #[test]
    fn rejects_oversized_labels() {
        let label = "a".repeat(64);
        assert_eq!(Dname::parse(&label), Err(DnameError::LabelTooLong));
    }

    #[test]
    fn rejects_empty_labels() {
        assert_eq!(Dname::parse("foo..bar"), Err(DnameError::EmptyLabel));
    }
}
