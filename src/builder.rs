//! Single-use builder support.
//!
//! Every filter and entity in obsdb is an immutable value produced by a
//! builder. Builders are single-use: `build()` moves the value out, a second
//! `build()` fails with [`Error::Validation`], and setters called after
//! `build()` are ignored. A built value can therefore never be changed through
//! the builder that produced it.
//!
//! ```text
//!   builder() ──► Draft { Some(value) } ──setters──► Draft { Some(value') }
//!                                                        │ build()
//!                                                        ▼
//!                                      Draft { None } + Ok(value')
//!                                                        │ build()
//!                                                        ▼
//!                                            Err(Validation("... already built"))
//! ```

use crate::error::{Error, Result};

/// The value under construction inside a builder.
#[derive(Debug, Clone)]
pub(crate) struct Draft<T> {
    value: Option<T>,
    what: &'static str,
}

impl<T> Draft<T> {
    /// Starts a draft from an initial value. `what` names the built type in
    /// error messages.
    pub(crate) fn new(what: &'static str, value: T) -> Self {
        Self {
            value: Some(value),
            what,
        }
    }

    /// Applies a setter, unless the value was already built.
    pub(crate) fn edit(&mut self, f: impl FnOnce(&mut T)) {
        if let Some(value) = self.value.as_mut() {
            f(value);
        }
    }

    /// The value so far, or `None` once built.
    pub(crate) fn peek(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Moves the value out. Fails on the second call.
    pub(crate) fn take(&mut self) -> Result<T> {
        self.value
            .take()
            .ok_or_else(|| Error::validation(format!("{} builder already built", self.what)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_take_fails() {
        let mut draft = Draft::new("counter", 1u32);
        draft.edit(|v| *v += 1);
        assert_eq!(draft.take().unwrap(), 2);

        let err = draft.take().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("counter builder already built"));
    }

    #[test]
    fn test_edit_after_take_is_ignored() {
        let mut draft = Draft::new("counter", 1u32);
        let built = draft.take().unwrap();
        draft.edit(|v| *v = 99);
        assert!(draft.peek().is_none());
        assert_eq!(built, 1);
    }
}
