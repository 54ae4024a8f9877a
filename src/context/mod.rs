//! Request-scoped diagnostic context
//!
//! Stages record identifiers (most commonly the correlation id) here so that
//! log output for a request can be tied together. The context travels inside
//! the [`Exchange`], and [`DiagnosticScope`] guarantees it is emptied when the
//! guarded part of the request ends, however it ends.

use crate::exchange::Exchange;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Key under which the correlation id is stored.
pub const CORRELATION_ID_KEY: &str = "cId";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticContext {
    entries: BTreeMap<String, String>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Renders as `key=value key=value`, for log fields.
impl fmt::Display for DiagnosticContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Exclusive access to an exchange whose diagnostic context is cleared on drop.
///
/// Dereferences to the exchange, so it can be handed to the rest of the chain.
/// The clear runs exactly once, on normal exit, early return and unwinding.
pub struct DiagnosticScope<'a> {
    exchange: &'a mut Exchange,
}

impl<'a> DiagnosticScope<'a> {
    pub fn enter(exchange: &'a mut Exchange) -> Self {
        Self { exchange }
    }
}

impl Deref for DiagnosticScope<'_> {
    type Target = Exchange;

    fn deref(&self) -> &Exchange {
        self.exchange
    }
}

impl DerefMut for DiagnosticScope<'_> {
    fn deref_mut(&mut self) -> &mut Exchange {
        self.exchange
    }
}

impl Drop for DiagnosticScope<'_> {
    fn drop(&mut self) {
        tracing::trace!("Clearing diagnostic context");
        self.exchange.diagnostics_mut().clear();
    }
}
