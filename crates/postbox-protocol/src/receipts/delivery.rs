//! Receipt states and the per-target tracker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Receipt state of one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptState {
    /// Not yet confirmed by the recipient.
    Unread,

    /// Retrieval confirmed; never reverts to unread.
    Received,
}

impl ReceiptState {
    /// Whether this is the received state.
    pub fn is_received(&self) -> bool {
        matches!(self, Self::Received)
    }
}

impl std::fmt::Display for ReceiptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unread => write!(f, "Unread"),
            Self::Received => write!(f, "Received"),
        }
    }
}

/// Receipt states of all recipients of one message or webreference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTracker {
    entries: BTreeMap<String, ReceiptState>,
    echo: Option<String>,
}

impl DeliveryTracker {
    /// Track the given keyhashes, all unread except the sender's echo.
    pub fn new<I, S>(keyhashes: I, echo: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = keyhashes
            .into_iter()
            .map(Into::into)
            .map(|keyhash: String| {
                let state = if echo == Some(keyhash.as_str()) {
                    ReceiptState::Received
                } else {
                    ReceiptState::Unread
                };
                (keyhash, state)
            })
            .collect();
        Self {
            entries,
            echo: echo.map(str::to_string),
        }
    }

    /// State of one keyhash.
    pub fn state(&self, keyhash: &str) -> Option<ReceiptState> {
        self.entries.get(keyhash).copied()
    }

    /// The sender's own keyhash, if any.
    pub fn echo(&self) -> Option<&str> {
        self.echo.as_deref()
    }

    /// Whether `keyhash` is the sender's echo.
    pub fn is_echo(&self, keyhash: &str) -> bool {
        self.echo.as_deref() == Some(keyhash)
    }

    /// Transition a recipient to received.
    ///
    /// Returns `true` if the state changed and `false` if it was already
    /// received.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRecipient` if the keyhash is not tracked.
    pub fn mark_received(&mut self, keyhash: &str) -> Result<bool> {
        let state = self
            .entries
            .get_mut(keyhash)
            .ok_or_else(|| ProtocolError::UnknownRecipient(keyhash.to_string()))?;
        let changed = !state.is_received();
        *state = ReceiptState::Received;
        Ok(changed)
    }

    /// Whether every keyhash of the set has received.
    ///
    /// Unknown keyhashes count as not received and an empty set is never
    /// considered received.
    pub fn all_received<I, S>(&self, keyhashes: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut any = false;
        for keyhash in keyhashes {
            any = true;
            if !self
                .state(keyhash.as_ref())
                .is_some_and(|state| state.is_received())
            {
                return false;
            }
        }
        any
    }

    /// Whether any recipient other than the echo has received.
    pub fn was_retrieved(&self) -> bool {
        self.entries
            .iter()
            .any(|(keyhash, state)| state.is_received() && !self.is_echo(keyhash))
    }

    /// Number of tracked keyhashes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keyhash is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of received entries, echo included.
    pub fn received_count(&self) -> usize {
        self.entries.values().filter(|s| s.is_received()).count()
    }

    /// Iterate keyhashes and states in keyhash order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ReceiptState)> {
        self.entries.iter().map(|(k, s)| (k.as_str(), *s))
    }
}
