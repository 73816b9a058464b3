//! Webreference types.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// How a webreference is served to its recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    /// Encrypted message fetched from the url and cached locally.
    Message,

    /// Recipients are redirected to the url; nothing is fetched.
    Redirect,

    /// Encrypted content for a content store. Not served.
    Content,
}

impl ReferenceType {
    /// Lowercase name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Redirect => "redirect",
            Self::Content => "content",
        }
    }
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ReferenceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "redirect" => Ok(Self::Redirect),
            "content" => Ok(Self::Content),
            _ => Err(ProtocolError::InvalidReferenceType(s.to_string())),
        }
    }
}
