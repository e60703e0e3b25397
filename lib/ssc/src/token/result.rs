//! Typed decoding of the driver's query-string result

use std::collections::BTreeMap;

use crate::error::SscError;

use super::TerminalStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Success,
    Error,
}

/// Token-level failure reasons reported in the `Reason` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenReason {
    /// The PUK presented does not match the token. Recoverable during PIN install.
    PukError,
    PukLocked,
    PukInvalid,
    PinNotEncrypted,
    /// The token refused the operation, e.g. the new PIN violates the PIN policy.
    TokenInternal,
    Other(String),
}

impl TokenReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PUKError" => Self::PukError,
            "PUKLockedError" => Self::PukLocked,
            "PUKInvalid" => Self::PukInvalid,
            "PINNotEncrypted" => Self::PinNotEncrypted,
            "TokenInternalError" => Self::TokenInternal,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PukError => "PUKError",
            Self::PukLocked => "PUKLockedError",
            Self::PukInvalid => "PUKInvalid",
            Self::PinNotEncrypted => "PINNotEncrypted",
            Self::TokenInternal => "TokenInternalError",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResult {
    pub outcome: ResultOutcome,
    pub reason: Option<TokenReason>,
    pub fields: BTreeMap<String, String>,
}

impl TokenResult {
    pub fn success() -> Self {
        Self {
            outcome: ResultOutcome::Success,
            reason: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn error(reason: Option<TokenReason>) -> Self {
        Self {
            outcome: ResultOutcome::Error,
            reason,
            fields: BTreeMap::new(),
        }
    }

    /// Decodes `Result=SUCCESS|ERROR&Reason=<code>&...`.
    ///
    /// An empty body takes its outcome from the terminal status. A terminal error
    /// status always wins over a body claiming success.
    pub fn decode(raw: &str, status: TerminalStatus) -> Result<Self, SscError> {
        let raw = raw.trim().trim_start_matches('?');
        if raw.is_empty() {
            return Ok(match status {
                TerminalStatus::FinishedSuccess => Self::success(),
                _ => Self::error(None),
            });
        }

        let mut fields: BTreeMap<String, String> = url::form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let outcome = match fields.remove("Result").as_deref() {
            Some("SUCCESS") => ResultOutcome::Success,
            Some("ERROR") => ResultOutcome::Error,
            Some(other) => {
                return Err(SscError::Adapter(format!(
                    "Unknown Result attribute: {}",
                    other
                )));
            }
            None => {
                return Err(SscError::Adapter(
                    "Token result has no Result attribute".to_string(),
                ));
            }
        };

        let reason = fields
            .remove("Reason")
            .filter(|r| !r.is_empty())
            .map(|r| TokenReason::parse(&r));

        let outcome = match status {
            TerminalStatus::FinishedSuccess => outcome,
            _ => ResultOutcome::Error,
        };

        Ok(Self {
            outcome,
            reason,
            fields,
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ResultOutcome::Success
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn reason_str(&self) -> &str {
        self.reason.as_ref().map(TokenReason::as_str).unwrap_or("")
    }
}
