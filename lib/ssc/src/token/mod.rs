//! Token Session Adapter
//!
//! The token driver exposes a duck-typed property object: request properties are
//! written, the command starts when `Request` is written, and the caller polls
//! `PluginStatus` until the driver reaches a terminal status. This module wraps
//! that contract into [`TokenSession::run_command`], which yields a typed
//! [`TokenResult`] so orchestrators never parse driver strings themselves.

mod presence;
mod result;
mod session;
mod software;

pub use presence::{DEFAULT_PRESENCE_INTERVAL, Presence, PresenceWatcher};
pub use result::{ResultOutcome, TokenReason, TokenResult};
pub use session::{CommandResponse, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, TokenSession};
pub use software::SoftwareToken;

use std::fmt;
use std::str::FromStr;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::SscError;

/// Properties of the driver object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Property {
    Request,
    ParamList,
    Data,
    UserPin,
    NewPin,
    CardType,
    PluginStatus,
    TokenId,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Request => "Request",
            Property::ParamList => "ParamList",
            Property::Data => "Data",
            Property::UserPin => "UserPIN",
            Property::NewPin => "NewPIN",
            Property::CardType => "CardType",
            Property::PluginStatus => "PluginStatus",
            Property::TokenId => "TokenID",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for the token driver's property contract (allows a software token in tests).
///
/// Writing [`Property::Request`] starts the command using whatever request
/// properties were written before it. Reads return `None` when the driver is
/// absent or the attribute is unavailable.
pub trait TokenDriver: Send + Sync {
    fn write(&self, property: Property, value: &str) -> Result<(), SscError>;

    fn read(&self, property: Property) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenCommand {
    GetCertificates,
    GetTokenId,
    ResetPin,
    ChangePuk,
    GenerateKeypair,
    ImportX509,
    ImportP12,
    DeleteUserData,
    ResetToken,
}

impl TokenCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenCommand::GetCertificates => "GetCertificates",
            TokenCommand::GetTokenId => "GetTokenID",
            TokenCommand::ResetPin => "ResetPIN",
            TokenCommand::ChangePuk => "ChangePUK",
            TokenCommand::GenerateKeypair => "GenerateKeypair",
            TokenCommand::ImportX509 => "ImportX509",
            TokenCommand::ImportP12 => "ImportP12",
            TokenCommand::DeleteUserData => "DeleteUserData",
            TokenCommand::ResetToken => "ResetToken",
        }
    }
}

impl FromStr for TokenCommand {
    type Err = SscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GetCertificates" => Ok(Self::GetCertificates),
            "GetTokenID" => Ok(Self::GetTokenId),
            "ResetPIN" => Ok(Self::ResetPin),
            "ChangePUK" => Ok(Self::ChangePuk),
            "GenerateKeypair" => Ok(Self::GenerateKeypair),
            "ImportX509" => Ok(Self::ImportX509),
            "ImportP12" => Ok(Self::ImportP12),
            "DeleteUserData" => Ok(Self::DeleteUserData),
            "ResetToken" => Ok(Self::ResetToken),
            _ => Err(SscError::Protocol(format!("Unknown token command: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    LookingForToken,
    Working,
    IdleTokenPresent,
    WaitForUserInput,
    FinishedSuccess,
    FinishedError,
    /// Anything the driver reports that we do not know. Keeps polling.
    Unrecognized,
}

impl PluginStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "LOOKING_FOR_TOKEN" => Self::LookingForToken,
            "WORKING" => Self::Working,
            "IDLE_TOKEN_PRESENT" => Self::IdleTokenPresent,
            "WAIT_FOR_USER_INPUT" => Self::WaitForUserInput,
            "FINISHED_SUCCESS" => Self::FinishedSuccess,
            "FINISHED_ERROR" => Self::FinishedError,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LookingForToken => "LOOKING_FOR_TOKEN",
            Self::Working => "WORKING",
            Self::IdleTokenPresent => "IDLE_TOKEN_PRESENT",
            Self::WaitForUserInput => "WAIT_FOR_USER_INPUT",
            Self::FinishedSuccess => "FINISHED_SUCCESS",
            Self::FinishedError => "FINISHED_ERROR",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }

    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            Self::WaitForUserInput => Some(TerminalStatus::WaitForUserInput),
            Self::FinishedSuccess => Some(TerminalStatus::FinishedSuccess),
            Self::FinishedError => Some(TerminalStatus::FinishedError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    WaitForUserInput,
    FinishedSuccess,
    FinishedError,
}

impl From<TerminalStatus> for PluginStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::WaitForUserInput => PluginStatus::WaitForUserInput,
            TerminalStatus::FinishedSuccess => PluginStatus::FinishedSuccess,
            TerminalStatus::FinishedError => PluginStatus::FinishedError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize)]
struct ParamEntry {
    key: String,
    value: String,
}

/// Ordered `Key=Value;` parameter list. Values may hold PUKs, so it is wiped on drop.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ParamList {
    entries: Vec<ParamEntry>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.entries.push(ParamEntry {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::new());
        for entry in &self.entries {
            out.push_str(&entry.key);
            out.push('=');
            out.push_str(&entry.value);
            out.push(';');
        }
        out
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Parses a `Key=Value;` string. Segments without `=` are skipped.
    pub fn decode(raw: &str) -> Self {
        let mut list = Self::new();
        for segment in raw.split(';') {
            if let Some((key, value)) = segment.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    list.push(key, value);
                }
            }
        }
        list
    }
}

impl fmt::Debug for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// One token command with its request properties.
#[derive(Clone)]
pub struct TokenRequest {
    pub command: TokenCommand,
    pub params: ParamList,
    pub data: Option<String>,
    pub user_pin: Option<Zeroizing<String>>,
    pub new_pin: Option<Zeroizing<String>>,
}

impl TokenRequest {
    pub fn new(command: TokenCommand) -> Self {
        Self {
            command,
            params: ParamList::new(),
            data: None,
            user_pin: None,
            new_pin: None,
        }
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.push(key, value);
        self
    }

    pub fn data(mut self, data: &str) -> Self {
        self.data = Some(data.to_string());
        self
    }

    pub fn user_pin(mut self, pin: &str) -> Self {
        self.user_pin = Some(Zeroizing::new(pin.to_string()));
        self
    }

    pub fn new_pin(mut self, pin: &str) -> Self {
        self.new_pin = Some(Zeroizing::new(pin.to_string()));
        self
    }
}
