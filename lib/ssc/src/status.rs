//! Operator callback contract
//!
//! Orchestrators return an [`Outcome`]; the presentation layer only ever sees
//! the [`StatusReport`] derived from it: a short status token plus optional detail.

use serde::Serialize;

use crate::error::SscError;
use crate::reconciler::NextAction;
use crate::types::BackendErrorClass;
use crate::types::error::classify_all;

/// What the operator has to supply before the run can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InputKind {
    SelectAccount {
        accounts: Vec<String>,
    },
    /// `invalid` is the field bit-flag: 1 first, 2 second, 3 both, 0 for a fresh prompt.
    AuthPersons {
        invalid: u8,
    },
    AuthCodes {
        auth1: Option<String>,
        auth2: Option<String>,
        rejected: bool,
    },
    /// The token refused the new PIN; the released PUK is kept for the retry.
    NewPin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Completion {
    /// Card personalized. Activation (unblock) should follow.
    Personalized,
    Unblocked { next: NextAction },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ErrorKind {
    /// The PUK could not be established. Further attempts risk locking the token.
    TokenUnusable,
    PukLocked,
    PukInvalid,
    PinNotEncrypted,
    PinPolicy,
    SessionInvalid,
    WorkflowFailed { state: String },
    ServerStalled,
    Backend { errors: Vec<String> },
    TokenRemoved,
    Transport { code: u32 },
}

impl ErrorKind {
    pub fn support_code(&self) -> u32 {
        match self {
            ErrorKind::TokenUnusable => 4001,
            ErrorKind::PukLocked => 4002,
            ErrorKind::PukInvalid => 4003,
            ErrorKind::PinNotEncrypted => 4004,
            ErrorKind::PinPolicy => 4005,
            ErrorKind::SessionInvalid => 5003,
            ErrorKind::WorkflowFailed { .. } => 5001,
            ErrorKind::ServerStalled => 5002,
            ErrorKind::Backend { .. } => 3001,
            ErrorKind::TokenRemoved => 1004,
            ErrorKind::Transport { code } => *code,
        }
    }

    /// Terminal error for backend codes the caller cannot recover from locally.
    pub fn from_backend(errors: Vec<String>) -> Self {
        match classify_all(errors.iter().map(String::as_str)) {
            Some(BackendErrorClass::Session) => ErrorKind::SessionInvalid,
            _ => ErrorKind::Backend { errors },
        }
    }
}

impl From<SscError> for ErrorKind {
    fn from(e: SscError) -> Self {
        match e {
            SscError::TokenRemoved => ErrorKind::TokenRemoved,
            other => ErrorKind::Transport {
                code: other.support_code(),
            },
        }
    }
}

/// Result of driving an orchestrator one step or to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// One step done, more to do without operator input.
    Resumed,
    AwaitingInput(InputKind),
    Succeeded(Completion),
    Failed(ErrorKind),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Succeeded(_) | Outcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusCode {
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "invalidPin")]
    InvalidPin,
    #[serde(rename = "cardBlocked")]
    CardBlocked,
    #[serde(rename = "invalidAuthCode")]
    InvalidAuthCode,
    #[serde(rename = "invalidAuthPerson")]
    InvalidAuthPerson,
    #[serde(rename = "selectAccount")]
    SelectAccount,
    #[serde(rename = "enterAuthcodes")]
    EnterAuthCodes,
    #[serde(rename = "enterAuthPersons")]
    EnterAuthPersons,
    #[serde(rename = "pinPolicy")]
    PinPolicy,
    #[serde(rename = "reload")]
    Reload,
    #[serde(rename = "tokenRemoved")]
    TokenRemoved,
    #[serde(rename = "contPerso")]
    ContPerso,
    #[serde(rename = "startPerso")]
    StartPerso,
    #[serde(rename = "startRecert")]
    StartRecert,
    #[serde(rename = "showStatus")]
    ShowStatus,
    #[serde(rename = "cardUnknown")]
    CardUnknown,
    #[serde(rename = "cardInitial")]
    CardInitial,
    #[serde(rename = "cardDeactivated")]
    CardDeactivated,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Working => "working",
            StatusCode::Success => "success",
            StatusCode::Error => "error",
            StatusCode::InvalidPin => "invalidPin",
            StatusCode::CardBlocked => "cardBlocked",
            StatusCode::InvalidAuthCode => "invalidAuthCode",
            StatusCode::InvalidAuthPerson => "invalidAuthPerson",
            StatusCode::SelectAccount => "selectAccount",
            StatusCode::EnterAuthCodes => "enterAuthcodes",
            StatusCode::EnterAuthPersons => "enterAuthPersons",
            StatusCode::PinPolicy => "pinPolicy",
            StatusCode::Reload => "reload",
            StatusCode::TokenRemoved => "tokenRemoved",
            StatusCode::ContPerso => "contPerso",
            StatusCode::StartPerso => "startPerso",
            StatusCode::StartRecert => "startRecert",
            StatusCode::ShowStatus => "showStatus",
            StatusCode::CardUnknown => "cardUnknown",
            StatusCode::CardInitial => "cardInitial",
            StatusCode::CardDeactivated => "cardDeactivated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusDetail {
    InvalidFields(u8),
    SupportCode(u32),
    Accounts(Vec<String>),
    AuthEmails {
        auth1: Option<String>,
        auth2: Option<String>,
    },
    Action(NextAction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<StatusDetail>,
}

impl StatusReport {
    pub fn new(code: StatusCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: StatusCode, detail: StatusDetail) -> Self {
        Self {
            code,
            detail: Some(detail),
        }
    }
}

impl From<&NextAction> for StatusReport {
    fn from(action: &NextAction) -> Self {
        StatusReport::with_detail(action.status_code(), StatusDetail::Action(action.clone()))
    }
}

impl From<&Outcome> for StatusReport {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Resumed => StatusReport::new(StatusCode::Working),
            Outcome::AwaitingInput(InputKind::SelectAccount { accounts }) => {
                StatusReport::with_detail(
                    StatusCode::SelectAccount,
                    StatusDetail::Accounts(accounts.clone()),
                )
            }
            Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 0 }) => {
                StatusReport::new(StatusCode::EnterAuthPersons)
            }
            Outcome::AwaitingInput(InputKind::AuthPersons { invalid }) => {
                StatusReport::with_detail(
                    StatusCode::InvalidAuthPerson,
                    StatusDetail::InvalidFields(*invalid),
                )
            }
            Outcome::AwaitingInput(InputKind::AuthCodes {
                auth1,
                auth2,
                rejected,
            }) => StatusReport::with_detail(
                if *rejected {
                    StatusCode::InvalidAuthCode
                } else {
                    StatusCode::EnterAuthCodes
                },
                StatusDetail::AuthEmails {
                    auth1: auth1.clone(),
                    auth2: auth2.clone(),
                },
            ),
            Outcome::AwaitingInput(InputKind::NewPin) => StatusReport::new(StatusCode::InvalidPin),
            Outcome::Succeeded(Completion::Personalized) => StatusReport::with_detail(
                StatusCode::Success,
                StatusDetail::Action(NextAction::EnterAuthPersons { wf_id: None }),
            ),
            Outcome::Succeeded(Completion::Unblocked { next }) => {
                StatusReport::with_detail(StatusCode::Success, StatusDetail::Action(next.clone()))
            }
            Outcome::Failed(kind) => {
                let code = match kind {
                    ErrorKind::PukLocked => StatusCode::CardBlocked,
                    ErrorKind::PinPolicy => StatusCode::PinPolicy,
                    ErrorKind::SessionInvalid => StatusCode::Reload,
                    ErrorKind::TokenRemoved => StatusCode::TokenRemoved,
                    _ => StatusCode::Error,
                };
                StatusReport::with_detail(code, StatusDetail::SupportCode(kind.support_code()))
            }
        }
    }
}

/// The single channel through which completions reach the presentation layer.
pub trait OperatorCallback {
    fn status(&mut self, report: &StatusReport);
}

impl<F> OperatorCallback for F
where
    F: FnMut(&StatusReport),
{
    fn status(&mut self, report: &StatusReport) {
        self(report)
    }
}
