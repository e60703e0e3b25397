//! Backend error identifiers and their classification

pub const ERROR_AUTHCODES_INCORRECT: &str = "ssc.pinreset.ERROR_AUTHCODES_INCORRECT";
pub const ERROR_AUTHPERSON1_INVALID: &str = "ssc.pinreset.ERROR_AUTHPERSON1_INVALID";
pub const ERROR_AUTHPERSON2_INVALID: &str = "ssc.pinreset.ERROR_AUTHPERSON2_INVALID";
pub const ERROR_AUTHPERSON1_MISSING: &str = "ssc.pinreset.ERROR_AUTHPERSON1_MISSING";
pub const ERROR_AUTHPERSON2_MISSING: &str = "ssc.pinreset.ERROR_AUTHPERSON2_MISSING";

pub const ERROR_SESSION_EXPIRED: &str = "ssc.session.ERROR_SESSION_EXPIRED";
pub const ERROR_NOT_TOKEN_OWNER: &str = "ssc.session.ERROR_NOT_TOKEN_OWNER";
pub const ERROR_TOKEN_MISMATCH: &str = "ssc.session.ERROR_TOKEN_MISMATCH";

pub const ERROR_WRONG_STATE: &str = "ssc.workflow.ERROR_WRONG_STATE";
pub const ERROR_NO_UNBLOCK_WORKFLOW: &str = "ssc.workflow.ERROR_NO_UNBLOCK_WORKFLOW";

/// Field bit for the first authorizer in `InvalidFields` details.
pub const AUTH_PERSON_1: u8 = 1;
/// Field bit for the second authorizer in `InvalidFields` details.
pub const AUTH_PERSON_2: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorClass {
    /// Re-prompt the operator with field-level detail.
    InputValidation,
    /// Session lost or token not owned by the session. Forces a reload.
    Session,
    /// Workflow not in the state the request needs. Re-request the missing input.
    WorkflowPrecondition,
    Unknown,
}

pub fn classify(code: &str) -> BackendErrorClass {
    match code {
        ERROR_AUTHCODES_INCORRECT
        | ERROR_AUTHPERSON1_INVALID
        | ERROR_AUTHPERSON2_INVALID
        | ERROR_AUTHPERSON1_MISSING
        | ERROR_AUTHPERSON2_MISSING => BackendErrorClass::InputValidation,
        ERROR_SESSION_EXPIRED | ERROR_NOT_TOKEN_OWNER | ERROR_TOKEN_MISMATCH => {
            BackendErrorClass::Session
        }
        ERROR_WRONG_STATE | ERROR_NO_UNBLOCK_WORKFLOW => BackendErrorClass::WorkflowPrecondition,
        _ => BackendErrorClass::Unknown,
    }
}

/// Most severe class among a set of codes. Session beats everything else.
pub fn classify_all<'a>(codes: impl IntoIterator<Item = &'a str>) -> Option<BackendErrorClass> {
    let mut worst: Option<BackendErrorClass> = None;
    for code in codes {
        let class = classify(code);
        worst = Some(match (worst, class) {
            (Some(BackendErrorClass::Session), _) | (_, BackendErrorClass::Session) => {
                BackendErrorClass::Session
            }
            (Some(BackendErrorClass::Unknown), _) | (_, BackendErrorClass::Unknown) => {
                BackendErrorClass::Unknown
            }
            (Some(BackendErrorClass::WorkflowPrecondition), _)
            | (_, BackendErrorClass::WorkflowPrecondition) => {
                BackendErrorClass::WorkflowPrecondition
            }
            _ => BackendErrorClass::InputValidation,
        });
    }
    worst
}

/// Bit-flag of authorizer fields named by the given codes (1 = first, 2 = second, 3 = both).
pub fn invalid_auth_person_fields<'a>(codes: impl IntoIterator<Item = &'a str>) -> u8 {
    codes.into_iter().fold(0, |acc, code| match code {
        ERROR_AUTHPERSON1_INVALID | ERROR_AUTHPERSON1_MISSING => acc | AUTH_PERSON_1,
        ERROR_AUTHPERSON2_INVALID | ERROR_AUTHPERSON2_MISSING => acc | AUTH_PERSON_2,
        _ => acc,
    })
}
