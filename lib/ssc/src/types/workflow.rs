//! Backend workflow instances and their states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SUCCESS: &str = "SUCCESS";
pub const FAILURE: &str = "FAILURE";

pub const PEND_PIN_CHANGE: &str = "PEND_PIN_CHANGE";
pub const PEND_ACT_CODE: &str = "PEND_ACT_CODE";
pub const PUK_TO_INSTALL: &str = "PUK_TO_INSTALL";
pub const NEED_NON_ESCROW_CSR: &str = "NEED_NON_ESCROW_CSR";
pub const CERT_TO_INSTALL: &str = "CERT_TO_INSTALL";
pub const PKCS12_TO_INSTALL: &str = "PKCS12_TO_INSTALL";
pub const HAVE_CERT_TO_DELETE: &str = "HAVE_CERT_TO_DELETE";
pub const HAVE_TOKEN_OWNER: &str = "HAVE_TOKEN_OWNER";
pub const CAN_WRITE_PIN: &str = "CAN_WRITE_PIN";
pub const ISSUE_CERT: &str = "ISSUE_CERT";
pub const HAVE_CERT_TO_PUBLISH: &str = "HAVE_CERT_TO_PUBLISH";
pub const HAVE_CERT_TO_UNPUBLISH: &str = "HAVE_CERT_TO_UNPUBLISH";

/// Workflow states that are safe to resume, in workflow order.
pub const STATE_WHITELIST: [&str; 12] = [
    PEND_PIN_CHANGE,
    PEND_ACT_CODE,
    PUK_TO_INSTALL,
    NEED_NON_ESCROW_CSR,
    CERT_TO_INSTALL,
    PKCS12_TO_INSTALL,
    HAVE_CERT_TO_DELETE,
    HAVE_TOKEN_OWNER,
    CAN_WRITE_PIN,
    ISSUE_CERT,
    HAVE_CERT_TO_PUBLISH,
    HAVE_CERT_TO_UNPUBLISH,
];

pub fn is_whitelisted(state: &str) -> bool {
    STATE_WHITELIST.contains(&state)
}

pub fn is_terminal(state: &str) -> bool {
    state == SUCCESS || state == FAILURE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    Personalization,
    PinUnblock,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Personalization => "PERSONALIZATION",
            WorkflowType::PinUnblock => "PIN_UNBLOCK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    #[serde(deserialize_with = "super::wire::id")]
    pub serial: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub state: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth1_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth2_email: Option<String>,
}

impl WorkflowRecord {
    pub fn is_terminal(&self) -> bool {
        is_terminal(&self.state)
    }

    pub fn is_success(&self) -> bool {
        self.state == SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_excludes_terminal_states() {
        assert!(!is_whitelisted(SUCCESS));
        assert!(!is_whitelisted(FAILURE));
        assert!(is_whitelisted(CERT_TO_INSTALL));
        assert!(is_whitelisted(HAVE_CERT_TO_UNPUBLISH));
        assert!(!is_whitelisted("cert_to_install"));
    }

    #[test]
    fn test_workflow_record_json() {
        let json = r#"{
            "serial": "4711",
            "type": "PIN_UNBLOCK",
            "state": "PEND_ACT_CODE",
            "last_update": 1700000000,
            "token_id": "tok-1",
            "auth1_email": "a***@example.org"
        }"#;
        let record: WorkflowRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.workflow_type, WorkflowType::PinUnblock);
        assert_eq!(record.last_update.timestamp(), 1_700_000_000);
        assert_eq!(record.auth1_email.as_deref(), Some("a***@example.org"));
        assert!(record.auth2_email.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_numeric_serial_accepted() {
        let json = r#"{
            "serial": 4711,
            "type": "PERSONALIZATION",
            "state": "SUCCESS",
            "last_update": 1700000000
        }"#;
        let record: WorkflowRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.serial, "4711");
        assert!(record.is_success());
    }
}
