//! Backend response payloads

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::{AggregateHealth, CardStatus, UserRecord, WorkflowRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardStatusResponse {
    #[serde(default)]
    pub card_status: CardStatus,
    #[serde(default)]
    pub overall_status: AggregateHealth,
    #[serde(default)]
    pub user: UserRecord,
    #[serde(default)]
    pub workflows: Vec<WorkflowRecord>,
}

/// `msg` block carried by personalization responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "PARAMS", default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalizationResponse {
    #[serde(default)]
    pub wf_state: Option<String>,
    #[serde(rename = "perso_wfID", default, deserialize_with = "opt_id")]
    pub perso_wf_id: Option<String>,
    #[serde(rename = "serverPUK", default)]
    pub server_puk: Option<String>,
    #[serde(rename = "serverPUKAlt", default)]
    pub server_puk_alt: Option<String>,
    #[serde(rename = "serverPIN", default)]
    pub server_pin: Option<String>,
    #[serde(default)]
    pub cert_to_install: Option<String>,
    #[serde(default)]
    pub p12_password: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub msg: ServerMessage,
}

impl PersonalizationResponse {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.msg.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinResetStartResponse {
    #[serde(rename = "unblock_wfID", default, deserialize_with = "opt_id")]
    pub unblock_wf_id: Option<String>,
    #[serde(default)]
    pub auth1_email: Option<String>,
    #[serde(default)]
    pub auth2_email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinResetVerifyResponse {
    #[serde(rename = "serverPUK", default)]
    pub server_puk: Option<String>,
    #[serde(rename = "serverPIN", default)]
    pub server_pin: Option<String>,
}

/// Query-string bodies carry a lone value where JSON carries a list.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) if s.is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}

/// Workflow ids arrive as strings or as bare numbers depending on the backend.
#[derive(Deserialize)]
#[serde(untagged)]
enum Id {
    Text(String),
    Number(u64),
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        match id {
            Id::Text(s) => s,
            Id::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Id::deserialize(deserializer).map(String::from)
}

pub(crate) fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Id>::deserialize(deserializer)?.map(String::from))
}
