//! Software token - an in-memory stand-in for the hardware driver
//!
//! Emulates the driver's property contract and the PUK/PIN bookkeeping of a
//! card closely enough to exercise every orchestration path. No cryptography
//! happens here: generated "CSRs" are opaque placeholders.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use url::form_urlencoded;

use crate::error::SscError;

use super::{ParamList, PluginStatus, Property, TokenCommand, TokenDriver};

const PUK_RETRIES: u8 = 3;
const PIN_MIN_LEN: usize = 6;

struct Inner {
    token_id: Option<String>,
    puk: String,
    puk_retries: u8,
    pin: Option<String>,
    keys: BTreeMap<String, Option<String>>,
    next_key: u32,
    properties: BTreeMap<Property, String>,
    status: PluginStatus,
    working_polls: u32,
    remaining_polls: u32,
    status_reads: u64,
    scripted: VecDeque<(TokenCommand, String)>,
    log: Vec<TokenCommand>,
}

pub struct SoftwareToken {
    inner: Mutex<Inner>,
}

impl SoftwareToken {
    pub const CARD_TYPE: &'static str = "SoftwareToken";
    /// PUK a fresh token ships with.
    pub const TRANSPORT_PUK: &'static str = "00000000";

    pub fn new(token_id: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                token_id: Some(token_id.to_string()),
                puk: Self::TRANSPORT_PUK.to_string(),
                puk_retries: PUK_RETRIES,
                pin: None,
                keys: BTreeMap::new(),
                next_key: 1,
                properties: BTreeMap::new(),
                status: PluginStatus::IdleTokenPresent,
                working_polls: 0,
                remaining_polls: 0,
                status_reads: 0,
                scripted: VecDeque::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Report `WORKING` this many times before every command finishes.
    pub fn with_working_polls(self, polls: u32) -> Self {
        self.lock().working_polls = polls;
        self
    }

    pub fn with_puk(self, puk: &str) -> Self {
        self.lock().puk = puk.to_string();
        self
    }

    pub fn with_pin(self, pin: &str) -> Self {
        self.lock().pin = Some(pin.to_string());
        self
    }

    /// Make the next `command` fail with the given `Reason`, regardless of its inputs.
    pub fn fail_next(&self, command: TokenCommand, reason: &str) {
        self.lock().scripted.push_back((command, reason.to_string()));
    }

    pub fn remove(&self) {
        let mut inner = self.lock();
        inner.token_id = None;
        inner.status = PluginStatus::LookingForToken;
    }

    pub fn insert(&self, token_id: &str) {
        let mut inner = self.lock();
        inner.token_id = Some(token_id.to_string());
        inner.status = PluginStatus::IdleTokenPresent;
    }

    // ==================== Inspection ====================

    pub fn commands(&self) -> Vec<TokenCommand> {
        self.lock().log.clone()
    }

    pub fn puk(&self) -> String {
        self.lock().puk.clone()
    }

    pub fn pin(&self) -> Option<String> {
        self.lock().pin.clone()
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.lock().keys.keys().cloned().collect()
    }

    pub fn installed_certificates(&self) -> Vec<String> {
        self.lock().keys.values().flatten().cloned().collect()
    }

    pub fn is_puk_locked(&self) -> bool {
        self.lock().puk_retries == 0
    }

    pub fn status_reads(&self) -> u64 {
        self.lock().status_reads
    }

    pub fn property(&self, property: Property) -> Option<String> {
        self.lock().properties.get(&property).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TokenDriver for SoftwareToken {
    fn write(&self, property: Property, value: &str) -> Result<(), SscError> {
        let mut inner = self.lock();
        if inner.token_id.is_none() {
            return Err(SscError::Adapter("Token driver absent".to_string()));
        }
        match property {
            Property::PluginStatus | Property::TokenId => Err(SscError::DriverRejected {
                property: property.to_string(),
                reason: "read only".to_string(),
            }),
            Property::Request => {
                let command: TokenCommand = value.parse()?;
                inner.execute(command);
                Ok(())
            }
            _ => {
                inner.properties.insert(property, value.to_string());
                Ok(())
            }
        }
    }

    fn read(&self, property: Property) -> Option<String> {
        let mut inner = self.lock();
        inner.token_id.as_ref()?;
        match property {
            Property::PluginStatus => {
                inner.status_reads += 1;
                if inner.remaining_polls > 0 {
                    inner.remaining_polls -= 1;
                    return Some(PluginStatus::Working.as_str().to_string());
                }
                Some(inner.status.as_str().to_string())
            }
            Property::TokenId => inner.token_id.clone(),
            Property::CardType => Some(Self::CARD_TYPE.to_string()),
            other => Some(inner.properties.get(&other).cloned().unwrap_or_default()),
        }
    }
}

type CommandOutcome = Result<Vec<(&'static str, String)>, String>;

impl Inner {
    fn execute(&mut self, command: TokenCommand) {
        self.log.push(command);
        self.remaining_polls = self.working_polls;

        let scripted = if self.scripted.front().is_some_and(|(c, _)| *c == command) {
            self.scripted.pop_front().map(|(_, reason)| reason)
        } else {
            None
        };

        let outcome = match scripted {
            Some(reason) => Err(reason),
            None => self.apply(command),
        };

        let mut body = form_urlencoded::Serializer::new(String::new());
        match outcome {
            Ok(fields) => {
                body.append_pair("Result", "SUCCESS");
                for (k, v) in fields {
                    body.append_pair(k, &v);
                }
                self.status = PluginStatus::FinishedSuccess;
            }
            Err(reason) => {
                body.append_pair("Result", "ERROR");
                body.append_pair("Reason", &reason);
                self.status = PluginStatus::FinishedError;
            }
        }
        self.properties.insert(Property::Data, body.finish());
    }

    fn apply(&mut self, command: TokenCommand) -> CommandOutcome {
        let params = ParamList::decode(self.prop(Property::ParamList));
        match command {
            TokenCommand::GetTokenId => Ok(vec![(
                "TokenID",
                self.token_id.clone().unwrap_or_default(),
            )]),
            TokenCommand::GetCertificates => {
                let ids: Vec<String> = self.keys.keys().cloned().collect();
                Ok(vec![("KeyIDs", ids.join(","))])
            }
            TokenCommand::ChangePuk => {
                self.check_puk(params.get("PUK").unwrap_or(""))?;
                let new_puk = params.get("NewPUK").unwrap_or("");
                if new_puk.is_empty() {
                    return Err("PUKInvalid".to_string());
                }
                self.puk = new_puk.to_string();
                Ok(vec![])
            }
            TokenCommand::ResetPin => {
                self.check_puk(params.get("PUK").unwrap_or(""))?;
                let new_pin = self.prop(Property::NewPin).to_string();
                if new_pin.len() < PIN_MIN_LEN || !new_pin.chars().all(|c| c.is_ascii_digit()) {
                    return Err("TokenInternalError".to_string());
                }
                self.pin = Some(new_pin);
                Ok(vec![])
            }
            TokenCommand::GenerateKeypair => {
                self.check_pin()?;
                let key_id = format!("key-{}", self.next_key);
                self.next_key += 1;
                self.keys.insert(key_id.clone(), None);
                let subject = params.get("Subject").unwrap_or("CN=unknown").to_string();
                Ok(vec![
                    ("KeyID", key_id.clone()),
                    ("CSR", format!("CSR({};{})", key_id, subject)),
                ])
            }
            TokenCommand::ImportX509 | TokenCommand::ImportP12 => {
                self.check_pin()?;
                let data = self.prop(Property::Data).to_string();
                if data.is_empty() {
                    return Err("NoData".to_string());
                }
                let key_id = match params.get("KeyID") {
                    Some(id) => id.to_string(),
                    None => {
                        let id = format!("key-{}", self.next_key);
                        self.next_key += 1;
                        id
                    }
                };
                self.keys.insert(key_id.clone(), Some(data));
                Ok(vec![("KeyID", key_id)])
            }
            TokenCommand::DeleteUserData => {
                self.check_pin()?;
                let key_id = params.get("KeyID").unwrap_or("");
                match self.keys.remove(key_id) {
                    Some(_) => Ok(vec![]),
                    None => Err("KeyNotFound".to_string()),
                }
            }
            TokenCommand::ResetToken => {
                self.keys.clear();
                self.pin = None;
                self.puk = SoftwareToken::TRANSPORT_PUK.to_string();
                self.puk_retries = PUK_RETRIES;
                Ok(vec![])
            }
        }
    }

    fn prop(&self, property: Property) -> &str {
        self.properties
            .get(&property)
            .map(String::as_str)
            .unwrap_or("")
    }

    fn check_puk(&mut self, presented: &str) -> Result<(), String> {
        if self.puk_retries == 0 {
            return Err("PUKLockedError".to_string());
        }
        if presented != self.puk {
            self.puk_retries -= 1;
            return Err(if self.puk_retries == 0 {
                "PUKLockedError".to_string()
            } else {
                "PUKError".to_string()
            });
        }
        self.puk_retries = PUK_RETRIES;
        Ok(())
    }

    fn check_pin(&self) -> Result<(), String> {
        match &self.pin {
            Some(pin) if pin == self.prop(Property::UserPin) => Ok(()),
            _ => Err("PINError".to_string()),
        }
    }
}
