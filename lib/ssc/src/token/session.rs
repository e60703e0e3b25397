//! Token session - command execution over the polled driver status

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SscError;

use super::presence::{Presence, wait_for_removal};
use super::{PluginStatus, Property, TerminalStatus, TokenCommand, TokenDriver, TokenRequest, TokenResult};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// What a finished command left behind on the driver.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub status: TerminalStatus,
    pub token_id: String,
    pub card_type: String,
    pub result: TokenResult,
}

/// A detected token. At most one command is in flight because every call
/// borrows the session mutably until the driver reports a terminal status.
pub struct TokenSession {
    driver: Arc<dyn TokenDriver>,
    poll_interval: Duration,
    poll_timeout: Duration,
    presence: Option<watch::Receiver<Presence>>,
    token_id: Option<String>,
    token_type: Option<String>,
    status: PluginStatus,
    last_result: Option<String>,
}

impl TokenSession {
    pub fn new(driver: Arc<dyn TokenDriver>) -> Self {
        Self::with_timing(driver, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_timing(
        driver: Arc<dyn TokenDriver>,
        poll_interval: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            poll_interval,
            poll_timeout,
            presence: None,
            token_id: None,
            token_type: None,
            status: PluginStatus::LookingForToken,
            last_result: None,
        }
    }

    /// Abort polling as soon as the observer reports the token gone or swapped.
    pub fn with_presence(mut self, presence: watch::Receiver<Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    // ==================== Accessors ====================

    pub fn token_id(&self) -> Option<&str> {
        self.token_id.as_deref()
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    pub fn reset(&mut self) {
        self.token_id = None;
        self.token_type = None;
        self.status = PluginStatus::LookingForToken;
        self.last_result = None;
    }

    // ==================== Commands ====================

    /// Reads the token id and card type of the inserted token.
    pub async fn detect(&mut self) -> Result<String, SscError> {
        self.reset();
        let response = self
            .run_command(&TokenRequest::new(TokenCommand::GetTokenId))
            .await?;
        if !response.result.is_success() {
            return Err(SscError::Adapter(format!(
                "GetTokenID failed: {}",
                response.result.reason_str()
            )));
        }
        Ok(response.token_id)
    }

    /// Polls `PluginStatus` until the driver reports a terminal status.
    ///
    /// Bounded by the poll timeout and cut short when the token is removed.
    pub async fn poll_until_ready(&mut self) -> Result<TerminalStatus, SscError> {
        let poll = poll_terminal(Arc::clone(&self.driver), self.poll_interval);
        let mut presence = self.presence.clone();
        let token_id = self.token_id.clone();

        let watched = async move {
            match presence.as_mut() {
                Some(rx) => tokio::select! {
                    result = poll => result,
                    _ = wait_for_removal(rx, token_id.as_deref()) => Err(SscError::TokenRemoved),
                },
                None => poll.await,
            }
        };

        match tokio::time::timeout(self.poll_timeout, watched).await {
            Ok(Ok(terminal)) => {
                self.status = terminal.into();
                Ok(terminal)
            }
            Ok(Err(e)) => {
                self.status = PluginStatus::Unrecognized;
                Err(e)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.poll_timeout.as_millis() as u64,
                    "Token poll timed out"
                );
                Err(SscError::PollTimeout(self.poll_timeout.as_millis() as u64))
            }
        }
    }

    pub async fn run_command(&mut self, request: &TokenRequest) -> Result<CommandResponse, SscError> {
        let polled = match self.issue(request) {
            Ok(()) => self.poll_until_ready().await,
            Err(e) => Err(e),
        };
        self.scrub_request(request);
        let status = polled?;

        let token_id = self.read_required(Property::TokenId)?;
        let card_type = self.read_required(Property::CardType)?;
        let raw = self.read_required(Property::Data)?;

        let result = TokenResult::decode(&raw, status)?;
        debug!(
            command = request.command.as_str(),
            success = result.is_success(),
            reason = result.reason_str(),
            "Token command finished"
        );

        self.token_id = Some(token_id.clone());
        self.token_type = Some(card_type.clone());
        self.last_result = Some(raw);

        Ok(CommandResponse {
            status,
            token_id,
            card_type,
            result,
        })
    }

    /// Writes the request properties, `Request` last since it starts the command.
    fn issue(&mut self, request: &TokenRequest) -> Result<(), SscError> {
        if let Some(card_type) = &self.token_type {
            self.driver.write(Property::CardType, card_type)?;
        }
        self.driver
            .write(Property::ParamList, request.params.encode().as_str())?;
        self.driver
            .write(Property::Data, request.data.as_deref().unwrap_or(""))?;
        if let Some(pin) = &request.user_pin {
            self.driver.write(Property::UserPin, pin)?;
        }
        if let Some(pin) = &request.new_pin {
            self.driver.write(Property::NewPin, pin)?;
        }

        debug!(command = request.command.as_str(), "Issuing token command");
        self.status = PluginStatus::Working;
        self.driver
            .write(Property::Request, request.command.as_str())
    }

    fn read_required(&self, property: Property) -> Result<String, SscError> {
        self.driver
            .read(property)
            .ok_or_else(|| SscError::Adapter(format!("{} unreadable", property)))
    }

    /// PIN properties must not outlive the command that needed them.
    fn scrub_request(&self, request: &TokenRequest) {
        let mut scrub = vec![Property::ParamList];
        if request.user_pin.is_some() {
            scrub.push(Property::UserPin);
        }
        if request.new_pin.is_some() {
            scrub.push(Property::NewPin);
        }
        for property in scrub {
            if let Err(e) = self.driver.write(property, "") {
                warn!(property = property.as_str(), error = %e, "Failed to clear token property");
            }
        }
    }
}

async fn poll_terminal(
    driver: Arc<dyn TokenDriver>,
    interval: Duration,
) -> Result<TerminalStatus, SscError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let raw = driver
            .read(Property::PluginStatus)
            .ok_or_else(|| SscError::Adapter("PluginStatus unreadable".to_string()))?;
        let status = PluginStatus::parse(&raw);
        if let Some(terminal) = status.terminal() {
            return Ok(terminal);
        }
        if status == PluginStatus::Unrecognized {
            debug!(status = %raw, "Unrecognized plugin status, polling again");
        }
    }
}
