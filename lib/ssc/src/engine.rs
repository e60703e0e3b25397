//! Self-service engine
//!
//! Owns the token session, the presence observer and the session context, and
//! routes every orchestration outcome to the operator callback. Removing the
//! token discards the whole context; the next call starts again from detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::client::{Gateway, SscClient};
use crate::config::SscConfig;
use crate::personalization::{PersonalizationOrchestrator, PersonalizationSettings};
use crate::reconciler::{CardReport, check_card};
use crate::session::SessionContext;
use crate::status::{ErrorKind, InputKind, OperatorCallback, Outcome, StatusReport};
use crate::token::{
    DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, DEFAULT_PRESENCE_INTERVAL, Presence,
    PresenceWatcher, TokenDriver, TokenSession,
};
use crate::unblock::UnblockOrchestrator;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub presence_interval: Duration,
    pub personalization: PersonalizationSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            personalization: PersonalizationSettings::default(),
        }
    }
}

impl From<&SscConfig> for EngineSettings {
    fn from(config: &SscConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            presence_interval: config.presence_interval,
            personalization: PersonalizationSettings {
                server_wait: config.server_wait,
                max_server_rounds: config.max_server_rounds,
            },
        }
    }
}

pub struct SelfService {
    gateway: Arc<dyn Gateway>,
    driver: Arc<dyn TokenDriver>,
    settings: EngineSettings,
    watcher: Option<PresenceWatcher>,
    token: TokenSession,
    ctx: Option<SessionContext>,
    personalization: PersonalizationOrchestrator,
    unblock: UnblockOrchestrator,
}

impl SelfService {
    pub fn new(gateway: Arc<dyn Gateway>, driver: Arc<dyn TokenDriver>, settings: EngineSettings) -> Self {
        Self {
            token: TokenSession::with_timing(
                Arc::clone(&driver),
                settings.poll_interval,
                settings.poll_timeout,
            ),
            personalization: PersonalizationOrchestrator::with_settings(
                Arc::clone(&gateway),
                settings.personalization,
            ),
            unblock: UnblockOrchestrator::new(Arc::clone(&gateway)),
            gateway,
            driver,
            settings,
            watcher: None,
            ctx: None,
        }
    }

    /// Engine talking HTTP to the configured backend.
    pub fn from_config(config: &SscConfig, driver: Arc<dyn TokenDriver>) -> Self {
        let client = SscClient::with_timeout(&config.server_url, config.request_timeout);
        Self::new(Arc::new(client), driver, EngineSettings::from(config))
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.ctx.as_ref()
    }

    pub fn presence(&self) -> Option<Presence> {
        self.watcher.as_ref().map(PresenceWatcher::current)
    }

    /// Fetch the card status and report the action the operator should take next.
    pub async fn check_status(
        &mut self,
        callback: &mut dyn OperatorCallback,
    ) -> Result<CardReport, ErrorKind> {
        let result = match self.open().await {
            Ok(()) => self.check_open_card().await,
            Err(kind) => Err(kind),
        };
        match result {
            Ok(report) => {
                callback.status(&StatusReport::from(&report.decision.action));
                Ok(report)
            }
            Err(kind) => {
                let outcome = Outcome::Failed(kind.clone());
                self.settle(&outcome);
                callback.status(&StatusReport::from(&outcome));
                Err(kind)
            }
        }
    }

    /// Run personalization until it needs the operator or ends.
    pub async fn personalize(&mut self, callback: &mut dyn OperatorCallback) -> Outcome {
        if let Err(kind) = self.open().await {
            return self.fail(kind, callback);
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return self.fail(ErrorKind::TokenRemoved, callback);
        };
        let outcome = self.personalization.run(&mut self.token, ctx, callback).await;
        self.settle(&outcome);
        outcome
    }

    /// Answer a `selectAccount` prompt and continue personalization.
    pub async fn select_account(&mut self, account: &str, callback: &mut dyn OperatorCallback) -> Outcome {
        let accepted = match self.ctx.as_mut() {
            Some(ctx) => self.personalization.select_account(ctx, account),
            None => false,
        };
        if !accepted {
            let outcome = Outcome::AwaitingInput(InputKind::SelectAccount {
                accounts: self.personalization.offered_accounts().to_vec(),
            });
            callback.status(&StatusReport::from(&outcome));
            return outcome;
        }
        self.personalize(callback).await
    }

    pub async fn start_unblock(
        &mut self,
        email1: &str,
        email2: &str,
        callback: &mut dyn OperatorCallback,
    ) -> Outcome {
        if let Err(kind) = self.open().await {
            return self.fail(kind, callback);
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return self.fail(ErrorKind::TokenRemoved, callback);
        };
        let outcome = self.unblock.initiate(ctx, email1, email2).await;
        self.report(outcome, callback)
    }

    pub async fn verify_unblock(
        &mut self,
        new_pin: &str,
        auth1_code: &str,
        auth2_code: &str,
        callback: &mut dyn OperatorCallback,
    ) -> Outcome {
        if let Err(kind) = self.open().await {
            return self.fail(kind, callback);
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return self.fail(ErrorKind::TokenRemoved, callback);
        };
        let outcome = self
            .unblock
            .verify(&mut self.token, ctx, new_pin, auth1_code, auth2_code)
            .await;
        self.report(outcome, callback)
    }

    /// Drop all session state. Credentials are wiped with the context.
    pub fn discard(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            info!(token_id = %ctx.token_id, "Discarding session");
        }
        self.token.reset();
        self.personalization =
            PersonalizationOrchestrator::with_settings(Arc::clone(&self.gateway), self.settings.personalization);
    }

    /// Make sure a context exists for the token currently inserted.
    async fn open(&mut self) -> Result<(), ErrorKind> {
        if self.watcher.is_none() {
            let watcher = PresenceWatcher::spawn(Arc::clone(&self.driver), self.settings.presence_interval);
            self.token = TokenSession::with_timing(
                Arc::clone(&self.driver),
                self.settings.poll_interval,
                self.settings.poll_timeout,
            )
            .with_presence(watcher.subscribe());
            self.watcher = Some(watcher);
        }

        if let (Some(watcher), Some(ctx)) = (&self.watcher, &self.ctx)
            && watcher.current().is_removed(Some(&ctx.token_id))
        {
            warn!(token_id = %ctx.token_id, "Token removed since last step");
            self.discard();
            return Err(ErrorKind::TokenRemoved);
        }

        if self.ctx.is_none() {
            let token_id = self.token.detect().await?;
            let mut ctx = SessionContext::new(&token_id);
            if let Some(card_type) = self.token.token_type() {
                ctx = ctx.with_card_type(card_type);
            }
            info!(token_id = %token_id, card_type = ?ctx.card_type, "Token detected");
            self.ctx = Some(ctx);
        }
        Ok(())
    }

    async fn check_open_card(&mut self) -> Result<CardReport, ErrorKind> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(ErrorKind::TokenRemoved);
        };
        let report = check_card(self.gateway.as_ref(), &ctx.token_id, Utc::now()).await?;
        if let Some(perso) = &report.decision.active_personalization {
            ctx.perso_wf_id = Some(perso.serial.clone());
        }
        if let Some(unblock) = &report.decision.active_unblock {
            ctx.unblock_wf_id = Some(unblock.serial.clone());
            ctx.auth1_email = unblock.auth1_email.clone();
            ctx.auth2_email = unblock.auth2_email.clone();
        }
        Ok(report)
    }

    /// Token loss and lost backend sessions invalidate everything we hold.
    fn settle(&mut self, outcome: &Outcome) {
        if matches!(
            outcome,
            Outcome::Failed(ErrorKind::TokenRemoved) | Outcome::Failed(ErrorKind::SessionInvalid)
        ) {
            self.discard();
        }
    }

    fn report(&mut self, outcome: Outcome, callback: &mut dyn OperatorCallback) -> Outcome {
        self.settle(&outcome);
        callback.status(&StatusReport::from(&outcome));
        outcome
    }

    fn fail(&mut self, kind: ErrorKind, callback: &mut dyn OperatorCallback) -> Outcome {
        self.report(Outcome::Failed(kind), callback)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::{Endpoint, ScriptedGateway};
    use crate::reconciler::NextAction;
    use crate::status::{StatusCode, StatusDetail};
    use crate::token::SoftwareToken;

    fn engine(gateway: &Arc<ScriptedGateway>, driver: &Arc<SoftwareToken>) -> SelfService {
        SelfService::new(
            gateway.clone(),
            driver.clone(),
            EngineSettings {
                poll_interval: Duration::from_millis(10),
                poll_timeout: Duration::from_secs(5),
                presence_interval: Duration::from_millis(50),
                personalization: PersonalizationSettings {
                    server_wait: Duration::from_millis(10),
                    max_server_rounds: 3,
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_status_reports_action_and_tracks_workflow() {
        let gateway = Arc::new(ScriptedGateway::new());
        let driver = Arc::new(SoftwareToken::new("tok-1"));
        gateway.push_json(json!({
            "card_status": "activated",
            "overall_status": "amber",
            "workflows": [
                {"serial": "p7", "type": "PERSONALIZATION", "state": "CERT_TO_INSTALL", "last_update": 10, "token_id": "tok-1"},
            ],
        }));
        let mut service = engine(&gateway, &driver);

        let mut reports = Vec::new();
        let report = service
            .check_status(&mut |r: &StatusReport| reports.push(r.clone()))
            .await
            .unwrap();

        assert_eq!(
            report.decision.action,
            NextAction::ContinuePersonalization {
                wf_id: "p7".to_string()
            }
        );
        assert_eq!(reports[0].code, StatusCode::ContPerso);
        assert_eq!(
            service.context().unwrap().perso_wf_id.as_deref(),
            Some("p7")
        );
        assert_eq!(gateway.requests()[0].get("tokenID"), Some("tok-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_removal_discards_session() {
        let gateway = Arc::new(ScriptedGateway::new());
        let driver = Arc::new(SoftwareToken::new("tok-1"));
        gateway.push_json(json!({"card_status": "activated", "overall_status": "red"}));
        let mut service = engine(&gateway, &driver);
        let mut noop = |_: &StatusReport| {};

        service.check_status(&mut noop).await.unwrap();
        assert_eq!(service.context().unwrap().token_id, "tok-1");

        driver.remove();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.presence(), Some(Presence::Absent));

        let mut reports = Vec::new();
        let outcome = service
            .personalize(&mut |r: &StatusReport| reports.push(r.clone()))
            .await;
        assert_eq!(outcome, Outcome::Failed(ErrorKind::TokenRemoved));
        assert!(service.context().is_none());
        assert_eq!(reports[0].code, StatusCode::TokenRemoved);
        assert_eq!(reports[0].detail, Some(StatusDetail::SupportCode(1004)));
        assert_eq!(gateway.count(Endpoint::ServerPersonalization, None), 0);

        driver.insert("tok-2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        gateway.push_json(json!({"card_status": "deactivated"}));
        let report = service.check_status(&mut noop).await.unwrap();
        assert_eq!(report.decision.action, NextAction::CardDeactivated);
        assert_eq!(service.context().unwrap().token_id, "tok-2");
        assert_eq!(gateway.count(Endpoint::GetCardStatus, None), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_forces_fresh_detection() {
        let gateway = Arc::new(ScriptedGateway::new());
        let driver = Arc::new(SoftwareToken::new("tok-1"));
        gateway.push_json(json!({"error": crate::types::error::ERROR_TOKEN_MISMATCH}));
        let mut service = engine(&gateway, &driver);

        let mut codes = Vec::new();
        let outcome = service
            .personalize(&mut |r: &StatusReport| codes.push(r.code))
            .await;
        assert_eq!(outcome, Outcome::Failed(ErrorKind::SessionInvalid));
        assert_eq!(codes, vec![StatusCode::Reload]);
        assert!(service.context().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_account_is_prompted_again() {
        let gateway = Arc::new(ScriptedGateway::new());
        let driver = Arc::new(SoftwareToken::new("tok-1"));
        gateway.push_json(json!({"wf_state": "NEED_NON_ESCROW_CSR", "accounts": ["a", "b"]}));
        let mut service = engine(&gateway, &driver);
        let mut noop = |_: &StatusReport| {};

        let outcome = service.personalize(&mut noop).await;
        assert!(matches!(outcome, Outcome::AwaitingInput(InputKind::SelectAccount { .. })));

        let outcome = service.select_account("c", &mut noop).await;
        assert_eq!(
            outcome,
            Outcome::AwaitingInput(InputKind::SelectAccount {
                accounts: vec!["a".to_string(), "b".to_string()]
            })
        );
        assert_eq!(gateway.count(Endpoint::ServerPersonalization, None), 1);
    }
}
