//! Dual-Authorization Unblock Orchestrator
//!
//! Phase one names the two authorizers, phase two presents their codes with
//! the new PIN. The PUK released by a successful verification is kept in the
//! session and reused for every local `ResetPIN` retry of the same cycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::client::{Endpoint, Gateway, Payload, ServerResponse};
use crate::error::SscError;
use crate::personalization::reset_pin;
use crate::reconciler::check_card;
use crate::session::{CredentialMaterial, SessionContext};
use crate::status::{Completion, ErrorKind, InputKind, Outcome};
use crate::token::{TokenReason, TokenSession};
use crate::types::error::{ERROR_AUTHCODES_INCORRECT, classify_all, invalid_auth_person_fields};
use crate::types::{BackendErrorClass, PinResetStartResponse, PinResetVerifyResponse};

/// Both authorizer fields, for prompts where the backend named neither.
const BOTH_AUTH_PERSONS: u8 = 3;

pub struct UnblockOrchestrator {
    gateway: Arc<dyn Gateway>,
}

impl UnblockOrchestrator {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Phase one: register the two authorizers for an unblock of this token.
    ///
    /// Starts a fresh authorization cycle, so any PUK released earlier is dropped.
    pub async fn initiate(&self, ctx: &mut SessionContext, email1: &str, email2: &str) -> Outcome {
        ctx.clear_unblock_credentials();

        let mut payload = Payload::new()
            .field("tokenID", &ctx.token_id)
            .field("email1", email1)
            .field("email2", email2);
        if let Some(wf_id) = &ctx.unblock_wf_id {
            payload = payload.field("unblock_wfID", wf_id);
        }

        let response = match self.request(Endpoint::StartPinReset, payload).await {
            Ok(response) => response,
            Err(kind) => return Outcome::Failed(kind),
        };

        let errors = response.errors();
        if !errors.is_empty() {
            warn!(?errors, "Unblock initiation rejected");
            return match classify_all(errors.iter().map(String::as_str)) {
                Some(BackendErrorClass::InputValidation)
                | Some(BackendErrorClass::WorkflowPrecondition) => {
                    let invalid = match invalid_auth_person_fields(errors.iter().map(String::as_str)) {
                        0 => BOTH_AUTH_PERSONS,
                        flags => flags,
                    };
                    Outcome::AwaitingInput(InputKind::AuthPersons { invalid })
                }
                _ => Outcome::Failed(ErrorKind::from_backend(errors)),
            };
        }

        let started: PinResetStartResponse = match response.decode() {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let Some(wf_id) = started.unblock_wf_id.filter(|id| !id.is_empty()) else {
            return Outcome::Failed(SscError::Protocol("unblock_wfID missing".to_string()).into());
        };

        info!(workflow = %wf_id, "Unblock workflow started");
        ctx.unblock_wf_id = Some(wf_id);
        ctx.auth1_email = started.auth1_email;
        ctx.auth2_email = started.auth2_email;

        self.awaiting_codes(ctx, false)
    }

    /// Phase two: verify both codes, then reset the PIN with the released PUK.
    pub async fn verify(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
        new_pin: &str,
        auth1_code: &str,
        auth2_code: &str,
    ) -> Outcome {
        let Some(wf_id) = ctx.unblock_wf_id.clone() else {
            debug!("No unblock workflow in this session, asking for authorizers");
            return Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 0 });
        };

        let credentials = match ctx.released_puk(&wf_id).cloned() {
            Some(credentials) => {
                debug!(workflow = %wf_id, "Reusing PUK released earlier in this cycle");
                credentials
            }
            None => match self.release_puk(ctx, &wf_id, auth1_code, auth2_code).await {
                Ok(credentials) => credentials,
                Err(outcome) => return outcome,
            },
        };

        let result = match reset_pin(token, credentials.puk(), new_pin).await {
            Ok(response) => response,
            Err(e) => {
                warn!(workflow = %wf_id, error = %e, "PIN reset did not complete");
                ctx.clear_unblock_credentials();
                return Outcome::Failed(e.into());
            }
        };

        if !result.is_success() {
            return match result.reason {
                Some(TokenReason::TokenInternal) => self.abort(ctx, &wf_id, ErrorKind::PinPolicy).await,
                Some(TokenReason::PukLocked) => self.abort(ctx, &wf_id, ErrorKind::PukLocked).await,
                _ => {
                    warn!(reason = result.reason_str(), "New PIN rejected, awaiting another");
                    Outcome::AwaitingInput(InputKind::NewPin)
                }
            };
        }

        info!(workflow = %wf_id, "PIN reset on token");
        if let Err(kind) = self.confirm(ctx, &wf_id, true).await {
            ctx.clear_unblock_credentials();
            return Outcome::Failed(kind);
        }
        ctx.clear_unblock_credentials();
        ctx.unblock_wf_id = None;

        match check_card(self.gateway.as_ref(), &ctx.token_id, Utc::now()).await {
            Ok(report) => Outcome::Succeeded(Completion::Unblocked {
                next: report.decision.action,
            }),
            Err(kind) => Outcome::Failed(kind),
        }
    }

    async fn release_puk(
        &self,
        ctx: &mut SessionContext,
        wf_id: &str,
        auth1_code: &str,
        auth2_code: &str,
    ) -> Result<CredentialMaterial, Outcome> {
        let payload = Payload::new()
            .field("tokenID", &ctx.token_id)
            .field("unblock_wfID", wf_id)
            .field("auth1_code", auth1_code)
            .field("auth2_code", auth2_code);
        let response = self
            .request(Endpoint::PinResetVerify, payload)
            .await
            .map_err(Outcome::Failed)?;

        let errors = response.errors();
        if !errors.is_empty() {
            warn!(?errors, "Authorization codes rejected");
            return Err(match classify_all(errors.iter().map(String::as_str)) {
                Some(BackendErrorClass::InputValidation)
                    if errors.iter().any(|e| e == ERROR_AUTHCODES_INCORRECT) =>
                {
                    self.awaiting_codes(ctx, true)
                }
                Some(BackendErrorClass::InputValidation) => {
                    let invalid = invalid_auth_person_fields(errors.iter().map(String::as_str));
                    Outcome::AwaitingInput(InputKind::AuthPersons { invalid })
                }
                Some(BackendErrorClass::WorkflowPrecondition) => {
                    // The cycle has to start over from the authorizers.
                    ctx.unblock_wf_id = None;
                    Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 0 })
                }
                _ => Outcome::Failed(ErrorKind::from_backend(errors)),
            });
        }

        let verified: PinResetVerifyResponse =
            response.decode().map_err(|e| Outcome::Failed(e.into()))?;
        let Some(puk) = verified.server_puk.as_deref().filter(|p| !p.is_empty()) else {
            return Err(Outcome::Failed(
                SscError::Protocol("serverPUK missing".to_string()).into(),
            ));
        };

        let credentials = CredentialMaterial::new(puk, None, verified.server_pin.as_deref());
        ctx.unblock_credentials = Some((wf_id.to_string(), credentials.clone()));
        info!(workflow = %wf_id, "Authorization codes accepted, PUK released");
        Ok(credentials)
    }

    async fn confirm(&self, ctx: &SessionContext, wf_id: &str, ok: bool) -> Result<(), ErrorKind> {
        let payload = Payload::new()
            .field("tokenID", &ctx.token_id)
            .field("unblock_wfID", wf_id)
            .field("result", if ok { "ok" } else { "err" });
        let response = self.request(Endpoint::PinResetConfirm, payload).await?;
        let errors = response.errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorKind::from_backend(errors))
        }
    }

    /// Terminal token failure: tell the backend, forget the cycle.
    async fn abort(&self, ctx: &mut SessionContext, wf_id: &str, kind: ErrorKind) -> Outcome {
        error!(workflow = %wf_id, support_code = kind.support_code(), "Unblock failed on token");
        if let Err(e) = self.confirm(ctx, wf_id, false).await {
            warn!(error = ?e, "Failed to report unblock failure");
        }
        ctx.clear_unblock_credentials();
        ctx.unblock_wf_id = None;
        Outcome::Failed(kind)
    }

    fn awaiting_codes(&self, ctx: &SessionContext, rejected: bool) -> Outcome {
        Outcome::AwaitingInput(InputKind::AuthCodes {
            auth1: ctx.auth1_email.clone(),
            auth2: ctx.auth2_email.clone(),
            rejected,
        })
    }

    async fn request(&self, endpoint: Endpoint, payload: Payload) -> Result<ServerResponse, ErrorKind> {
        Ok(self.gateway.request(endpoint, payload).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::client::ScriptedGateway;
    use crate::reconciler::NextAction;
    use crate::token::{SoftwareToken, TokenCommand};
    use crate::types::error::{
        ERROR_AUTHPERSON2_INVALID, ERROR_NOT_TOKEN_OWNER, ERROR_WRONG_STATE,
    };

    const PUK: &str = "87654321";
    const NEW_PIN: &str = "135790";

    async fn setup() -> (Arc<ScriptedGateway>, Arc<SoftwareToken>, TokenSession, SessionContext) {
        let gateway = Arc::new(ScriptedGateway::new());
        let driver = Arc::new(SoftwareToken::new("tok-1").with_puk(PUK).with_pin("000000"));
        let mut token =
            TokenSession::with_timing(driver.clone(), Duration::from_millis(10), Duration::from_secs(5));
        let token_id = token.detect().await.unwrap();
        (gateway, driver, token, SessionContext::new(&token_id))
    }

    fn started(gateway: &ScriptedGateway) {
        gateway.push_json(json!({
            "unblock_wfID": "ub-1",
            "auth1_email": "a***@example.org",
            "auth2_email": "b***@example.org",
        }));
    }

    fn released(gateway: &ScriptedGateway) {
        gateway.push_json(json!({"serverPUK": PUK, "serverPIN": "999999"}));
    }

    fn card_status(gateway: &ScriptedGateway) {
        gateway.push_json(json!({
            "card_status": "activated",
            "overall_status": "green",
            "workflows": [
                {"serial": "p1", "type": "PERSONALIZATION", "state": "SUCCESS", "last_update": 100, "token_id": "tok-1"},
                {"serial": "ub-1", "type": "PIN_UNBLOCK", "state": "SUCCESS", "last_update": 200, "token_id": "tok-1"},
            ],
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_returns_masked_addresses() {
        let (gateway, _driver, _token, mut ctx) = setup().await;
        started(&gateway);
        let unblock = UnblockOrchestrator::new(gateway.clone());

        let outcome = unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;
        assert_eq!(
            outcome,
            Outcome::AwaitingInput(InputKind::AuthCodes {
                auth1: Some("a***@example.org".to_string()),
                auth2: Some("b***@example.org".to_string()),
                rejected: false,
            })
        );
        assert_eq!(ctx.unblock_wf_id.as_deref(), Some("ub-1"));
        assert_eq!(gateway.requests()[0].get("email2"), Some("bob@example.org"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_flags_invalid_authorizer() {
        let (gateway, _driver, _token, mut ctx) = setup().await;
        gateway.push_json(json!({"errors": [ERROR_AUTHPERSON2_INVALID]}));
        gateway.push_json(json!({"error": ERROR_WRONG_STATE}));
        gateway.push_json(json!({"error": ERROR_NOT_TOKEN_OWNER}));
        let unblock = UnblockOrchestrator::new(gateway.clone());

        assert_eq!(
            unblock.initiate(&mut ctx, "a@example.org", "x@example.org").await,
            Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 2 })
        );
        assert_eq!(
            unblock.initiate(&mut ctx, "a@example.org", "x@example.org").await,
            Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 3 })
        );
        assert_eq!(
            unblock.initiate(&mut ctx, "a@example.org", "x@example.org").await,
            Outcome::Failed(ErrorKind::SessionInvalid)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incorrect_codes_then_reuse_released_puk() {
        let (gateway, driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        started(&gateway);
        unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;

        gateway.push_json(json!({"errors": [ERROR_AUTHCODES_INCORRECT]}));
        let outcome = unblock.verify(&mut token, &mut ctx, NEW_PIN, "111", "222").await;
        assert!(matches!(
            outcome,
            Outcome::AwaitingInput(InputKind::AuthCodes { rejected: true, .. })
        ));
        assert!(ctx.unblock_credentials.is_none());
        assert!(!driver.commands().contains(&TokenCommand::ResetPin));

        released(&gateway);
        driver.fail_next(TokenCommand::ResetPin, "PINError");
        let outcome = unblock.verify(&mut token, &mut ctx, NEW_PIN, "123", "456").await;
        assert_eq!(outcome, Outcome::AwaitingInput(InputKind::NewPin));
        assert!(ctx.unblock_credentials.is_some());

        gateway.push_json(json!({}));
        card_status(&gateway);
        let outcome = unblock.verify(&mut token, &mut ctx, NEW_PIN, "123", "456").await;
        assert_eq!(
            outcome,
            Outcome::Succeeded(Completion::Unblocked {
                next: NextAction::ShowStatus
            })
        );

        assert_eq!(gateway.count(Endpoint::PinResetVerify, None), 2);
        assert_eq!(gateway.count(Endpoint::PinResetConfirm, None), 1);
        assert_eq!(driver.pin().as_deref(), Some(NEW_PIN));
        assert!(ctx.unblock_credentials.is_none());
        assert!(ctx.unblock_wf_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_policy_is_terminal() {
        let (gateway, driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        started(&gateway);
        unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;

        released(&gateway);
        gateway.push_json(json!({}));
        let outcome = unblock.verify(&mut token, &mut ctx, "12", "123", "456").await;
        assert_eq!(outcome, Outcome::Failed(ErrorKind::PinPolicy));

        let confirm = gateway
            .requests()
            .into_iter()
            .find(|r| r.endpoint == Endpoint::PinResetConfirm)
            .unwrap();
        assert_eq!(confirm.get("result"), Some("err"));
        assert!(ctx.unblock_credentials.is_none());
        assert_eq!(driver.pin().as_deref(), Some("000000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_cycle_drops_released_puk() {
        let (gateway, _driver, _token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        ctx.unblock_wf_id = Some("ub-0".to_string());
        ctx.unblock_credentials = Some(("ub-0".to_string(), CredentialMaterial::new(PUK, None, None)));

        started(&gateway);
        unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;
        assert!(ctx.unblock_credentials.is_none());
        assert_eq!(gateway.requests()[0].get("unblock_wfID"), Some("ub-0"));
        assert_eq!(ctx.unblock_wf_id.as_deref(), Some("ub-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_without_workflow_asks_for_authorizers() {
        let (gateway, _driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        assert_eq!(
            unblock.verify(&mut token, &mut ctx, NEW_PIN, "1", "2").await,
            Outcome::AwaitingInput(InputKind::AuthPersons { invalid: 0 })
        );
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_personalization_puk_never_skips_code_check() {
        let (gateway, driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        ctx.credentials = Some(CredentialMaterial::new(PUK, None, Some("999999")));
        started(&gateway);
        unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;

        gateway.push_json(json!({"errors": [ERROR_AUTHCODES_INCORRECT]}));
        let outcome = unblock.verify(&mut token, &mut ctx, NEW_PIN, "bogus", "bogus").await;
        assert!(matches!(
            outcome,
            Outcome::AwaitingInput(InputKind::AuthCodes { rejected: true, .. })
        ));
        assert_eq!(gateway.count(Endpoint::PinResetVerify, None), 1);
        assert!(!driver.commands().contains(&TokenCommand::ResetPin));
        assert_eq!(driver.pin().as_deref(), Some("000000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_puk_released_for_other_workflow_not_reused() {
        let (gateway, driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        ctx.unblock_wf_id = Some("ub-2".to_string());
        ctx.unblock_credentials = Some(("ub-1".to_string(), CredentialMaterial::new(PUK, None, None)));

        gateway.push_json(json!({"errors": [ERROR_AUTHCODES_INCORRECT]}));
        unblock.verify(&mut token, &mut ctx, NEW_PIN, "1", "2").await;
        let verify = gateway
            .requests()
            .into_iter()
            .find(|r| r.endpoint == Endpoint::PinResetVerify)
            .unwrap();
        assert_eq!(verify.get("unblock_wfID"), Some("ub-2"));
        assert!(!driver.commands().contains(&TokenCommand::ResetPin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_transport_failure_drops_released_puk() {
        let (gateway, driver, mut token, mut ctx) = setup().await;
        let unblock = UnblockOrchestrator::new(gateway.clone());
        started(&gateway);
        unblock.initiate(&mut ctx, "alice@example.org", "bob@example.org").await;

        released(&gateway);
        driver.remove();
        let outcome = unblock.verify(&mut token, &mut ctx, NEW_PIN, "123", "456").await;
        assert!(matches!(outcome, Outcome::Failed(ErrorKind::Transport { .. })));
        assert!(ctx.unblock_credentials.is_none());
        assert_eq!(ctx.unblock_wf_id.as_deref(), Some("ub-1"));
    }
}
