//! Personalization Orchestrator
//!
//! Drives the backend personalization workflow one round trip per [`step`]:
//! post the pending report, read the new `wf_state`, run whatever token
//! command that state needs and queue the report for the next round.
//!
//! [`step`]: PersonalizationOrchestrator::step

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::client::{Endpoint, Gateway, Payload};
use crate::error::SscError;
use crate::session::{CredentialMaterial, SessionContext};
use crate::status::{Completion, ErrorKind, InputKind, OperatorCallback, Outcome, StatusReport};
use crate::token::{TokenCommand, TokenReason, TokenRequest, TokenResult, TokenSession};
use crate::types::PersonalizationResponse;
use crate::types::workflow::{
    CAN_WRITE_PIN, CERT_TO_INSTALL, HAVE_CERT_TO_DELETE, HAVE_CERT_TO_PUBLISH,
    HAVE_CERT_TO_UNPUBLISH, HAVE_TOKEN_OWNER, ISSUE_CERT, NEED_NON_ESCROW_CSR, PEND_ACT_CODE,
    PEND_PIN_CHANGE, PKCS12_TO_INSTALL, PUK_TO_INSTALL, SUCCESS,
};

/// Backend PUK fetches allowed per run: the first one plus a single retry.
/// A third PUK attempt on the token risks locking it for good.
pub const MAX_PUK_REQUESTS: u8 = 2;

pub const DEFAULT_SERVER_WAIT: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_SERVER_ROUNDS: u32 = 30;

/// `wf_action` values reported to `server_personalization`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowAction {
    Status,
    GetPuk,
    PukInstalled,
    PukInstallFailed,
    PinInstalled,
    UploadCsr,
    CertInstalled,
    CertInstallFailed,
    CertDeleted,
    CertDeleteFailed,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowAction::Status => "status",
            WorkflowAction::GetPuk => "get_puk",
            WorkflowAction::PukInstalled => "puk_inst_ok",
            WorkflowAction::PukInstallFailed => "puk_inst_err",
            WorkflowAction::PinInstalled => "pin_inst_ok",
            WorkflowAction::UploadCsr => "upload_csr",
            WorkflowAction::CertInstalled => "cert_inst_ok",
            WorkflowAction::CertInstallFailed => "cert_inst_err",
            WorkflowAction::CertDeleted => "cert_del_ok",
            WorkflowAction::CertDeleteFailed => "cert_del_err",
        }
    }

    fn payload(self) -> Payload {
        Payload::new().field("wf_action", self.as_str())
    }
}

/// States in which the backend is busy and the client only waits.
pub fn is_server_side(state: &str) -> bool {
    matches!(
        state,
        HAVE_TOKEN_OWNER
            | ISSUE_CERT
            | HAVE_CERT_TO_PUBLISH
            | HAVE_CERT_TO_UNPUBLISH
            | PEND_ACT_CODE
            | PEND_PIN_CHANGE
    )
}

/// Token failures nothing can recover from in this session.
///
/// `PUKError` and unclassified reasons pass; the caller decides between the
/// PUK fallback and reporting the failure to the backend.
pub(crate) fn fatal_reason(result: &TokenResult) -> Result<(), ErrorKind> {
    if result.is_success() {
        return Ok(());
    }
    match result.reason {
        Some(TokenReason::PukLocked) => Err(ErrorKind::PukLocked),
        Some(TokenReason::PukInvalid) => Err(ErrorKind::PukInvalid),
        Some(TokenReason::PinNotEncrypted) => Err(ErrorKind::PinNotEncrypted),
        Some(TokenReason::TokenInternal) => Err(ErrorKind::PinPolicy),
        Some(TokenReason::PukError) | Some(TokenReason::Other(_)) | None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PersonalizationSettings {
    /// Pause before re-fetching while the backend works on its own.
    pub server_wait: Duration,
    /// Consecutive server-side rounds tolerated before giving up.
    pub max_server_rounds: u32,
}

impl Default for PersonalizationSettings {
    fn default() -> Self {
        Self {
            server_wait: DEFAULT_SERVER_WAIT,
            max_server_rounds: DEFAULT_MAX_SERVER_ROUNDS,
        }
    }
}

pub struct PersonalizationOrchestrator {
    gateway: Arc<dyn Gateway>,
    settings: PersonalizationSettings,
    pending: Option<Payload>,
    server_rounds: u32,
    offered_accounts: Vec<String>,
}

impl PersonalizationOrchestrator {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_settings(gateway, PersonalizationSettings::default())
    }

    pub fn with_settings(gateway: Arc<dyn Gateway>, settings: PersonalizationSettings) -> Self {
        Self {
            gateway,
            settings,
            pending: None,
            server_rounds: 0,
            offered_accounts: Vec::new(),
        }
    }

    pub fn offered_accounts(&self) -> &[String] {
        &self.offered_accounts
    }

    /// Record the operator's account choice. Returns `false` if it was not offered.
    pub fn select_account(&mut self, ctx: &mut SessionContext, account: &str) -> bool {
        if !self.offered_accounts.iter().any(|a| a == account) {
            warn!(account, "Rejected selection of an account that was not offered");
            return false;
        }
        ctx.selected_account = Some(account.to_string());
        true
    }

    /// Step until the run needs the operator or ends. Every outcome other than
    /// `Resumed` is reported through `callback` before it is returned.
    pub async fn run(
        &mut self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
        callback: &mut dyn OperatorCallback,
    ) -> Outcome {
        loop {
            let outcome = self.step(token, ctx).await;
            if outcome != Outcome::Resumed {
                callback.status(&StatusReport::from(&outcome));
                return outcome;
            }
        }
    }

    /// One backend round trip plus the token work it asks for.
    pub async fn step(&mut self, token: &mut TokenSession, ctx: &mut SessionContext) -> Outcome {
        let outcome = match self.advance(token, ctx).await {
            Ok(outcome) => outcome,
            Err(kind) => Outcome::Failed(kind),
        };
        if outcome.is_terminal() {
            if let Outcome::Failed(kind) = &outcome {
                error!(
                    support_code = kind.support_code(),
                    workflow = ctx.perso_wf_id.as_deref().unwrap_or("-"),
                    "Personalization failed"
                );
            }
            ctx.end_run();
            self.pending = None;
            self.server_rounds = 0;
        }
        outcome
    }

    async fn advance(
        &mut self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
    ) -> Result<Outcome, ErrorKind> {
        let report = self
            .pending
            .take()
            .unwrap_or_else(|| WorkflowAction::Status.payload());
        let response = self.post(ctx, report).await?;
        let state = response.wf_state.clone().unwrap_or_default();

        if is_server_side(&state) {
            self.server_rounds += 1;
            if self.server_rounds > self.settings.max_server_rounds {
                return Err(ErrorKind::ServerStalled);
            }
            debug!(state = %state, round = self.server_rounds, "Waiting on backend");
            tokio::time::sleep(self.settings.server_wait).await;
            return Ok(Outcome::Resumed);
        }
        self.server_rounds = 0;

        info!(
            state = %state,
            workflow = ctx.perso_wf_id.as_deref().unwrap_or("-"),
            "Personalization state"
        );

        let next = match state.as_str() {
            SUCCESS => return Ok(Outcome::Succeeded(Completion::Personalized)),
            PUK_TO_INSTALL => self.install_puk(token, ctx).await?,
            CAN_WRITE_PIN => {
                self.install_pin(token, ctx).await?;
                WorkflowAction::PinInstalled.payload()
            }
            NEED_NON_ESCROW_CSR => match self.generate_csr(token, ctx, &response).await? {
                Some(report) => report,
                None => {
                    return Ok(Outcome::AwaitingInput(InputKind::SelectAccount {
                        accounts: self.offered_accounts.clone(),
                    }));
                }
            },
            CERT_TO_INSTALL => self.import(token, ctx, &response, TokenCommand::ImportX509).await?,
            PKCS12_TO_INSTALL => self.import(token, ctx, &response, TokenCommand::ImportP12).await?,
            HAVE_CERT_TO_DELETE => self.delete_certificate(token, ctx, &response).await?,
            _ => return Err(ErrorKind::WorkflowFailed { state: state.clone() }),
        };

        self.pending = Some(next);
        Ok(Outcome::Resumed)
    }

    async fn post(
        &self,
        ctx: &mut SessionContext,
        payload: Payload,
    ) -> Result<PersonalizationResponse, ErrorKind> {
        let mut payload = payload.field("tokenID", &ctx.token_id);
        if let Some(wf_id) = &ctx.perso_wf_id {
            payload = payload.field("perso_wfID", wf_id);
        }
        let response = self
            .gateway
            .request(Endpoint::ServerPersonalization, payload)
            .await?;

        let errors = response.errors();
        if !errors.is_empty() {
            warn!(?errors, "Personalization request rejected");
            return Err(ErrorKind::from_backend(errors));
        }

        let decoded: PersonalizationResponse = response.decode()?;
        if let Some(wf_id) = decoded.perso_wf_id.as_deref().filter(|id| !id.is_empty()) {
            ctx.perso_wf_id = Some(wf_id.to_string());
        }
        Ok(decoded)
    }

    /// Credentials of this run, fetched from the backend on first use.
    async fn credentials(&self, ctx: &mut SessionContext) -> Result<CredentialMaterial, ErrorKind> {
        if let Some(credentials) = &ctx.credentials {
            return Ok(credentials.clone());
        }
        if ctx.puk_requests >= MAX_PUK_REQUESTS {
            error!(
                attempts = ctx.puk_requests,
                "PUK attempts exhausted, token may be unusable"
            );
            return Err(ErrorKind::TokenUnusable);
        }
        ctx.puk_requests += 1;
        debug!(attempt = ctx.puk_requests, "Requesting PUK");

        let response = self.post(ctx, WorkflowAction::GetPuk.payload()).await?;
        let puk = response
            .server_puk
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SscError::Protocol("serverPUK missing".to_string()))?;
        let credentials = CredentialMaterial::new(
            puk,
            response.server_puk_alt.as_deref(),
            response.server_pin.as_deref(),
        );
        ctx.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    async fn install_puk(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
    ) -> Result<Payload, ErrorKind> {
        let credentials = self.credentials(ctx).await?;
        let Some(current) = credentials.puk_alt() else {
            debug!("No alternate PUK released, token already holds the primary");
            return Ok(WorkflowAction::PukInstalled.payload());
        };

        let result = change_puk(token, current, credentials.puk()).await?;
        fatal_reason(&result)?;
        if result.is_success() {
            info!("Primary PUK installed");
            Ok(WorkflowAction::PukInstalled.payload())
        } else {
            // PIN install falls back to the alternate PUK later on.
            warn!(reason = result.reason_str(), "PUK install failed");
            Ok(WorkflowAction::PukInstallFailed.payload())
        }
    }

    /// Sets the server-issued PIN through `ResetPIN` with the primary PUK.
    ///
    /// On `PUKError` the alternate PUK is swapped for the primary once and the
    /// reset retried without asking the backend. If that still fails a fresh
    /// PUK pair is requested, up to [`MAX_PUK_REQUESTS`].
    async fn install_pin(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
    ) -> Result<Zeroizing<String>, ErrorKind> {
        loop {
            let credentials = self.credentials(ctx).await?;
            let pin = Zeroizing::new(
                credentials
                    .pin()
                    .ok_or_else(|| SscError::Protocol("serverPIN missing".to_string()))?
                    .to_string(),
            );

            let result = reset_pin(token, credentials.puk(), &pin).await?;
            fatal_reason(&result)?;
            if result.is_success() {
                ctx.pin_installed = true;
                info!("Server PIN installed");
                return Ok(pin);
            }

            if result.reason == Some(TokenReason::PukError)
                && let Some(alternate) = credentials.puk_alt()
            {
                warn!("Token rejected primary PUK, installing it from the alternate");
                let changed = change_puk(token, alternate, credentials.puk()).await?;
                fatal_reason(&changed)?;
                if changed.is_success() {
                    let retried = reset_pin(token, credentials.puk(), &pin).await?;
                    fatal_reason(&retried)?;
                    if retried.is_success() {
                        ctx.pin_installed = true;
                        info!("Server PIN installed after PUK fallback");
                        return Ok(pin);
                    }
                }
            }

            warn!(
                reason = result.reason_str(),
                "PIN install failed, discarding released PUK"
            );
            ctx.clear_credentials();
        }
    }

    /// PIN for commands that need the user PIN, installing it first if needed.
    async fn user_pin(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
    ) -> Result<Zeroizing<String>, ErrorKind> {
        if ctx.pin_installed
            && let Some(pin) = ctx.credentials.as_ref().and_then(CredentialMaterial::pin)
        {
            return Ok(Zeroizing::new(pin.to_string()));
        }
        self.install_pin(token, ctx).await
    }

    /// `None` means the operator has to pick one of the offered accounts first.
    async fn generate_csr(
        &mut self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
        response: &PersonalizationResponse,
    ) -> Result<Option<Payload>, ErrorKind> {
        let account = match ctx.selected_account.clone() {
            Some(selected) => Some(selected),
            None => match response.accounts.as_slice() {
                [] => None,
                [only] => {
                    ctx.selected_account = Some(only.clone());
                    Some(only.clone())
                }
                accounts => {
                    self.offered_accounts = accounts.to_vec();
                    return Ok(None);
                }
            },
        };

        let pin = self.user_pin(token, ctx).await?;
        let mut request = TokenRequest::new(TokenCommand::GenerateKeypair).user_pin(&pin);
        for (key, value) in &response.msg.params {
            request = request.param(key, value);
        }
        if let Some(account) = &account {
            request = request.param("Account", account);
        }

        let result = token.run_command(&request).await?.result;
        fatal_reason(&result)?;
        if !result.is_success() {
            warn!(reason = result.reason_str(), "Key generation failed");
            return Err(ErrorKind::WorkflowFailed {
                state: NEED_NON_ESCROW_CSR.to_string(),
            });
        }

        let csr = result
            .field("CSR")
            .ok_or_else(|| SscError::Protocol("CSR missing from token result".to_string()))?;
        let mut report = WorkflowAction::UploadCsr.payload().field("csr", csr);
        if let Some(key_id) = result.field("KeyID") {
            report = report.field("key_id", key_id);
        }
        if let Some(account) = &account {
            report = report.field("account", account);
        }
        info!(account = account.as_deref().unwrap_or("-"), "CSR generated");
        Ok(Some(report))
    }

    async fn import(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
        response: &PersonalizationResponse,
        command: TokenCommand,
    ) -> Result<Payload, ErrorKind> {
        let data = response
            .cert_to_install
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SscError::Protocol("cert_to_install missing".to_string()))?;

        let pin = self.user_pin(token, ctx).await?;
        let mut request = TokenRequest::new(command).user_pin(&pin).data(data);
        if let Some(key_id) = response.param("KEY_ID") {
            request = request.param("KeyID", key_id);
        }
        if let Some(password) = response.p12_password.as_deref() {
            request = request.param("Password", password);
        }

        let result = token.run_command(&request).await?.result;
        fatal_reason(&result)?;
        if result.is_success() {
            info!(command = command.as_str(), "Certificate installed");
            Ok(WorkflowAction::CertInstalled.payload())
        } else {
            warn!(command = command.as_str(), reason = result.reason_str(), "Certificate install failed");
            Ok(WorkflowAction::CertInstallFailed.payload())
        }
    }

    async fn delete_certificate(
        &self,
        token: &mut TokenSession,
        ctx: &mut SessionContext,
        response: &PersonalizationResponse,
    ) -> Result<Payload, ErrorKind> {
        let key_id = response
            .param("KEY_ID")
            .ok_or_else(|| SscError::Protocol("KEY_ID missing".to_string()))?;

        let pin = self.user_pin(token, ctx).await?;
        let request = TokenRequest::new(TokenCommand::DeleteUserData)
            .user_pin(&pin)
            .param("KeyID", key_id);

        let result = token.run_command(&request).await?.result;
        fatal_reason(&result)?;
        if result.is_success() {
            info!(key_id, "Certificate deleted");
            Ok(WorkflowAction::CertDeleted.payload())
        } else {
            warn!(key_id, reason = result.reason_str(), "Certificate delete failed");
            Ok(WorkflowAction::CertDeleteFailed.payload())
        }
    }
}

async fn change_puk(
    token: &mut TokenSession,
    current: &str,
    new: &str,
) -> Result<TokenResult, SscError> {
    let request = TokenRequest::new(TokenCommand::ChangePuk)
        .param("PUK", current)
        .param("NewPUK", new);
    Ok(token.run_command(&request).await?.result)
}

pub(crate) async fn reset_pin(
    token: &mut TokenSession,
    puk: &str,
    new_pin: &str,
) -> Result<TokenResult, SscError> {
    let request = TokenRequest::new(TokenCommand::ResetPin)
        .param("PUK", puk)
        .new_pin(new_pin);
    Ok(token.run_command(&request).await?.result)
}
