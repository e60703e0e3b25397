//! Session context threaded through every orchestration step

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// PUK/PIN material released by the backend. Lives only for one personalization
/// run or one unblock authorization cycle.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CredentialMaterial {
    puk: String,
    puk_alt: Option<String>,
    pin: Option<String>,
    encrypted: bool,
}

impl CredentialMaterial {
    pub fn new(puk: &str, puk_alt: Option<&str>, pin: Option<&str>) -> Self {
        Self {
            puk: puk.to_string(),
            puk_alt: puk_alt.filter(|p| !p.is_empty()).map(str::to_string),
            pin: pin.filter(|p| !p.is_empty()).map(str::to_string),
            encrypted: false,
        }
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn puk(&self) -> &str {
        &self.puk
    }

    /// Fallback PUK the token may still hold if the primary was never installed.
    pub fn puk_alt(&self) -> Option<&str> {
        self.puk_alt.as_deref()
    }

    pub fn pin(&self) -> Option<&str> {
        self.pin.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("puk_alt", &self.puk_alt.is_some())
            .field("pin", &self.pin.is_some())
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

/// Everything an orchestration run needs to know between steps.
///
/// Created when a token is detected, discarded when it is removed.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub token_id: String,
    pub card_type: Option<String>,
    pub perso_wf_id: Option<String>,
    pub unblock_wf_id: Option<String>,
    pub credentials: Option<CredentialMaterial>,
    /// PUK released by a verified unblock, tagged with the workflow it was released for.
    pub unblock_credentials: Option<(String, CredentialMaterial)>,
    /// Backend PUK fetches in the current personalization run.
    pub puk_requests: u8,
    /// The server-issued random PIN is on the token.
    pub pin_installed: bool,
    pub selected_account: Option<String>,
    pub auth1_email: Option<String>,
    pub auth2_email: Option<String>,
}

impl SessionContext {
    pub fn new(token_id: &str) -> Self {
        Self {
            token_id: token_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_card_type(mut self, card_type: &str) -> Self {
        self.card_type = Some(card_type.to_string());
        self
    }

    /// Drops credentials and the per-run counters. Called on every terminal outcome.
    pub fn end_run(&mut self) {
        self.clear_credentials();
        self.puk_requests = 0;
        self.pin_installed = false;
        self.selected_account = None;
    }

    pub fn clear_credentials(&mut self) {
        if let Some(mut credentials) = self.credentials.take() {
            credentials.zeroize();
        }
    }

    /// The PUK a verified unblock released, only while `wf_id` is the cycle it belongs to.
    pub fn released_puk(&self, wf_id: &str) -> Option<&CredentialMaterial> {
        self.unblock_credentials
            .as_ref()
            .filter(|(released_for, _)| released_for == wf_id)
            .map(|(_, credentials)| credentials)
    }

    pub fn clear_unblock_credentials(&mut self) {
        if let Some((_, mut credentials)) = self.unblock_credentials.take() {
            credentials.zeroize();
        }
    }
}
