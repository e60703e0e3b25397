//! SSC (smartcard self-service) client library
//!
//! This library drives token personalization and dual-authorization PIN unblock
//! against the self-service workflow backend.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod personalization;
pub mod reconciler;
pub mod session;
pub mod status;
pub mod token;
pub mod types;
pub mod unblock;

pub use client::{Endpoint, Gateway, Payload, RecordedRequest, ScriptedGateway, ServerResponse, SscClient};
pub use config::SscConfig;
pub use engine::{EngineSettings, SelfService};
pub use error::SscError;
pub use personalization::{PersonalizationOrchestrator, PersonalizationSettings, WorkflowAction};
pub use reconciler::{CardReport, Decision, NextAction, check_card, determine_required_action, reconcile};
pub use session::{CredentialMaterial, SessionContext};
pub use status::{
    Completion, ErrorKind, InputKind, OperatorCallback, Outcome, StatusCode, StatusDetail,
    StatusReport,
};
pub use token::{
    Presence, PresenceWatcher, Property, SoftwareToken, TokenCommand, TokenDriver, TokenReason,
    TokenRequest, TokenResult, TokenSession,
};
pub use types::{
    AggregateHealth, CardStatus, CardStatusResponse, Certificate, CertificateHealth,
    CertificateType, UserProfile, WorkflowRecord, WorkflowType,
};
pub use unblock::UnblockOrchestrator;
