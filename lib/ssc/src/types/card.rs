//! Cardholder profile, card status and certificates

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Certificates closer than this to expiry are shown as amber.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Initial,
    Deactivated,
    Activated,
    #[default]
    #[serde(other)]
    Unknown,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Unknown => "unknown",
            CardStatus::Initial => "initial",
            CardStatus::Deactivated => "deactivated",
            CardStatus::Activated => "activated",
        }
    }
}

/// Server-computed summary of certificate and workflow health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregateHealth {
    Green,
    Amber,
    #[default]
    #[serde(other)]
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    Escrow,
    #[serde(alias = "non-escrow", alias = "non_escrow")]
    Nonescrow,
    Signature,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateHealth {
    Green,
    Amber,
    Red,
}

/// Certificate as delivered in the card status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub cert_type: CertificateType,
    pub serial: String,
    pub issuer: String,
    #[serde(default)]
    pub subject: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub notbefore: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub notafter: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Certificate {
    pub cert_type: CertificateType,
    pub serial: String,
    pub issuer: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked: bool,
    pub health: CertificateHealth,
}

impl Certificate {
    pub fn from_record(record: CertificateRecord, now: DateTime<Utc>) -> Self {
        let health = if record.revoked || record.notafter <= now || record.notbefore > now {
            CertificateHealth::Red
        } else if record.notafter - now < Duration::days(EXPIRY_WARNING_DAYS) {
            CertificateHealth::Amber
        } else {
            CertificateHealth::Green
        };

        Self {
            cert_type: record.cert_type,
            serial: record.serial,
            issuer: record.issuer,
            subject: record.subject,
            not_before: record.notbefore,
            not_after: record.notafter,
            revoked: record.revoked,
            health,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.not_before <= now && now < self.not_after
    }
}

/// Cardholder record as delivered in the card status response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub cn: String,
    #[serde(default)]
    pub givenname: String,
    #[serde(default)]
    pub sn: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub certs: Vec<CertificateRecord>,
}

/// Cardholder profile. The two derived flags are filled in by the reconciler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserProfile {
    pub common_name: String,
    pub given_name: String,
    pub surname: String,
    pub entity: String,
    pub accounts: Vec<String>,
    pub certificates: Vec<Certificate>,
    pub card_status: CardStatus,
    pub health: AggregateHealth,
    pub first_time_personalization: bool,
    pub pending_activation: bool,
}

impl UserProfile {
    pub fn from_record(
        user: UserRecord,
        card_status: CardStatus,
        health: AggregateHealth,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            common_name: user.cn,
            given_name: user.givenname,
            surname: user.sn,
            entity: user.entity,
            accounts: user.accounts,
            certificates: user
                .certs
                .into_iter()
                .map(|c| Certificate::from_record(c, now))
                .collect(),
            card_status,
            health,
            first_time_personalization: false,
            pending_activation: false,
        }
    }

    pub fn certificates_of(&self, cert_type: CertificateType) -> impl Iterator<Item = &Certificate> {
        self.certificates
            .iter()
            .filter(move |c| c.cert_type == cert_type)
    }
}
