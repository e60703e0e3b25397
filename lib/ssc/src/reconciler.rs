//! Status Reconciler - decides the single next action for the inserted card

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::{Endpoint, Gateway, Payload};
use crate::status::{ErrorKind, StatusCode};
use crate::types::workflow::{PEND_ACT_CODE, PEND_PIN_CHANGE, is_whitelisted};
use crate::types::{
    AggregateHealth, CardStatus, CardStatusResponse, UserProfile, WorkflowRecord, WorkflowType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum NextAction {
    #[serde(rename = "cardUnknown")]
    CardUnknown,
    #[serde(rename = "cardInitial")]
    CardInitial,
    #[serde(rename = "cardDeactivated")]
    CardDeactivated,
    #[serde(rename = "contPerso")]
    ContinuePersonalization { wf_id: String },
    #[serde(rename = "enterAuthcodes")]
    EnterAuthCodes { wf_id: String },
    #[serde(rename = "enterAuthPersons")]
    EnterAuthPersons { wf_id: Option<String> },
    #[serde(rename = "startPerso")]
    StartPersonalization,
    #[serde(rename = "startRecert")]
    StartRecertification,
    #[serde(rename = "showStatus")]
    ShowStatus,
}

impl NextAction {
    pub fn status_code(&self) -> StatusCode {
        match self {
            NextAction::CardUnknown => StatusCode::CardUnknown,
            NextAction::CardInitial => StatusCode::CardInitial,
            NextAction::CardDeactivated => StatusCode::CardDeactivated,
            NextAction::ContinuePersonalization { .. } => StatusCode::ContPerso,
            NextAction::EnterAuthCodes { .. } => StatusCode::EnterAuthCodes,
            NextAction::EnterAuthPersons { .. } => StatusCode::EnterAuthPersons,
            NextAction::StartPersonalization => StatusCode::StartPerso,
            NextAction::StartRecertification => StatusCode::StartRecert,
            NextAction::ShowStatus => StatusCode::ShowStatus,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.status_code().as_str()
    }

    /// The card cannot be served here; the operator has to be contacted.
    pub fn is_contact_operator(&self) -> bool {
        matches!(
            self,
            NextAction::CardUnknown | NextAction::CardInitial | NextAction::CardDeactivated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: NextAction,
    pub first_time_personalization: bool,
    pub pending_activation: bool,
    pub active_personalization: Option<WorkflowRecord>,
    pub active_unblock: Option<WorkflowRecord>,
}

impl Decision {
    fn contact_operator(action: NextAction) -> Self {
        Self {
            action,
            first_time_personalization: false,
            pending_activation: false,
            active_personalization: None,
            active_unblock: None,
        }
    }
}

/// Newest non-terminal workflow of `workflow_type` owned by `token_id`.
/// On equal timestamps the first one listed is kept.
pub fn select_active<'a>(
    workflows: &'a [WorkflowRecord],
    workflow_type: WorkflowType,
    token_id: &str,
) -> Option<&'a WorkflowRecord> {
    newest(
        workflows
            .iter()
            .filter(|w| w.workflow_type == workflow_type)
            .filter(|w| !w.is_terminal())
            .filter(|w| w.token_id == token_id),
    )
}

/// Newest successful workflow of `workflow_type`, whoever owns it.
pub fn last_success(
    workflows: &[WorkflowRecord],
    workflow_type: WorkflowType,
) -> Option<&WorkflowRecord> {
    newest(
        workflows
            .iter()
            .filter(|w| w.workflow_type == workflow_type)
            .filter(|w| w.is_success()),
    )
}

fn newest<'a>(candidates: impl Iterator<Item = &'a WorkflowRecord>) -> Option<&'a WorkflowRecord> {
    candidates.fold(None, |best: Option<&WorkflowRecord>, w| match best {
        Some(b) if b.last_update >= w.last_update => Some(b),
        _ => Some(w),
    })
}

pub fn pending_activation(
    last_personalization: Option<&WorkflowRecord>,
    last_unblock: Option<&WorkflowRecord>,
) -> bool {
    match (last_unblock, last_personalization) {
        (None, _) => true,
        (Some(unblock), Some(perso)) => unblock.last_update < perso.last_update,
        (Some(_), None) => false,
    }
}

fn resumable(active: Option<&WorkflowRecord>) -> Option<&WorkflowRecord> {
    let active = active?;
    if is_whitelisted(&active.state) {
        Some(active)
    } else {
        // Left alone on purpose: no cleanup, the workflow just is not resumed.
        warn!(
            serial = %active.serial,
            workflow_type = active.workflow_type.as_str(),
            state = %active.state,
            "Ignoring active workflow in a non-resumable state"
        );
        None
    }
}

fn resume_unblock(unblock: &WorkflowRecord) -> NextAction {
    match unblock.state.as_str() {
        PEND_ACT_CODE | PEND_PIN_CHANGE => NextAction::EnterAuthCodes {
            wf_id: unblock.serial.clone(),
        },
        _ => NextAction::EnterAuthPersons {
            wf_id: Some(unblock.serial.clone()),
        },
    }
}

pub fn determine_required_action(
    card_status: CardStatus,
    health: AggregateHealth,
    workflows: &[WorkflowRecord],
    token_id: &str,
) -> Decision {
    match card_status {
        CardStatus::Unknown => return Decision::contact_operator(NextAction::CardUnknown),
        CardStatus::Initial => return Decision::contact_operator(NextAction::CardInitial),
        CardStatus::Deactivated => return Decision::contact_operator(NextAction::CardDeactivated),
        CardStatus::Activated => {}
    }

    let active_perso = resumable(select_active(
        workflows,
        WorkflowType::Personalization,
        token_id,
    ));
    let active_unblock = resumable(select_active(workflows, WorkflowType::PinUnblock, token_id));

    let success_perso = last_success(workflows, WorkflowType::Personalization);
    let success_unblock = last_success(workflows, WorkflowType::PinUnblock);

    let first_time_personalization = success_perso.is_none();
    let pending_activation = pending_activation(success_perso, success_unblock);

    let continue_perso = active_perso.map(|p| NextAction::ContinuePersonalization {
        wf_id: p.serial.clone(),
    });

    let action = match health {
        AggregateHealth::Green | AggregateHealth::Amber => {
            if let Some(action) = continue_perso {
                action
            } else if let Some(unblock) = active_unblock {
                resume_unblock(unblock)
            } else if pending_activation {
                NextAction::EnterAuthPersons { wf_id: None }
            } else if health == AggregateHealth::Green {
                NextAction::ShowStatus
            } else {
                NextAction::StartRecertification
            }
        }
        AggregateHealth::Red => match continue_perso {
            Some(action) => action,
            None if first_time_personalization => NextAction::StartPersonalization,
            None => NextAction::StartRecertification,
        },
    };

    debug!(
        action = action.as_str(),
        first_time_personalization, pending_activation, "Determined required action"
    );

    Decision {
        action,
        first_time_personalization,
        pending_activation,
        active_personalization: active_perso.cloned(),
        active_unblock: active_unblock.cloned(),
    }
}

/// Runs the decision and writes the derived flags back into the profile.
pub fn reconcile(profile: &mut UserProfile, workflows: &[WorkflowRecord], token_id: &str) -> Decision {
    let decision = determine_required_action(profile.card_status, profile.health, workflows, token_id);
    if !decision.action.is_contact_operator() {
        profile.first_time_personalization = decision.first_time_personalization;
        profile.pending_activation = decision.pending_activation;
    }
    decision
}

#[derive(Debug, Clone)]
pub struct CardReport {
    pub profile: UserProfile,
    pub workflows: Vec<WorkflowRecord>,
    pub decision: Decision,
}

/// Fetches the card status for `token_id` and reconciles it.
pub async fn check_card(
    gateway: &dyn Gateway,
    token_id: &str,
    now: DateTime<Utc>,
) -> Result<CardReport, ErrorKind> {
    let response = gateway
        .request(
            Endpoint::GetCardStatus,
            Payload::new().field("tokenID", token_id),
        )
        .await?;

    let errors = response.errors();
    if !errors.is_empty() {
        warn!(?errors, "Card status request rejected");
        return Err(ErrorKind::from_backend(errors));
    }

    let status: CardStatusResponse = response.decode()?;
    let mut profile =
        UserProfile::from_record(status.user, status.card_status, status.overall_status, now);
    let decision = reconcile(&mut profile, &status.workflows, token_id);

    Ok(CardReport {
        profile,
        workflows: status.workflows,
        decision,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::workflow::{
        CAN_WRITE_PIN, CERT_TO_INSTALL, FAILURE, HAVE_TOKEN_OWNER, NEED_NON_ESCROW_CSR, SUCCESS,
    };

    const TOKEN: &str = "tok-1";

    fn wf(serial: &str, workflow_type: WorkflowType, state: &str, ts: i64, owner: &str) -> WorkflowRecord {
        WorkflowRecord {
            serial: serial.to_string(),
            workflow_type,
            state: state.to_string(),
            last_update: Utc.timestamp_opt(ts, 0).unwrap(),
            token_id: owner.to_string(),
            auth1_email: None,
            auth2_email: None,
        }
    }

    fn perso(serial: &str, state: &str, ts: i64) -> WorkflowRecord {
        wf(serial, WorkflowType::Personalization, state, ts, TOKEN)
    }

    fn unblock(serial: &str, state: &str, ts: i64) -> WorkflowRecord {
        wf(serial, WorkflowType::PinUnblock, state, ts, TOKEN)
    }

    fn decide(health: AggregateHealth, workflows: &[WorkflowRecord]) -> Decision {
        determine_required_action(CardStatus::Activated, health, workflows, TOKEN)
    }

    #[test]
    fn test_contact_operator_card_states() {
        let workflows = [perso("1", CERT_TO_INSTALL, 10)];
        for (status, action) in [
            (CardStatus::Unknown, NextAction::CardUnknown),
            (CardStatus::Initial, NextAction::CardInitial),
            (CardStatus::Deactivated, NextAction::CardDeactivated),
        ] {
            let decision =
                determine_required_action(status, AggregateHealth::Green, &workflows, TOKEN);
            assert_eq!(decision.action, action);
            assert!(decision.action.is_contact_operator());
            assert!(decision.active_personalization.is_none());
        }
    }

    #[test]
    fn test_red_first_time_starts_personalization() {
        let decision = decide(AggregateHealth::Red, &[]);
        assert!(decision.first_time_personalization);
        assert_eq!(decision.action, NextAction::StartPersonalization);
    }

    #[test]
    fn test_red_after_success_starts_recertification() {
        let decision = decide(AggregateHealth::Red, &[perso("1", SUCCESS, 10)]);
        assert!(!decision.first_time_personalization);
        assert_eq!(decision.action, NextAction::StartRecertification);
    }

    #[test]
    fn test_red_ignores_active_unblock() {
        let decision = decide(AggregateHealth::Red, &[unblock("2", PEND_ACT_CODE, 10)]);
        assert_eq!(decision.action, NextAction::StartPersonalization);
    }

    #[test]
    fn test_amber_resumes_active_personalization() {
        let decision = decide(AggregateHealth::Amber, &[perso("7", CERT_TO_INSTALL, 10)]);
        assert_eq!(
            decision.action,
            NextAction::ContinuePersonalization {
                wf_id: "7".to_string()
            }
        );
    }

    #[test]
    fn test_green_personalization_outranks_unblock() {
        let workflows = [
            unblock("2", PEND_ACT_CODE, 50),
            perso("1", NEED_NON_ESCROW_CSR, 10),
        ];
        let decision = decide(AggregateHealth::Green, &workflows);
        assert_eq!(
            decision.action,
            NextAction::ContinuePersonalization {
                wf_id: "1".to_string()
            }
        );
        assert!(decision.active_unblock.is_some());
    }

    #[test]
    fn test_green_resumes_unblock_by_state() {
        let decision = decide(AggregateHealth::Green, &[unblock("2", PEND_ACT_CODE, 10)]);
        assert_eq!(
            decision.action,
            NextAction::EnterAuthCodes {
                wf_id: "2".to_string()
            }
        );

        let decision = decide(AggregateHealth::Green, &[unblock("3", HAVE_TOKEN_OWNER, 10)]);
        assert_eq!(
            decision.action,
            NextAction::EnterAuthPersons {
                wf_id: Some("3".to_string())
            }
        );
    }

    #[test]
    fn test_green_pending_activation_starts_unblock() {
        let decision = decide(AggregateHealth::Green, &[perso("1", SUCCESS, 10)]);
        assert!(decision.pending_activation);
        assert_eq!(decision.action, NextAction::EnterAuthPersons { wf_id: None });
    }

    #[test]
    fn test_green_activated_shows_status_amber_recertifies() {
        let workflows = [perso("1", SUCCESS, 10), unblock("2", SUCCESS, 20)];
        let decision = decide(AggregateHealth::Green, &workflows);
        assert!(!decision.pending_activation);
        assert_eq!(decision.action, NextAction::ShowStatus);

        let decision = decide(AggregateHealth::Amber, &workflows);
        assert_eq!(decision.action, NextAction::StartRecertification);
    }

    #[test]
    fn test_pending_activation_when_unblock_older() {
        let workflows = [perso("1", SUCCESS, 30), unblock("2", SUCCESS, 20)];
        assert!(decide(AggregateHealth::Green, &workflows).pending_activation);

        // No successful personalization at all: nothing to activate.
        let workflows = [unblock("2", SUCCESS, 20)];
        let decision = decide(AggregateHealth::Green, &workflows);
        assert!(!decision.pending_activation);
        assert!(decision.first_time_personalization);
    }

    #[test]
    fn test_first_time_ignores_unblock_history() {
        let workflows = [unblock("2", SUCCESS, 20), perso("1", FAILURE, 30)];
        assert!(decide(AggregateHealth::Green, &workflows).first_time_personalization);
    }

    #[test]
    fn test_selects_newest_owned_workflow() {
        let workflows = [
            perso("old", CERT_TO_INSTALL, 10),
            perso("new", CAN_WRITE_PIN, 20),
            wf("foreign", WorkflowType::Personalization, CERT_TO_INSTALL, 99, "tok-2"),
            perso("done", SUCCESS, 50),
        ];
        let active = select_active(&workflows, WorkflowType::Personalization, TOKEN).unwrap();
        assert_eq!(active.serial, "new");
    }

    #[test]
    fn test_last_success_ignores_ownership() {
        let workflows = [
            perso("mine", SUCCESS, 10),
            wf("other", WorkflowType::Personalization, SUCCESS, 20, "tok-2"),
        ];
        let success = last_success(&workflows, WorkflowType::Personalization).unwrap();
        assert_eq!(success.serial, "other");
    }

    #[test]
    fn test_non_whitelisted_active_is_discarded_not_replaced() {
        let workflows = [
            perso("older", CERT_TO_INSTALL, 10),
            perso("newer", "MANUAL_REVIEW", 20),
        ];
        let decision = decide(AggregateHealth::Red, &workflows);
        assert!(decision.active_personalization.is_none());
        assert_eq!(decision.action, NextAction::StartPersonalization);
    }

    #[test]
    fn test_never_selects_non_whitelisted_state() {
        let states = [
            CERT_TO_INSTALL,
            "MANUAL_REVIEW",
            PEND_ACT_CODE,
            "INITIALIZE",
            SUCCESS,
            FAILURE,
            HAVE_TOKEN_OWNER,
        ];
        for (i, a) in states.iter().enumerate() {
            for (j, b) in states.iter().enumerate() {
                let workflows = [
                    perso("a", a, i as i64),
                    unblock("b", b, j as i64),
                    perso("c", b, 100 - j as i64),
                ];
                for health in [AggregateHealth::Green, AggregateHealth::Amber, AggregateHealth::Red] {
                    let decision = decide(health, &workflows);
                    for active in [&decision.active_personalization, &decision.active_unblock]
                        .into_iter()
                        .flatten()
                    {
                        assert!(is_whitelisted(&active.state));
                    }
                }
            }
        }
    }

    #[test]
    fn test_reconcile_updates_profile_flags() {
        let mut profile = UserProfile {
            card_status: CardStatus::Activated,
            health: AggregateHealth::Green,
            ..UserProfile::default()
        };
        let decision = reconcile(&mut profile, &[perso("1", SUCCESS, 10)], TOKEN);
        assert!(!profile.first_time_personalization);
        assert!(profile.pending_activation);
        assert_eq!(decision.action, NextAction::EnterAuthPersons { wf_id: None });
    }
}
