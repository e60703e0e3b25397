//! End-to-end flows through the self-service engine with a software token
//! and a scripted backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use ssc::personalization::PersonalizationSettings;
use ssc::{
    Completion, EngineSettings, Endpoint, InputKind, NextAction, Outcome, ScriptedGateway,
    SelfService, SoftwareToken, StatusCode, StatusReport,
};

const PUK: &str = "31415926";
const SERVER_PIN: &str = "271828";

fn engine(gateway: &Arc<ScriptedGateway>, driver: &Arc<SoftwareToken>) -> SelfService {
    SelfService::new(
        gateway.clone(),
        driver.clone(),
        EngineSettings {
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_secs(5),
            presence_interval: Duration::from_millis(100),
            personalization: PersonalizationSettings {
                server_wait: Duration::from_millis(100),
                max_server_rounds: 5,
            },
        },
    )
}

fn card_status(gateway: &ScriptedGateway, health: &str, workflows: serde_json::Value) {
    gateway.push_json(json!({
        "card_status": "activated",
        "overall_status": health,
        "user": {"cn": "Alice Example", "givenname": "Alice", "sn": "Example", "accounts": ["alice", "alice-adm"]},
        "workflows": workflows,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_first_personalization_then_activation() {
    let gateway = Arc::new(ScriptedGateway::new());
    let driver = Arc::new(SoftwareToken::new("tok-1").with_working_polls(3));
    let mut service = engine(&gateway, &driver);
    let mut codes: Vec<StatusCode> = Vec::new();

    // Blank card: nothing personalized yet.
    card_status(&gateway, "red", json!([]));
    let report = service
        .check_status(&mut |r: &StatusReport| codes.push(r.code))
        .await
        .unwrap();
    assert_eq!(report.decision.action, NextAction::StartPersonalization);
    assert!(report.profile.first_time_personalization);
    assert_eq!(report.profile.given_name, "Alice");

    gateway
        .push_json(json!({"wf_state": "PUK_TO_INSTALL", "perso_wfID": "wf-1"}))
        .push_json(json!({"serverPUK": PUK, "serverPUKAlt": SoftwareToken::TRANSPORT_PUK, "serverPIN": SERVER_PIN}))
        .push_json(json!({"wf_state": "CAN_WRITE_PIN"}))
        .push_json(json!({"wf_state": "HAVE_TOKEN_OWNER"}))
        .push_json(json!({"wf_state": "NEED_NON_ESCROW_CSR", "accounts": ["alice", "alice-adm"]}));
    let outcome = service
        .personalize(&mut |r: &StatusReport| codes.push(r.code))
        .await;
    assert_eq!(
        outcome,
        Outcome::AwaitingInput(InputKind::SelectAccount {
            accounts: vec!["alice".to_string(), "alice-adm".to_string()]
        })
    );
    assert_eq!(driver.puk(), PUK);
    assert_eq!(driver.pin().as_deref(), Some(SERVER_PIN));

    gateway
        .push_json(json!({"wf_state": "NEED_NON_ESCROW_CSR", "accounts": ["alice", "alice-adm"]}))
        .push_json(json!({
            "wf_state": "PKCS12_TO_INSTALL",
            "cert_to_install": "UEsDBBQ-p12",
            "p12_password": "bundle-pass",
        }))
        .push_json(json!({"wf_state": "SUCCESS"}));
    let outcome = service
        .select_account("alice", &mut |r: &StatusReport| codes.push(r.code))
        .await;
    assert_eq!(outcome, Outcome::Succeeded(Completion::Personalized));
    assert_eq!(driver.key_ids().len(), 2);
    assert_eq!(driver.installed_certificates(), vec!["UEsDBBQ-p12"]);
    assert!(service.context().unwrap().credentials.is_none());

    // Activation: the unblock workflow sets the cardholder's own PIN.
    gateway.push_json(json!({
        "unblock_wfID": "ub-1",
        "auth1_email": "b***@example.org",
        "auth2_email": "c***@example.org",
    }));
    let outcome = service
        .start_unblock("bob@example.org", "carol@example.org", &mut |r: &StatusReport| {
            codes.push(r.code)
        })
        .await;
    assert!(matches!(
        outcome,
        Outcome::AwaitingInput(InputKind::AuthCodes { rejected: false, .. })
    ));

    gateway
        .push_json(json!({"serverPUK": PUK, "serverPIN": SERVER_PIN}))
        .push_json(json!({}));
    card_status(
        &gateway,
        "green",
        json!([
            {"serial": "wf-1", "type": "PERSONALIZATION", "state": "SUCCESS", "last_update": 1000, "token_id": "tok-1"},
            {"serial": "ub-1", "type": "PIN_UNBLOCK", "state": "SUCCESS", "last_update": 2000, "token_id": "tok-1"},
        ]),
    );
    let outcome = service
        .verify_unblock("97531864", "code-1", "code-2", &mut |r: &StatusReport| {
            codes.push(r.code)
        })
        .await;
    assert_eq!(
        outcome,
        Outcome::Succeeded(Completion::Unblocked {
            next: NextAction::ShowStatus
        })
    );
    assert_eq!(driver.pin().as_deref(), Some("97531864"));

    assert_eq!(
        codes,
        vec![
            StatusCode::StartPerso,
            StatusCode::SelectAccount,
            StatusCode::Success,
            StatusCode::EnterAuthCodes,
            StatusCode::Success,
        ]
    );
    assert_eq!(gateway.remaining(), 0);

    let p12 = gateway
        .requests()
        .into_iter()
        .filter(|r| r.endpoint == Endpoint::ServerPersonalization)
        .filter(|r| r.get("wf_action") == Some("cert_inst_ok"))
        .count();
    assert_eq!(p12, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_reload_picks_up_active_unblock() {
    let gateway = Arc::new(ScriptedGateway::new());
    let driver = Arc::new(SoftwareToken::new("tok-9").with_puk(PUK).with_pin("111111"));
    let mut service = engine(&gateway, &driver);
    let mut noop = |_: &StatusReport| {};

    card_status(
        &gateway,
        "green",
        json!([
            {"serial": "wf-1", "type": "PERSONALIZATION", "state": "SUCCESS", "last_update": 1000, "token_id": "tok-9"},
            {"serial": "ub-7", "type": "PIN_UNBLOCK", "state": "PEND_ACT_CODE", "last_update": 1500, "token_id": "tok-9",
             "auth1_email": "b***@example.org", "auth2_email": "c***@example.org"},
        ]),
    );
    let report = service.check_status(&mut noop).await.unwrap();
    assert_eq!(
        report.decision.action,
        NextAction::EnterAuthCodes {
            wf_id: "ub-7".to_string()
        }
    );

    gateway
        .push_json(json!({"errors": ["ssc.pinreset.ERROR_AUTHCODES_INCORRECT"]}))
        .push_json(json!({"serverPUK": PUK}))
        .push_json(json!({}));
    card_status(&gateway, "green", json!([]));

    let outcome = service.verify_unblock("222222", "x", "y", &mut noop).await;
    assert_eq!(
        outcome,
        Outcome::AwaitingInput(InputKind::AuthCodes {
            auth1: Some("b***@example.org".to_string()),
            auth2: Some("c***@example.org".to_string()),
            rejected: true,
        })
    );

    let outcome = service.verify_unblock("222222", "right", "codes", &mut noop).await;
    assert!(matches!(outcome, Outcome::Succeeded(Completion::Unblocked { .. })));

    let verify = gateway
        .requests()
        .into_iter()
        .rev()
        .find(|r| r.endpoint == Endpoint::PinResetVerify)
        .unwrap();
    assert_eq!(verify.get("unblock_wfID"), Some("ub-7"));
    assert_eq!(driver.pin().as_deref(), Some("222222"));
}
