//! Authentication integration tests.
//!
//! Exercises the nonce handshake and the SASL mechanisms through the
//! command dispatcher, checking the 17/18 wire codes.

use serde_json::json;

use authkeeper_core::auth::challenge::client_key;
use authkeeper_core::auth::Mechanism;
use authkeeper_core::error::{AUTHENTICATION_FAILED_CODE, BAD_COMMAND_CODE};
use authkeeper_core::testing::{TestHarness, TestHarnessBuilder};

fn harness_with_user() -> TestHarness {
    let harness = TestHarness::new();
    harness.create_user("test", "spencer", "password", &["readWrite"]);
    harness
}

#[test]
fn test_challenge_response_valid_password() {
    let harness = harness_with_user();
    let mut session = harness.session();

    let reply = harness.login_challenge(&mut session, "test", "spencer", "password");
    assert!(reply.is_ok(), "{reply}");
    assert_eq!(reply.get("user"), Some(&json!("spencer")));
    assert_eq!(reply.get("db"), Some(&json!("test")));
    assert!(session.authz.is_authenticated());
}

#[test]
fn test_challenge_response_wrong_password_or_unknown_user() {
    let harness = harness_with_user();

    for (user, password) in [("spencer", "wrong"), ("nobody", "password"), ("spencer", "")] {
        let mut session = harness.session();
        let reply = harness.login_challenge(&mut session, "test", user, password);
        assert_eq!(reply.code(), Some(i64::from(AUTHENTICATION_FAILED_CODE)), "{user}/{password}");
        assert!(!session.authz.is_authenticated());
    }
}

#[test]
fn test_failure_messages_do_not_reveal_cause() {
    let harness = harness_with_user();

    let mut session = harness.session();
    let wrong_password = harness.login_challenge(&mut session, "test", "spencer", "wrong");
    let mut session = harness.session();
    let unknown_user = harness.login_challenge(&mut session, "test", "nobody", "password");

    assert_eq!(wrong_password, unknown_user);
}

#[test]
fn test_authenticate_without_nonce_is_bad_command() {
    let harness = harness_with_user();
    let mut session = harness.session();

    // Correct credentials do not help without a getnonce first.
    let key = client_key("spencer", "password", "0123456789abcdef");
    let reply = harness.run(
        &mut session,
        "test",
        json!({"authenticate": 1, "user": "spencer", "nonce": "0123456789abcdef", "key": key}),
    );
    assert_eq!(reply.code(), Some(i64::from(BAD_COMMAND_CODE)));
    assert!(!session.authz.is_authenticated());
}

#[test]
fn test_nonce_is_single_use() {
    let harness = harness_with_user();
    let mut session = harness.session();

    let nonce = harness.get_nonce(&mut session, "test");
    let key = client_key("spencer", "password", &nonce);
    let command = json!({"authenticate": 1, "user": "spencer", "nonce": nonce, "key": key});

    assert!(harness.run(&mut session, "test", command.clone()).is_ok());
    let replay = harness.run(&mut session, "test", command);
    assert_eq!(replay.code(), Some(i64::from(BAD_COMMAND_CODE)));
}

#[test]
fn test_nonce_not_shared_between_sessions() {
    let harness = harness_with_user();
    let mut issuer = harness.session();
    let mut other = harness.session();

    let nonce = harness.get_nonce(&mut issuer, "test");
    let key = client_key("spencer", "password", &nonce);
    let reply = harness.run(
        &mut other,
        "test",
        json!({"authenticate": 1, "user": "spencer", "nonce": nonce, "key": key}),
    );
    assert_eq!(reply.code(), Some(i64::from(BAD_COMMAND_CODE)));
}

#[test]
fn test_challenge_response_disabled() {
    let harness = TestHarnessBuilder::new()
        .mechanisms(vec![Mechanism::ScramSha256])
        .build();
    harness.create_user("test", "spencer", "password", &[]);
    let mut session = harness.session();

    let reply = harness.login_challenge(&mut session, "test", "spencer", "password");
    assert_eq!(reply.code(), Some(i64::from(AUTHENTICATION_FAILED_CODE)));

    assert!(harness.login_scram(&mut session, "test", "spencer", "password").is_ok());
}

#[test]
fn test_plain_mechanism() {
    let harness = harness_with_user();

    let mut session = harness.session();
    assert!(harness.login_plain(&mut session, "test", "spencer", "password").is_ok());

    for (user, password) in [("spencer", "wrong"), ("nobody", "password")] {
        let mut session = harness.session();
        let reply = harness.login_plain(&mut session, "test", user, password);
        assert_eq!(reply.code(), Some(i64::from(AUTHENTICATION_FAILED_CODE)));
    }
}

#[test]
fn test_scram_full_exchange() {
    let harness = harness_with_user();
    let mut session = harness.session();

    // login_scram verifies the server signature on success.
    let reply = harness.login_scram(&mut session, "test", "spencer", "password");
    assert!(reply.is_ok(), "{reply}");
    assert_eq!(reply.get("done"), Some(&json!(true)));
    assert!(session.authz.is_authenticated());
}

#[test]
fn test_scram_wrong_password_or_unknown_user() {
    let harness = harness_with_user();

    for (user, password) in [("spencer", "wrong"), ("nobody", "password")] {
        let mut session = harness.session();
        let reply = harness.login_scram(&mut session, "test", user, password);
        assert_eq!(reply.code(), Some(i64::from(AUTHENTICATION_FAILED_CODE)), "{user}");
        assert!(!session.authz.is_authenticated());
    }
}

#[test]
fn test_sasl_continue_without_start() {
    let harness = harness_with_user();
    let mut session = harness.session();

    let reply = harness.run(
        &mut session,
        "test",
        json!({"saslContinue": 1, "conversationId": 1, "payload": ""}),
    );
    assert_eq!(reply.code(), Some(i64::from(BAD_COMMAND_CODE)));
}

#[test]
fn test_unsupported_sasl_mechanism() {
    let harness = harness_with_user();
    let mut session = harness.session();

    let reply = harness.run(
        &mut session,
        "test",
        json!({"saslStart": 1, "mechanism": "GSSAPI", "payload": ""}),
    );
    assert!(!reply.is_ok());
    assert_eq!(reply.code_name(), Some("InvalidArgument"));
}

#[test]
fn test_logout_drops_privileges() {
    let harness = TestHarness::new();
    harness.create_user("admin", "root", "password", &["root"]);
    let mut session = harness.session();

    assert!(harness.login_challenge(&mut session, "admin", "root", "password").is_ok());
    harness.run_ok(&mut session, "test", json!({"usersInfo": 1}));

    harness.run_ok(&mut session, "admin", json!({"logout": 1}));
    let reply = harness.run(&mut session, "test", json!({"usersInfo": 1}));
    assert_eq!(reply.code_name(), Some("Unauthorized"));
}

#[test]
fn test_auth_metrics_recorded() {
    let harness = harness_with_user();
    let mut session = harness.session();
    harness.login_challenge(&mut session, "test", "spencer", "password");
    harness.login_challenge(&mut session, "test", "spencer", "wrong");

    let metrics = harness.server.metrics().expect("metrics enabled by default");
    let encoded = metrics.encode().unwrap();
    assert!(encoded.contains("authkeeper_auth_attempts_total"));
    assert!(encoded.contains("CHALLENGE-RESPONSE"));
}
