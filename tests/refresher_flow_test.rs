//! Refreshers renewing registrations and subscriptions end to end

mod common;

use common::TestUa;
use sipflow::domain::shared::value_objects::{RefresherId, SipMethod};
use sipflow::infrastructure::protocols::sip::{
    RefreshFailure, RefreshReport, RefresherState, RequestBuilder, ResponseBuilder, SipHeaders,
    SipRequest, UserCredentials,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Reports = Arc<Mutex<Vec<RefreshReport>>>;

fn register(expires: u32) -> SipRequest {
    RequestBuilder::new(SipMethod::Register, "sip:192.0.2.4")
        .from("sip:alice@example.com")
        .to("sip:alice@example.com")
        .contact("sip:alice@192.0.2.1:5060")
        .expires(expires)
        .build()
        .unwrap()
}

/// Answer the last request of `method` on the wire
fn answer(ua: &mut TestUa, method: SipMethod, status: u16, headers: &[(&str, &str)]) {
    let mut builder = ResponseBuilder::new(status).to_tag("srv");
    for (name, value) in headers {
        builder = builder.header(name, *value);
    }
    let response = builder.build_for_request(&ua.last_request(method)).unwrap();
    ua.provider.route_response(response);
}

/// Completed registration handed to a refresher that records its reports
fn registered(ua: &mut TestUa, expires: u32) -> (RefresherId, Reports) {
    let key = ua
        .provider
        .create_client_transaction(register(expires))
        .unwrap();
    ua.provider.send_request(&key).unwrap();
    let granted = expires.to_string();
    answer(ua, SipMethod::Register, 200, &[("Expires", granted.as_str())]);
    ua.drain();

    let id = ua.provider.create_refresher(&key).unwrap();
    let reports = Reports::default();
    let sink = reports.clone();
    ua.provider
        .set_refresher_listener(
            id,
            Box::new(move |report| sink.lock().unwrap().push(report.clone())),
        )
        .unwrap();
    (id, reports)
}

fn codes(reports: &Reports) -> Vec<u16> {
    reports.lock().unwrap().iter().map(|r| r.status_code).collect()
}

#[tokio::test(start_paused = true)]
async fn test_registration_renewed_before_expiry() {
    let mut ua = TestUa::new();
    let (id, reports) = registered(&mut ua, 600);
    assert_eq!(ua.provider.refresher_expires(id).unwrap(), 600);
    assert_eq!(ua.provider.refresher_state(id).unwrap(), RefresherState::Armed);

    ua.run_for(Duration::from_secs(539)).await;
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 1);

    ua.run_for(Duration::from_secs(2)).await;
    let renewal = ua.last_request(SipMethod::Register);
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 2);
    assert_eq!(renewal.cseq(), Some((2, SipMethod::Register)));
    assert_eq!(renewal.expires(), Some(600));

    answer(&mut ua, SipMethod::Register, 200, &[("Expires", "300")]);
    assert_eq!(codes(&reports), vec![200]);
    assert_eq!(ua.provider.refresher_expires(id).unwrap(), 300);

    // unregister
    ua.provider.refresh(id, 0).unwrap();
    let removal = ua.last_request(SipMethod::Register);
    assert_eq!(removal.expires(), Some(0));
    assert_eq!(removal.cseq(), Some((3, SipMethod::Register)));
    answer(&mut ua, SipMethod::Register, 200, &[("Expires", "0")]);
    assert_eq!(ua.provider.refresher_state(id).unwrap(), RefresherState::Idle);
    assert_eq!(codes(&reports), vec![200, 200]);

    // an idle refresher schedules nothing
    let sent = ua.sent_count();
    ua.run_for(Duration::from_secs(700)).await;
    assert_eq!(ua.sent_count(), sent);
    assert!(ua.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_challenged_renewal_is_resent_with_credentials() {
    let mut ua = TestUa::new();
    ua.provider
        .add_credentials(UserCredentials::new("alice", "secret").with_realm("example.com"));
    let (id, reports) = registered(&mut ua, 600);

    ua.provider.refresh(id, 600).unwrap();
    let first = ua.last_request(SipMethod::Register);
    answer(
        &mut ua,
        SipMethod::Register,
        401,
        &[(
            "WWW-Authenticate",
            r#"Digest realm="example.com", nonce="84a4cc6f3082121f32b42a2187831a9e""#,
        )],
    );
    assert!(codes(&reports).is_empty());

    let retry = ua.last_request(SipMethod::Register);
    assert_eq!(
        retry.cseq_number(),
        first.cseq_number().map(|cseq| cseq + 1)
    );
    assert_ne!(retry.branch(), first.branch());
    let authorization = retry.header_value("Authorization").unwrap();
    assert!(authorization.starts_with(r#"Digest username="alice", realm="example.com""#));

    answer(&mut ua, SipMethod::Register, 200, &[("Expires", "600")]);
    assert_eq!(codes(&reports), vec![200]);
    assert_eq!(ua.provider.refresher_state(id).unwrap(), RefresherState::Armed);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_challenge_reports_auth_failure() {
    let mut ua = TestUa::new();
    ua.provider
        .add_credentials(UserCredentials::new("alice", "wrong").with_realm("example.com"));
    let (id, reports) = registered(&mut ua, 600);
    let challenge = [(
        "WWW-Authenticate",
        r#"Digest realm="example.com", nonce="aa11""#,
    )];

    ua.provider.refresh(id, 600).unwrap();
    answer(&mut ua, SipMethod::Register, 401, &challenge);
    answer(&mut ua, SipMethod::Register, 401, &challenge);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status_code, 401);
    assert_eq!(reports[0].failure, Some(RefreshFailure::AuthFailure));
    assert!(!reports[0].will_retry);
}

#[tokio::test(start_paused = true)]
async fn test_short_expiry_renews_until_stopped() {
    let mut ua = TestUa::new();
    let (id, reports) = registered(&mut ua, 1);

    for round in 1..=3 {
        ua.run_for(Duration::from_secs(1)).await;
        assert_eq!(ua.sent_requests(SipMethod::Register).len(), 1 + round);
        answer(&mut ua, SipMethod::Register, 200, &[("Expires", "1")]);
    }
    assert_eq!(codes(&reports), vec![200, 200, 200]);

    ua.provider.stop_refresher(id).unwrap();
    ua.provider.stop_refresher(id).unwrap();
    ua.run_for(Duration::from_secs(5)).await;
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 4);
    assert!(ua.provider.refresher_state(id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_double_unregister_sends_once() {
    let mut ua = TestUa::new();
    let (id, _) = registered(&mut ua, 600);

    ua.provider.refresh(id, 0).unwrap();
    ua.provider.refresh(id, 0).unwrap();
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 2);
    assert_eq!(
        ua.provider.refresher_state(id).unwrap(),
        RefresherState::InFlight { queued: None }
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscription_renewed_inside_dialog() {
    let mut ua = TestUa::new();
    let subscribe = RequestBuilder::new(SipMethod::Subscribe, "sip:bob@192.0.2.4")
        .from("sip:alice@example.com")
        .to("sip:bob@example.com")
        .contact("sip:alice@192.0.2.1:5060")
        .header("Event", "presence")
        .header("Accept", "application/pidf+xml")
        .expires(600)
        .build()
        .unwrap();
    let key = ua.provider.create_client_transaction(subscribe).unwrap();
    ua.provider.send_request(&key).unwrap();
    answer(
        &mut ua,
        SipMethod::Subscribe,
        200,
        &[("Expires", "600"), ("Contact", "<sip:bob@192.0.2.9>")],
    );
    ua.drain();

    let id = ua.provider.create_refresher(&key).unwrap();
    ua.provider.refresh(id, 600).unwrap();

    let renewal = ua.last_request(SipMethod::Subscribe);
    assert_eq!(renewal.uri_string(), "sip:bob@192.0.2.9");
    assert_eq!(renewal.to_tag().as_deref(), Some("srv"));
    assert_eq!(renewal.cseq(), Some((2, SipMethod::Subscribe)));
    assert_eq!(renewal.header_value("Event").as_deref(), Some("presence"));
    assert_eq!(
        renewal.header_value("Accept").as_deref(),
        Some("application/pidf+xml")
    );
    assert_eq!(renewal.expires(), Some(600));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_renewal_reports_timeout_and_retries() {
    let mut ua = TestUa::new();
    let (id, reports) = registered(&mut ua, 600);
    ua.provider.refresh(id, 600).unwrap();

    ua.run_for(Duration::from_secs(33)).await;
    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status_code, 408);
        assert_eq!(reports[0].failure, Some(RefreshFailure::Timeout));
        assert!(reports[0].will_retry);
    }
    // timeouts of refresher transactions never reach the application
    assert!(ua.drain().is_empty());

    let sent = ua.sent_requests(SipMethod::Register).len();
    ua.run_for(Duration::from_secs(3)).await;
    assert!(ua.sent_requests(SipMethod::Register).len() > sent);
    assert!(matches!(
        ua.provider.refresher_state(id).unwrap(),
        RefresherState::InFlight { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_interval_too_brief_is_retried_with_min_expires() {
    let mut ua = TestUa::new();
    let (id, reports) = registered(&mut ua, 600);
    ua.provider.refresh(id, 30).unwrap();

    answer(&mut ua, SipMethod::Register, 423, &[("Min-Expires", "120")]);
    let retry = ua.last_request(SipMethod::Register);
    assert_eq!(retry.expires(), Some(120));
    assert!(codes(&reports).is_empty());

    answer(&mut ua, SipMethod::Register, 200, &[("Expires", "120")]);
    assert_eq!(codes(&reports), vec![200]);
    assert_eq!(ua.provider.refresher_expires(id).unwrap(), 120);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_auth_failure_answers_new_challenge() {
    let mut ua = TestUa::new();
    ua.provider
        .add_credentials(UserCredentials::new("alice", "secret").with_realm("example.com"));
    let (id, reports) = registered(&mut ua, 600);
    ua.provider
        .set_retry_after(id, Some(Duration::from_secs(30)))
        .unwrap();
    let challenge = [(
        "WWW-Authenticate",
        r#"Digest realm="example.com", nonce="bb22""#,
    )];

    ua.provider.refresh(id, 600).unwrap();
    answer(&mut ua, SipMethod::Register, 401, &challenge);
    answer(&mut ua, SipMethod::Register, 401, &challenge);
    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failure, Some(RefreshFailure::AuthFailure));
        assert!(reports[0].will_retry);
    }
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 3);

    ua.run_for(Duration::from_secs(31)).await;
    let retry = ua.last_request(SipMethod::Register);
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 4);
    assert!(retry.header_value("Authorization").is_none());

    answer(&mut ua, SipMethod::Register, 401, &challenge);
    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 5);
    let answered = ua.last_request(SipMethod::Register);
    assert!(answered.header_value("Authorization").is_some());
    assert_eq!(codes(&reports), vec![401]);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_refresher_ignores_outstanding_renewal() {
    for status in [200, 401] {
        let mut ua = TestUa::new();
        ua.provider
            .add_credentials(UserCredentials::new("alice", "secret").with_realm("example.com"));
        let (id, reports) = registered(&mut ua, 600);

        ua.provider.refresh(id, 600).unwrap();
        ua.provider.stop_refresher(id).unwrap();
        let sent = ua.sent_requests(SipMethod::Register).len();
        answer(
            &mut ua,
            SipMethod::Register,
            status,
            &[
                ("Expires", "600"),
                ("WWW-Authenticate", r#"Digest realm="example.com", nonce="cc33""#),
            ],
        );

        ua.run_for(Duration::from_secs(700)).await;
        assert!(codes(&reports).is_empty(), "reported after stop on {}", status);
        assert_eq!(ua.sent_requests(SipMethod::Register).len(), sent);
        assert!(ua.provider.refresher_state(id).is_err());
    }
}

#[tokio::test(start_paused = true)]
async fn test_interval_too_brief_does_not_revive_unregister() {
    let mut ua = TestUa::new();
    let (id, reports) = registered(&mut ua, 600);

    ua.provider.refresh(id, 0).unwrap();
    answer(&mut ua, SipMethod::Register, 423, &[("Min-Expires", "120")]);

    assert_eq!(ua.sent_requests(SipMethod::Register).len(), 2);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status_code, 423);
    assert_eq!(reports[0].failure, Some(RefreshFailure::Rejected));
    assert!(!reports[0].will_retry);
    drop(reports);
    assert_eq!(ua.provider.refresher_state(id).unwrap(), RefresherState::Idle);
}
