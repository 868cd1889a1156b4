//! Gateway client and webhook delivery against a fake HTTP server.

use std::sync::Arc;
use std::time::Duration;

use chanpulse_core::{AlertEvent, AlertRule, ChannelId, Comparator, MetricName, PlatformError, RuleId, TenantId};
use chanpulse_ingest::notify::{AlertNotification, AlertNotifier, NotifierSet, NotifyError, WebhookNotifier};
use chanpulse_ingest::{Credential, HttpPlatformConnector, PlatformConnector};
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn connected(server: &MockServer) -> Arc<dyn chanpulse_ingest::PlatformSession> {
    Mock::given(method("POST"))
        .and(path("/v1/sessions"))
        .and(body_json(json!({ "tenant_id": "acct-1", "credential": "s3cret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session_token": "tok-1" })))
        .mount(server)
        .await;

    HttpPlatformConnector::new(server.uri(), Duration::from_secs(5))
        .expect("client")
        .connect(&TenantId::new("acct-1"), &Credential::new("s3cret"))
        .await
        .expect("connect")
}

#[tokio::test]
async fn history_page_is_fetched_with_bearer_token_and_cursor() {
    let server = MockServer::start().await;
    let session = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/v1/channels/-1001/history"))
        .and(query_param("after", "40"))
        .and(query_param("limit", "2"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                { "id": 41, "date": 1_717_200_000, "views": 12 },
                { "id": 42, "date": 1_717_200_060, "reactions": [{ "emoji": "+1", "count": 3 }] }
            ],
            "has_more": true
        })))
        .mount(&server)
        .await;

    let page = session
        .fetch_history(ChannelId::new(-1001), 40, 2)
        .await
        .expect("page");
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![41, 42]);
    assert!(page.has_more);
}

#[tokio::test]
async fn throttled_history_maps_to_flood_wait() {
    let server = MockServer::start().await;
    let session = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/v1/channels/7/history"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
        .mount(&server)
        .await;

    let err = session.fetch_history(ChannelId::new(7), 0, 100).await.unwrap_err();
    assert_eq!(
        err,
        PlatformError::FloodWait {
            retry_after: Duration::from_secs(12)
        }
    );
}

#[tokio::test]
async fn rejected_credential_is_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sessions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("AUTH_KEY_UNREGISTERED"))
        .mount(&server)
        .await;

    let result = HttpPlatformConnector::new(server.uri(), Duration::from_secs(5))
        .expect("client")
        .connect(&TenantId::new("acct-1"), &Credential::new("stale"))
        .await;
    assert!(matches!(result, Err(PlatformError::Auth(message)) if message.contains("AUTH_KEY_UNREGISTERED")));
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    connected(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/channels/7/history"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let quick = HttpPlatformConnector::new(server.uri(), Duration::from_millis(200))
        .expect("client")
        .connect(&TenantId::new("acct-1"), &Credential::new("s3cret"))
        .await
        .expect("connect");
    let err = quick.fetch_history(ChannelId::new(7), 0, 10).await.unwrap_err();
    assert!(matches!(err, PlatformError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn disconnect_deletes_the_session() {
    let server = MockServer::start().await;
    let session = connected(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sessions/tok-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    session.disconnect().await;
}

fn fired() -> AlertNotification {
    let rule = AlertRule {
        id: RuleId::new("views-spike"),
        channel_id: ChannelId::new(7),
        metric_name: MetricName::Views,
        threshold: 1000.0,
        comparator: Comparator::Gt,
        cooldown_seconds: Some(600),
    };
    AlertNotification::Fired {
        event: AlertEvent::fired(&rule, 1500.0, Utc::now()),
        threshold: rule.threshold,
        comparator: rule.comparator,
    }
}

#[tokio::test]
async fn webhook_posts_the_notification_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/alerts"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(format!("{}/hooks/alerts", server.uri()), Duration::from_secs(5))
        .expect("client");
    notifier.notify(&fired()).await.expect("delivered");

    let requests = server.received_requests().await.expect("recorded");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json body");
    assert_eq!(body["kind"], "fired");
    assert_eq!(body["event"]["rule_id"], "views-spike");
    assert_eq!(body["comparator"], "gt");
}

#[tokio::test]
async fn webhook_failure_is_reported_but_not_fatal_in_a_set() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let notifier = Arc::new(
        WebhookNotifier::new(format!("{}/hooks", server.uri()), Duration::from_secs(5)).expect("client"),
    );
    assert!(matches!(notifier.notify(&fired()).await, Err(NotifyError::Status(500))));

    let set = NotifierSet::new().with(notifier);
    assert!(set.notify(&fired()).await.is_ok());
}
