use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use assistant_bridge::app::{Notifier, Orchestrator};
use assistant_bridge::clients::AssistantClient;
use assistant_bridge::types::{
    EscalationContext, ReplyFailure, RunStatus, ACK_REPLY, AI_ERROR_REPLY, AI_TIMEOUT_REPLY,
};

fn orchestrator(
    ai: &MockServer,
    notify_url: Option<String>,
    max_retries: u32,
    poll_ceiling: u32,
) -> Orchestrator {
    let http = reqwest::Client::new();
    let assistant =
        AssistantClient::new(http.clone(), "sk-test", "asst_test").with_base_url(ai.uri());
    Orchestrator::new(assistant, Notifier::new(http, notify_url), max_retries).with_timings(
        Duration::from_millis(5),
        poll_ceiling,
        Duration::from_millis(5),
    )
}

fn context() -> EscalationContext {
    EscalationContext {
        conversation_id: 7,
        conversation_url: "https://support.example.com/app/accounts/1/conversations/7".into(),
        customer: Some("Ada <ada@example.com>".into()),
        customer_message: "Where is my order?".into(),
    }
}

fn reply_listing(text: &str) -> Value {
    json!({
        "data": [
            {
                "id": "msg_2",
                "role": "assistant",
                "content": [{ "type": "text", "text": { "value": text } }],
            },
            {
                "id": "msg_1",
                "role": "user",
                "content": [{ "type": "text", "text": { "value": "Where is my order?" } }],
            },
        ]
    })
}

async fn mount_turn_submission(ai: &MockServer, thread_id: &str, attempts: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/threads/{thread_id}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg_1" })))
        .expect(attempts)
        .mount(ai)
        .await;
}

#[tokio::test]
async fn first_poll_success_issues_one_message_and_one_run() {
    let ai = MockServer::start().await;
    mount_turn_submission(&ai, "thread_1", 1).await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "run_1", "status": "queued" })),
        )
        .expect(1)
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .expect(1)
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply_listing(
            "Your order 4512 shipped on Monday. Tracking follows by email.",
        )))
        .expect(1)
        .mount(&ai)
        .await;

    let reply = orchestrator(&ai, None, 2, 5)
        .resolve_reply("thread_1", "Where is my order?", &context())
        .await
        .unwrap();
    assert_eq!(
        reply,
        "Your order 4512 shipped on Monday. Tracking follows by email."
    );
}

#[tokio::test]
async fn stuck_run_times_out_and_escalates_exactly_once() {
    let ai = MockServer::start().await;
    let hooks = MockServer::start().await;

    // Three full attempts, never reaching a terminal state.
    mount_turn_submission(&ai, "thread_1", 3).await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "run_1", "status": "queued" })),
        )
        .expect(3)
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "in_progress" })))
        .mount(&ai)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/chat"))
        .and(body_string_contains("timeout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&hooks)
        .await;

    let failure = orchestrator(&ai, Some(format!("{}/hooks/chat", hooks.uri())), 2, 2)
        .resolve_reply("thread_1", "Where is my order?", &context())
        .await
        .unwrap_err();
    assert!(matches!(failure, ReplyFailure::RunTimedOut), "got {failure:?}");
    assert_eq!(failure.user_message(), AI_TIMEOUT_REPLY);
}

#[tokio::test]
async fn failed_runs_are_retried_until_one_succeeds() {
    let ai = MockServer::start().await;
    let hooks = MockServer::start().await;

    mount_turn_submission(&ai, "thread_1", 3).await;
    // First two run creations produce a run that dies; the third completes.
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "run_bad", "status": "queued" })),
        )
        .up_to_n_times(2)
        .mount(&ai)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "run_good", "status": "queued" })),
        )
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_bad"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "failed" })))
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply_listing(
            "Thanks for waiting! Your refund was approved this morning.",
        )))
        .mount(&ai)
        .await;
    // The first failed attempt escalates; the retries stay quiet.
    Mock::given(method("POST"))
        .and(path("/hooks/chat"))
        .and(body_string_contains("run failed"))
        .and(body_string_contains("run_bad"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&hooks)
        .await;

    let reply = orchestrator(&ai, Some(format!("{}/hooks/chat", hooks.uri())), 2, 5)
        .resolve_reply("thread_1", "Where is my refund?", &context())
        .await
        .unwrap();
    assert_eq!(reply, "Thanks for waiting! Your refund was approved this morning.");
}

#[tokio::test]
async fn exhausted_retries_return_the_last_failure() {
    let ai = MockServer::start().await;
    let hooks = MockServer::start().await;

    mount_turn_submission(&ai, "thread_1", 3).await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "run_bad", "status": "queued" })),
        )
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_bad"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "expired" })))
        .mount(&ai)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&hooks)
        .await;

    let failure = orchestrator(&ai, Some(format!("{}/hooks/chat", hooks.uri())), 2, 5)
        .resolve_reply("thread_1", "Hello?", &context())
        .await
        .unwrap_err();
    match failure {
        ReplyFailure::RunEnded { ref status, ref run_id } => {
            assert_eq!(*status, RunStatus::Expired);
            assert_eq!(run_id, "run_bad");
        }
        other => panic!("expected RunEnded, got {other:?}"),
    }
    assert_eq!(failure.user_message(), AI_ERROR_REPLY);
}

#[tokio::test]
async fn completed_run_without_assistant_message_is_reply_not_found() {
    let ai = MockServer::start().await;
    mount_turn_submission(&ai, "thread_1", 1).await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "run_1", "status": "queued" })),
        )
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "msg_1",
                "role": "user",
                "content": [{ "type": "text", "text": { "value": "Hello?" } }],
            }]
        })))
        .mount(&ai)
        .await;

    let failure = orchestrator(&ai, None, 0, 5)
        .resolve_reply("thread_1", "Hello?", &context())
        .await
        .unwrap_err();
    assert!(matches!(failure, ReplyFailure::ReplyNotFound), "got {failure:?}");
}

#[tokio::test]
async fn structured_only_reply_collapses_to_the_acknowledgment() {
    let ai = MockServer::start().await;
    mount_turn_submission(&ai, "thread_1", 1).await;
    Mock::given(method("POST"))
        .and(path("/v1/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "run_1", "status": "queued" })),
        )
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "completed" })))
        .mount(&ai)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/threads/thread_1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(reply_listing(r#"{"intent": "order_status"}"#)),
        )
        .mount(&ai)
        .await;

    let reply = orchestrator(&ai, None, 0, 5)
        .resolve_reply("thread_1", "Where is my order?", &context())
        .await
        .unwrap();
    assert_eq!(reply, ACK_REPLY);
}
