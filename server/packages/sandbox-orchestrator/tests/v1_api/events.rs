use super::*;

#[tokio::test]
async fn appended_events_are_searchable_by_kind() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let conversation = Uuid::new_v4();
    let event_id = Uuid::new_v4();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/events"),
        Some(json!({
            "events": [
                { "id": event_id, "kind": "message", "payload": { "text": "hi" } },
                { "kind": "action", "payload": { "command": "ls" } },
                { "kind": "message", "payload": { "text": "done" } }
            ]
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let appended = parse_json(&body);
    assert_eq!(appended.as_array().expect("events").len(), 3);
    assert_eq!(appended[0]["conversation_id"], conversation.to_string());

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{conversation}/events?kind=message&limit=1"),
        None,
        &[],
    )
    .await;
    let page = parse_json(&body);
    assert_eq!(page["items"][0]["id"], event_id.to_string());
    let next = page["next_page_id"].as_str().expect("next page").to_string();

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{conversation}/events?kind=message&page_id={next}"),
        None,
        &[],
    )
    .await;
    let page = parse_json(&body);
    assert_eq!(page["items"][0]["payload"]["text"], "done");
    assert!(page["next_page_id"].is_null());

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{conversation}/events/{event_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["kind"], "message");

    let other = Uuid::new_v4();
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{other}/events/{event_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/events?ids={event_id},{other}"),
        None,
        &[],
    )
    .await;
    let batch = parse_json(&body);
    assert_eq!(batch[0]["id"], event_id.to_string());
    assert!(batch[1].is_null());
}

#[tokio::test]
async fn subscribers_batch_events_to_their_webhook() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let receiver = WebhookReceiver::start().await;
    let conversation = Uuid::new_v4();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/subscribers"),
        Some(json!({
            "kind": "webhook",
            "name": "audit",
            "url": receiver.url,
            "filter_types": ["message"],
            "max_batch_size": 2,
            "max_wait_ms": 60000,
            "session_api_key": "hook-key"
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let subscriber = parse_json(&body);
    let subscriber_id = subscriber["id"].as_str().expect("id").to_string();
    assert!(subscriber["definition"]["session_api_key"].is_null());

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/events"),
        Some(json!({
            "events": [
                { "kind": "message", "payload": { "n": 1 } },
                { "kind": "action", "payload": {} },
                { "kind": "message", "payload": { "n": 2 } },
                { "kind": "message", "payload": { "n": 3 } }
            ]
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Two matching events fill one batch; the third waits for the timer.
    let bodies = receiver.wait_for(1).await;
    let (auth, batch) = &bodies[0];
    assert_eq!(auth.as_deref(), Some("Bearer hook-key"));
    assert_eq!(batch["subscriber_id"], subscriber_id.as_str());
    let numbers: Vec<i64> = batch["events"]
        .as_array()
        .expect("events")
        .iter()
        .map(|event| event["payload"]["n"].as_i64().expect("n"))
        .collect();
    assert_eq!(numbers, vec![1, 2]);

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/subscribers/search?conversation_id={conversation}"),
        None,
        &[],
    )
    .await;
    let page = parse_json(&body);
    assert_eq!(page["items"][0]["id"], subscriber_id.as_str());

    // Deleting flushes what is still buffered.
    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/subscribers/{subscriber_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let bodies = receiver.wait_for(2).await;
    assert_eq!(bodies[1].1["events"][0]["payload"]["n"], 3);

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/subscribers/{subscriber_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_subscriber_urls_are_rejected() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let conversation = Uuid::new_v4();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/subscribers"),
        Some(json!({ "kind": "webhook", "url": "ftp://example.test/hook" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:invalid_request"
    );
}

async fn sandbox_with_key(test_app: &TestApp, headers: &[(&str, &str)]) -> (String, String) {
    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/sandboxes",
        Some(json!({})),
        headers,
    )
    .await;
    let id = parse_json(&body)["id"].as_str().expect("id").to_string();
    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes/{id}"),
        None,
        headers,
    )
    .await;
    let key = parse_json(&body)["session_api_key"]
        .as_str()
        .expect("session key")
        .to_string();
    (id, key)
}

#[tokio::test]
async fn sandboxes_post_events_with_their_session_key() {
    let test_app = TestApp::new(AuthConfig::with_token("secret-token".to_string())).await;
    let alice = [("authorization", "Bearer secret-token"), ("x-user-id", "alice")];
    let bob = [("authorization", "Bearer secret-token"), ("x-user-id", "bob")];

    let (id, key) = sandbox_with_key(&test_app, &alice).await;
    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversations",
        Some(json!({ "sandbox_id": id })),
        &alice,
    )
    .await;
    let conversation = parse_json(&body)["id"].as_str().expect("id").to_string();

    let payload = json!({
        "conversation_id": conversation,
        "events": [{ "kind": "message", "payload": { "text": "from sandbox" } }]
    });
    let path = format!("/v1/event-webhooks/{id}/events");

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &path,
        Some(payload.clone()),
        &[("x-session-api-key", "wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &path,
        Some(payload.clone()),
        &[("x-session-api-key", key.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)[0]["conversation_id"], conversation.as_str());
    let conversation_id = Uuid::parse_str(&conversation).expect("uuid");
    assert_eq!(
        test_app.state.context().events.count_events(conversation_id).await,
        1
    );

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/event-webhooks/{}/events", Uuid::new_v4()),
        Some(payload),
        &[("x-session-api-key", key.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &path,
        Some(json!({ "conversation_id": Uuid::new_v4(), "events": [] })),
        &[("x-session-api-key", key.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Another sandbox's valid key cannot write into this conversation.
    let (other_id, other_key) = sandbox_with_key(&test_app, &bob).await;
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/event-webhooks/{other_id}/events"),
        Some(json!({
            "conversation_id": conversation,
            "events": [{ "kind": "message", "payload": { "text": "intruder" } }]
        })),
        &[("x-session-api-key", other_key.as_str())],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:permission_denied"
    );
    assert_eq!(
        test_app.state.context().events.count_events(conversation_id).await,
        1
    );
}

#[tokio::test]
async fn event_ids_cannot_move_between_conversations() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let event_id = Uuid::new_v4();

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{first}/events"),
        Some(json!({
            "events": [{ "id": event_id, "kind": "message", "payload": { "who": "first" } }]
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{second}/events"),
        Some(json!({
            "events": [{ "id": event_id, "kind": "message", "payload": { "who": "second" } }]
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(parse_json(&body)["type"], "urn:sandbox-orchestrator:error:conflict");

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{first}/events/{event_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["payload"]["who"], "first");
}
