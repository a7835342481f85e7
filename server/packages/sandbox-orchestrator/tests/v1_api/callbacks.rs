use super::*;

async fn wait_for_results(test_app: &TestApp, query: &str, count: usize) -> Value {
    for _ in 0..200 {
        let (status, _, body) = send_request(
            &test_app.app,
            Method::GET,
            &format!("/v1/event-callback-results/search?{query}"),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let page = parse_json(&body);
        if page["items"].as_array().map(Vec::len).unwrap_or(0) >= count {
            return page;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} callback results for {query}");
}

#[tokio::test]
async fn event_callback_crud() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let conversation = Uuid::new_v4();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/event-callbacks",
        Some(json!({
            "conversation_id": conversation,
            "processor": { "kind": "logging", "label": "audit" },
            "event_kind": "message"
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let callback = parse_json(&body);
    assert_eq!(callback["status"], "ACTIVE");
    let id = callback["id"].as_str().expect("id").to_string();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::PUT,
        &format!("/v1/event-callbacks/{id}"),
        Some(json!({ "status": "DISABLED" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "DISABLED");
    assert_eq!(parse_json(&body)["processor"]["label"], "audit");

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/event-callbacks/search?status=DISABLED",
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["items"][0]["id"], id.as_str());

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/event-callbacks/search?status=ACTIVE",
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["items"], json!([]));

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/event-callbacks/{id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    for method in [Method::GET, Method::DELETE] {
        let (status, _, _) = send_request(
            &test_app.app,
            method,
            &format!("/v1/event-callbacks/{id}"),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let (status, _, _) = send_request(
        &test_app.app,
        Method::PUT,
        &format!("/v1/event-callbacks/{id}"),
        Some(json!({ "status": "ACTIVE" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn published_events_produce_one_result_per_callback() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let receiver = WebhookReceiver::start().await;
    let conversation = Uuid::new_v4();

    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/event-callbacks",
        Some(json!({
            "processor": {
                "kind": "webhook",
                "url": receiver.url,
                "headers": { "authorization": "Token callback" }
            },
            "event_kind": "message"
        })),
        &[],
    )
    .await;
    let webhook_id = parse_json(&body)["id"].as_str().expect("id").to_string();
    let (_, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/event-callbacks",
        Some(json!({
            "conversation_id": conversation,
            "processor": { "kind": "logging" }
        })),
        &[],
    )
    .await;
    let logging_id = parse_json(&body)["id"].as_str().expect("id").to_string();

    let event_id = Uuid::new_v4();
    send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/events"),
        Some(json!({ "events": [{ "id": event_id, "kind": "message", "payload": {} }] })),
        &[],
    )
    .await;

    let page = wait_for_results(&test_app, &format!("event_id={event_id}"), 2).await;
    let items = page["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|result| result["status"] == "SUCCESS"));

    let bodies = receiver.wait_for(1).await;
    assert_eq!(bodies[0].0.as_deref(), Some("Token callback"));
    assert_eq!(bodies[0].1["id"], event_id.to_string());

    let page = wait_for_results(
        &test_app,
        &format!("event_callback_id={logging_id}&sort_order=CREATED_AT_DESC"),
        1,
    )
    .await;
    let result_id = page["items"][0]["id"].as_str().expect("id").to_string();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/event-callback-results?ids={result_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)[0]["event_callback_id"], logging_id.as_str());

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/event-callback-results/{result_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/event-callback-results/{result_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Other kinds only match the catch-all logging callback.
    let other_event = Uuid::new_v4();
    send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/conversations/{conversation}/events"),
        Some(json!({ "events": [{ "id": other_event, "kind": "action", "payload": {} }] })),
        &[],
    )
    .await;
    let page = wait_for_results(&test_app, &format!("event_id={other_event}"), 1).await;
    assert_eq!(page["items"][0]["event_callback_id"], logging_id.as_str());
    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/event-callback-results/search?event_callback_id={webhook_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(parse_json(&body)["items"].as_array().expect("items").len(), 1);
}
