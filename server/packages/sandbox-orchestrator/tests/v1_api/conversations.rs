use super::*;

#[tokio::test]
async fn starting_a_conversation_waits_for_a_fresh_sandbox() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversations",
        Some(json!({ "title": "first", "initial_message": "hello" })),
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let conversation = parse_json(&body);
    assert_eq!(conversation["title"], "first");
    assert_eq!(conversation["created_by_user_id"], "alice");
    assert_eq!(conversation["sandbox_status"], "RUNNING");
    let id = conversation["id"].as_str().expect("id").to_string();

    let requests = test_app.agent.requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].0.starts_with("http://localhost:"));
    assert!(requests[0].1.is_some());

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{id}"),
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["sandbox_id"], conversation["sandbox_id"]);

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations/{id}"),
        None,
        &[("x-user-id", "bob")],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/conversations?ids={id}"),
        None,
        &[("x-user-id", "root")],
    )
    .await;
    assert_eq!(parse_json(&body)[0]["id"], id.as_str());
}

#[tokio::test]
async fn conversations_resume_paused_sandboxes() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let started = test_app.start_sandbox("alice").await;
    let sandbox_id = started["id"].as_str().expect("id").to_string();
    test_app
        .engine
        .set_status(&test_app.container_name(&sandbox_id), "paused");

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversations",
        Some(json!({ "sandbox_id": sandbox_id })),
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    assert_eq!(parse_json(&body)["sandbox_status"], "RUNNING");
    assert!(test_app
        .engine
        .calls()
        .iter()
        .any(|call| call.starts_with("unpause_container")));

    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/conversations",
        Some(json!({ "sandbox_id": sandbox_id })),
        &[("x-user-id", "bob")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn search_lists_only_the_callers_conversations() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    for (user, title) in [("alice", "a1"), ("bob", "b1"), ("alice", "a2")] {
        let (status, _, _) = send_request(
            &test_app.app,
            Method::POST,
            "/v1/conversations",
            Some(json!({ "title": title })),
            &[("x-user-id", user)],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/conversations/search",
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    let titles: Vec<String> = parse_json(&body)["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["title"].as_str().expect("title").to_string())
        .collect();
    assert_eq!(titles, vec!["a2", "a1"]);

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/conversations/search?limit=2",
        None,
        &[("x-user-id", "root")],
    )
    .await;
    let page = parse_json(&body);
    assert_eq!(page["items"].as_array().expect("items").len(), 2);
    assert!(page["next_page_id"].is_string());
}
