use super::*;

#[tokio::test]
async fn health_is_open_and_unknown_routes_are_404() {
    let test_app = TestApp::new(AuthConfig::with_token("secret-token".to_string())).await;

    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "ok");

    let (status, _, _) = send_request(&test_app.app, Method::GET, "/nowhere", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let test_app = TestApp::new(AuthConfig::with_token("secret-token".to_string())).await;

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sandboxes/search", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:token_invalid"
    );

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sandboxes/search",
        None,
        &[("authorization", "Bearer secret-token")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sandbox_lifecycle_round_trip() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;

    let started = test_app.start_sandbox("alice").await;
    assert_eq!(started["status"], "STARTING");
    assert_eq!(started["created_by_user_id"], "alice");
    assert_eq!(started["sandbox_spec_id"], SPEC);
    let id = started["id"].as_str().expect("id").to_string();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let running = parse_json(&body);
    assert_eq!(running["status"], "RUNNING");
    assert!(running["session_api_key"].is_string());
    assert!(running["url"].as_str().expect("url").starts_with("http://localhost:"));
    assert_eq!(running["exposed_urls"][0]["name"], "APPLICATION_SERVER_PORT");

    for action in ["pause", "resume"] {
        let (status, _, _) = send_request(
            &test_app.app,
            Method::POST,
            &format!("/v1/sandboxes/{id}/{action}"),
            None,
            &[("x-user-id", "alice")],
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{action}");
    }

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(test_app.engine.container_names().is_empty());

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(&body)["status"], 404);
}

#[tokio::test]
async fn other_users_cannot_mutate_or_read_the_session_key() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let started = test_app.start_sandbox("alice").await;
    let id = started["id"].as_str().expect("id").to_string();

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        &format!("/v1/sandboxes/{id}/pause"),
        None,
        &[("x-user-id", "mallory")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:permission_denied"
    );

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[("x-user-id", "mallory")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse_json(&body)["session_api_key"].is_null());

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sandboxes/search",
        None,
        &[("x-user-id", "mallory")],
    )
    .await;
    assert_eq!(parse_json(&body)["items"], json!([]));

    let (status, _, _) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[("x-user-id", "root")],
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn missing_sandboxes_are_404_for_every_mutation() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let id = Uuid::new_v4();
    for (method, path) in [
        (Method::POST, format!("/v1/sandboxes/{id}/pause")),
        (Method::POST, format!("/v1/sandboxes/{id}/resume")),
        (Method::DELETE, format!("/v1/sandboxes/{id}")),
    ] {
        let (status, _, _) = send_request(&test_app.app, method, &path, None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn search_pages_and_batch_get_preserves_order() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let started = test_app.start_sandbox("alice").await;
        ids.push(started["id"].as_str().expect("id").to_string());
    }

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sandboxes/search?limit=2",
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    let first = parse_json(&body);
    assert_eq!(first["items"].as_array().expect("items").len(), 2);
    let next = first["next_page_id"].as_str().expect("next page").to_string();

    let (_, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes/search?limit=2&page_id={next}"),
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    let second = parse_json(&body);
    assert_eq!(second["items"].as_array().expect("items").len(), 1);
    assert!(second["next_page_id"].is_null());

    let missing = Uuid::new_v4();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandboxes?ids={},{missing}&ids={}", ids[2], ids[0]),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch = parse_json(&body);
    assert_eq!(batch[0]["id"], ids[2].as_str());
    assert!(batch[1].is_null());
    assert_eq!(batch[2]["id"], ids[0].as_str());

    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sandboxes?ids=not-a-uuid",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn engine_outage_reads_as_empty_search() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let started = test_app.start_sandbox("alice").await;
    let id = started["id"].as_str().expect("id").to_string();
    test_app.engine.fail_with(Some("daemon unavailable"));

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sandboxes/search",
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["items"], json!([]));

    let (status, _, body) = send_request(
        &test_app.app,
        Method::DELETE,
        &format!("/v1/sandboxes/{id}"),
        None,
        &[("x-user-id", "alice")],
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:sandbox_error"
    );
}

#[tokio::test]
async fn specs_are_listed_and_unknown_specs_are_rejected() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;

    let (_, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/sandbox-specs/search", None, &[]).await;
    let page = parse_json(&body);
    assert_eq!(page["items"][0]["id"], SPEC);

    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        &format!("/v1/sandbox-specs?ids={SPEC},missing:tag"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch = parse_json(&body);
    assert_eq!(batch[0]["id"], SPEC);
    assert!(batch[1].is_null());

    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/sandboxes",
        Some(json!({ "sandbox_spec_id": "missing:tag" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:sandbox-orchestrator:error:sandbox_spec_not_found"
    );
}

#[tokio::test]
async fn openapi_document_is_served() {
    let test_app = TestApp::new(AuthConfig::disabled()).await;
    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/openapi.json", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let doc = parse_json(&body);
    assert!(doc["paths"]["/v1/sandboxes/search"].is_object());
}
