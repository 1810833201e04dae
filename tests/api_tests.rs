//! REST gateway tests against an in-process fake backend.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chatsync::{ApiClient, ConversationKey, Error, WireMessage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "tok-alice";

type Reply = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Clone, Default)]
struct Backend {
    limits: Arc<Mutex<Vec<Option<u32>>>>,
    responses: Arc<Mutex<Vec<(String, bool)>>>,
    names: Arc<Mutex<Vec<Value>>>,
    appended: Arc<Mutex<Vec<Value>>>,
}

fn require_token(headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Invalid token" })))),
    }
}

async fn login(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    if params.get("password").map(String::as_str) == Some("secret") {
        Json(json!({ "token": TOKEN, "uid": "alice", "username": "Alice" }))
    } else {
        Json(json!({ "status": "error", "message": "Invalid credentials" }))
    }
}

async fn register(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    if params.get("email").map(String::as_str) == Some("taken@example.org") {
        Json(json!({ "status": "error", "message": "User already exists" }))
    } else {
        Json(json!({ "message": "User registered successfully" }))
    }
}

async fn contacts(headers: HeaderMap, Path(uid): Path<String>) -> Reply {
    require_token(&headers)?;
    assert_eq!(uid, "alice");
    Ok(Json(json!({
        "contacts": [
            { "uid": "bob", "username": "Bob", "email": "bob@example.org" },
            { "id": "carol", "displayName": "Carol", "profileImage": "https://img/carol.png" }
        ]
    })))
}

async fn messages(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Path((me, peer)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Reply {
    require_token(&headers)?;
    let limit = params.get("limit").and_then(|l| l.parse::<u32>().ok());
    backend.limits.lock().push(limit);

    let all = vec![
        json!({ "sender": peer, "receiver": me, "message": "one", "timestamp": "2025-03-04T10:00:00Z" }),
        json!({ "id": "m2", "sender": me, "receiver": peer, "text": "two", "timestamp": "2025-03-04T10:01:00Z", "status": "seen" }),
        json!({ "sender": peer, "receiver": me, "message": "three", "timestamp": "2025-03-04T10:02:00Z" }),
    ];
    let take = limit.map(|l| l as usize).unwrap_or(all.len());
    let start = all.len().saturating_sub(take);
    Ok(Json(Value::Array(all[start..].to_vec())))
}

async fn append_message(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    require_token(&headers)?;
    if body["message"].as_str().unwrap_or_default().is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "detail": "empty message" }))));
    }
    backend.appended.lock().push(body);
    Ok(Json(json!({ "status": "ok" })))
}

async fn group_messages(headers: HeaderMap, Path(group_id): Path<String>) -> Reply {
    require_token(&headers)?;
    Ok(Json(json!([
        { "sender": "bob", "group_id": group_id, "message": "hey all", "timestamp": "2025-03-04T10:00:00Z" }
    ])))
}

async fn group_members(headers: HeaderMap, Path(group_id): Path<String>) -> Reply {
    require_token(&headers)?;
    if group_id == "missing" {
        return Err((StatusCode::NOT_FOUND, Json(json!({ "detail": "Group not found" }))));
    }
    Ok(Json(json!({ "members": [{ "uid": "bob", "username": "Bob" }] })))
}

async fn create_group(headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    require_token(&headers)?;
    Ok(Json(json!({
        "group_id": "g-new",
        "name": body["name"],
        "members": body["members"],
        "created_by": body["created_by"],
    })))
}

async fn delete_group(headers: HeaderMap, Path(_id): Path<String>) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    require_token(&headers)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search_users(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Reply {
    require_token(&headers)?;
    let q = params.get("q").cloned().unwrap_or_default();
    Ok(Json(json!({ "users": [{ "uid": format!("{}-1", q), "username": q }] })))
}

async fn contact_requests(headers: HeaderMap, Path(_uid): Path<String>) -> Reply {
    require_token(&headers)?;
    Ok(Json(json!({
        "requests": [{ "id": "r1", "from": "dave", "from_name": "Dave", "to": "alice" }]
    })))
}

async fn respond(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    require_token(&headers)?;
    let accept = body["accept"].as_bool().unwrap_or(false);
    backend.responses.lock().push((id, accept));
    Ok(Json(json!({ "message": "ok" })))
}

async fn update_name(State(backend): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    require_token(&headers)?;
    backend.names.lock().push(body);
    Ok(Json(json!({ "message": "Name updated" })))
}

async fn upload(headers: HeaderMap, mut multipart: Multipart) -> Reply {
    require_token(&headers)?;
    let mut uid = String::new();
    let mut file = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "uid" => uid = field.text().await.unwrap(),
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let mime = field.content_type().unwrap_or_default().to_string();
                let len = field.bytes().await.unwrap().len();
                file = Some((name, mime, len));
            }
            _ => {}
        }
    }
    let (name, mime, len) = file.expect("file part");
    assert_eq!(mime, "image/png");
    assert_eq!(len, 4);
    Ok(Json(json!({ "profile_image": format!("https://cdn/{}/{}", uid, name) })))
}

async fn spawn_backend() -> (String, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/contacts/:uid", get(contacts))
        .route("/messages", post(append_message))
        .route("/messages/:me/:peer", get(messages))
        .route("/groups", post(create_group))
        .route("/groups/:id", delete(delete_group))
        .route("/groups/:id/messages", get(group_messages))
        .route("/groups/:id/members", get(group_members))
        .route("/search_users", get(search_users))
        .route("/contact_requests/:id", get(contact_requests))
        .route("/contact_requests/:id/respond", post(respond))
        .route("/update_name", post(update_name))
        .route("/upload_profile_picture", post(upload))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), backend)
}

fn client(base_url: &str) -> ApiClient {
    ApiClient::with_base_url(base_url, Duration::from_secs(5)).unwrap()
}

async fn logged_in() -> (ApiClient, Backend) {
    let (url, backend) = spawn_backend().await;
    let api = client(&url);
    api.login("alice@example.org", "secret").await.unwrap();
    (api, backend)
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn test_login_stores_token() {
    let (url, _) = spawn_backend().await;
    let api = client(&url);
    assert!(!api.has_token());

    let session = api.login("alice@example.org", "secret").await.unwrap();
    assert_eq!(session.uid, "alice");
    assert_eq!(session.display_name, "Alice");
    assert_eq!(session.token, TOKEN);
    assert!(api.has_token());

    let contacts = api.contacts("alice").await.unwrap();
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].display_name, "Bob");
    assert_eq!(contacts[1].uid, "carol");
    assert_eq!(contacts[1].profile_image.as_deref(), Some("https://img/carol.png"));
}

#[tokio::test]
async fn test_login_rejected_in_body_is_auth_error() {
    let (url, _) = spawn_backend().await;
    let api = client(&url);

    match api.login("alice@example.org", "wrong").await {
        Err(Error::Auth(detail)) => assert_eq!(detail, "Invalid credentials"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!api.has_token());
}

#[tokio::test]
async fn test_calls_without_token_fail_locally() {
    let api = client("http://127.0.0.1:9");
    assert!(matches!(api.contacts("alice").await, Err(Error::NotLoggedIn)));
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth_error() {
    let (url, _) = spawn_backend().await;
    let api = client(&url);
    api.set_token("expired");

    match api.contacts("alice").await {
        Err(Error::Auth(detail)) => assert_eq!(detail, "Invalid token"),
        other => panic!("unexpected {:?}", other),
    }

    api.clear_token();
    assert!(matches!(api.contacts("alice").await, Err(Error::NotLoggedIn)));
}

#[tokio::test]
async fn test_register_validates_before_any_request() {
    // Nothing listens here: reaching the network would be a Transport error.
    let api = client("http://127.0.0.1:9");
    assert!(matches!(
        api.register("bob@example.org", "bob", "12345").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        api.register("", "bob", "secret").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_register_reports_server_detail() {
    let (url, _) = spawn_backend().await;
    let api = client(&url);

    api.register("new@example.org", "newbie", "secret").await.unwrap();
    match api.register("taken@example.org", "taken", "secret").await {
        Err(Error::Api { detail, .. }) => assert_eq!(detail, "User already exists"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let api = client("http://127.0.0.1:9");
    assert!(matches!(
        api.login("alice@example.org", "secret").await,
        Err(Error::Transport(_))
    ));
}

// ============================================================================
// Messages and groups
// ============================================================================

#[tokio::test]
async fn test_message_history_with_limit() {
    let (api, backend) = logged_in().await;

    let latest: Vec<WireMessage> = api.messages("alice", "bob", Some(2)).await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].message, "two");
    assert_eq!(latest[0].id.as_deref(), Some("m2"));

    let all = api.history("alice", &ConversationKey::Direct("bob".into()), None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(*backend.limits.lock(), vec![Some(2), None]);

    let message = all[0].clone().into_message("alice", None).unwrap();
    assert_eq!(message.conversation, ConversationKey::Direct("bob".into()));
}

#[tokio::test]
async fn test_append_message() {
    let (api, backend) = logged_in().await;

    let mut message = WireMessage {
        id: Some("m9".into()),
        sender: "alice".into(),
        receiver: Some("bob".into()),
        group_id: None,
        message: "hello".into(),
        timestamp: None,
        attachment: None,
        status: None,
    };
    api.append_message(&message).await.unwrap();
    {
        let appended = backend.appended.lock();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0]["sender"], "alice");
        assert_eq!(appended[0]["receiver"], "bob");
        assert_eq!(appended[0]["message"], "hello");
        assert!(appended[0].get("group_id").is_none());
    }

    message.message.clear();
    match api.append_message(&message).await {
        Err(Error::Api { status, detail }) => {
            assert_eq!(status, 422);
            assert_eq!(detail, "empty message");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_group_history_and_members() {
    let (api, _) = logged_in().await;

    let history = api
        .history("alice", &ConversationKey::Group("g1".into()), Some(50))
        .await
        .unwrap();
    assert_eq!(history[0].group_id.as_deref(), Some("g1"));

    let members = api.group_members("g1").await.unwrap();
    assert_eq!(members[0].display_name, "Bob");

    match api.group_members("missing").await {
        Err(Error::Api { status, detail }) => {
            assert_eq!(status, 404);
            assert_eq!(detail, "Group not found");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_create_and_delete_group() {
    let (api, _) = logged_in().await;

    let members = vec!["bob".to_string(), "carol".to_string()];
    let group = api.create_group("  Friends ", "alice", &members).await.unwrap();
    assert_eq!(group.id, "g-new");
    assert_eq!(group.name, "Friends");
    assert_eq!(group.members, members);
    assert_eq!(group.created_by.as_deref(), Some("alice"));

    api.delete_group("g-new").await.unwrap();

    assert!(matches!(
        api.create_group(" ", "alice", &members).await,
        Err(Error::Validation(_))
    ));
}

// ============================================================================
// Directory and profile
// ============================================================================

#[tokio::test]
async fn test_search_users() {
    let (api, _) = logged_in().await;

    let users = api.search_users("dan").await.unwrap();
    assert_eq!(users[0].uid, "dan-1");
    assert!(api.search_users("  ").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_contact_request_lifecycle() {
    let (api, backend) = logged_in().await;

    let requests = api.contact_requests("alice").await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].from_uid, "dave");
    assert_eq!(requests[0].from_name.as_deref(), Some("Dave"));

    api.respond_contact_request("r1", true).await.unwrap();
    api.respond_contact_request("r2", false).await.unwrap();
    assert_eq!(
        *backend.responses.lock(),
        vec![("r1".to_string(), true), ("r2".to_string(), false)]
    );
}

#[tokio::test]
async fn test_update_name() {
    let (api, backend) = logged_in().await;

    api.update_name("alice", "  Alice B ").await.unwrap();
    assert_eq!(*backend.names.lock(), vec![json!({ "uid": "alice", "name": "Alice B" })]);

    assert!(matches!(api.update_name("alice", "").await, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_upload_profile_picture_guesses_mime() {
    let (api, _) = logged_in().await;

    let url = api
        .upload_profile_picture("alice", vec![0x89, b'P', b'N', b'G'], "me.png")
        .await
        .unwrap();
    assert_eq!(url, "https://cdn/alice/me.png");

    assert!(matches!(
        api.upload_profile_picture("alice", vec![1, 2, 3], "notes.txt").await,
        Err(Error::Validation(_))
    ));
}
