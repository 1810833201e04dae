//! REST gateway: typed calls against the chat backend.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default, alias = "username")]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ContactsResponse {
    contacts: Vec<Contact>,
}

#[derive(Deserialize)]
struct GroupsResponse {
    groups: Vec<Group>,
}

#[derive(Deserialize)]
struct MembersResponse {
    members: Vec<GroupMember>,
}

#[derive(Deserialize)]
struct UsersResponse {
    users: Vec<Contact>,
}

#[derive(Deserialize)]
struct ContactRequestsResponse {
    requests: Vec<ContactRequest>,
}

#[derive(Deserialize)]
struct ProfilePictureResponse {
    #[serde(alias = "url", alias = "profileImage")]
    profile_image: String,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_base_url(
            &config.server.http_url(),
            Duration::from_secs(config.sync.request_timeout_secs),
        )
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    pub fn clear_token(&self) {
        *self.token.lock() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.lock().is_some()
    }

    fn auth_header(&self) -> Option<String> {
        self.token.lock().as_ref().map(|t| format!("Bearer {}", t))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let auth = self.auth_header().ok_or(Error::NotLoggedIn)?;
        Ok(req.header("Authorization", auth))
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = check(self.authorized(req)?.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn submit(&self, req: RequestBuilder) -> Result<()> {
        check(self.authorized(req)?.send().await?).await?;
        Ok(())
    }

    // ========================================================================
    // Auth
    // ========================================================================

    /// Signs in and stores the returned token for later calls.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(Error::Validation("email and password are required".into()));
        }

        let resp = self
            .client
            .post(self.url("/login"))
            .query(&[("email", email), ("password", password)])
            .send()
            .await?;
        let data: LoginResponse = check(resp).await?.json().await?;

        if data.status.as_deref() == Some("error") {
            let detail = data.message.unwrap_or_else(|| "invalid credentials".into());
            return Err(Error::Auth(detail));
        }
        let token = data
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Protocol("login response has no token".into()))?;

        let session = AuthSession {
            uid: data.uid.unwrap_or_else(|| email.to_string()),
            email: email.to_string(),
            display_name: data.display_name.unwrap_or_default(),
            token,
        };

        *self.token.lock() = Some(session.token.clone());
        tracing::info!(uid = %session.uid, "Logged in");
        Ok(session)
    }

    pub async fn register(&self, email: &str, username: &str, password: &str) -> Result<()> {
        validate_registration(email, username, password)?;

        let resp = self
            .client
            .post(self.url("/register"))
            .query(&[("email", email), ("username", username), ("password", password)])
            .send()
            .await?;
        let status = resp.status();
        let data: StatusResponse = check(resp).await?.json().await?;

        if data.status.as_deref() == Some("error") {
            return Err(Error::Api {
                status: status.as_u16(),
                detail: data.message.unwrap_or_else(|| "registration failed".into()),
            });
        }
        tracing::info!(%email, "Registered");
        Ok(())
    }

    // ========================================================================
    // Contacts
    // ========================================================================

    pub async fn contacts(&self, uid: &str) -> Result<Vec<Contact>> {
        let resp: ContactsResponse = self
            .fetch(self.client.get(self.url(&format!("/contacts/{}", uid))))
            .await?;
        Ok(resp.contacts)
    }

    pub async fn remove_contact(&self, uid: &str, contact_uid: &str) -> Result<()> {
        self.submit(
            self.client
                .delete(self.url(&format!("/contacts/{}/{}", uid, contact_uid))),
        )
        .await
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<Contact>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let resp: UsersResponse = self
            .fetch(self.client.get(self.url("/search_users")).query(&[("q", query)]))
            .await?;
        Ok(resp.users)
    }

    pub async fn contact_requests(&self, uid: &str) -> Result<Vec<ContactRequest>> {
        let resp: ContactRequestsResponse = self
            .fetch(self.client.get(self.url(&format!("/contact_requests/{}", uid))))
            .await?;
        Ok(resp.requests)
    }

    pub async fn send_contact_request(&self, from_uid: &str, to_uid: &str) -> Result<()> {
        if from_uid == to_uid {
            return Err(Error::Validation("cannot add yourself as a contact".into()));
        }
        self.submit(
            self.client
                .post(self.url("/contact_requests"))
                .json(&json!({ "from": from_uid, "to": to_uid })),
        )
        .await
    }

    pub async fn respond_contact_request(&self, request_id: &str, accept: bool) -> Result<()> {
        self.submit(
            self.client
                .post(self.url(&format!("/contact_requests/{}/respond", request_id)))
                .json(&json!({ "accept": accept })),
        )
        .await
    }

    // ========================================================================
    // Direct messages
    // ========================================================================

    pub async fn messages(
        &self,
        self_uid: &str,
        peer_uid: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WireMessage>> {
        let mut req = self
            .client
            .get(self.url(&format!("/messages/{}/{}", self_uid, peer_uid)));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        self.fetch(req).await
    }

    pub async fn append_message(&self, message: &WireMessage) -> Result<()> {
        self.submit(self.client.post(self.url("/messages")).json(message))
            .await
    }

    /// History of either kind of conversation.
    pub async fn history(
        &self,
        self_uid: &str,
        key: &ConversationKey,
        limit: Option<u32>,
    ) -> Result<Vec<WireMessage>> {
        match key {
            ConversationKey::Direct(peer) => self.messages(self_uid, peer, limit).await,
            ConversationKey::Group(id) => self.group_messages(id, limit).await,
        }
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub async fn groups(&self, uid: &str) -> Result<Vec<Group>> {
        let resp: GroupsResponse = self
            .fetch(self.client.get(self.url(&format!("/groups/user/{}", uid))))
            .await?;
        Ok(resp.groups)
    }

    pub async fn create_group(&self, name: &str, created_by: &str, members: &[String]) -> Result<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("group name is required".into()));
        }
        if members.is_empty() {
            return Err(Error::Validation("a group needs at least one member".into()));
        }
        self.fetch(self.client.post(self.url("/groups")).json(&json!({
            "name": name,
            "created_by": created_by,
            "members": members,
        })))
        .await
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.submit(self.client.delete(self.url(&format!("/groups/{}", group_id))))
            .await
    }

    pub async fn group_messages(&self, group_id: &str, limit: Option<u32>) -> Result<Vec<WireMessage>> {
        let mut req = self
            .client
            .get(self.url(&format!("/groups/{}/messages", group_id)));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        self.fetch(req).await
    }

    pub async fn group_members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let resp: MembersResponse = self
            .fetch(self.client.get(self.url(&format!("/groups/{}/members", group_id))))
            .await?;
        Ok(resp.members)
    }

    pub async fn add_group_member(&self, group_id: &str, uid: &str) -> Result<()> {
        self.submit(
            self.client
                .post(self.url(&format!("/groups/{}/members", group_id)))
                .json(&json!({ "uid": uid })),
        )
        .await
    }

    pub async fn remove_group_member(&self, group_id: &str, uid: &str) -> Result<()> {
        self.submit(
            self.client
                .delete(self.url(&format!("/groups/{}/members/{}", group_id, uid))),
        )
        .await
    }

    // ========================================================================
    // Profile
    // ========================================================================

    pub async fn update_name(&self, uid: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("name cannot be empty".into()));
        }
        self.submit(
            self.client
                .post(self.url("/update_name"))
                .json(&json!({ "uid": uid, "name": name })),
        )
        .await
    }

    /// Uploads a new profile picture and returns its URL.
    pub async fn upload_profile_picture(
        &self,
        uid: &str,
        data: Vec<u8>,
        file_name: &str,
    ) -> Result<String> {
        if data.is_empty() {
            return Err(Error::Validation("image is empty".into()));
        }
        let mime = mime_guess::from_path(file_name).first_or_octet_stream();
        if mime.type_() != mime_guess::mime::IMAGE {
            return Err(Error::Validation(format!("{} is not an image", file_name)));
        }

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime.essence_str())
            .map_err(|e| Error::Validation(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("uid", uid.to_string())
            .part("file", part);

        let resp: ProfilePictureResponse = self
            .fetch(self.client.post(self.url("/upload_profile_picture")).multipart(form))
            .await?;
        Ok(resp.profile_image)
    }
}

/// Local checks run before a registration request is sent.
pub fn validate_registration(email: &str, username: &str, password: &str) -> Result<()> {
    if email.trim().is_empty() || username.trim().is_empty() || password.is_empty() {
        return Err(Error::Validation("all fields are required".into()));
    }
    if !email.contains('@') {
        return Err(Error::Validation("email address is not valid".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let detail = error_detail(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    tracing::debug!(status = status.as_u16(), %detail, "API request failed");

    if status == StatusCode::UNAUTHORIZED {
        Err(Error::Auth(detail))
    } else {
        Err(Error::Api { status: status.as_u16(), detail })
    }
}

/// Human-readable detail of an error body: `detail`, `message` or `error`
/// (string or `{ "message": .. }`), else the raw text.
fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Some(body.to_string());
    };

    for field in ["detail", "message", "error"] {
        match &value[field] {
            serde_json::Value::String(s) => return Some(s.clone()),
            serde_json::Value::Object(inner) => {
                if let Some(s) = inner.get("message").and_then(|m| m.as_str()) {
                    return Some(s.to_string());
                }
            }
            serde_json::Value::Null => {}
            other => return Some(other.to_string()),
        }
    }
    Some(body.to_string())
}
