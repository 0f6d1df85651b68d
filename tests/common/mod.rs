#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use repair_desk::{
    api,
    db::{self, user::PasswordHash, Store as _},
    http::{self, AppState},
    media, Config,
};
use reqwest::{multipart::Form, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tempfile::TempDir;
use time::{
    format_description::well_known::Rfc3339, Duration, OffsetDateTime,
};
use tokio::{net::TcpListener, sync::watch};

pub const PASSWORD: &str = "password";

const CONFIG: &str = r#"
[db]
url = "memory://"

[http.server]
addr = "127.0.0.1:0"

[http.cors]
allowed_origins = ["http://localhost:8080"]

[jwt]
secret = "integration tests"
expiration_time = "1h"
"#;

/// Seeded accounts: `(id, email, name, role)`. All use [`PASSWORD`].
pub const USERS: [(u128, &str, &str, api::user::Role); 5] = [
    (1, "alice@example.com", "Alice", api::user::Role::Customer),
    (2, "bob@example.com", "Bob", api::user::Role::Executor),
    (3, "carol@example.com", "Carol", api::user::Role::Admin),
    (4, "dave@example.com", "Dave", api::user::Role::Customer),
    (5, "erin@example.com", "Erin", api::user::Role::Executor),
];

pub fn id(n: u128) -> api::user::Id {
    api::user::Id::from(n)
}

/// In-process server over the in-memory store and a temporary media
/// directory. Stops with the test's runtime.
pub struct Server {
    pub base_url: String,
    pub media_dir: TempDir,
    _shutdown: watch::Sender<bool>,
}

impl Server {
    pub async fn start() -> Self {
        let media_dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut config =
            toml::from_str::<Config>(CONFIG).expect("invalid test config");
        config.media.dir = media_dir.path().to_owned();

        let store = db::open(&config.db).await.expect("failed to open store");
        let password_hash = password_hash();
        for (n, email, name, role) in USERS {
            let user = db::User {
                id: id(n),
                email: email.to_owned(),
                name: name.to_owned(),
                role,
                is_active: true,
                password_hash: password_hash.clone(),
                created_at: OffsetDateTime::now_utc(),
            };
            store.write_user(&user).await.expect("failed to seed user");
        }
        let media = Arc::new(
            media::Dir::open(&config.media)
                .await
                .expect("failed to open media dir"),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state =
            Arc::new(AppState::new(store, media, &config, shutdown_rx));
        tokio::spawn(Arc::clone(&state.scheduler).run());
        let app = http::router(state, &config).expect("invalid cors config");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().expect("no local address");
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            base_url: format!("http://{addr}"),
            media_dir,
            _shutdown: shutdown,
        }
    }

    pub fn client(&self) -> Client {
        Client {
            inner: reqwest::Client::new(),
            base_url: self.base_url.clone(),
            auth_token: None,
        }
    }

    pub async fn login(&self, email: &str) -> Client {
        self.client().auth(email, PASSWORD).await
    }
}

/// Hashing is slow without optimizations, so every seeded account shares one
/// hash of [`PASSWORD`].
fn password_hash() -> PasswordHash {
    static HASH: OnceLock<PasswordHash> = OnceLock::new();
    HASH.get_or_init(|| {
        PasswordHash::new(PASSWORD).expect("failed to hash password")
    })
    .clone()
}

/// Ticket body with a deadline three days ahead.
pub fn new_ticket(title: &str) -> Value {
    let deadline = (OffsetDateTime::now_utc() + Duration::days(3))
        .format(&Rfc3339)
        .expect("failed to format deadline");
    json!({
        "title": title,
        "address": "1 Main St",
        "description": "Leaking tap",
        "deadline": deadline,
        "priority": 3,
    })
}

pub struct Client {
    inner: reqwest::Client,
    base_url: String,
    pub auth_token: Option<String>,
}

impl Client {
    pub async fn auth(mut self, email: &str, password: &str) -> Self {
        self.auth_token = Some(
            self.try_auth(email, password)
                .await
                .expect("wrong status code"),
        );
        self
    }

    pub async fn try_auth(
        &self,
        email: &str,
        password: &str,
    ) -> Result<String, StatusCode> {
        Ok(self
            .request(Method::POST, "/auth")
            .json(&json!({
                "email": email,
                "password": password,
            }))
            .send()
            .await
            .expect("failed to send a request")
            .error_for_status()
            .map_err(|e| e.status().expect("status error"))?
            .text()
            .await
            .expect("failed to get a response"))
    }

    pub async fn user(&self) -> Result<api::user::Profile, StatusCode> {
        send(self.request(Method::GET, "/user")).await
    }

    pub async fn permissions(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/user/permissions")).await
    }

    pub async fn user_stats(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/user/stats")).await
    }

    pub async fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<api::user::Profile, StatusCode> {
        send(self.request(Method::POST, "/auth/register").json(&json!({
            "email": email,
            "name": name,
            "password": password,
        })))
        .await
    }

    pub async fn change_password(
        &self,
        current: &str,
        new: &str,
    ) -> Result<(), StatusCode> {
        self.request(Method::POST, "/user/password")
            .json(&json!({
                "currentPassword": current,
                "newPassword": new,
            }))
            .send()
            .await
            .expect("failed to send a request")
            .error_for_status()
            .map(drop)
            .map_err(|e| e.status().expect("status error"))
    }

    pub async fn list_users(
        &self,
    ) -> Result<Vec<api::user::Profile>, StatusCode> {
        send(self.request(Method::GET, "/users")).await
    }

    pub async fn add_user(
        &self,
        email: &str,
        name: &str,
        role: api::user::Role,
    ) -> Result<api::user::Profile, StatusCode> {
        send(self.request(Method::POST, "/users").json(&json!({
            "email": email,
            "name": name,
            "password": PASSWORD,
            "role": role,
        })))
        .await
    }

    pub async fn toggle_user(
        &self,
        id: api::user::Id,
    ) -> Result<api::user::Profile, StatusCode> {
        let path = format!("/users/{id}/toggle");
        send(self.request(Method::PATCH, &path)).await
    }

    pub async fn add_ticket(
        &self,
        title: &str,
    ) -> Result<api::Ticket, StatusCode> {
        self.add_ticket_with(new_ticket(title)).await
    }

    pub async fn add_ticket_with(
        &self,
        body: Value,
    ) -> Result<api::Ticket, StatusCode> {
        send(self.request(Method::POST, "/ticket").json(&body)).await
    }

    pub async fn get_ticket(
        &self,
        id: api::ticket::Id,
    ) -> Result<api::Ticket, StatusCode> {
        send(self.request(Method::GET, &format!("/ticket/{id}"))).await
    }

    /// `query` is appended verbatim, e.g. `status=pending&limit=5`.
    pub async fn get_tickets(
        &self,
        query: &str,
    ) -> Result<api::ticket::List, StatusCode> {
        send(self.request(Method::GET, &format!("/ticket?{query}"))).await
    }

    pub async fn edit_ticket(
        &self,
        id: api::ticket::Id,
        form: Form,
    ) -> Result<api::Ticket, StatusCode> {
        send(
            self.request(Method::PATCH, &format!("/ticket/{id}"))
                .multipart(form),
        )
        .await
    }

    /// Error body of a rejected edit.
    pub async fn edit_ticket_error(
        &self,
        id: api::ticket::Id,
        form: Form,
    ) -> (StatusCode, Value) {
        let resp = self
            .request(Method::PATCH, &format!("/ticket/{id}"))
            .multipart(form)
            .send()
            .await
            .expect("failed to send a request");
        let status = resp.status();
        (status, resp.json().await.expect("failed to get a response"))
    }

    pub async fn delete_ticket(
        &self,
        id: api::ticket::Id,
    ) -> Result<(), StatusCode> {
        self.request(Method::DELETE, &format!("/ticket/{id}"))
            .send()
            .await
            .expect("failed to send a request")
            .error_for_status()
            .map(drop)
            .map_err(|e| e.status().expect("status error"))
    }

    pub async fn executors(&self) -> Result<Vec<api::User>, StatusCode> {
        send(self.request(Method::GET, "/executors")).await
    }

    pub async fn dashboard(
        &self,
    ) -> Result<api::ticket::Dashboard, StatusCode> {
        send(self.request(Method::GET, "/dashboard")).await
    }

    pub async fn analytics(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/admin/stats")).await
    }

    pub async fn digest(&self, range: &str) -> Result<Value, StatusCode> {
        let path = format!("/report/digest?range={range}");
        send(self.request(Method::GET, &path)).await
    }

    pub async fn cleanup(
        &self,
        retention_days: u64,
    ) -> Result<Value, StatusCode> {
        send(self.request(
            Method::POST,
            &format!("/admin/cleanup?retention_days={retention_days}"),
        ))
        .await
    }

    pub async fn scheduler(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/admin/scheduler")).await
    }

    pub async fn disk_usage(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/admin/disk-usage")).await
    }

    pub async fn ticket_report(
        &self,
        id: api::ticket::Id,
    ) -> Result<api::ticket::Report, StatusCode> {
        let path = format!("/report/ticket/{id}");
        send(self.request(Method::GET, &path)).await
    }

    pub async fn health(&self) -> Result<Value, StatusCode> {
        send(self.request(Method::GET, "/health")).await
    }

    /// Content type and bytes of a media file.
    pub async fn media(
        &self,
        name: &str,
    ) -> Result<(String, Vec<u8>), StatusCode> {
        let resp = self
            .request(Method::GET, &format!("/media/{name}"))
            .send()
            .await
            .expect("failed to send a request")
            .error_for_status()
            .map_err(|e| e.status().expect("status error"))?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let bytes = resp.bytes().await.expect("failed to get a response");
        Ok((content_type, bytes.to_vec()))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.inner.request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req
    }
}

async fn send<T: DeserializeOwned>(
    req: RequestBuilder,
) -> Result<T, StatusCode> {
    Ok(req
        .send()
        .await
        .expect("failed to send a request")
        .error_for_status()
        .map_err(|e| e.status().expect("status error"))?
        .json::<T>()
        .await
        .expect("failed to get a response"))
}
