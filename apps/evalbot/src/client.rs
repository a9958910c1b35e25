//! Protocol client capability.
//!
//! The worker only sees the `PostClient` trait; the concrete
//! implementation speaks XRPC over HTTPS. `MockPostClient` records posts
//! for tests.

use async_trait::async_trait;
use chrono::Utc;
use jetstream::PostRef;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Protocol client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not authenticated")]
    NotAuthenticated,
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The bot's own identity, resolved at login.
#[derive(Debug, Clone)]
pub struct BotProfile {
    pub did: String,
    pub handle: String,
}

/// Posting capability consumed by the worker.
#[async_trait]
pub trait PostClient: Send + Sync {
    /// Authenticate and cache a session.
    async fn login(&self) -> Result<()>;

    /// The authenticated account's handle and DID.
    async fn get_profile(&self) -> Result<BotProfile>;

    /// Post `text` as a reply threaded under `parent` with thread `root`.
    async fn post_reply(&self, text: &str, parent: &PostRef, root: &PostRef) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Session {
    access_jwt: String,
    did: String,
    handle: String,
}

/// XRPC protocol client.
pub struct AtprotoClient {
    service: String,
    identifier: String,
    password: String,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
}

impl AtprotoClient {
    pub fn new(
        service: impl Into<String>,
        identifier: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into().trim_end_matches('/').to_string(),
            identifier: identifier.into(),
            password: password.into(),
            http: reqwest::Client::new(),
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Session> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotAuthenticated)
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "accessJwt")]
    access_jwt: String,
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl PostClient for AtprotoClient {
    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/xrpc/com.atproto.server.createSession", self.service))
            .json(&json!({
                "identifier": self.identifier,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|error| ClientError::Http(error.to_string()))?;

        let session: SessionResponse = decode(response).await?;
        debug!(handle = %session.handle, "session created");
        *self.session.lock().await = Some(Session {
            access_jwt: session.access_jwt,
            did: session.did,
            handle: session.handle,
        });
        Ok(())
    }

    async fn get_profile(&self) -> Result<BotProfile> {
        let session = self.session().await?;
        Ok(BotProfile {
            did: session.did,
            handle: session.handle,
        })
    }

    async fn post_reply(&self, text: &str, parent: &PostRef, root: &PostRef) -> Result<()> {
        let session = self.session().await?;
        let record = json!({
            "$type": "app.bsky.feed.post",
            "text": text,
            "createdAt": Utc::now().to_rfc3339(),
            "reply": {
                "root": { "uri": root.uri, "cid": root.cid },
                "parent": { "uri": parent.uri, "cid": parent.cid },
            },
        });

        let response = self
            .http
            .post(format!("{}/xrpc/com.atproto.repo.createRecord", self.service))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": "app.bsky.feed.post",
                "record": record,
            }))
            .send()
            .await
            .map_err(|error| ClientError::Http(error.to_string()))?;

        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }
}

/// Decode an XRPC response, surfacing error bodies as `ClientError::Api`.
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body: XrpcErrorBody = response.json().await.unwrap_or(XrpcErrorBody {
            message: None,
            error: None,
        });
        let message = body
            .message
            .or(body.error)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(ClientError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|error| ClientError::Http(error.to_string()))
}

/// A posted reply as seen by the mock client.
#[derive(Debug, Clone)]
pub struct RecordedReply {
    pub text: String,
    pub parent: PostRef,
    pub root: PostRef,
}

/// Recording mock for tests: stores replies, optionally failing on demand.
#[derive(Default)]
pub struct MockPostClient {
    pub profile_handle: String,
    pub profile_did: String,
    replies: std::sync::Mutex<Vec<RecordedReply>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl MockPostClient {
    pub fn new(handle: &str, did: &str) -> Self {
        Self {
            profile_handle: handle.to_string(),
            profile_did: did.to_string(),
            ..Self::default()
        }
    }

    pub fn fail_next_post(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn replies(&self) -> Vec<RecordedReply> {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PostClient for MockPostClient {
    async fn login(&self) -> Result<()> {
        Ok(())
    }

    async fn get_profile(&self) -> Result<BotProfile> {
        Ok(BotProfile {
            did: self.profile_did.clone(),
            handle: self.profile_handle.clone(),
        })
    }

    async fn post_reply(&self, text: &str, parent: &PostRef, root: &PostRef) -> Result<()> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(ClientError::Http("injected post failure".to_string()));
        }
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedReply {
                text: text.to_string(),
                parent: parent.clone(),
                root: root.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve_json_once(
        status_line: &str,
        body: &str,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (addr, handle)
    }

    /// Headers received and the announced body length consumed.
    fn request_complete(raw: &[u8]) -> bool {
        let Some(split) = raw.windows(4).position(|window| window == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&raw[..split]);
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        raw.len() >= split + 4 + content_length
    }

    #[tokio::test]
    async fn login_caches_the_session_profile() {
        let (addr, handle) = serve_json_once(
            "HTTP/1.1 200 OK",
            r#"{"accessJwt":"jwt-token","refreshJwt":"r","did":"did:plc:bot","handle":"bot.example"}"#,
        )
        .await;
        let client = AtprotoClient::new(format!("http://{addr}"), "bot.example", "app-pass");
        client.login().await.unwrap();

        let profile = client.get_profile().await.unwrap();
        assert_eq!(profile.did, "did:plc:bot");
        assert_eq!(profile.handle, "bot.example");

        let request = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(request.starts_with("POST /xrpc/com.atproto.server.createSession"));
        assert!(request.contains("\"identifier\":\"bot.example\""));
    }

    #[tokio::test]
    async fn login_failure_surfaces_the_api_message() {
        let (addr, handle) = serve_json_once(
            "HTTP/1.1 401 Unauthorized",
            r#"{"error":"AuthenticationRequired","message":"Invalid identifier or password"}"#,
        )
        .await;
        let client = AtprotoClient::new(format!("http://{addr}"), "bot.example", "wrong");
        let err = client.login().await.unwrap_err();
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid identifier or password");
            }
            other => panic!("expected api error, got {other:?}"),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn post_reply_requires_login() {
        let client = AtprotoClient::new("http://127.0.0.1:1", "bot.example", "pass");
        let post_ref = PostRef {
            uri: "at://did:plc:a/app.bsky.feed.post/1".to_string(),
            cid: "bafy".to_string(),
        };
        assert!(matches!(
            client.post_reply("hi", &post_ref, &post_ref).await,
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn mock_records_threading_refs() {
        let mock = MockPostClient::new("bot.example", "did:plc:bot");
        let parent = PostRef {
            uri: "at://did:plc:a/app.bsky.feed.post/2".to_string(),
            cid: "bafy-parent".to_string(),
        };
        let root = PostRef {
            uri: "at://did:plc:a/app.bsky.feed.post/1".to_string(),
            cid: "bafy-root".to_string(),
        };
        mock.post_reply("=> 4", &parent, &root).await.unwrap();

        let replies = mock.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "=> 4");
        assert_eq!(replies[0].parent, parent);
        assert_eq!(replies[0].root, root);
    }
}
