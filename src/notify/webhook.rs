//! Webhook sink: POSTs each update as JSON to a configured URL.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{NotificationSink, ProgressUpdate};
use crate::error::NotifyError;

pub struct WebhookSink {
    url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, recipient: i64, update: ProgressUpdate) -> Result<(), NotifyError> {
        let body = json!({
            "recipient": recipient,
            "update": update,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed {
                recipient,
                reason: format!("webhook returned {status}: {text}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::notify::UpdateKind;

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn hook(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.lock().await.push((auth, body));
        StatusCode::NO_CONTENT
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn update() -> ProgressUpdate {
        ProgressUpdate {
            quest_id: Uuid::new_v4(),
            quest_name: "Profit Goal".into(),
            kind: UpdateKind::Milestone,
            current: 50,
            target: 100,
            percent: 50.0,
            status: "Halfway".into(),
            time_remaining: "1h 0m".into(),
        }
    }

    #[tokio::test]
    async fn posts_json_with_bearer_token() {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route("/hook", post(hook))
            .with_state(seen.clone());
        let base = serve(router).await;

        let sink = WebhookSink::new(
            format!("{base}/hook"),
            Some(SecretString::from("s3cret")),
        );
        sink.notify(12345, update()).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer s3cret"));
        assert_eq!(body["recipient"], 12345);
        assert_eq!(body["update"]["kind"], "milestone");
        assert_eq!(body["update"]["status"], "Halfway");
    }

    #[tokio::test]
    async fn non_success_status_is_send_failure() {
        let router = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let base = serve(router).await;

        let sink = WebhookSink::new(format!("{base}/hook"), None);
        let err = sink.notify(1, update()).await.unwrap_err();
        match err {
            NotifyError::SendFailed { recipient, reason } => {
                assert_eq!(recipient, 1);
                assert!(reason.contains("500"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
