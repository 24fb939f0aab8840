//! Provider Sender
//!
//! Builds the provider request for a queued message and classifies the
//! response:
//! - 200/201 → delivered
//! - 4xx other than 408/429, and any other 2xx → rejected, never retried
//! - timeouts, transport errors, 408, 429, 5xx → transient, retried

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use wd_common::{MessageKind, QueuedMessage, SendOutcome, SenderInstance};

/// Provider sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Base URL; requests go to `<base>/<action>/<instance>`
    pub base_url: String,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/message".to_string(),
            send_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Request body for the provider send call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SendPayload {
    Text {
        number: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Media {
        number: String,
        caption: String,
        media: String,
        file_name: String,
        mediatype: &'static str,
        mimetype: &'static str,
    },
}

impl SendPayload {
    pub fn for_message(message: &QueuedMessage) -> Self {
        let media_url = match (&message.media_url, message.kind) {
            (Some(url), kind) if kind.is_media() => url,
            _ => {
                return SendPayload::Text {
                    number: message.destination.clone(),
                    text: message.body.clone(),
                }
            }
        };

        let caption = match &message.title {
            Some(title) => format!("*{}*\n\n{}", title, message.body),
            None => message.body.clone(),
        };

        SendPayload::Media {
            number: message.destination.clone(),
            caption,
            media: media_url.clone(),
            file_name: file_name(message.kind, message.title.as_deref()),
            mediatype: message.kind.media_type().unwrap_or_default(),
            mimetype: message.kind.mime_type().unwrap_or_default(),
        }
    }

    /// Provider action path segment
    pub fn action(&self) -> &'static str {
        match self {
            SendPayload::Text { .. } => "sendText",
            SendPayload::Media { .. } => "sendMedia",
        }
    }
}

fn file_name(kind: MessageKind, title: Option<&str>) -> String {
    match kind {
        MessageKind::Document => match title {
            Some(title) => format!("{}.pdf", title),
            None => "document.pdf".to_string(),
        },
        MessageKind::Image => "img.jpg".to_string(),
        MessageKind::Video => "video.mp4".to_string(),
        MessageKind::Text => String::new(),
    }
}

/// Classify a provider HTTP status
pub fn classify_status(status_code: u16, body: &str) -> SendOutcome {
    match status_code {
        200 | 201 => SendOutcome::Delivered { status_code },
        408 | 429 => SendOutcome::Transient {
            status_code: Some(status_code),
            error: format!("HTTP {}: {}", status_code, body),
        },
        400..=499 | 202..=299 => SendOutcome::Rejected {
            status_code,
            error: format!("HTTP {}: {}", status_code, body),
        },
        _ => SendOutcome::Transient {
            status_code: Some(status_code),
            error: format!("HTTP {}: {}", status_code, body),
        },
    }
}

/// Sends one message through one instance
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, instance: &SenderInstance, message: &QueuedMessage) -> SendOutcome;
}

/// Sender backed by the provider REST API
pub struct HttpMessageSender {
    config: SenderConfig,
    client: reqwest::Client,
}

impl HttpMessageSender {
    pub fn new(config: SenderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.send_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, action: &str, instance: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            action,
            instance
        )
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, instance: &SenderInstance, message: &QueuedMessage) -> SendOutcome {
        let payload = SendPayload::for_message(message);
        let url = self.endpoint(payload.action(), &instance.name);

        debug!(message_id = message.id, url = %url, "Sending message to provider");

        let result = self
            .client
            .post(&url)
            .header("Apikey", &instance.token)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let outcome = classify_status(status_code, &body);
                if !outcome.is_delivered() {
                    warn!(
                        message_id = message.id,
                        status_code = status_code,
                        body = %body,
                        "Provider did not accept message"
                    );
                }
                outcome
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("Request timeout after {:?}", self.config.send_timeout)
                } else if e.is_connect() {
                    format!("Connection error: {}", e)
                } else {
                    format!("HTTP error: {}", e)
                };
                warn!(message_id = message.id, error = %error, "Provider send failed");
                SendOutcome::Transient {
                    status_code: e.status().map(|s| s.as_u16()),
                    error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(kind: MessageKind, media: Option<&str>, title: Option<&str>) -> QueuedMessage {
        QueuedMessage {
            id: 1,
            destination: "51999999999".to_string(),
            body: "hola".to_string(),
            kind,
            media_url: media.map(String::from),
            title: title.map(String::from),
        }
    }

    #[test]
    fn test_text_payload_has_only_number_and_text() {
        let payload = SendPayload::for_message(&message(MessageKind::Text, None, Some("ignored")));
        assert_eq!(payload.action(), "sendText");
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"number": "51999999999", "text": "hola"})
        );
    }

    #[test]
    fn test_media_payload_mapping() {
        let cases = [
            (MessageKind::Image, "image", "image/jpeg", "img.jpg"),
            (MessageKind::Video, "video", "video/mp4", "video.mp4"),
            (MessageKind::Document, "document", "application/pdf", "document.pdf"),
        ];

        for (kind, mediatype, mimetype, file_name) in cases {
            let payload = SendPayload::for_message(&message(kind, Some("https://cdn/x"), None));
            assert_eq!(payload.action(), "sendMedia");

            let value = serde_json::to_value(&payload).unwrap();
            assert_eq!(value["mediatype"], mediatype);
            assert_eq!(value["mimetype"], mimetype);
            assert_eq!(value["media"], "https://cdn/x");
            assert_eq!(value["fileName"], file_name);
            assert_eq!(value["caption"], "hola");
            assert!(value.get("text").is_none());
        }
    }

    #[test]
    fn test_titled_document_caption_and_name() {
        let payload = SendPayload::for_message(&message(
            MessageKind::Document,
            Some("https://cdn/f.pdf"),
            Some("Catalogo"),
        ));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["caption"], "*Catalogo*\n\nhola");
        assert_eq!(value["fileName"], "Catalogo.pdf");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(200, "").is_delivered());
        assert!(classify_status(201, "").is_delivered());

        for code in [400, 401, 403, 404, 422, 204] {
            assert!(
                matches!(classify_status(code, ""), SendOutcome::Rejected { .. }),
                "{} should be rejected",
                code
            );
        }
        for code in [408, 429, 500, 502, 503, 301] {
            assert!(classify_status(code, "").is_retryable(), "{} should be transient", code);
        }
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let sender = HttpMessageSender::new(SenderConfig {
            base_url: "http://provider/message/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            sender.endpoint("sendText", "inst1"),
            "http://provider/message/sendText/inst1"
        );
    }
}
