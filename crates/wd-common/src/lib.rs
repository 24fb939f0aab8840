use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub mod logging;

/// Identifier assigned to a message by the upstream queue (`idSendmessage`).
pub type MessageId = i64;

// ============================================================================
// Message Types
// ============================================================================

/// Kind of content carried by a queued message.
///
/// The queue endpoint emits Spanish codes (`texto`, `imagen`, `video`, `pdf`);
/// the English names are accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Document,
}

impl MessageKind {
    pub fn from_code(code: &str) -> Result<Self, ValidationError> {
        match code.trim().to_ascii_lowercase().as_str() {
            "texto" | "text" => Ok(MessageKind::Text),
            "imagen" | "image" => Ok(MessageKind::Image),
            "video" => Ok(MessageKind::Video),
            "pdf" | "documento" | "document" => Ok(MessageKind::Document),
            _ => Err(ValidationError::UnknownKind(code.to_string())),
        }
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }

    /// Provider `mediatype` field for media sends
    pub fn media_type(&self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image => Some("image"),
            MessageKind::Video => Some("video"),
            MessageKind::Document => Some("document"),
        }
    }

    /// Provider `mimetype` field for media sends
    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image => Some("image/jpeg"),
            MessageKind::Video => Some("video/mp4"),
            MessageKind::Document => Some("application/pdf"),
        }
    }
}

/// A validated message waiting in the working queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Destination phone number
    pub destination: String,
    pub body: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub title: Option<String>,
}

/// Message descriptor exactly as the queue endpoint returns it.
///
/// Every field is optional here; [`MessageDescriptor::validate`] enforces the
/// required ones and produces a [`QueuedMessage`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDescriptor {
    #[serde(rename = "idSendmessage", default)]
    pub id: Option<DescriptorId>,
    #[serde(rename = "tenvio", default)]
    pub destination: Option<String>,
    #[serde(rename = "mensaje", default)]
    pub body: Option<String>,
    #[serde(rename = "tipo", default)]
    pub kind: Option<String>,
    #[serde(rename = "titulo", default)]
    pub title: Option<String>,
    #[serde(rename = "media", default)]
    pub media_url: Option<String>,
}

/// The upstream sends ids as JSON numbers, some legacy rows as numeric strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DescriptorId {
    Number(i64),
    Text(String),
}

impl DescriptorId {
    pub fn as_id(&self) -> Result<MessageId, ValidationError> {
        match self {
            DescriptorId::Number(n) => Ok(*n),
            DescriptorId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ValidationError::InvalidId(s.clone())),
        }
    }
}

impl MessageDescriptor {
    /// Decode one element of a queue response.
    ///
    /// Type mismatches (a numeric `tenvio`, an object `mensaje`) are reported as
    /// [`ValidationError::Malformed`] so one bad element never fails the batch.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Malformed(format!(
                "expected an object, got {}",
                value
            )));
        }
        Self::deserialize(value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn validate(self) -> Result<QueuedMessage, ValidationError> {
        let id = self
            .id
            .as_ref()
            .ok_or(ValidationError::MissingField("idSendmessage"))?
            .as_id()?;
        let destination = required(self.destination, "tenvio")?;
        let body = required(self.body, "mensaje")?;

        let kind = match self.kind.as_deref() {
            Some(code) if !code.trim().is_empty() => MessageKind::from_code(code)?,
            _ => MessageKind::Text,
        };

        let media_url = self.media_url.filter(|m| !m.trim().is_empty());
        if kind.is_media() && media_url.is_none() {
            return Err(ValidationError::MissingMedia { kind });
        }

        Ok(QueuedMessage {
            id,
            destination,
            body,
            kind,
            media_url,
            title: self.title.filter(|t| !t.trim().is_empty()),
        })
    }
}

impl TryFrom<MessageDescriptor> for QueuedMessage {
    type Error = ValidationError;

    fn try_from(descriptor: MessageDescriptor) -> Result<Self, Self::Error> {
        descriptor.validate()
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        None => Err(ValidationError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(ValidationError::EmptyField(field)),
        Some(v) => Ok(v),
    }
}

/// Reasons a queue descriptor is discarded instead of enqueued
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed descriptor: {0}")]
    Malformed(String),

    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("Invalid message id: {0}")]
    InvalidId(String),

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("{kind:?} message has no media URL")]
    MissingMedia { kind: MessageKind },
}

// ============================================================================
// Sender Instance Types
// ============================================================================

/// Provider-side session state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Connecting,
    #[serde(rename = "close", alias = "closed")]
    Closed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Instance entry returned by the instance-status endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub connection_status: ConnectionState,
    #[serde(default)]
    pub owner_jid: Option<String>,
}

/// A sending identity with the per-cycle counter its dispatch loop maintains
#[derive(Debug, Clone, PartialEq)]
pub struct SenderInstance {
    pub name: String,
    pub token: String,
    pub owner_jid: Option<String>,
    pub connection_state: ConnectionState,
    pub messages_sent_in_cycle: u32,
}

impl From<InstanceDescriptor> for SenderInstance {
    fn from(d: InstanceDescriptor) -> Self {
        Self {
            name: d.name,
            token: d.token,
            owner_jid: d.owner_jid,
            connection_state: d.connection_status,
            messages_sent_in_cycle: 0,
        }
    }
}

// ============================================================================
// Send / Confirmation Types
// ============================================================================

/// Classified result of a single provider send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// HTTP 200/201
    Delivered { status_code: u16 },
    /// Permanent failure, never retried
    Rejected { status_code: u16, error: String },
    /// Timeout, transport error, 5xx - eligible for retry
    Transient { status_code: Option<u16>, error: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SendOutcome::Transient { .. })
    }
}

/// `Cenvio` code reported to the confirmation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationCode {
    Success = 1,
    Failure = 2,
}

impl ConfirmationCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Serialize for ConfirmationCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

/// Body of the confirmation call
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    #[serde(rename = "Idenvio")]
    pub message_id: MessageId,
    #[serde(rename = "Ninstancia")]
    pub instance_name: String,
    #[serde(rename = "Cenvio")]
    pub code: ConfirmationCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(value: serde_json::Value) -> Result<QueuedMessage, ValidationError> {
        MessageDescriptor::from_value(&value)?.validate()
    }

    #[test]
    fn test_text_descriptor_validates() {
        let msg = descriptor(json!({
            "idSendmessage": 1,
            "tenvio": "51999999999",
            "mensaje": "hola",
            "tipo": "texto"
        }))
        .unwrap();

        assert_eq!(msg.id, 1);
        assert_eq!(msg.destination, "51999999999");
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.media_url.is_none());
    }

    #[test]
    fn test_missing_kind_defaults_to_text() {
        let msg = descriptor(json!({"idSendmessage": 7, "tenvio": "51", "mensaje": "x"})).unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn test_numeric_string_id_accepted() {
        let msg = descriptor(json!({"idSendmessage": "42", "tenvio": "51", "mensaje": "x"})).unwrap();
        assert_eq!(msg.id, 42);
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            descriptor(json!({"tenvio": "51", "mensaje": "x"})).unwrap_err(),
            ValidationError::MissingField("idSendmessage")
        );
        assert_eq!(
            descriptor(json!({"idSendmessage": 1, "mensaje": "x"})).unwrap_err(),
            ValidationError::MissingField("tenvio")
        );
        assert_eq!(
            descriptor(json!({"idSendmessage": 1, "tenvio": "51", "mensaje": "  "})).unwrap_err(),
            ValidationError::EmptyField("mensaje")
        );
        assert!(matches!(
            descriptor(json!({"idSendmessage": "abc", "tenvio": "51", "mensaje": "x"})).unwrap_err(),
            ValidationError::InvalidId(_)
        ));
    }

    #[test]
    fn test_wrong_types_are_malformed() {
        assert!(matches!(
            descriptor(json!({"idSendmessage": 1, "tenvio": 51999, "mensaje": "x"})).unwrap_err(),
            ValidationError::Malformed(_)
        ));
        assert!(matches!(descriptor(json!("just a string")).unwrap_err(), ValidationError::Malformed(_)));
    }

    #[test]
    fn test_media_requires_url() {
        let err = descriptor(json!({
            "idSendmessage": 3, "tenvio": "51", "mensaje": "x", "tipo": "imagen"
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingMedia { kind: MessageKind::Image });

        let msg = descriptor(json!({
            "idSendmessage": 3, "tenvio": "51", "mensaje": "x", "tipo": "pdf",
            "titulo": "Boleta", "media": "https://cdn.example.com/b.pdf"
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageKind::Document);
        assert_eq!(msg.title.as_deref(), Some("Boleta"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(
            descriptor(json!({"idSendmessage": 1, "tenvio": "51", "mensaje": "x", "tipo": "sticker"})).unwrap_err(),
            ValidationError::UnknownKind("sticker".to_string())
        );
    }

    #[test]
    fn test_kind_mime_mapping() {
        assert_eq!(MessageKind::Image.mime_type(), Some("image/jpeg"));
        assert_eq!(MessageKind::Video.mime_type(), Some("video/mp4"));
        assert_eq!(MessageKind::Document.mime_type(), Some("application/pdf"));
        assert_eq!(MessageKind::Document.media_type(), Some("document"));
        assert_eq!(MessageKind::Text.mime_type(), None);
    }

    #[test]
    fn test_instance_descriptor_states() {
        let list: Vec<InstanceDescriptor> = serde_json::from_value(json!([
            {"name": "a", "token": "t1", "connectionStatus": "open"},
            {"name": "b", "token": "t2", "connectionStatus": "close"},
            {"name": "c", "token": "t3", "connectionStatus": "connecting"},
            {"name": "d", "connectionStatus": "refused"},
            {"name": "e"}
        ]))
        .unwrap();

        let states: Vec<_> = list.iter().map(|i| i.connection_status).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Open,
                ConnectionState::Closed,
                ConnectionState::Connecting,
                ConnectionState::Unknown,
                ConnectionState::Unknown,
            ]
        );
        assert_eq!(list[3].token, "");
    }

    #[test]
    fn test_confirmation_request_wire_format() {
        let req = ConfirmationRequest {
            message_id: 1,
            instance_name: "inst1".to_string(),
            code: ConfirmationCode::Failure,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"Idenvio": 1, "Ninstancia": "inst1", "Cenvio": 2})
        );
    }
}
