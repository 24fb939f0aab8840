//! HTTP client tests for the upstream endpoints and the provider sender

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wd_common::{
    ConfirmationCode, ConfirmationRequest, ConnectionState, MessageKind, QueuedMessage,
    SendOutcome, SenderInstance,
};
use wd_dispatch::{
    Confirmer, DispatchState, FetchOutcome, HttpMessageSender, HttpUpstream, InstanceSource,
    MessageSender, QueueFetcher, QueueResponse, QueueSource, SenderConfig, UpstreamConfig,
};

fn upstream(server: &MockServer) -> HttpUpstream {
    HttpUpstream::new(UpstreamConfig {
        queue_url: format!("{}/queue", server.uri()),
        instances_url: format!("{}/instances", server.uri()),
        confirmation_url: format!("{}/confirm", server.uri()),
        request_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    })
    .unwrap()
}

fn sender(server: &MockServer) -> HttpMessageSender {
    HttpMessageSender::new(SenderConfig {
        base_url: format!("{}/message/", server.uri()),
        send_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(200),
    })
    .unwrap()
}

fn instance() -> SenderInstance {
    SenderInstance {
        name: "inst1".to_string(),
        token: "tok".to_string(),
        owner_jid: None,
        connection_state: ConnectionState::Open,
        messages_sent_in_cycle: 0,
    }
}

fn image_message() -> QueuedMessage {
    QueuedMessage {
        id: 7,
        destination: "51999999999".to_string(),
        body: "Nuevo catalogo".to_string(),
        kind: MessageKind::Image,
        media_url: Some("https://cdn.example.com/a.jpg".to_string()),
        title: Some("Oferta".to_string()),
    }
}

#[tokio::test]
async fn test_queue_sentinel_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"message": "No hay registros"})),
        )
        .mount(&server)
        .await;

    let response = upstream(&server).fetch_queue().await.unwrap();
    assert!(matches!(response, QueueResponse::Empty));
}

#[tokio::test]
async fn test_queue_404_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let response = upstream(&server).fetch_queue().await.unwrap();
    assert!(matches!(response, QueueResponse::Empty));
}

#[tokio::test]
async fn test_queue_server_error_leaves_working_queue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"idSendmessage": 1, "tenvio": "51999999999", "mensaje": "uno"},
            {"idSendmessage": "2", "tenvio": "51999999999", "mensaje": "dos"}
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let state = Arc::new(DispatchState::new());
    let fetcher = QueueFetcher::new(
        Arc::new(upstream(&server)),
        Arc::clone(&state),
        Duration::from_secs(60),
    );

    assert!(matches!(fetcher.poll_once().await, FetchOutcome::Merged { .. }));
    assert_eq!(state.queued_ids(), vec![1, 2]);

    assert_eq!(fetcher.poll_once().await, FetchOutcome::Failed);
    assert_eq!(state.queued_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_instances_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "a", "token": "t1", "connectionStatus": "open", "ownerJid": "5199@s.whatsapp.net"},
            {"name": "b", "token": "t2", "connectionStatus": "close"},
            {"name": "c", "token": "t3", "connectionStatus": "connecting"},
            {"token": "missing name"}
        ])))
        .mount(&server)
        .await;

    let instances = upstream(&server).fetch_instances().await.unwrap();

    assert_eq!(instances.len(), 3);
    assert_eq!(instances[0].connection_status, ConnectionState::Open);
    assert_eq!(instances[0].owner_jid.as_deref(), Some("5199@s.whatsapp.net"));
    assert_eq!(instances[1].connection_status, ConnectionState::Closed);
    assert_eq!(instances[2].connection_status, ConnectionState::Connecting);
}

#[tokio::test]
async fn test_confirmation_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/confirm"))
        .and(body_json(json!({"Idenvio": 9, "Ninstancia": "inst1", "Cenvio": 2})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let request = ConfirmationRequest {
        message_id: 9,
        instance_name: "inst1".to_string(),
        code: ConfirmationCode::Failure,
    };
    upstream(&server).confirm(&request).await.unwrap();
}

#[tokio::test]
async fn test_media_send_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendMedia/inst1"))
        .and(header("Apikey", "tok"))
        .and(body_json(json!({
            "number": "51999999999",
            "caption": "*Oferta*\n\nNuevo catalogo",
            "media": "https://cdn.example.com/a.jpg",
            "fileName": "img.jpg",
            "mediatype": "image",
            "mimetype": "image/jpeg"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = sender(&server).send(&instance(), &image_message()).await;
    assert_eq!(outcome, SendOutcome::Delivered { status_code: 200 });
}

#[tokio::test]
async fn test_send_statuses_are_classified() {
    let cases = [(400, false), (429, true), (500, true), (503, true)];

    for (status, retryable) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendMedia/inst1"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = sender(&server).send(&instance(), &image_message()).await;
        assert!(!outcome.is_delivered(), "status {}", status);
        assert_eq!(outcome.is_retryable(), retryable, "status {}", status);
    }
}

#[tokio::test]
async fn test_send_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/sendMedia/inst1"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let outcome = sender(&server).send(&instance(), &image_message()).await;
    assert!(matches!(outcome, SendOutcome::Transient { status_code: None, .. }));
}
