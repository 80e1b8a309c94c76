use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use url::Url;

use qrverse::application::generator::{GenerationError, VerseGenerator};
use qrverse::config::GeneratorSettings;
use qrverse::domain::language::Language;
use qrverse::infra::error::InfraError;
use qrverse::infra::generator::OpenAiVerseGenerator;

/// What the stub replies with, plus every request body it saw.
#[derive(Clone)]
struct Stub {
    status: StatusCode,
    reply: Value,
    seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn chat_completions(
    State(stub): State<Stub>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    stub.seen.lock().expect("seen lock").push((auth, body));
    (stub.status, Json(stub.reply.clone())).into_response()
}

async fn spawn_stub(stub: Stub) -> SocketAddr {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });
    addr
}

fn stub(status: StatusCode, reply: Value) -> Stub {
    Stub {
        status,
        reply,
        seen: Arc::new(Mutex::new(Vec::new())),
    }
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

fn settings(addr: SocketAddr) -> GeneratorSettings {
    GeneratorSettings {
        api_base: Url::parse(&format!("http://{addr}/v1/")).expect("stub url"),
        model: "test-model".to_string(),
        api_key: Some("sk-test".to_string()),
        timeout: Duration::from_secs(5),
        temperature: 0.7,
    }
}

#[tokio::test]
async fn generates_a_verse_from_a_fenced_reply() {
    let stub = stub(
        StatusCode::OK,
        completion(
            "```json\n{\"book\":\"Juan\",\"chapter\":3,\"verse\":16,\"text\":\"Porque de tal manera amó Dios al mundo...\"}\n```",
        ),
    );
    let seen = stub.seen.clone();
    let addr = spawn_stub(stub).await;

    let generator = OpenAiVerseGenerator::new(&settings(addr)).expect("generator builds");
    let verse = generator
        .generate(Language::Spanish)
        .await
        .expect("verse generated");

    assert_eq!(verse.reference(), "Juan 3:16");
    assert!(verse.text().starts_with("Porque"));

    let seen = seen.lock().expect("seen lock");
    let (auth, body) = seen.first().expect("one request");
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert_eq!(body["model"], json!("test-model"));
    assert_eq!(body["response_format"]["type"], json!("json_object"));
    let prompt = body["messages"][1]["content"]
        .as_str()
        .expect("user prompt");
    assert!(prompt.contains("Spanish"));
}

#[tokio::test]
async fn upstream_errors_keep_status_and_body() {
    let addr = spawn_stub(stub(
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": { "message": "rate limited" } }),
    ))
    .await;

    let generator = OpenAiVerseGenerator::new(&settings(addr)).expect("generator builds");
    let err = generator
        .generate(Language::English)
        .await
        .expect_err("upstream failure");

    match err {
        GenerationError::Upstream { status, body } => {
            assert_eq!(status, 429);
            assert!(body.contains("rate limited"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn prose_without_json_is_malformed() {
    let addr = spawn_stub(stub(
        StatusCode::OK,
        completion("Sorry, I can only answer questions about the weather."),
    ))
    .await;

    let generator = OpenAiVerseGenerator::new(&settings(addr)).expect("generator builds");
    let err = generator
        .generate(Language::English)
        .await
        .expect_err("malformed reply");
    assert!(matches!(err, GenerationError::Malformed { .. }));
}

#[tokio::test]
async fn empty_choices_are_malformed() {
    let addr = spawn_stub(stub(StatusCode::OK, json!({ "choices": [] }))).await;

    let generator = OpenAiVerseGenerator::new(&settings(addr)).expect("generator builds");
    let err = generator
        .generate(Language::BrazilianPortuguese)
        .await
        .expect_err("no content");
    assert!(matches!(err, GenerationError::Malformed { .. }));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);

    let generator = OpenAiVerseGenerator::new(&settings(addr)).expect("generator builds");
    let err = generator
        .generate(Language::English)
        .await
        .expect_err("connection refused");
    assert!(matches!(err, GenerationError::Transport { .. }));
}

#[test]
fn missing_api_key_is_rejected_up_front() {
    let mut settings = settings("127.0.0.1:9".parse().expect("socket addr"));
    settings.api_key = None;

    assert!(matches!(
        OpenAiVerseGenerator::new(&settings),
        Err(InfraError::MissingApiKey)
    ));
}
