//! Server-sent events -> [`ChatStream`] adapter.

use std::pin::Pin;

use eventsource_stream::Eventsource;
use futures_util::{future, stream, Stream, StreamExt};
use reqwest::Response;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;

/// Text fragments of a streamed answer, in arrival order.
///
/// Ends when the server sends `[DONE]` or closes the connection. Not restartable.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

/// Error object the server sends in place of a chunk when it gives up mid-answer.
#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseData {
    Fragment(String),
    Skip,
    Done,
}

/// Interpret the `data:` payload of one event.
pub(crate) fn parse_sse_data(data: &str) -> Result<SseData, ChatError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseData::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseData::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(ChatError::Stream(match error.kind {
            Some(kind) => format!("{}: {}", kind, error.message),
            None => error.message,
        }));
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();

    if content.is_empty() {
        Ok(SseData::Skip)
    } else {
        Ok(SseData::Fragment(content))
    }
}

pub(crate) fn fragments_from_sse(response: Response) -> ChatStream {
    let stream = response
        .bytes_stream()
        .eventsource()
        .map(|event| {
            let event = event.map_err(|e| ChatError::Stream(e.to_string()))?;
            parse_sse_data(&event.data)
        })
        .take_while(|item| future::ready(!matches!(item, Ok(SseData::Done))))
        .filter_map(|item| async move {
            match item {
                Ok(SseData::Fragment(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            }
        });

    Box::pin(stream)
}

/// Stop `fragments` as soon as `token` fires, yielding a final `Cancelled`.
///
/// The stream also ends after the first error.
pub(crate) fn with_cancellation(fragments: ChatStream, token: CancellationToken) -> ChatStream {
    let guarded = stream::unfold(Some((fragments, token)), |state| async move {
        let (mut fragments, token) = match state {
            Some(state) => state,
            None => return None,
        };

        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            next = fragments.next() => Some(next),
        };

        match next {
            None => Some((Err(ChatError::Cancelled), None)),
            Some(Some(Ok(fragment))) => Some((Ok(fragment), Some((fragments, token)))),
            Some(Some(Err(err))) => Some((Err(err), None)),
            Some(None) => None,
        }
    });

    Box::pin(guarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sse_response(body: &'static str) -> (MockServer, Response) {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        let response = reqwest::Client::new()
            .get(format!("{}/sse", mock_server.uri()))
            .send()
            .await
            .expect("response");
        (mock_server, response)
    }

    #[test]
    fn test_parse_token() {
        let data = r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        assert_eq!(parse_sse_data(data).unwrap(), SseData::Fragment("Hello".to_string()));
    }

    #[test]
    fn test_parse_role_only_delta_is_skipped() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_data(data).unwrap(), SseData::Skip);
    }

    #[test]
    fn test_parse_done() {
        assert_eq!(parse_sse_data("[DONE]").unwrap(), SseData::Done);
        assert_eq!(parse_sse_data("  ").unwrap(), SseData::Skip);
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(parse_sse_data("{not json"), Err(ChatError::Json(_))));
    }

    #[test]
    fn test_parse_error_event() {
        let data = r#"{"error":{"message":"context_length_exceeded","type":"invalid_request_error"}}"#;
        match parse_sse_data(data) {
            Err(ChatError::Stream(message)) => {
                assert_eq!(message, "invalid_request_error: context_length_exceeded");
            }
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_event_after_fragments_is_surfaced() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Part\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"context_length_exceeded\"}}\n\n",
        );
        let (_server, response) = sse_response(body).await;

        let items: Vec<Result<String, ChatError>> = fragments_from_sse(response).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Part");
        assert!(matches!(&items[1], Err(ChatError::Stream(message)) if message == "context_length_exceeded"));
    }

    #[tokio::test]
    async fn test_fragments_stop_at_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let (_server, response) = sse_response(body).await;

        let fragments: Vec<String> = fragments_from_sse(response)
            .map(|item| item.expect("fragment"))
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_fragments_end_when_connection_closes() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"only\"}}]}\n\n";
        let (_server, response) = sse_response(body).await;

        let fragments: Vec<String> = fragments_from_sse(response)
            .map(|item| item.expect("fragment"))
            .collect()
            .await;
        assert_eq!(fragments, vec!["only"]);
    }

    #[tokio::test]
    async fn test_cancelled_stream_yields_cancelled_then_ends() {
        let token = CancellationToken::new();
        let source: ChatStream = Box::pin(stream::pending());
        let mut guarded = with_cancellation(source, token.clone());

        token.cancel();
        assert!(matches!(guarded.next().await, Some(Err(ChatError::Cancelled))));
        assert!(guarded.next().await.is_none());
    }

    #[tokio::test]
    async fn test_guard_passes_fragments_through() {
        let source: ChatStream = Box::pin(stream::iter(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
        ]));
        let guarded = with_cancellation(source, CancellationToken::new());

        let out: Vec<String> = guarded.map(|item| item.unwrap()).collect().await;
        assert_eq!(out, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_guard_stops_after_error() {
        let source: ChatStream = Box::pin(stream::iter(vec![
            Err(ChatError::Stream("boom".to_string())),
            Ok("never".to_string()),
        ]));
        let mut guarded = with_cancellation(source, CancellationToken::new());

        assert!(matches!(guarded.next().await, Some(Err(ChatError::Stream(_)))));
        assert!(guarded.next().await.is_none());
    }
}
