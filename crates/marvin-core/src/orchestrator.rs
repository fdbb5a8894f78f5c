//! Turns a question plus the project context into a chat request.
//!
//! One query runs at a time. While it is in flight its cancellation handle
//! is registered here so the front end can cancel without holding the handle
//! itself; a second `ask` during that time fails with [`AskError::Busy`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;

use crate::ai::{CancellationHandle, ChatClient};
use crate::error::AskError;
use crate::history::{History, HistoryEntry};
use crate::state::ChatMessage;

const PROMPT_INTRODUCTION: &str = "You are a highly skilled software assistant with the ability to understand and analyze software projects in their entirety. You have the capability to read and comprehend various source code files and project documents, and you can provide assistance based on this understanding. Below is a summary of a software project, including key excerpts from its source code and documentation:";

const PROMPT_INSTRUCTION: &str = "Based on the project summary above, be prepared to answer questions about the project, offer insights, suggest improvements, assist in debugging, and provide coding help where needed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Sending,
}

/// The four messages sent for every question: system, user, system, user.
pub fn build_messages(question: &str, context: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(PROMPT_INTRODUCTION),
        ChatMessage::user(format!("Project Summary:\n{}\n\n", context)),
        ChatMessage::system(PROMPT_INSTRUCTION),
        ChatMessage::user(question),
    ]
}

pub struct Orchestrator {
    client: ChatClient,
    history: Mutex<History>,
    in_flight: Mutex<Option<CancellationHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight slot when the query settles or its future is dropped.
struct InFlight<'a> {
    slot: &'a Mutex<Option<CancellationHandle>>,
    handle: CancellationHandle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().map(CancellationHandle::id) == Some(self.handle.id()) {
            *slot = None;
        }
    }
}

impl Orchestrator {
    pub fn new(client: ChatClient, history: History) -> Self {
        Self {
            client,
            history: Mutex::new(history),
            in_flight: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueryState {
        if lock(&self.in_flight).is_some() {
            QueryState::Sending
        } else {
            QueryState::Idle
        }
    }

    /// Snapshot of the history, newest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.history).entries().to_vec()
    }

    pub fn history_snapshot(&self) -> History {
        lock(&self.history).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    /// Ask `question` against `context` and wait for the full answer.
    pub async fn ask(&self, question: &str, context: &str) -> Result<String, AskError> {
        let in_flight = self.begin()?;
        let messages = build_messages(question, context);

        let answer = self.client.complete(&messages, &in_flight.handle).await?;
        drop(in_flight);

        self.record(question, &answer);
        Ok(answer)
    }

    /// Like [`ask`](Self::ask), handing each fragment to `on_fragment` as it arrives.
    ///
    /// History only records answers whose stream ran to completion.
    pub async fn ask_streaming<F>(&self, question: &str, context: &str, mut on_fragment: F) -> Result<String, AskError>
    where
        F: FnMut(&str),
    {
        let in_flight = self.begin()?;
        let messages = build_messages(question, context);

        let mut stream = self.client.complete_streaming(&messages, &in_flight.handle).await?;
        let mut answer = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            on_fragment(&fragment);
            answer.push_str(&fragment);
        }
        drop(in_flight);

        self.record(question, &answer);
        Ok(answer)
    }

    /// Cancel the query in flight, if any. Returns whether there was one.
    pub fn cancel_current(&self) -> bool {
        match lock(&self.in_flight).take() {
            Some(handle) => {
                log::info!("Cancelling query {}", handle.id());
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> Result<InFlight<'_>, AskError> {
        let mut slot = lock(&self.in_flight);
        if slot.is_some() {
            return Err(AskError::Busy);
        }

        let handle = CancellationHandle::new();
        *slot = Some(handle.clone());
        Ok(InFlight {
            slot: &self.in_flight,
            handle,
        })
    }

    fn record(&self, question: &str, answer: &str) {
        lock(&self.history).record(question, answer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::history::HISTORY_LIMIT;
    use crate::state::ChatRole;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn answering(content: &str, delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "choices": [{ "message": { "role": "assistant", "content": content } }]
                    }))
                    .set_delay(delay),
            )
            .mount(&server)
            .await;
        server
    }

    fn orchestrator_for(server: &MockServer) -> Orchestrator {
        let client = ChatClient::new("sk-test", "gpt-test").with_endpoint(server.uri());
        Orchestrator::new(client, History::new())
    }

    async fn wait_until_sending(orchestrator: &Orchestrator) {
        while orchestrator.state() != QueryState::Sending {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_build_messages_template() {
        let messages = build_messages("What does X do?", "File: x.py\nx = 1\n\n");

        let roles: Vec<ChatRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::User, ChatRole::System, ChatRole::User]);
        assert_eq!(messages[0].content, PROMPT_INTRODUCTION);
        assert_eq!(messages[1].content, "Project Summary:\nFile: x.py\nx = 1\n\n\n\n");
        assert_eq!(messages[2].content, PROMPT_INSTRUCTION);
        assert_eq!(messages[3].content, "What does X do?");
    }

    #[tokio::test]
    async fn test_ask_sends_template_and_records_history() {
        let server = answering("It does Y.", Duration::ZERO).await;
        let orchestrator = orchestrator_for(&server);

        let answer = orchestrator.ask("What does X do?", "ctx").await.unwrap();
        assert_eq!(answer, "It does Y.");
        assert_eq!(
            orchestrator.history(),
            vec![HistoryEntry {
                question: "What does X do?".to_string(),
                response: "It does Y.".to_string(),
            }]
        );
        assert_eq!(orchestrator.state(), QueryState::Idle);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "system", "user"]);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_fifty() {
        let server = answering("ok", Duration::ZERO).await;
        let orchestrator = orchestrator_for(&server);

        for i in 1..=HISTORY_LIMIT + 1 {
            orchestrator.ask(&format!("q{i}"), "").await.unwrap();
        }

        let history = orchestrator.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].question, "q51");
        assert!(history.iter().all(|e| e.question != "q1"));
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let orchestrator = orchestrator_for(&server);

        let err = orchestrator.ask("q", "ctx").await.unwrap_err();
        assert!(matches!(err, AskError::Failed(_)));
        assert!(orchestrator.history().is_empty());
        assert_eq!(orchestrator.state(), QueryState::Idle);
    }

    #[test]
    fn test_cancel_without_query_is_noop() {
        let orchestrator = Orchestrator::new(ChatClient::new("k", "m"), History::new());
        assert!(!orchestrator.cancel_current());
        assert!(!orchestrator.cancel_current());
        assert_eq!(orchestrator.state(), QueryState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_query() {
        let server = answering("late", Duration::from_secs(10)).await;
        let orchestrator = Arc::new(orchestrator_for(&server));

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.ask("slow?", "ctx").await })
        };

        wait_until_sending(&orchestrator).await;
        assert!(orchestrator.cancel_current());

        let result = task.await.unwrap();
        assert!(matches!(result, Err(AskError::Cancelled)));
        assert!(orchestrator.history().is_empty());
        assert_eq!(orchestrator.state(), QueryState::Idle);
        assert!(!orchestrator.cancel_current());
    }

    #[tokio::test]
    async fn test_overlapping_ask_is_rejected() {
        let server = answering("first", Duration::from_millis(300)).await;
        let orchestrator = Arc::new(orchestrator_for(&server));

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.ask("one", "ctx").await })
        };

        wait_until_sending(&orchestrator).await;
        let second = orchestrator.ask("two", "ctx").await;
        assert!(matches!(second, Err(AskError::Busy)));

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(orchestrator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_query_frees_the_slot() {
        let server = answering("late", Duration::from_secs(10)).await;
        let orchestrator = orchestrator_for(&server);

        let result = tokio::time::timeout(Duration::from_millis(50), orchestrator.ask("q", "ctx")).await;
        assert!(result.is_err());
        assert_eq!(orchestrator.state(), QueryState::Idle);
    }

    #[tokio::test]
    async fn test_ask_streaming_forwards_fragments() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Str\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"eamed\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;
        let orchestrator = orchestrator_for(&server);

        let mut seen = Vec::new();
        let answer = orchestrator
            .ask_streaming("q", "ctx", |fragment| seen.push(fragment.to_string()))
            .await
            .unwrap();

        assert_eq!(answer, "Streamed");
        assert_eq!(seen, vec!["Str", "eamed"]);
        assert_eq!(orchestrator.history()[0].response, "Streamed");
    }

    #[tokio::test]
    async fn test_error_mid_stream_fails_the_query() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Part\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"context_length_exceeded\",\"type\":\"invalid_request_error\"}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;
        let orchestrator = orchestrator_for(&server);

        let mut seen = Vec::new();
        let result = orchestrator
            .ask_streaming("q", "ctx", |fragment| seen.push(fragment.to_string()))
            .await;

        assert!(matches!(result, Err(AskError::Failed(ChatError::Stream(_)))));
        assert_eq!(seen, vec!["Part"]);
        assert!(orchestrator.history().is_empty());
        assert_eq!(orchestrator.state(), QueryState::Idle);
    }
}
