use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::inference::{CompletionProvider, CompletionRequest, CompletionResponse, TokenUsage};
use crate::{Error, ErrorKind, Result, ServiceHealth};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return the text immediately.
    Text(String),
    /// Fail with the given kind and message.
    Error(ErrorKind, String),
    /// Sleep, then return the text.
    Delayed(Duration, String),
    /// Never answer.
    Hang,
}

impl MockReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(kind, message.into())
    }

    pub fn delayed(delay: Duration, content: impl Into<String>) -> Self {
        Self::Delayed(delay, content.into())
    }
}

/// Replies are consumed front to back; the last one repeats forever.
#[derive(Debug, Default)]
struct ReplyQueue(VecDeque<MockReply>);

impl ReplyQueue {
    fn next(&mut self) -> Option<MockReply> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

#[derive(Debug)]
struct Rule {
    needle: String,
    replies: ReplyQueue,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    default: ReplyQueue,
    calls: Vec<CompletionRequest>,
}

/// Completion provider answering from a script.
///
/// A request is matched against rules in insertion order by checking whether
/// the prompt contains the rule's needle. Unmatched requests use the default
/// replies. Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockCompletionProvider {
    state: Arc<Mutex<State>>,
}

impl MockCompletionProvider {
    /// Creates a provider with no script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for prompts containing `needle`.
    pub fn with_rule<I>(self, needle: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = MockReply>,
    {
        self.lock().rules.push(Rule {
            needle: needle.into(),
            replies: ReplyQueue(replies.into_iter().collect()),
        });
        self
    }

    /// Sets a single default reply.
    pub fn with_default_reply(self, reply: MockReply) -> Self {
        self.with_default_replies([reply])
    }

    /// Sets the default reply sequence.
    pub fn with_default_replies<I>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = MockReply>,
    {
        self.lock().default = ReplyQueue(replies.into_iter().collect());
        self
    }

    /// Returns all recorded requests in call order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.lock().calls.clone()
    }

    /// Returns the number of recorded requests.
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Returns the number of recorded requests whose prompt contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.prompt.contains(needle))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_reply(&self, request: &CompletionRequest) -> Option<MockReply> {
        let mut state = self.lock();
        state.calls.push(request.clone());

        let matched = state
            .rules
            .iter()
            .position(|rule| request.prompt.contains(&rule.needle));

        match matched {
            Some(index) => state.rules[index].replies.next(),
            None => state.default.next(),
        }
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait::async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let reply = self.next_reply(request).ok_or_else(|| {
            Error::not_found().with_message("no scripted reply matches the prompt")
        })?;

        let content = match reply {
            MockReply::Text(content) => content,
            MockReply::Error(kind, message) => return Err(Error::new(kind).with_message(message)),
            MockReply::Delayed(delay, content) => {
                tokio::time::sleep(delay).await;
                content
            }
            MockReply::Hang => {
                std::future::pending::<()>().await;
                String::new()
            }
        };

        let usage = TokenUsage::new(word_count(&request.prompt), word_count(&content));
        Ok(CompletionResponse::new(request.request_id, &request.model, content).with_usage(usage))
    }

    async fn health_check(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ask(provider: &MockCompletionProvider, prompt: &str) -> Result<String> {
        provider
            .complete(&CompletionRequest::new("mock", prompt))
            .await
            .map(|response| response.content)
    }

    #[tokio::test]
    async fn rules_match_by_substring_and_last_reply_repeats() {
        let provider = MockCompletionProvider::new()
            .with_rule("alpha", [MockReply::text("one"), MockReply::text("two")])
            .with_default_reply(MockReply::text("fallback"));

        assert_eq!(ask(&provider, "run alpha now").await.unwrap(), "one");
        assert_eq!(ask(&provider, "run alpha now").await.unwrap(), "two");
        assert_eq!(ask(&provider, "run alpha now").await.unwrap(), "two");
        assert_eq!(ask(&provider, "something else").await.unwrap(), "fallback");

        assert_eq!(provider.call_count(), 4);
        assert_eq!(provider.calls_matching("alpha"), 3);
    }

    #[tokio::test]
    async fn missing_script_is_an_error() {
        let provider = MockCompletionProvider::new();
        let err = ask(&provider, "hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reports_word_count_usage() {
        let provider = MockCompletionProvider::new().with_default_reply(MockReply::text("a b c"));
        let response = provider
            .complete(&CompletionRequest::new("mock", "four words in here"))
            .await
            .unwrap();
        assert_eq!(response.usage, TokenUsage::new(4, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let provider = MockCompletionProvider::new()
            .with_default_reply(MockReply::delayed(Duration::from_secs(5), "late"));

        let started = tokio::time::Instant::now();
        assert_eq!(ask(&provider, "x").await.unwrap(), "late");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
