//! Orchestration of user actions.
//!
//! Turns an intent (summarize, explain, rewrite, chat) into a prompt or a
//! conversation, runs it through the inference client with a fresh
//! configuration snapshot, and records successful chat exchanges.

use crate::client::{CallOptions, InferenceClient, InferenceError};
use crate::config::{ConfigError, Settings};
use crate::extractor::ExtractedContext;
use crate::message::{Conversation, Message};
use crate::storage::{HistoryStore, StorageError};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// System preamble sent with every conversation.
pub const SYSTEM_PREAMBLE: &str = "You are Callosum, an on-device AI assistant. \
Be accurate, concise, and cite in-page sections when possible. \
Never send data to external services.";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("nothing to send: {0}")]
    EmptyInput(String),
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Inference(e) if e.is_cancelled())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Inference(e) if e.is_timeout())
    }
}

/// One-shot text actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Summarize,
    Explain,
    Rewrite,
}

impl Action {
    /// Fixed prompt for this action wrapped around `text`.
    pub fn prompt(&self, text: &str) -> String {
        match self {
            Action::Summarize => format!(
                "Summarize the following content concisely in 5-8 bullet points.\n\nCONTENT:\n{}",
                text
            ),
            Action::Explain => format!(
                "Explain the following text clearly and briefly, with key points and definitions where helpful.\n\nTEXT:\n{}",
                text
            ),
            Action::Rewrite => format!(
                "Rewrite the following text to improve clarity and tone while preserving meaning. Return only the rewritten text.\n\nTEXT:\n{}",
                text
            ),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Summarize => "summarize",
            Action::Explain => "explain",
            Action::Rewrite => "rewrite",
        };
        f.write_str(name)
    }
}

/// Where the text for an action comes from.
#[derive(Debug, Clone, Copy)]
pub enum TextSource<'a> {
    Selection(&'a str),
    Page(&'a ExtractedContext),
    Free(&'a str),
}

impl<'a> TextSource<'a> {
    pub fn text(&self) -> &'a str {
        match *self {
            TextSource::Selection(text) | TextSource::Free(text) => text.trim(),
            TextSource::Page(context) => context.content.trim(),
        }
    }
}

/// Assemble the conversation for a chat turn: preamble, optional page
/// context, prior history, then the new user message.
pub fn build_conversation(
    history: &[Message],
    user_message: &str,
    page: Option<&ExtractedContext>,
) -> Conversation {
    let mut messages = Vec::with_capacity(history.len() + 3);
    match page {
        Some(page) => {
            messages.push(Message::system(format!(
                "{} Current page: {} ({})",
                SYSTEM_PREAMBLE, page.title, page.url
            )));
            messages.push(Message::system(page_context(page)));
        }
        None => messages.push(Message::system(SYSTEM_PREAMBLE)),
    }
    messages.extend(history.iter().cloned());
    messages.push(Message::user(user_message));
    messages
}

fn page_context(page: &ExtractedContext) -> String {
    let mut out = String::from("Page context:");
    let fields = [
        ("Title", &page.title),
        ("URL", &page.url),
        ("Description", &page.description),
        ("Selected text", &page.selection),
    ];
    for (label, value) in fields {
        if !value.is_empty() {
            out.push_str(&format!("\n{}: {}", label, value));
        }
    }
    if !page.content.is_empty() {
        out.push_str("\n\nContent:\n");
        out.push_str(&page.content);
    }
    out
}

/// Runs user intents against the inference server with the given settings.
pub struct Assistant<'a> {
    client: &'a InferenceClient,
    settings: &'a Settings,
}

impl<'a> Assistant<'a> {
    pub fn new(client: &'a InferenceClient, settings: &'a Settings) -> Self {
        Self { client, settings }
    }

    /// Run a one-shot action over `source`.
    pub async fn run_action(
        &self,
        action: Action,
        source: TextSource<'_>,
        options: CallOptions<'_>,
    ) -> Result<String, AgentError> {
        let text = source.text();
        if text.is_empty() {
            return Err(AgentError::EmptyInput(format!("no text to {}", action)));
        }
        let config = self.settings.request_config()?;
        info!(%action, chars = text.len(), model = %config.model, "running action");
        let prompt = action.prompt(text);
        Ok(self.client.generate(&prompt, &config, options).await?)
    }

    /// Summarize a page's extracted content.
    pub async fn summarize_page(
        &self,
        page: &ExtractedContext,
        options: CallOptions<'_>,
    ) -> Result<String, AgentError> {
        self.run_action(Action::Summarize, TextSource::Page(page), options)
            .await
    }

    /// One chat turn for `origin`. The exchange is appended to the stored
    /// history only when the server answered successfully with some text.
    pub async fn chat(
        &self,
        store: &HistoryStore,
        origin: &str,
        message: &str,
        page: Option<&ExtractedContext>,
        options: CallOptions<'_>,
    ) -> Result<String, AgentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::EmptyInput("empty chat message".into()));
        }
        let config = self.settings.request_config()?;
        let history = store.load(origin)?;
        let page = page.filter(|_| self.settings.include_page_context);
        let messages = build_conversation(&history, message, page);
        info!(origin, history = history.len(), "sending chat turn");

        let reply = self.client.chat(&messages, &config, options).await?;
        if reply.trim().is_empty() {
            warn!(origin, "empty reply, chat history left unchanged");
            return Ok(reply);
        }
        store.append_exchange(origin, Message::user(message), Message::assistant(&reply))?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn page() -> ExtractedContext {
        ExtractedContext {
            title: "Borrowing".to_string(),
            url: "https://example.com/borrow".to_string(),
            description: String::new(),
            content: "References never outlive their referent.".to_string(),
            selection: "outlive".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_prompts_embed_text() {
        let prompt = Action::Summarize.prompt("some article");
        assert!(prompt.starts_with("Summarize the following content"));
        assert!(prompt.ends_with("CONTENT:\nsome article"));
        assert!(Action::Rewrite
            .prompt("x")
            .contains("Return only the rewritten text."));
        assert!(Action::Explain.prompt("x").ends_with("TEXT:\nx"));
    }

    #[test]
    fn test_conversation_without_page() {
        let history = vec![Message::user("q1"), Message::assistant("a1")];
        let messages = build_conversation(&history, "q2", None);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system(SYSTEM_PREAMBLE));
        assert_eq!(&messages[1..3], &history[..]);
        assert_eq!(messages[3], Message::user("q2"));
    }

    #[test]
    fn test_conversation_with_page_context() {
        let page = page();
        let messages = build_conversation(&[], "what is this?", Some(&page));

        assert_eq!(messages.len(), 3);
        assert!(messages[0]
            .content
            .ends_with("Current page: Borrowing (https://example.com/borrow)"));
        assert_eq!(messages[1].role, Role::System);
        assert!(messages[1].content.contains("Selected text: outlive"));
        assert!(messages[1]
            .content
            .contains("References never outlive their referent."));
        assert!(!messages[1].content.contains("Description:"));
        assert_eq!(messages[2], Message::user("what is this?"));
    }

    #[test]
    fn test_text_source() {
        let page = page();
        assert_eq!(TextSource::Selection("  hi \n").text(), "hi");
        assert_eq!(
            TextSource::Page(&page).text(),
            "References never outlive their referent."
        );
    }

    #[tokio::test]
    async fn test_empty_text_fails_before_network() {
        let client = InferenceClient::new().unwrap();
        let settings = Settings::default();
        let assistant = Assistant::new(&client, &settings);

        let err = assistant
            .run_action(Action::Explain, TextSource::Free("   "), CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_fast() {
        let client = InferenceClient::new().unwrap();
        let settings = Settings {
            model: String::new(),
            ..Settings::default()
        };
        let assistant = Assistant::new(&client, &settings);

        let err = assistant
            .run_action(Action::Rewrite, TextSource::Free("text"), CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(ConfigError::Invalid(_))));
    }
}
