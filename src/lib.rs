//! # Callosum
//!
//! Summarise, explain, rewrite and chat about web pages with a locally hosted
//! language model.
//!
//! ## Features
//!
//! - **Content Extraction**: Picks the main content of a page and strips navigation, ads and banners
//! - **Streaming Inference**: Tokens are delivered as the local server produces them, with cancellation and timeouts
//! - **Per-site Chat History**: Conversations are kept per origin in sled, bounded to the last 10 exchanges

pub mod agent;
pub mod client;
pub mod config;
pub mod extractor;
pub mod message;
pub mod storage;
pub mod stream;

pub use agent::{Action, AgentError, Assistant, TextSource};
pub use client::{CallOptions, InferenceClient, InferenceError};
pub use config::{RequestConfig, Settings};
pub use extractor::ExtractedContext;
pub use message::{Conversation, Message, Role};
pub use storage::HistoryStore;
pub use tokio_util::sync::CancellationToken;
