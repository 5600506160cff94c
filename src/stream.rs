//! Decoding of streamed completion bodies.
//!
//! The server answers with newline-delimited chunks, each a `data: <json>` line
//! (a bare JSON line is accepted too). A chunk carries either a `response`
//! field (generate) or a `message.content` field (chat). `[DONE]` and chunks
//! that fail to parse are skipped without ending the stream. A chunk carrying
//! an `error` field ends it.

use crate::client::InferenceError;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use tracing::warn;

/// Lazy, finite sequence of token deltas in arrival order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// Which completion endpoint a stream comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Generate,
    Chat,
}

impl StreamKind {
    pub fn path(&self) -> &'static str {
        match self {
            StreamKind::Generate => "/api/generate",
            StreamKind::Chat => "/api/chat",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Accumulates raw bytes and hands out complete lines.
///
/// Bytes are kept until a newline arrives so multi-byte characters split
/// across network reads decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(decode(&line[..pos]))
    }

    /// Whatever is left after the body ended, if it is not blank.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode(&rest))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// Token carried by one line, if any. An error reported by the server in
/// the body comes back as [`InferenceError::Server`].
pub fn parse_line(line: &str, kind: StreamKind) -> Result<Option<String>, InferenceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let payload = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        None if line.starts_with('{') => line,
        None => return Ok(None),
    };
    if payload == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "skipping unparseable stream chunk");
            return Ok(None);
        }
    };

    if let Some(error) = chunk.error {
        warn!(%error, "server reported an error in the stream");
        return Err(InferenceError::Server(error));
    }

    let token = match kind {
        StreamKind::Generate => chunk.response,
        StreamKind::Chat => chunk.message.and_then(|message| message.content),
    };
    Ok(token.filter(|token| !token.is_empty()))
}

/// Turn a body byte stream into a stream of token deltas.
///
/// A transport error or a server-reported error is yielded once and ends the
/// stream.
pub fn token_stream<S, B>(body: S, kind: StreamKind) -> TokenStream
where
    S: Stream<Item = Result<B, InferenceError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend(bytes.as_ref());
                    while let Some(line) = buffer.next_line() {
                        match parse_line(&line, kind) {
                            Ok(Some(token)) => yield Ok(token),
                            Ok(None) => {}
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(line) = buffer.finish() {
            match parse_line(&line, kind) {
                Ok(Some(token)) => yield Ok(token),
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>, InferenceError>> {
        let chunks: Vec<_> = chunks
            .iter()
            .map(|c| Ok(c.as_bytes().to_vec()))
            .collect();
        stream::iter(chunks)
    }

    async fn collect(chunks: &[&str], kind: StreamKind) -> Vec<String> {
        token_stream(body(chunks), kind)
            .map(|token| token.unwrap())
            .collect()
            .await
    }

    fn token(line: &str, kind: StreamKind) -> Option<String> {
        parse_line(line, kind).unwrap()
    }

    #[test]
    fn test_parse_generate_line() {
        let line = r#"data: {"response":"Hel","done":false}"#;
        assert_eq!(token(line, StreamKind::Generate).as_deref(), Some("Hel"));
        assert_eq!(token(line, StreamKind::Chat), None);
    }

    #[test]
    fn test_parse_chat_line() {
        let line = r#"data: {"message":{"role":"assistant","content":"lo"}}"#;
        assert_eq!(token(line, StreamKind::Chat).as_deref(), Some("lo"));
    }

    #[test]
    fn test_done_and_noise_lines_are_skipped() {
        assert_eq!(token("data: [DONE]", StreamKind::Generate), None);
        assert_eq!(token("   ", StreamKind::Generate), None);
        assert_eq!(token("event: ping", StreamKind::Generate), None);
        assert_eq!(token("data: {not json", StreamKind::Generate), None);
        assert_eq!(token(r#"data: {"response":""}"#, StreamKind::Generate), None);
    }

    #[test]
    fn test_bare_json_line_is_accepted() {
        let line = r#"{"model":"mistral","response":"Hi","done":false}"#;
        assert_eq!(token(line, StreamKind::Generate).as_deref(), Some("Hi"));
    }

    #[test]
    fn test_error_chunk_is_reported() {
        let err = parse_line(r#"data: {"error":"out of memory"}"#, StreamKind::Chat).unwrap_err();
        assert!(matches!(err, InferenceError::Server(ref message) if message == "out of memory"));
    }

    #[tokio::test]
    async fn test_error_chunk_ends_stream() {
        let items: Vec<_> = token_stream(
            body(&[
                "data: {\"response\":\"a\"}\n",
                "data: {\"error\":\"model runner crashed\"}\n",
                "data: {\"response\":\"b\"}\n",
            ]),
            StreamKind::Generate,
        )
        .collect()
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "a");
        assert!(matches!(items[1], Err(InferenceError::Server(_))));
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        buffer.extend(b"data: {\"resp");
        assert_eq!(buffer.next_line(), None);
        buffer.extend(b"onse\":\"a\"}\r\ndata: x");
        assert_eq!(
            buffer.next_line().as_deref(),
            Some(r#"data: {"response":"a"}"#)
        );
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_line_buffer_keeps_split_utf8() {
        let mut buffer = LineBuffer::default();
        let bytes = "é\n".as_bytes();
        buffer.extend(&bytes[..1]);
        assert_eq!(buffer.next_line(), None);
        buffer.extend(&bytes[1..]);
        assert_eq!(buffer.next_line().as_deref(), Some("é"));
    }

    #[tokio::test]
    async fn test_tokens_arrive_in_order_across_chunk_boundaries() {
        let tokens = collect(
            &[
                "data: {\"response\":\"The \"}\ndata: {\"resp",
                "onse\":\"quick \"}\n",
                "data: [DONE]\n",
                "data: {\"response\":\"fox\"}",
            ],
            StreamKind::Generate,
        )
        .await;
        assert_eq!(tokens, vec!["The ", "quick ", "fox"]);
    }

    #[tokio::test]
    async fn test_malformed_chunk_does_not_change_result() {
        let clean = collect(
            &[
                "data: {\"message\":{\"content\":\"a\"}}\n",
                "data: {\"message\":{\"content\":\"b\"}}\n",
            ],
            StreamKind::Chat,
        )
        .await;
        let noisy = collect(
            &[
                "data: {\"message\":{\"content\":\"a\"}}\n",
                "data: {\"message\": oops}\n",
                "data: {\"message\":{\"content\":\"b\"}}\n",
            ],
            StreamKind::Chat,
        )
        .await;
        assert_eq!(clean, noisy);
        assert_eq!(clean.concat(), "ab");
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let chunks = vec![
            Ok(b"data: {\"response\":\"a\"}\n".to_vec()),
            Err(InferenceError::Cancelled),
            Ok(b"data: {\"response\":\"b\"}\n".to_vec()),
        ];
        let items: Vec<_> = token_stream(stream::iter(chunks), StreamKind::Generate)
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "a");
        assert!(matches!(items[1], Err(InferenceError::Cancelled)));
    }
}
