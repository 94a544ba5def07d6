//! Chat-completion upstream: streaming client, tool execution, and text
//! utilities shared by the response pipeline.

pub mod stream;
pub mod tools;

pub use stream::{ApiMessage, ChatClient, CompletionRequest};
pub use tools::{FunctionDefinition, ToolDefinition, ToolValidator, build_validators};

use async_stream::try_stream;
use futures::{Stream, StreamExt, pin_mut};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::SessionResult;

static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Rechunk a stream of text deltas into whole words.
///
/// The TTS mispronounces words split across chunks, so it must only ever
/// see word boundaries. Spaces are attached to the following word: the
/// stream "fo", "o bar" comes out as "foo", " bar". Runs of whitespace
/// collapse to a single space.
pub fn rechunk_to_words<S>(input: S) -> impl Stream<Item = SessionResult<String>> + Send
where
    S: Stream<Item = SessionResult<String>> + Send,
{
    try_stream! {
        let mut buffer = String::new();
        let mut prefix = "";
        pin_mut!(input);

        while let Some(delta) = input.next().await {
            buffer.push_str(&delta?);
            loop {
                let Some(found) = SPACE_RE.find(&buffer) else {
                    break;
                };
                let (start, end) = (found.start(), found.end());
                let chunk = buffer[..start].to_string();
                buffer.replace_range(..end, "");
                if !chunk.is_empty() {
                    yield format!("{prefix}{chunk}");
                }
                prefix = " ";
            }
        }

        if !buffer.is_empty() {
            yield format!("{prefix}{buffer}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_words(deltas: Vec<&str>) -> Vec<String> {
        let input = futures::stream::iter(
            deltas
                .into_iter()
                .map(|s| Ok(s.to_string()))
                .collect::<Vec<SessionResult<String>>>(),
        );
        rechunk_to_words(input)
            .map(|w| w.expect("no errors"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_words_split_across_deltas_are_joined() {
        let words = collect_words(vec!["fo", "o bar ", "baz"]).await;
        assert_eq!(words, vec!["foo", " bar", " baz"]);
    }

    #[tokio::test]
    async fn test_multiple_spaces_collapse() {
        let words = collect_words(vec!["one  two\n three"]).await;
        assert_eq!(words, vec!["one", " two", " three"]);
    }

    #[tokio::test]
    async fn test_trailing_word_is_flushed() {
        let words = collect_words(vec!["only"]).await;
        assert_eq!(words, vec!["only"]);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let words = collect_words(vec![]).await;
        assert!(words.is_empty());
    }
}
