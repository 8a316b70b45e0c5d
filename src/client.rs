//! Per-credential client for one OpenAI-compatible provider.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tracing::warn;

use crate::sse;
use crate::usage::UsageLedger;
use crate::{Result, RouterError};

/// One (provider, API key) pair. Holds the usage the key has accrued; every
/// successful completion reports its token total back here.
#[derive(Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    usage: UsageLedger,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            usage: UsageLedger::new(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Buffered chat completion. The body is forwarded verbatim; on success
    /// the response's `usage.total_tokens` is attributed to this credential
    /// under the request's model.
    pub async fn complete(&self, body: &Value) -> Result<Value> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let response = self
            .http
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RouterError::UpstreamStatus { status, body: text });
        }

        let parsed: Value = response.json().await?;
        if let Some(total) = total_tokens(&parsed) {
            if let Err(err) = self.usage.add(&model, total) {
                warn!(model = %model, error = %err, "refusing usage update");
            }
        }
        Ok(parsed)
    }

    /// Opens a streaming chat completion. The returned [`ChatStream`] relays
    /// chunks and meters usage as they arrive.
    pub async fn open_stream(self: Arc<Self>, body: &Value) -> Result<ChatStream> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let response = self
            .http
            .post(self.chat_completions_url())
            .header("Accept", "text/event-stream")
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RouterError::UpstreamStatus { status, body: text });
        }

        Ok(ChatStream {
            data: sse::data_stream_from_response(response),
            client: self,
            model,
            last_reported_usage: 0,
        })
    }
}

/// An open upstream SSE stream. Owns the connection; dropping the stream on
/// any exit path closes it.
pub struct ChatStream {
    data: BoxStream<'static, Result<String>>,
    client: Arc<UpstreamClient>,
    model: String,
    last_reported_usage: i64,
}

impl ChatStream {
    /// Next upstream chunk, already parsed. `None` means end of stream (the
    /// `[DONE]` sentinel included).
    pub async fn recv(&mut self) -> Option<Result<Value>> {
        let payload = match self.data.next().await? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err)),
        };
        let chunk: Value = match serde_json::from_str(&payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                return Some(Err(RouterError::InvalidStream(format!(
                    "invalid chunk json: {err}"
                ))));
            }
        };
        self.observe(&chunk);
        Some(Ok(chunk))
    }

    /// Meters usage against `last_reported_usage` so cumulative, repeated, or
    /// final-only reports all land exactly once. Only finish-like chunks
    /// carrying a usage object contribute.
    fn observe(&mut self, chunk: &Value) {
        if !is_finish_chunk(chunk) {
            return;
        }
        let Some(total) = total_tokens(chunk) else {
            return;
        };
        let delta = total - self.last_reported_usage;
        if delta <= 0 {
            return;
        }
        match self.client.usage.add(&self.model, delta) {
            Ok(()) => self.last_reported_usage += delta,
            Err(err) => warn!(model = %self.model, error = %err, "refusing usage update"),
        }
    }
}

fn total_tokens(value: &Value) -> Option<i64> {
    value.pointer("/usage/total_tokens").and_then(Value::as_i64)
}

/// A chunk is finish-like when its `choices` are empty, its first choice has
/// a non-empty `finish_reason`, or the first choice's delta carries neither
/// content nor reasoning content. Providers disagree on where usage is
/// reported; every variant lands on a finish-like chunk.
pub(crate) fn is_finish_chunk(chunk: &Value) -> bool {
    let choices = match chunk.get("choices").and_then(Value::as_array) {
        Some(choices) => choices,
        None => return true,
    };
    let Some(first) = choices.first() else {
        return true;
    };
    if first
        .get("finish_reason")
        .and_then(Value::as_str)
        .is_some_and(|reason| !reason.is_empty())
    {
        return true;
    }
    let content = first
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let reasoning = first
        .pointer("/delta/reasoning_content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    content.is_empty() && reasoning.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn test_client() -> Arc<UpstreamClient> {
        Arc::new(UpstreamClient::new(
            reqwest::Client::new(),
            "http://localhost:9/v1",
            "k",
        ))
    }

    fn stream_over(chunks: Vec<Value>) -> ChatStream {
        let items = chunks
            .into_iter()
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<Result<String>>>();
        ChatStream {
            data: Box::pin(stream::iter(items)),
            client: test_client(),
            model: "m".to_string(),
            last_reported_usage: 0,
        }
    }

    async fn drain(mut stream: ChatStream) -> (i64, usize) {
        let mut count = 0;
        while let Some(chunk) = stream.recv().await {
            chunk.expect("chunk");
            count += 1;
        }
        (stream.client.usage.get("m"), count)
    }

    #[test]
    fn content_chunk_is_not_finish_like() {
        let chunk = json!({"choices": [{"delta": {"content": "Hel"}}]});
        assert!(!is_finish_chunk(&chunk));
    }

    #[test]
    fn reasoning_chunk_is_not_finish_like() {
        let chunk = json!({"choices": [{"delta": {"content": "", "reasoning_content": "hmm"}}]});
        assert!(!is_finish_chunk(&chunk));
    }

    #[test]
    fn empty_choices_is_finish_like() {
        assert!(is_finish_chunk(&json!({"choices": []})));
    }

    #[test]
    fn finish_reason_is_finish_like() {
        let chunk = json!({"choices": [{"delta": {"content": "tail"}, "finish_reason": "stop"}]});
        assert!(is_finish_chunk(&chunk));
    }

    #[test]
    fn empty_delta_is_finish_like() {
        assert!(is_finish_chunk(&json!({"choices": [{"delta": {}}]})));
        assert!(is_finish_chunk(
            &json!({"choices": [{"delta": {"content": "", "reasoning_content": ""}}]})
        ));
    }

    #[tokio::test]
    async fn usage_on_final_chunk_lands_once() {
        let stream = stream_over(vec![
            json!({"choices": [{"delta": {"content": "a"}}]}),
            json!({"choices": [{"delta": {"content": "b"}}]}),
            json!({"choices": [{"delta": {"content": "c"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}], "usage": {"total_tokens": 77}}),
        ]);
        let (usage, count) = drain(stream).await;
        assert_eq!(usage, 77);
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn cumulative_usage_reports_deduplicate() {
        // Two finish-like chunks carrying cumulative totals 30 then 77 must
        // land as 77, not 107.
        let stream = stream_over(vec![
            json!({"choices": [{"delta": {}}], "usage": {"total_tokens": 30}}),
            json!({"choices": [{"delta": {}}], "usage": {"total_tokens": 77}}),
        ]);
        let (usage, _) = drain(stream).await;
        assert_eq!(usage, 77);
    }

    #[tokio::test]
    async fn repeated_identical_usage_reports_deduplicate() {
        let stream = stream_over(vec![
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}], "usage": {"total_tokens": 50}}),
            json!({"choices": [], "usage": {"total_tokens": 50}}),
        ]);
        let (usage, _) = drain(stream).await;
        assert_eq!(usage, 50);
    }

    #[tokio::test]
    async fn usage_on_content_chunk_is_ignored() {
        let stream = stream_over(vec![
            json!({"choices": [{"delta": {"content": "x"}}], "usage": {"total_tokens": 10}}),
        ]);
        let (usage, _) = drain(stream).await;
        assert_eq!(usage, 0);
    }

    #[tokio::test]
    async fn stream_without_usage_contributes_nothing() {
        let stream = stream_over(vec![
            json!({"choices": [{"delta": {"content": "x"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ]);
        let (usage, count) = drain(stream).await;
        assert_eq!(usage, 0);
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn error_mid_stream_stops_metering() {
        let items: Vec<Result<String>> = vec![
            Ok(json!({"choices": [{"delta": {}}], "usage": {"total_tokens": 30}}).to_string()),
            Err(RouterError::InvalidStream("boom".to_string())),
        ];
        let mut stream = ChatStream {
            data: Box::pin(stream::iter(items)),
            client: test_client(),
            model: "m".to_string(),
            last_reported_usage: 0,
        };

        stream.recv().await.expect("chunk").expect("ok");
        assert!(stream.recv().await.expect("item").is_err());
        assert_eq!(stream.client.usage.get("m"), 30);
    }
}
