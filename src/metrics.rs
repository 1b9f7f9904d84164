//! Per-request token metrics, recovered from upstream response bodies.
//!
//! OpenAI-compatible servers report a `usage` object either in a plain JSON
//! response or in the final SSE chunk of a streamed one. The proxy scans the
//! bytes it forwards (keeping only a bounded tail) and emits a
//! [`TokenMetrics`] event when the request completes.

use serde::Serialize;

/// Bytes of body tail retained for usage scanning. The usage chunk is at the
/// end of the stream, so a bounded window is enough even for long streams.
const SCAN_WINDOW_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct TokenMetrics {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
    /// Completion tokens per second over the whole request; 0 when unknown.
    pub tokens_per_second: f64,
}

impl TokenMetrics {
    pub fn new(model: String, usage: Option<Usage>, duration_ms: u64) -> Self {
        let (prompt_tokens, completion_tokens) = match usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (0, 0),
        };
        let tokens_per_second = if duration_ms > 0 && completion_tokens > 0 {
            completion_tokens as f64 * 1000.0 / duration_ms as f64
        } else {
            0.0
        };
        TokenMetrics {
            model,
            prompt_tokens,
            completion_tokens,
            duration_ms,
            tokens_per_second,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Accumulates the tail of a response body and extracts the `usage` object
/// once the stream ends.
#[derive(Default)]
pub struct UsageScanner {
    tail: Vec<u8>,
    truncated: bool,
}

impl UsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > SCAN_WINDOW_BYTES {
            let drop = self.tail.len() - SCAN_WINDOW_BYTES;
            self.tail.drain(..drop);
            self.truncated = true;
        }
    }

    pub fn finish(&self) -> Option<Usage> {
        let text = std::str::from_utf8(&self.tail).ok()?;
        if text.contains("data:") {
            parse_usage_from_sse(text)
        } else if self.truncated {
            // A truncated plain JSON body can no longer be parsed whole.
            None
        } else {
            parse_usage_from_json(text.trim())
        }
    }
}

fn parse_usage_from_json(body: &str) -> Option<Usage> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    usage_from_value(value.get("usage")?)
}

/// Scan SSE `data:` lines back to front for the last chunk carrying usage.
fn parse_usage_from_sse(body: &str) -> Option<Usage> {
    for line in body.lines().rev() {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" || payload.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload)
            && let Some(usage) = value.get("usage")
            && let Some(parsed) = usage_from_value(usage)
        {
            return Some(parsed);
        }
    }
    None
}

fn usage_from_value(usage: &serde_json::Value) -> Option<Usage> {
    let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
    let completion_tokens = usage.get("completion_tokens")?.as_u64()?;
    Some(Usage {
        prompt_tokens,
        completion_tokens,
    })
}
