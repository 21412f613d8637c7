//! Provider-specific configuration and detection.
//!
//! Gemini serves an OpenAI-compatible surface under `/v1beta/openai` next to
//! its native API; other OpenAI-compatible hosts use `/v1`.

/// Supported LLM providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// Google Gemini (generativelanguage.googleapis.com)
    Gemini,
    /// Generic OpenAI-compatible provider (local proxies, gateways)
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gemini_mcp_chat::llm::Provider;
    ///
    /// let provider = Provider::detect_from_url("https://generativelanguage.googleapis.com");
    /// assert_eq!(provider, Provider::Gemini);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("generativelanguage.googleapis.com") {
            Self::Gemini
        } else {
            Self::Generic
        }
    }

    /// Build the chat completions URL for this provider.
    #[must_use]
    pub fn build_chat_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::Gemini if base.ends_with("/openai") => format!("{base}/chat/completions"),
            Self::Gemini => format!("{base}/v1beta/openai/chat/completions"),
            Self::Generic if base.ends_with("/v1") => format!("{base}/chat/completions"),
            Self::Generic => format!("{base}/v1/chat/completions"),
        }
    }

    /// Build the native `streamGenerateContent` URL (SSE framing).
    #[must_use]
    pub fn build_native_stream_url(base_url: &str, model: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let model = model.trim_start_matches("models/");
        format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
    }
}
