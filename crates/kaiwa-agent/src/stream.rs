/// Events emitted during LLM streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Incremental piece of a tool call, keyed by its position in the turn.
    ToolCallDelta(ToolCallFragment),

    /// Stream completed successfully.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// One streamed tool-call delta.
///
/// Fragments for the same `index` arrive in order but may interleave with
/// other indices. `id` usually arrives on the first fragment only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ToolCallFragment {
    pub fn name(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn arguments(index: usize, arguments: impl Into<String>) -> Self {
        Self {
            index,
            arguments: Some(arguments.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug, PartialEq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_with_and_without_space() {
        assert_eq!(
            parse_sse_line("data: [DONE]"),
            Some(SseParsed::Data("[DONE]".into()))
        );
        assert_eq!(
            parse_sse_line("data:{}"),
            Some(SseParsed::Data("{}".into()))
        );
        assert_eq!(
            parse_sse_line("event: ping"),
            Some(SseParsed::Event("ping".into()))
        );
        assert_eq!(parse_sse_line(": keep-alive"), None);
    }
}
