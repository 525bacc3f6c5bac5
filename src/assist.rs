#![forbid(unsafe_code)]

//! Boundary to the external natural-language extraction service.
//!
//! The service is a last-resort parser for records the tokenizer cannot
//! handle. It receives a fixed instruction plus the raw record text and must
//! answer with a literal JSON array of strings in marker order, with the
//! length omitted when the source left it empty. Everything beyond that
//! request/response contract is out of scope.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

/// Instruction sent ahead of every raw record. Spells out the marker
/// semantics of the dump format and pins the reply to a bare JSON array so
/// the answer stays machine-parseable.
const EXTRACTION_INSTRUCTION: &str = "Extract the metadata fields from the record string that follows. \
Answer with nothing but a JSON array of strings, e.g. [\"value1\", \"value2\", \"value3\"]. \
Do not explain anything. The first run of digits is the record ID. \
\"gvibirID\" marks the video title. \"gvibirDESC\" marks the video description. \
\"gvibirLEN\" marks the video length; it is sometimes empty or not stated, and in that case \
it must be left out of the array entirely rather than substituted with another value. \
\"gvibirDATE\" marks the upload date, a digit string optionally followed by a comma and a \
timezone label; keep both together as one value. \"gvibirPIC\" marks the thumbnail URL. \
\"gvibirURL\" marks the video URL. Remove any escape characters if found. Use double quotes \
around every value and escape any double quotes appearing inside the data. Record: ";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Failures at the extraction boundary. A reply that arrived but cannot be
/// parsed as a list is deliberately distinct from transport trouble: the
/// record processor logs them differently, though both abandon the record.
#[derive(Debug)]
pub enum AssistError {
    Transport(anyhow::Error),
    /// The raw reply text, kept verbatim for debugging.
    MalformedReply(String),
}

impl fmt::Display for AssistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssistError::Transport(err) => {
                write!(f, "extraction service request failed: {err}")
            }
            AssistError::MalformedReply(_) => {
                write!(f, "extraction service reply is not a literal list")
            }
        }
    }
}

impl std::error::Error for AssistError {}

/// Seam between the record processor and the extraction service, so the
/// processor can be tested without network access.
pub trait MetadataAssist {
    fn extract_fields(&self, raw: &str) -> Result<Vec<String>, AssistError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct AssistClient {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl AssistClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(REQUEST_TIMEOUT)
            .timeout_read(REQUEST_TIMEOUT)
            .build();
        Self {
            agent,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    fn request_reply(&self, raw: &str) -> Result<String, AssistError> {
        let url = format!(
            "{}/chat/completions",
            self.endpoint.trim_end_matches('/')
        );
        let mut request = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = request
            .send_json(json!({
                "model": self.model,
                "messages": [{
                    "role": "user",
                    "content": format!("{EXTRACTION_INSTRUCTION}{raw}"),
                }],
            }))
            .map_err(|err| AssistError::Transport(err.into()))?;

        let reply: ChatReply = response
            .into_json()
            .map_err(|err| AssistError::Transport(err.into()))?;
        reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AssistError::Transport(anyhow::anyhow!("reply carried no choices")))
    }
}

impl MetadataAssist for AssistClient {
    fn extract_fields(&self, raw: &str) -> Result<Vec<String>, AssistError> {
        let reply = self.request_reply(raw)?;
        parse_list_reply(&reply)
    }
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Parses the service's answer as a literal list of strings.
///
/// Models wrap answers in Markdown code fences often enough that fence lines
/// are tolerated and dropped; anything that still fails to parse as a JSON
/// string array is a [`AssistError::MalformedReply`].
pub fn parse_list_reply(content: &str) -> Result<Vec<String>, AssistError> {
    let body = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::from_str::<Vec<String>>(body.trim())
        .map_err(|_| AssistError::MalformedReply(content.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_list_reply() {
        let reply = r#"["123", "Title", "desc", "01:30", "20210615120000,PDT", "p", "u"]"#;
        let fields = parse_list_reply(reply).unwrap();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0], "123");
        assert_eq!(fields[4], "20210615120000,PDT");
    }

    #[test]
    fn strips_code_fences_around_the_list() {
        let reply = "```json\n[\"1\", \"t\", \"d\", \"20200101000000\", \"p\", \"u\"]\n```";
        let fields = parse_list_reply(reply).unwrap();
        assert_eq!(fields.len(), 6);
    }

    #[test]
    fn prose_reply_is_malformed() {
        let reply = "Sure! The metadata fields are id 123 and title My Video.";
        match parse_list_reply(reply) {
            Err(AssistError::MalformedReply(original)) => assert_eq!(original, reply),
            other => panic!("expected malformed reply, got {other:?}"),
        }
    }

    #[test]
    fn non_string_elements_are_malformed() {
        let reply = r#"["123", 42, "desc"]"#;
        assert!(matches!(
            parse_list_reply(reply),
            Err(AssistError::MalformedReply(_))
        ));
    }

    #[test]
    fn escaped_quotes_survive_parsing() {
        let reply = r#"["1", "the \"best\" clip", "d", "20200101000000", "p", "u"]"#;
        let fields = parse_list_reply(reply).unwrap();
        assert_eq!(fields[1], "the \"best\" clip");
    }
}
