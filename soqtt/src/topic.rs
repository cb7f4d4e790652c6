use thiserror::Error;

const INBOUND_SUFFIX: &str = "/in";
const OUTBOUND_SUFFIX: &str = "/out";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic prefix cannot be empty")]
    Empty,
    #[error("topic prefix '{0}' contains a wildcard or NUL character")]
    InvalidCharacter(String),
}

/// The two topics a bridge is attached to.
///
/// Clients publish to `<prefix>/in` to reach the socket and subscribe to
/// `<prefix>/out` to hear from it. The suffixes are fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPair {
    pub inbound: String,
    pub outbound: String,
}

impl TopicPair {
    pub fn from_prefix(prefix: &str) -> Result<Self, TopicError> {
        if prefix.is_empty() {
            return Err(TopicError::Empty);
        }
        // Publish topics may not carry wildcards.
        if prefix.contains(['+', '#', '\0']) {
            return Err(TopicError::InvalidCharacter(prefix.to_string()));
        }

        Ok(Self {
            inbound: format!("{prefix}{INBOUND_SUFFIX}"),
            outbound: format!("{prefix}{OUTBOUND_SUFFIX}"),
        })
    }
}
