//! One-way messages.

use crate::frame::Parameters;
use crate::identifier::Identifier;

/// A fire-and-forget payload sent to one connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    receiver: Identifier,
    parameters: Parameters,
    content: Vec<u8>,
}

impl Message {
    /// Create a message for `receiver`
    #[must_use]
    pub fn new(receiver: Identifier, content: impl Into<Vec<u8>>) -> Self {
        Self {
            receiver,
            parameters: Parameters::new(),
            content: content.into(),
        }
    }

    pub(crate) fn incoming(receiver: Identifier, parameters: Parameters, content: Vec<u8>) -> Self {
        Self {
            receiver,
            parameters,
            content,
        }
    }

    /// Add a parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Receiver; on inbound messages, the connection it arrived on
    #[must_use]
    pub fn receiver(&self) -> &Identifier {
        &self.receiver
    }

    /// Message parameters
    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Look up one parameter
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Raw content
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Take the raw content
    #[must_use]
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }
}
