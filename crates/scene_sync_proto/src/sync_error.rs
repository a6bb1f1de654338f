use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    Serde(String),
    ChannelUnavailable { topic: String },
    MalformedRecord { reason: String },
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Serde(message) => write!(f, "serde error: {message}"),
            ProtoError::ChannelUnavailable { topic } => {
                write!(f, "channel unavailable for topic {topic}")
            }
            ProtoError::MalformedRecord { reason } => write!(f, "malformed record: {reason}"),
        }
    }
}

impl From<serde_cbor::Error> for ProtoError {
    fn from(error: serde_cbor::Error) -> Self {
        ProtoError::Serde(error.to_string())
    }
}
