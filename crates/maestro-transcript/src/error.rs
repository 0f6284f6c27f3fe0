use thiserror::Error;

/// Reasons an incoming bus event could not be decoded.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("event has no type")]
    MissingType,

    #[error("{event_type} event has no properties")]
    MissingProperties { event_type: String },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
