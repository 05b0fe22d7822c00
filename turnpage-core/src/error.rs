use thiserror::Error;

/// Failures reported by a render engine or its rendition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("document failed to load: {0}")]
    Init(String),
    #[error("reached the {0} of the document")]
    Boundary(&'static str),
    #[error("unknown location reference `{0}`")]
    InvalidReference(String),
    #[error("location index error: {0}")]
    Locations(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote store answered with status {0}")]
    Status(u16),
    #[error("failed to decode remote payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeechError {
    #[error("speech engine unavailable")]
    Unavailable,
    #[error("speech failed: {0}")]
    Failed(String),
}

/// Session-level error surface. Only `EngineInit` is fatal; every other
/// variant is reported through the event log while the session keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReaderError {
    #[error("failed to initialise document: {0}")]
    EngineInit(#[source] EngineError),
    #[error("navigation rejected: {0}")]
    NavigationRejected(#[source] EngineError),
    #[error("remote persistence failed: {0}")]
    TransientNetwork(#[source] RemoteError),
    #[error("read-aloud stopped: {0}")]
    Speech(#[source] SpeechError),
    #[error("location index unavailable: {0}")]
    IndexGeneration(String),
    #[error("local cache error: {0}")]
    Cache(String),
    #[error("no document session is active")]
    NoActiveSession,
}

impl ReaderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReaderError::EngineInit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_engine_init_is_fatal() {
        assert!(ReaderError::EngineInit(EngineError::Init("bad zip".into())).is_fatal());
        assert!(!ReaderError::NavigationRejected(EngineError::Boundary("end")).is_fatal());
        assert!(!ReaderError::TransientNetwork(RemoteError::Status(502)).is_fatal());
    }

    #[test]
    fn messages_include_source() {
        let err = ReaderError::NavigationRejected(EngineError::Boundary("end"));
        assert_eq!(
            err.to_string(),
            "navigation rejected: reached the end of the document"
        );
    }
}
