use std::io;

/// Errors from sandbox operations.
///
/// Backends map their internal failures into these variants. `NotFound`
/// is never raised on the read path — `get_sandbox` returns `Ok(None)` —
/// but lifecycle calls on a missing sandbox do raise it.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("incompatible composition: {0}")]
    IncompatibleComposition(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_id() {
        let err = SandboxError::NotFound("sbx-123".into());
        assert_eq!(err.to_string(), "sandbox not found: sbx-123");
    }

    #[test]
    fn composition_error_displays_reason() {
        let err = SandboxError::IncompatibleComposition(
            "addon 'jupyter' requires flavor python or polyglot".into(),
        );
        assert!(err.to_string().starts_with("incompatible composition"));
    }

    #[test]
    fn backend_error_carries_message() {
        let err = SandboxError::Backend("quota exceeded (code 429)".into());
        assert_eq!(err.to_string(), "backend error: quota exceeded (code 429)");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "socket missing");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::Io(_)));
        assert!(err.to_string().contains("socket missing"));
    }

    #[test]
    fn error_is_send_and_sync() {
        // SandboxError must be Send + Sync for use in async trait returns
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
