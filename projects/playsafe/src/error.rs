// Fatal run failures surfaced to the user
//
// Per-frame and per-player problems never end up here: they are absorbed by
// the pipeline. Anything tagged with a RunFailure aborts the whole run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunFailure {
    /// The uploaded video could not be opened or decoded.
    #[error("could not read input video: {0}")]
    UnreadableInput(String),

    /// The detector or pose model could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The external encoder could not be started or exited with an error.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The run was stopped before the last frame.
    #[error("processing stopped")]
    Stopped,
}

/// Render the single message shown in the UI for a failed run.
pub fn user_message(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(failure) = cause.downcast_ref::<RunFailure>() {
            return failure.to_string();
        }
    }
    format!("processing failed: {}", err.root_cause())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_user_message_finds_failure_in_chain() {
        let err: anyhow::Error = RunFailure::Encoding("ffmpeg not found".to_string()).into();
        let err = err.context("finishing output video");
        assert_eq!(user_message(&err), "encoding failed: ffmpeg not found");
    }

    #[test]
    fn test_user_message_generic_fallback() {
        let res: anyhow::Result<()> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        let err = res.context("writing stats").unwrap_err();
        assert_eq!(user_message(&err), "processing failed: disk full");
    }
}
