//! Failures raised while coordinating locks and elections.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    /// The coordination endpoint could not be parsed or dialed.
    #[error("invalid coordination endpoint {url}: {reason}")]
    Endpoint { url: String, reason: String },

    /// An operation against the coordination backend failed.
    #[error("coordination backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The election runner's heartbeat loop was started twice.
    #[error("election runner already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, StandbyError>;

impl From<StandbyError> for catga_common::CatgaError {
    fn from(err: StandbyError) -> Self {
        match &err {
            StandbyError::AlreadyStarted => {
                catga_common::CatgaError::conflict("election_running", err.to_string())
            }
            // Endpoint and backend trouble are transient from the caller's
            // point of view: another node may still win the election.
            _ => catga_common::CatgaError::unavailable_from("standby", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catga_common::ErrorKind;

    #[test]
    fn backend_errors_map_to_unavailable() {
        let err: catga_common::CatgaError = StandbyError::Endpoint {
            url: "redis://nowhere".to_string(),
            reason: "unreachable".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn double_start_maps_to_conflict() {
        let err: catga_common::CatgaError = StandbyError::AlreadyStarted.into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.code(), "election_running");
    }
}
