use pkg_lease::LeaseError;

pub type Result<T> = std::result::Result<T, LeadershipError>;

#[derive(Debug, thiserror::Error)]
pub enum LeadershipError {
    /// Another unit is leader.
    #[error("leadership claim denied")]
    ClaimDenied,

    #[error("{unit:?} is not leader of {application:?}")]
    NotLeader { unit: String, application: String },

    #[error("not valid: {0}")]
    NotValid(String),

    #[error("waiting for leadership cancelled by client")]
    WaitCancelled,

    #[error("leadership manager stopped")]
    Stopped,

    #[error(transparent)]
    Lease(LeaseError),
}

impl From<LeaseError> for LeadershipError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::ClaimDenied => LeadershipError::ClaimDenied,
            LeaseError::NotValid(reason) => LeadershipError::NotValid(reason),
            LeaseError::WaitCancelled => LeadershipError::WaitCancelled,
            LeaseError::Stopped => LeadershipError::Stopped,
            other => LeadershipError::Lease(other),
        }
    }
}
