use thiserror::Error;

/// Error taxonomy for the control plane.
///
/// Every failure that crosses a module boundary is one of these kinds;
/// the dispatcher decides per kind whether a cycle is failed, retried or
/// silently degraded.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("required data unavailable: {0}")]
    DataUnavailable(String),

    #[error("invalid horizon: {0}")]
    HorizonInvalid(String),

    #[error("thermal model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("thermal model learning failed: {0}")]
    ModelLearnFailed(String),

    #[error("planning problem is infeasible")]
    SolverInfeasible,

    #[error("planning problem is unbounded")]
    SolverUnbounded,

    #[error("solver failure: {0}")]
    SolverError(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("transient bus failure: {0}")]
    BusTransient(String),
}

impl ControlError {
    /// Stable machine-readable tag, used in log fields and bus acks.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::ConfigInvalid(_) => "CONFIG_INVALID",
            ControlError::DataUnavailable(_) => "DATA_UNAVAILABLE",
            ControlError::HorizonInvalid(_) => "HORIZON_INVALID",
            ControlError::ModelLoadFailed(_) => "MODEL_LOAD_FAILED",
            ControlError::ModelLearnFailed(_) => "MODEL_LEARN_FAILED",
            ControlError::SolverInfeasible => "SOLVER_INFEASIBLE",
            ControlError::SolverUnbounded => "SOLVER_UNBOUNDED",
            ControlError::SolverError(_) => "SOLVER_ERROR",
            ControlError::WriteFailed(_) => "WRITE_FAILED",
            ControlError::BusTransient(_) => "BUS_TRANSIENT",
        }
    }

    /// Whether the failure leaves previously published state in place.
    ///
    /// Solver and data failures never roll back the prior schedule; the
    /// last accepted dispatch keeps running until a later cycle succeeds.
    pub fn preserves_prior_schedule(&self) -> bool {
        !matches!(self, ControlError::ConfigInvalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_tags() {
        assert_eq!(ControlError::SolverInfeasible.kind(), "SOLVER_INFEASIBLE");
        assert_eq!(
            ControlError::DataUnavailable("x".into()).kind(),
            "DATA_UNAVAILABLE"
        );
        assert_eq!(
            ControlError::HorizonInvalid("x".into()).kind(),
            "HORIZON_INVALID"
        );
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(!ControlError::ConfigInvalid("x".into()).preserves_prior_schedule());
        assert!(ControlError::SolverInfeasible.preserves_prior_schedule());
        assert!(ControlError::WriteFailed("x".into()).preserves_prior_schedule());
    }
}
