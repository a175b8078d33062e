use thiserror::Error;

/// Task-level outcomes shared by the ingress use-case and the distributor.
/// `NotFound` and `Expired` mark a queue message as unactionable (ack and
/// drop); `Failed` and `NotReady` drive the download endpoint's status
/// mapping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task not found")]
    NotFound,

    #[error("task expired")]
    Expired,

    #[error("task failed")]
    Failed,

    #[error("result is not ready yet")]
    NotReady,
}
