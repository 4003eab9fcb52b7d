use std::fmt;

use kfn_api::StoreError;
use kfn_render::OwnershipError;

/// Control-plane operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Update,
    UpdateStatus,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Get => "get",
            Op::Create => "create",
            Op::Update => "update",
            Op::UpdateStatus => "update status of",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store failure other than not-found. Retried by the next trigger.
    #[error("{op} {target} failed: {source}")]
    Store {
        target: &'static str,
        op: Op,
        #[source]
        source: StoreError,
    },

    /// The trigger's deadline expired during a call.
    #[error("{op} {target}: deadline exceeded")]
    DeadlineExceeded { target: &'static str, op: Op },

    /// Owner reference could not be set; needs operator attention.
    #[error("ownership: {0}")]
    Ownership(#[from] OwnershipError),
}

impl Error {
    /// Whether retrying the pass as-is can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::Ownership(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_target_and_operation() {
        let e = Error::Store { target: "ConfigMap", op: Op::Create, source: StoreError::Unavailable("etcd".into()) };
        assert_eq!(e.to_string(), "create ConfigMap failed: unavailable: etcd");
        assert!(e.is_transient());

        let e = Error::DeadlineExceeded { target: "Function", op: Op::UpdateStatus };
        assert_eq!(e.to_string(), "update status of Function: deadline exceeded");
        assert!(e.is_transient());

        let e = Error::from(OwnershipError::MissingOwnerField("uid"));
        assert!(!e.is_transient());
    }
}
