use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("version order overflow, reached {0}")]
    OrderOverflow(u64),
}
