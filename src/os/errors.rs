use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Requested capacity is zero")]
    InvalidCapacity,

    #[error("OS refused the mapping: {0}")]
    ResourceUnavailable(#[from] std::io::Error),
}
