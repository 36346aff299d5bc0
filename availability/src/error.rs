use thiserror::Error;

pub type AvailabilityResult<T> = Result<T, AvailabilityError>;

#[derive(Debug, Error)]
pub enum AvailabilityError {
    #[error("watch sink closed")]
    SinkClosed,
}
