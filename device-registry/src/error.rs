use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub(crate) fn require_id(value: &str, what: &'static str) -> Result<(), RegistrationError> {
    if value.trim().is_empty() {
        return Err(RegistrationError::InvalidArgument(what));
    }
    Ok(())
}
