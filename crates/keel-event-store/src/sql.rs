//! Conversions between domain values and `PostgreSQL` column types.

use keel_core::error::DomainError;

pub(crate) fn db_error(error: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(error.to_string())
}

/// `PostgreSQL` has no unsigned integers; versions and positions are `BIGINT`.
pub(crate) fn to_db(value: u64) -> Result<i64, DomainError> {
    i64::try_from(value)
        .map_err(|_| DomainError::Validation(format!("{value} exceeds the BIGINT range")))
}

pub(crate) fn from_db(value: i64) -> Result<u64, DomainError> {
    u64::try_from(value)
        .map_err(|_| DomainError::Infrastructure(format!("negative value {value} in database")))
}

pub(crate) fn to_db_u32(value: u32) -> Result<i32, DomainError> {
    i32::try_from(value)
        .map_err(|_| DomainError::Validation(format!("{value} exceeds the INTEGER range")))
}

pub(crate) fn from_db_u32(value: i32) -> Result<u32, DomainError> {
    u32::try_from(value)
        .map_err(|_| DomainError::Infrastructure(format!("negative value {value} in database")))
}

pub(crate) fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
