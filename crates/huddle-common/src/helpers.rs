//! Common helper functions for Huddle.

use std::str::FromStr;

/// Lowest student identifier accepted when joining a group.
pub const STUDENT_ID_MIN: u64 = 816_000_000;
/// Highest student identifier accepted when joining a group.
pub const STUDENT_ID_MAX: u64 = 816_999_999;

/// Performs a constant-time comparison of two strings.
/// This is used to prevent timing attacks when comparing security tokens.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a_bytes.iter().zip(b_bytes.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Whether `identifier` is a student ID in the accepted numeric range.
pub fn is_valid_student_id(identifier: &str) -> bool {
    let trimmed = identifier.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    trimmed
        .parse::<u64>()
        .map(|id| (STUDENT_ID_MIN..=STUDENT_ID_MAX).contains(&id))
        .unwrap_or(false)
}

/// Read and parse a value from the environment.
///
/// Returns `Ok(None)` when the variable is unset and an error message naming
/// the variable when it is set but does not parse.
pub fn env_parse<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("invalid {name}='{raw}': {e}")),
        Err(_) => Ok(None),
    }
}
