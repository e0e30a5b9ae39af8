//! Subdomain label validation shared by both endpoints.
//!
//! A registrable subdomain is a single DNS label: lowercase alphanumerics
//! with single interior hyphens, at most 63 characters.

/// Why a subdomain was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubdomainError {
    #[error("subdomain is empty")]
    Empty,

    #[error("subdomain exceeds 63 characters")]
    TooLong,

    #[error("subdomain contains invalid character {0:?}")]
    InvalidChar(char),

    #[error("subdomain must start and end with a letter or digit")]
    BadBoundary,

    #[error("subdomain contains consecutive hyphens")]
    DoubleHyphen,
}

/// Lowercase and validate a subdomain label, returning the normalized form.
pub fn normalize(raw: &str) -> Result<String, SubdomainError> {
    let label = raw.trim().to_ascii_lowercase();
    if label.is_empty() {
        return Err(SubdomainError::Empty);
    }
    if label.len() > 63 {
        return Err(SubdomainError::TooLong);
    }
    let mut prev_hyphen = false;
    for (i, c) in label.chars().enumerate() {
        match c {
            'a'..='z' | '0'..='9' => prev_hyphen = false,
            '-' => {
                if i == 0 {
                    return Err(SubdomainError::BadBoundary);
                }
                if prev_hyphen {
                    return Err(SubdomainError::DoubleHyphen);
                }
                prev_hyphen = true;
            }
            other => return Err(SubdomainError::InvalidChar(other)),
        }
    }
    if label.ends_with('-') {
        return Err(SubdomainError::BadBoundary);
    }
    Ok(label)
}
