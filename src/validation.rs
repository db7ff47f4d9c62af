//! Input validation shared by the store and the CLI.

use crate::db::KbError;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_CONTENT_LEN: usize = 10_000_000; // 10 MB
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_QUERY_LEN: usize = 1000;

/// Caller-supplied ids must be usable inside a `[[page:<id>]]` marker.
pub fn validate_id(id: &str) -> Result<(), KbError> {
    if id.is_empty() {
        return Err(KbError::Validation("Id must not be empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(KbError::Validation(format!("Id too long (max {} characters)", MAX_ID_LEN)));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(KbError::Validation(
            "Id must contain only ASCII letters, digits, hyphens, and underscores".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_title(title: &str) -> Result<(), KbError> {
    if title.trim().is_empty() {
        return Err(KbError::Validation("Title must not be empty".to_string()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(KbError::Validation(format!("Title too long (max {} characters)", MAX_TITLE_LEN)));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), KbError> {
    if name.trim().is_empty() {
        return Err(KbError::Validation("Name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(KbError::Validation(format!("Name too long (max {} characters)", MAX_NAME_LEN)));
    }
    Ok(())
}

pub fn validate_description(desc: &str) -> Result<(), KbError> {
    if desc.len() > MAX_DESCRIPTION_LEN {
        return Err(KbError::Validation(format!(
            "Description too long (max {} characters)",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

pub fn validate_content(content: &str) -> Result<(), KbError> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(KbError::Validation(format!("Content too long (max {} bytes)", MAX_CONTENT_LEN)));
    }
    Ok(())
}

pub fn validate_query(query: &str) -> Result<(), KbError> {
    if query.len() > MAX_QUERY_LEN {
        return Err(KbError::Validation(format!("Query too long (max {} bytes)", MAX_QUERY_LEN)));
    }
    Ok(())
}

/// Fails when a required reference field is empty.
pub fn require(field: &str, value: &str) -> Result<(), KbError> {
    if value.trim().is_empty() {
        return Err(KbError::Validation(format!("{field} is required")));
    }
    Ok(())
}
