//! Node names and ids.

use crate::error::{NodeError, NodeResult};

const MAX_LEN: usize = 64;

/// Trim, collapse internal whitespace, and check the allowed character set.
pub fn sanitize_name(raw: &str) -> NodeResult<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(NodeError::Validation("node name must not be empty".into()));
    }
    if name.chars().count() > MAX_LEN {
        return Err(NodeError::Validation(format!(
            "node name longer than {MAX_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.')))
    {
        return Err(NodeError::Validation(format!(
            "node name contains invalid character {bad:?}"
        )));
    }
    Ok(name)
}

/// Explicit ids are `[a-z0-9-]{1,64}` and may not start with `-`.
pub fn validate_id(id: &str) -> NodeResult<()> {
    if id.is_empty() || id.len() > MAX_LEN {
        return Err(NodeError::Validation(format!(
            "node id must be 1-{MAX_LEN} characters"
        )));
    }
    if id.starts_with('-') {
        return Err(NodeError::Validation("node id must not start with '-'".into()));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(NodeError::Validation(format!(
            "node id '{id}' may only contain a-z, 0-9 and '-'"
        )));
    }
    Ok(())
}
