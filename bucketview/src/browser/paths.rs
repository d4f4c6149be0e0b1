use thiserror::Error;

pub const DELIMITER: &str = "/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("name must not contain '/'")]
    NestedName,
}

/// Normalizes a browsing prefix: no leading separator, exactly one trailing
/// separator, and the bucket root as the empty string.
pub fn normalize_prefix(path: &str) -> Result<String, PathError> {
    let mut out = String::new();
    for segment in path.split(DELIMITER) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent),
            segment => {
                out.push_str(segment);
                out.push_str(DELIMITER);
            }
        }
    }
    Ok(out)
}

pub fn validate_name(name: &str) -> Result<&str, PathError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    if name.contains(DELIMITER) {
        return Err(PathError::NestedName);
    }
    if name == "." || name == ".." {
        return Err(PathError::UnsupportedComponent);
    }
    Ok(name)
}

/// First directory of a relative upload path ("photos/2024/" → "photos").
pub fn top_level_dir(relative_path: &str) -> Option<&str> {
    relative_path
        .split_once(DELIMITER)
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
}

pub fn join_key(prefix: &str, relative_path: &str, name: &str) -> String {
    format!("{prefix}{relative_path}{name}")
}

pub fn parent_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches(DELIMITER);
    match trimmed.rfind(DELIMITER) {
        Some(index) => trimmed[..=index].to_string(),
        None => String::new(),
    }
}
