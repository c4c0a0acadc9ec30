use std::path::{Component, Path, PathBuf};

use crate::errors::{AppError, Result};

/// Normalizes a client supplied path into a relative path that cannot escape
/// the directory it is joined onto. A leading `/` is accepted and dropped.
pub fn sanitize_relative(raw: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();

    for component in Path::new(raw.trim()).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(AppError::Validation(format!("path may not contain '..': {}", raw)))
            }
            Component::Prefix(_) => {
                return Err(AppError::Validation(format!("unsupported path prefix: {}", raw)))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(AppError::Validation("path must not be empty".to_string()));
    }

    Ok(clean)
}

/// Usernames become directory names under `home/` and `trash/`.
pub fn validate_username(username: &str) -> Result<()> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username != "."
        && username != ".."
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid username: {:?}", username)))
    }
}

/// `/`-separated rendering used in events and API responses.
pub fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
