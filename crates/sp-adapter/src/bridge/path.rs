//! Lexical path normalization for SFTP paths

/// Resolve `path` against `base` without touching the target.
///
/// Relative paths are joined onto `base`; `.` and empty components are
/// dropped and `..` pops a component (never above `/`). The result is
/// always absolute and never ends in `/` unless it is the root.
pub fn normalize(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    format!("/{}", parts.join("/"))
}
