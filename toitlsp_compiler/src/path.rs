//! Conversion between host paths and the compiler's path form.
//!
//! The compiler only understands slash-separated absolute paths. On
//! Windows a drive-qualified path is re-rooted below `/`, so `C:\x`
//! becomes `/C:/x`. Paths starting with the virtual-file marker `///`
//! belong to in-memory documents and pass through unchanged.

/// Prefix marking a path as virtual (not backed by the host filesystem).
pub const VIRTUAL_FILE_MARKER: &str = "///";

/// Returns whether `path` designates a virtual file.
pub fn is_virtual(path: &str) -> bool {
    path.starts_with(VIRTUAL_FILE_MARKER)
}

#[cfg(not(windows))]
pub fn to_compiler_path(path: &str) -> String {
    path.to_string()
}

#[cfg(not(windows))]
pub fn from_compiler_path(path: &str) -> String {
    path.to_string()
}

#[cfg(windows)]
pub fn to_compiler_path(path: &str) -> String {
    if is_virtual(path) {
        return path.to_string();
    }
    let slashed = path.replace('\\', "/");
    if slashed.starts_with('/') {
        slashed
    } else {
        format!("/{slashed}")
    }
}

#[cfg(windows)]
pub fn from_compiler_path(path: &str) -> String {
    if is_virtual(path) {
        return path.to_string();
    }
    // Strip the artificial root in front of a drive letter.
    let bytes = path.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        return path[1..].to_string();
    }
    path.to_string()
}

/// Converts every path in `paths` to compiler form.
pub fn to_compiler_paths<I, S>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|p| to_compiler_path(p.as_ref()))
        .collect()
}
