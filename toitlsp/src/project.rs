//! Project-root computation.
//!
//! Documents are grouped by project root. The root of a document is the
//! parent of its enclosing `.packages` directory if there is one, else
//! the nearest ancestor directory with a `package.yaml` or
//! `package.lock`, else the filesystem root.

use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::Url;

use toitlsp_compiler::uri;

pub fn compute_project_uri(document_uri: &Url) -> Url {
    let path = uri::uri_to_path(document_uri);

    // A document below `.packages` belongs to the project that vendored
    // it; no package file check needed.
    let slashed = path.replace('\\', "/");
    let segments: Vec<&str> = slashed.split('/').collect();
    for i in (0..segments.len()).rev() {
        if segments[i] == ".packages" {
            let root = segments[..i].join("/");
            return to_project_uri(&root, document_uri);
        }
    }

    let mut current = PathBuf::from(&path);
    loop {
        if has_package_file(&current) {
            return to_project_uri(&current.to_string_lossy(), document_uri);
        }
        let Some(parent) = current.parent() else {
            return to_project_uri(&current.to_string_lossy(), document_uri);
        };
        if parent == current {
            return to_project_uri(&current.to_string_lossy(), document_uri);
        }
        current = parent.to_path_buf();
    }
}

fn has_package_file(path: &Path) -> bool {
    path.join("package.yaml").exists() || path.join("package.lock").exists()
}

fn to_project_uri(path: &str, fallback: &Url) -> Url {
    uri::path_to_uri(path).unwrap_or_else(|_| fallback.clone())
}

/// Whether the document lives inside a `.packages` directory.
pub fn is_inside_dot_packages(uri: &Url) -> bool {
    let path = uri::uri_to_path(uri).replace('\\', "/");
    path.split('/').any(|segment| segment == ".packages")
}
