//! Filesystem view over open editor buffers.
//!
//! Stacked in front of the local filesystem so the compiler sees dirty
//! buffer contents instead of what is on disk. Directory listings and
//! package cache paths are never answered from buffers.

use std::io;
use std::sync::Arc;

use toitlsp_compiler::fs::{File, FileSystem};
use toitlsp_compiler::uri;

use crate::documents::Documents;

pub struct BufferFileSystem {
    documents: Arc<Documents>,
}

impl BufferFileSystem {
    pub fn new(documents: Arc<Documents>) -> Self {
        BufferFileSystem { documents }
    }
}

impl FileSystem for BufferFileSystem {
    fn read(&self, path: &str) -> io::Result<File> {
        let Ok(uri) = uri::path_to_uri(path) else {
            return Err(io::ErrorKind::NotFound.into());
        };
        match self.documents.content(&uri) {
            Some(content) => Ok(File {
                path: path.to_string(),
                exists: true,
                is_regular: true,
                is_directory: false,
                content: Some(content.into_bytes()),
            }),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn list_directory(&self, _path: &str) -> io::Result<Vec<String>> {
        Err(io::ErrorKind::NotFound.into())
    }

    fn package_cache_paths(&self) -> io::Result<Vec<String>> {
        Err(io::ErrorKind::NotFound.into())
    }
}
