//! Filesystem view over a reproducer archive.
//!
//! The archive is deserialized once at open; afterwards every FS-protocol
//! request the original compiler made is answered from the recorded
//! metadata and file blobs.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::archive::{
    ArchiveMeta, COMPILER_FLAGS_PATH, COMPILER_INPUT_PATH, CWD_PATH, INFO_PATH, META_PATH,
    PACKAGE_CACHE_PATHS_PATH, SDK_PATH_PATH,
};
use crate::fs::{File, FileSystem};

pub struct ReproFileSystem {
    blobs: HashMap<String, Vec<u8>>,
    meta: ArchiveMeta,
    sdk_path: String,
    package_cache_paths: Vec<String>,
    compiler_flags: Vec<String>,
    compiler_input: String,
}

impl ReproFileSystem {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut archive = tar::Archive::new(file);
        let mut blobs: HashMap<String, Vec<u8>> = HashMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            // Names are absolute virtual paths; re-add the root in case
            // the writer stored them relative.
            let name = if name.starts_with('/') {
                name
            } else {
                format!("/{name}")
            };
            let mut content = Vec::new();
            io::Read::read_to_end(&mut entry, &mut content)?;
            blobs.insert(name, content);
        }

        let meta_content = blobs.remove(META_PATH).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "archive has no meta entry")
        })?;
        let meta: ArchiveMeta = serde_json::from_slice(&meta_content)?;

        let take_string = |blobs: &mut HashMap<String, Vec<u8>>, key: &str| {
            String::from_utf8_lossy(&blobs.remove(key).unwrap_or_default()).into_owned()
        };
        let compiler_flags = split_lines(&take_string(&mut blobs, COMPILER_FLAGS_PATH));
        let compiler_input = take_string(&mut blobs, COMPILER_INPUT_PATH);
        let package_cache_paths = split_lines(&take_string(&mut blobs, PACKAGE_CACHE_PATHS_PATH));
        let sdk_path = take_string(&mut blobs, SDK_PATH_PATH);
        blobs.remove(INFO_PATH);
        blobs.remove(CWD_PATH);

        Ok(ReproFileSystem {
            blobs,
            meta,
            sdk_path,
            package_cache_paths,
            compiler_flags,
            compiler_input,
        })
    }

    pub fn sdk_path(&self) -> &str {
        &self.sdk_path
    }

    pub fn compiler_flags(&self) -> &[String] {
        &self.compiler_flags
    }

    pub fn compiler_input(&self) -> &str {
        &self.compiler_input
    }
}

fn split_lines(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split('\n').map(str::to_string).collect()
}

impl FileSystem for ReproFileSystem {
    fn read(&self, path: &str) -> io::Result<File> {
        let Some(meta) = self.meta.files.get(path) else {
            return Err(io::ErrorKind::NotFound.into());
        };
        let mut res = File {
            path: path.to_string(),
            exists: meta.exists,
            is_regular: meta.is_regular,
            is_directory: meta.is_directory,
            content: None,
        };
        if meta.has_content {
            res.content = Some(self.blobs.get(path).cloned().unwrap_or_default());
        }
        Ok(res)
    }

    fn list_directory(&self, path: &str) -> io::Result<Vec<String>> {
        match self.meta.directories.get(path) {
            Some(entries) => Ok(entries.clone()),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn package_cache_paths(&self) -> io::Result<Vec<String>> {
        Ok(self.package_cache_paths.clone())
    }
}
