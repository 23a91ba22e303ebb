//! Reproducer archives.
//!
//! A reproducer is a single GNU tar capturing everything one compiler
//! invocation saw: the filesystem answers, the SDK path, package cache
//! paths, working directory, compiler flags and the exact stdin block.
//! Replaying it against [`crate::repro::ReproFileSystem`] reproduces the
//! invocation offline.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};

use crate::fs_protocol::FsProtocol;
use crate::path;

pub const META_PATH: &str = "/<meta>";
pub const SDK_PATH_PATH: &str = "/<sdk-path>";
pub const PACKAGE_CACHE_PATHS_PATH: &str = "/<package-cache-paths>";
pub const CWD_PATH: &str = "/<cwd>";
pub const COMPILER_FLAGS_PATH: &str = "/<compiler-flags>";
pub const COMPILER_INPUT_PATH: &str = "/<compiler-input>";
pub const INFO_PATH: &str = "/<info>";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub files: HashMap<String, ArchiveFile>,
    pub directories: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub exists: bool,
    pub is_regular: bool,
    pub is_directory: bool,
    pub has_content: bool,
}

pub struct WriteArchiveOptions<'a, W: io::Write> {
    pub writer: W,
    pub compiler_flags: &'a [String],
    pub compiler_input: &'a str,
    pub info: &'a str,
    pub protocol: &'a FsProtocol,
    pub include_sdk: bool,
    pub cwd_path: Option<String>,
}

/// Writes a tar with every file the compiler was served.
pub fn write_archive<W: io::Write>(options: WriteArchiveOptions<'_, W>) -> io::Result<()> {
    let mut meta = ArchiveMeta::default();

    let mut sdk_path = options.protocol.served_sdk_path().unwrap_or_default();
    if !sdk_path.ends_with(std::path::MAIN_SEPARATOR) {
        sdk_path.push(std::path::MAIN_SEPARATOR);
    }
    let sdk_path = path::to_compiler_path(&sdk_path);
    let has_sdk_path = options.protocol.served_sdk_path().is_some();

    let package_paths = path::to_compiler_paths(options.protocol.served_package_cache_paths());

    let mut builder = tar::Builder::new(options.writer);

    for (host_path, file) in options.protocol.served_files() {
        let archive_path = path::to_compiler_path(&host_path);
        meta.files.insert(
            archive_path.clone(),
            ArchiveFile {
                exists: file.exists,
                is_regular: file.is_regular,
                is_directory: file.is_directory,
                has_content: file.content.is_some(),
            },
        );
        if let Some(content) = &file.content {
            if !options.include_sdk && has_sdk_path && archive_path.starts_with(&sdk_path) {
                continue;
            }
            add_file(&mut builder, &archive_path, content)?;
        }
    }

    for (host_path, entries) in options.protocol.served_directories() {
        meta.directories
            .insert(path::to_compiler_path(&host_path), entries);
    }

    let meta_content = serde_json::to_vec(&meta)?;
    let cwd = options
        .cwd_path
        .as_deref()
        .map(path::to_compiler_path)
        .unwrap_or_default();

    add_file(&mut builder, COMPILER_INPUT_PATH, options.compiler_input.as_bytes())?;
    add_file(
        &mut builder,
        COMPILER_FLAGS_PATH,
        options.compiler_flags.join("\n").as_bytes(),
    )?;
    add_file(&mut builder, INFO_PATH, options.info.as_bytes())?;
    add_file(&mut builder, META_PATH, &meta_content)?;
    add_file(&mut builder, SDK_PATH_PATH, sdk_path.as_bytes())?;
    add_file(
        &mut builder,
        PACKAGE_CACHE_PATHS_PATH,
        package_paths.join("\n").as_bytes(),
    )?;
    add_file(&mut builder, CWD_PATH, cwd.as_bytes())?;

    builder.into_inner()?.flush()
}

fn add_file<W: io::Write>(
    builder: &mut tar::Builder<W>,
    archive_path: &str,
    content: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o664);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, archive_path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{File, FileSystem};
    use std::sync::Arc;

    struct StaticFs;

    impl FileSystem for StaticFs {
        fn read(&self, path: &str) -> io::Result<File> {
            Ok(File {
                path: path.to_string(),
                exists: true,
                is_regular: true,
                is_directory: false,
                content: Some(format!("content of {path}").into_bytes()),
            })
        }
        fn list_directory(&self, _path: &str) -> io::Result<Vec<String>> {
            Ok(vec!["entry.toit".to_string()])
        }
        fn package_cache_paths(&self) -> io::Result<Vec<String>> {
            Ok(vec!["/pkg/cache".to_string()])
        }
    }

    /// Serves a couple of requests so the protocol has something to record.
    async fn recorded_protocol() -> Arc<FsProtocol> {
        let protocol = Arc::new(FsProtocol::new(Arc::new(StaticFs), "/sdk"));
        let input = b"SDK PATH\nPACKAGE CACHE PATHS\nINFO\n/sdk/core.toit\nINFO\n/proj/main.toit\nLIST DIRECTORY\n/proj\n";
        let mut sink = Vec::new();
        protocol
            .handle_conn(std::io::Cursor::new(input.to_vec()), &mut sink)
            .await;
        protocol
    }

    fn entries(data: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(data);
        let mut res = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let path = if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            };
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
            res.insert(path, content);
        }
        res
    }

    #[tokio::test]
    async fn writes_served_state_and_well_known_entries() {
        let protocol = recorded_protocol().await;
        let mut buffer = Vec::new();
        write_archive(WriteArchiveOptions {
            writer: &mut buffer,
            compiler_flags: &["--lsp".to_string()],
            compiler_input: "-2\nANALYZE\n1\n/proj/main.toit\n",
            info: "test archive",
            protocol: &protocol,
            include_sdk: true,
            cwd_path: Some("/proj".to_string()),
        })
        .unwrap();

        let entries = entries(&buffer);
        assert_eq!(entries[SDK_PATH_PATH], b"/sdk/");
        assert_eq!(entries[COMPILER_FLAGS_PATH], b"--lsp");
        assert_eq!(entries[INFO_PATH], b"test archive");
        assert_eq!(entries[CWD_PATH], b"/proj");
        assert!(entries.contains_key("/proj/main.toit"));

        let meta: ArchiveMeta = serde_json::from_slice(&entries[META_PATH]).unwrap();
        assert!(meta.files["/proj/main.toit"].has_content);
        assert_eq!(meta.directories["/proj"], vec!["entry.toit"]);
    }

    #[tokio::test]
    async fn include_sdk_false_omits_sdk_blobs_but_keeps_meta() {
        let protocol = recorded_protocol().await;
        let mut buffer = Vec::new();
        write_archive(WriteArchiveOptions {
            writer: &mut buffer,
            compiler_flags: &[],
            compiler_input: "",
            info: "",
            protocol: &protocol,
            include_sdk: false,
            cwd_path: None,
        })
        .unwrap();

        let entries = entries(&buffer);
        assert!(!entries.contains_key("/sdk/core.toit"));
        assert!(entries.contains_key("/proj/main.toit"));
        let meta: ArchiveMeta = serde_json::from_slice(&entries[META_PATH]).unwrap();
        assert!(meta.files.contains_key("/sdk/core.toit"));
    }
}
