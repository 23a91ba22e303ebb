//! Virtual filesystems served to the compiler.
//!
//! Sources are stacked: open editor buffers shadow the local disk, and a
//! reproducer archive can stand in for both. A source signals "not mine"
//! with `io::ErrorKind::NotFound`; [`MultiFileSystem`] consults sources in
//! order and returns the first claimed answer.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// What the compiler learns about a single path.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub path: String,
    pub exists: bool,
    pub is_regular: bool,
    pub is_directory: bool,
    pub content: Option<Vec<u8>>,
}

impl File {
    pub fn not_found(path: &str) -> Self {
        File {
            path: path.to_string(),
            ..File::default()
        }
    }
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &str) -> io::Result<File>;
    fn list_directory(&self, path: &str) -> io::Result<Vec<String>>;
    fn package_cache_paths(&self) -> io::Result<Vec<String>>;
}

fn not_found() -> io::Error {
    io::ErrorKind::NotFound.into()
}

/// The host filesystem. Package cache paths come from
/// `TOIT_PACKAGE_CACHE_PATHS` or default to `$HOME/.cache/toit/tpkg`.
pub struct LocalFileSystem {
    package_cache_paths: OnceLock<Vec<String>>,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        LocalFileSystem {
            package_cache_paths: OnceLock::new(),
        }
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &str) -> io::Result<File> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A missing file is an answer, not an error.
                return Ok(File::not_found(path));
            }
            Err(e) => return Err(e),
        };
        let mut res = File {
            path: path.to_string(),
            exists: true,
            is_regular: meta.is_file(),
            is_directory: meta.is_dir(),
            content: None,
        };
        if res.is_regular {
            res.content = Some(std::fs::read(path)?);
        }
        Ok(res)
    }

    fn list_directory(&self, path: &str) -> io::Result<Vec<String>> {
        let mut res = Vec::new();
        for entry in std::fs::read_dir(path)? {
            res.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(res)
    }

    fn package_cache_paths(&self) -> io::Result<Vec<String>> {
        if let Some(paths) = self.package_cache_paths.get() {
            return Ok(paths.clone());
        }
        let paths = default_package_cache_paths()?;
        Ok(self.package_cache_paths.get_or_init(|| paths).clone())
    }
}

fn default_package_cache_paths() -> io::Result<Vec<String>> {
    if let Some(env_paths) = env::var_os("TOIT_PACKAGE_CACHE_PATHS") {
        let mut res = Vec::new();
        for p in env::split_paths(&env_paths) {
            let abs = if p.is_absolute() {
                p
            } else {
                env::current_dir()?.join(p)
            };
            res.push(abs.to_string_lossy().into_owned());
        }
        return Ok(res);
    }
    let home = home_dir().ok_or_else(|| {
        io::Error::other("cannot determine the home directory for the package cache")
    })?;
    let cache: PathBuf = home.join(".cache").join("toit").join("tpkg");
    Ok(vec![cache.to_string_lossy().into_owned()])
}

fn home_dir() -> Option<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from)
}

/// Consults sources in declared order; the first non-`NotFound` answer wins.
pub struct MultiFileSystem {
    sources: Vec<Box<dyn FileSystem>>,
}

impl MultiFileSystem {
    pub fn new(sources: Vec<Box<dyn FileSystem>>) -> Self {
        MultiFileSystem { sources }
    }
}

impl FileSystem for MultiFileSystem {
    fn read(&self, path: &str) -> io::Result<File> {
        for source in &self.sources {
            match source.read(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                res => return res,
            }
        }
        Err(not_found())
    }

    fn list_directory(&self, path: &str) -> io::Result<Vec<String>> {
        for source in &self.sources {
            match source.list_directory(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                res => return res,
            }
        }
        Err(not_found())
    }

    fn package_cache_paths(&self) -> io::Result<Vec<String>> {
        for source in &self.sources {
            match source.package_cache_paths() {
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                res => return res,
            }
        }
        Err(not_found())
    }
}

/// Helper for [`Path`]-based callers.
pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
