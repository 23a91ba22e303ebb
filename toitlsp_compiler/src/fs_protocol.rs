//! The line-oriented filesystem protocol served to the compiler.
//!
//! Commands arrive newline-terminated on the FS channel; every answer is
//! written back newline-terminated (plus raw content bytes for `INFO`).
//! Each answer is cached, which both dedupes repeat requests and records
//! exactly what the compiler saw. That record is the input to reproducer
//! archives.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::fs::{File, FileSystem};
use crate::path;

#[derive(Default)]
struct Served {
    sdk_path: Option<String>,
    package_cache_paths: Option<Vec<String>>,
}

pub struct FsProtocol {
    fs: Arc<dyn FileSystem>,
    sdk_path: String,
    files: DashMap<String, File>,
    directories: DashMap<String, Vec<String>>,
    served: Mutex<Served>,
}

impl FsProtocol {
    pub fn new(fs: Arc<dyn FileSystem>, sdk_path: impl Into<String>) -> Self {
        FsProtocol {
            fs,
            sdk_path: sdk_path.into(),
            files: DashMap::new(),
            directories: DashMap::new(),
            served: Mutex::new(Served::default()),
        }
    }

    /// Serves one connection until EOF, a protocol violation, or an I/O
    /// error. Replies are flushed after every command.
    pub async fn handle_conn<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("read from compiler fs channel failed: {e}");
                    return;
                }
            }
            let command = line.trim_end_matches('\n');
            let res = match command {
                "SDK PATH" => self.handle_sdk_path(&mut writer).await,
                "PACKAGE CACHE PATHS" => self.handle_package_cache_paths(&mut writer).await,
                "LIST DIRECTORY" => self.handle_list_directory(&mut reader, &mut writer).await,
                "INFO" => self.handle_info(&mut reader, &mut writer).await,
                other => {
                    tracing::error!("unhandled compiler fs command: {other}");
                    return;
                }
            };
            match res {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::error!("compiler fs protocol failed: {e}");
                    return;
                }
            }
            if let Err(e) = writer.flush().await {
                tracing::error!("write to compiler failed: {e}");
                return;
            }
        }
    }

    async fn handle_sdk_path<W>(&self, writer: &mut BufWriter<W>) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        {
            let mut served = self.served.lock().unwrap();
            if served.sdk_path.is_none() {
                served.sdk_path = Some(self.sdk_path.clone());
            }
        }
        let reply = format!("{}\n", path::to_compiler_path(&self.sdk_path));
        writer.write_all(reply.as_bytes()).await?;
        Ok(true)
    }

    async fn handle_package_cache_paths<W>(&self, writer: &mut BufWriter<W>) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let paths = {
            let cached = self.served.lock().unwrap().package_cache_paths.clone();
            match cached {
                Some(paths) => paths,
                None => {
                    let paths = match self.fs.package_cache_paths() {
                        Ok(paths) => paths,
                        Err(e) => {
                            tracing::error!("failed to get package cache paths: {e}");
                            Vec::new()
                        }
                    };
                    self.served.lock().unwrap().package_cache_paths = Some(paths.clone());
                    paths
                }
            }
        };
        let mut reply = format!("{}\n", paths.len());
        for p in &paths {
            reply.push_str(&path::to_compiler_path(p));
            reply.push('\n');
        }
        writer.write_all(reply.as_bytes()).await?;
        Ok(true)
    }

    async fn handle_list_directory<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> io::Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(raw) = read_path_line(reader).await? else {
            return Ok(false);
        };
        let host_path = path::from_compiler_path(&raw);
        let entries = match self.directory(&host_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("failed to list directory entries: {e}");
                return Ok(false);
            }
        };
        let mut reply = format!("{}\n", entries.len());
        for e in &entries {
            reply.push_str(&path::to_compiler_path(e));
            reply.push('\n');
        }
        writer.write_all(reply.as_bytes()).await?;
        Ok(true)
    }

    async fn handle_info<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> io::Result<bool>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(raw) = read_path_line(reader).await? else {
            return Ok(false);
        };
        let host_path = path::from_compiler_path(&raw);
        let file = match self.file(&host_path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("failed to get file: {e}");
                return Ok(false);
            }
        };
        let content_length: i64 = if file.exists {
            file.content.as_ref().map_or(0, |c| c.len() as i64)
        } else {
            -1
        };
        let header = format!(
            "{}\n{}\n{}\n{}\n",
            file.exists, file.is_regular, file.is_directory, content_length
        );
        writer.write_all(header.as_bytes()).await?;
        if let Some(content) = &file.content {
            writer.write_all(content).await?;
        }
        Ok(true)
    }

    fn file(&self, path: &str) -> io::Result<File> {
        if let Some(file) = self.files.get(path) {
            return Ok(file.clone());
        }
        let file = self.fs.read(path)?;
        self.files.insert(path.to_string(), file.clone());
        Ok(file)
    }

    fn directory(&self, path: &str) -> io::Result<Vec<String>> {
        if let Some(entries) = self.directories.get(path) {
            return Ok(entries.clone());
        }
        let entries = self.fs.list_directory(path)?;
        self.directories.insert(path.to_string(), entries.clone());
        Ok(entries)
    }

    /// Everything the compiler asked about, keyed by host path.
    pub fn served_files(&self) -> HashMap<String, File> {
        self.files
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn served_directories(&self) -> HashMap<String, Vec<String>> {
        self.directories
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn served_sdk_path(&self) -> Option<String> {
        self.served.lock().unwrap().sdk_path.clone()
    }

    pub fn served_package_cache_paths(&self) -> Vec<String> {
        self.served
            .lock()
            .unwrap()
            .package_cache_paths
            .clone()
            .unwrap_or_default()
    }
}

async fn read_path_line<R>(reader: &mut BufReader<R>) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches('\n').to_string()))
}
