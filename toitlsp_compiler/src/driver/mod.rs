//! The compiler driver: spawns the compiler in `--lsp` mode, feeds it one
//! request block, serves its filesystem questions and parses its output.
//!
//! Invocation protocol: the first stdin line selects the FS transport
//! (`-2` for in-band), then the request block follows. Compiler stdout is
//! demultiplexed into analyzer output and FS requests; FS replies are
//! written back to the compiler's stdin behind the request block.

pub mod output;

use std::io::BufReader;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{CompletionItem, Location, Position, Url};

use crate::archive::{self, WriteArchiveOptions};
use crate::error::CompilerError;
use crate::file_server::PipeFileServer;
use crate::fs::FileSystem;
use crate::fs_protocol::FsProtocol;
use crate::multiplex;
use crate::uri;

pub use output::AnalyzeResult;

#[derive(Debug, Clone, Default)]
pub struct CompilerSettings {
    pub compiler_path: String,
    pub sdk_path: String,
    pub timeout: Option<Duration>,
    pub root_uri: Option<Url>,
}

/// One driver per query. The driver keeps what the last invocation served
/// so a reproducer can be archived afterwards, crash or not.
pub struct Compiler {
    settings: CompilerSettings,
    fs: Arc<dyn FileSystem>,
    cancel: CancellationToken,
    last_run: Mutex<Option<LastRun>>,
}

struct LastRun {
    protocol: Arc<FsProtocol>,
    compiler_flags: Vec<String>,
    compiler_input: String,
}

/// Options for [`Compiler::archive`].
pub struct ArchiveOptions<'a, W: std::io::Write> {
    pub writer: W,
    pub info: &'a str,
    pub include_sdk: bool,
    /// Replaces the recorded stdin block, e.g. with a JSON file list for
    /// external tooling.
    pub overwrite_compiler_input: Option<String>,
}

impl Compiler {
    pub fn new(fs: Arc<dyn FileSystem>, settings: CompilerSettings) -> Self {
        Compiler {
            settings,
            fs,
            cancel: CancellationToken::new(),
            last_run: Mutex::new(None),
        }
    }

    /// Cancelling the returned token kills the running compiler; the
    /// invocation then reports `Cancelled` instead of a crash.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ties this driver's lifetime to an outer token, e.g. the
    /// connection's shutdown token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn analyze(&self, uris: &[Url]) -> Result<AnalyzeResult, CompilerError> {
        let paths = compiler_paths(uris);
        let input = format!("ANALYZE\n{}\n{}\n", paths.len(), paths.join("\n"));
        let stdout = self.run(input).await?;
        output::parse_analyze(&mut BufReader::new(&stdout[..]))
    }

    pub async fn goto_definition(
        &self,
        uri: &Url,
        position: Position,
    ) -> Result<Vec<Location>, CompilerError> {
        let path = uri::uri_to_compiler_path(uri);
        let input = format!(
            "GOTO DEFINITION\n{path}\n{}\n{}\n",
            position.line, position.character
        );
        let stdout = self.run(input).await?;
        Ok(output::parse_goto_definition(&mut BufReader::new(
            &stdout[..],
        ))?)
    }

    pub async fn complete(
        &self,
        uri: &Url,
        position: Position,
    ) -> Result<Vec<CompletionItem>, CompilerError> {
        let path = uri::uri_to_compiler_path(uri);
        let input = format!(
            "COMPLETE\n{path}\n{}\n{}\n",
            position.line, position.character
        );
        let stdout = self.run(input).await?;
        Ok(output::parse_completions(&mut BufReader::new(&stdout[..]))?)
    }

    pub async fn semantic_tokens(&self, uri: &Url) -> Result<Vec<u32>, CompilerError> {
        let path = uri::uri_to_compiler_path(uri);
        let stdout = self.run(format!("SEMANTIC TOKENS\n{path}\n")).await?;
        Ok(output::parse_semantic_tokens(&mut BufReader::new(
            &stdout[..],
        ))?)
    }

    /// Parses the given files, recording everything the compiler touches.
    /// The output itself is discarded.
    pub async fn parse(&self, uris: &[Url]) -> Result<(), CompilerError> {
        let paths = compiler_paths(uris);
        let input = format!("PARSE\n{}\n{}\n", paths.len(), paths.join("\n"));
        self.run(input).await?;
        Ok(())
    }

    pub async fn snapshot_bundle(&self, uri: &Url) -> Result<Vec<u8>, CompilerError> {
        let path = uri::uri_to_compiler_path(uri);
        let stdout = self.run(format!("SNAPSHOT BUNDLE\n{path}\n")).await?;
        output::parse_snapshot_bundle(&mut BufReader::new(&stdout[..]))
    }

    /// Writes a reproducer of the last invocation.
    pub fn archive<W: std::io::Write>(
        &self,
        options: ArchiveOptions<'_, W>,
    ) -> Result<(), CompilerError> {
        let last_run = self.last_run.lock().unwrap();
        let Some(last_run) = last_run.as_ref() else {
            return Err(CompilerError::protocol("no compiler invocation to archive"));
        };
        let compiler_input = options
            .overwrite_compiler_input
            .unwrap_or_else(|| last_run.compiler_input.clone());
        let cwd_path = self.settings.root_uri.as_ref().map(uri::uri_to_path);
        archive::write_archive(WriteArchiveOptions {
            writer: options.writer,
            compiler_flags: &last_run.compiler_flags,
            compiler_input: &compiler_input,
            info: options.info,
            protocol: &last_run.protocol,
            include_sdk: options.include_sdk,
            cwd_path,
        })?;
        Ok(())
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec!["--lsp".to_string()];
        if let Some(root_uri) = &self.settings.root_uri {
            let root_path = uri::uri_to_path(root_uri);
            let lock_file = Path::new(&root_path).join("package.lock");
            if lock_file.is_file() {
                args.push("--project-root".to_string());
                args.push(uri::uri_to_compiler_path(root_uri));
            }
        }
        args
    }

    /// Runs one compiler invocation and returns the collected analyzer
    /// output.
    async fn run(&self, input: String) -> Result<Vec<u8>, CompilerError> {
        let args = self.build_args();
        let file_server = PipeFileServer::new(self.fs.clone(), self.settings.sdk_path.clone());
        let full_input = format!("{}\n{input}", file_server.config_line());

        *self.last_run.lock().unwrap() = Some(LastRun {
            protocol: file_server.protocol(),
            compiler_flags: args.clone(),
            compiler_input: full_input.clone(),
        });

        tracing::debug!(
            compiler = %self.settings.compiler_path,
            ?args,
            "running compiler"
        );

        let mut child = Command::new(&self.settings.compiler_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        tokio::spawn(forward_stderr(stderr));

        let pipes = multiplex::demultiplex(stdout);
        let inner = async {
            stdin.write_all(full_input.as_bytes()).await?;
            stdin.flush().await?;
            // The file server takes over the stdin pipe for its replies.
            let server_task = file_server.run(pipes.fs_requests, stdin);

            let mut analyzer = pipes.analyzer;
            let mut stdout_bytes = Vec::new();
            analyzer.read_to_end(&mut stdout_bytes).await?;

            let status = child.wait().await?;
            server_task.abort();
            Ok::<_, std::io::Error>((stdout_bytes, status))
        };
        tokio::pin!(inner);

        let deadline = self.settings.timeout;
        let (stdout_bytes, status) = tokio::select! {
            res = &mut inner => res?,
            _ = self.cancel.cancelled() => return Err(CompilerError::Cancelled),
            _ = sleep_or_forever(deadline) => return Err(CompilerError::Timeout),
        };

        if let Some(code) = status.code() {
            // Any regular exit is fine; errors travel in the output.
            tracing::debug!(code, "compiler finished");
            Ok(stdout_bytes)
        } else if self.cancel.is_cancelled() {
            Err(CompilerError::Cancelled)
        } else {
            Err(CompilerError::Crash(exit_signal(&status)))
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "toitc", "{line}");
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    -1
}

fn compiler_paths(uris: &[Url]) -> Vec<String> {
    uris.iter().map(uri::uri_to_compiler_path).collect()
}
