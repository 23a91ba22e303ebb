//! `toitlsp` binary: the LSP server plus the analysis and reproducer
//! tooling around the same compiler driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tower_lsp::lsp_types::{DiagnosticSeverity, Url};

use toitlsp_compiler::driver::ArchiveOptions;
use toitlsp_compiler::file_server::TcpFileServer;
use toitlsp_compiler::fs::LocalFileSystem;
use toitlsp_compiler::repro::ReproFileSystem;
use toitlsp_compiler::{path, uri, Compiler, CompilerSettings};

use toitlsp::ServerSettings;

#[derive(Parser, Debug)]
#[command(name = "toitlsp")]
#[command(about = "Language server and compiler driver for the Toit language")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the language server over stdio.
    Serve {
        /// Path to the Toit compiler binary.
        #[arg(long)]
        toitc: Option<String>,
        /// Path to the SDK; defaults to the compiler's directory.
        #[arg(long)]
        sdk_path: Option<String>,
        #[arg(long)]
        verbose: bool,
        /// Per-invocation compiler timeout; 0 disables it.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Analyze files and print their diagnostics. Exits with 1 when any
    /// error-severity diagnostic was produced.
    Analyze {
        #[arg(long)]
        toitc: String,
        #[arg(long)]
        sdk_path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Capture everything the compiler reads for the given files into a
    /// reproducer tar.
    Archive {
        #[arg(long)]
        toitc: String,
        #[arg(long)]
        sdk_path: Option<String>,
        #[arg(long)]
        out: PathBuf,
        /// Include SDK files in the archive (pass `--include-sdk false`
        /// for a slimmer tar).
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        include_sdk: bool,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Reproducer tooling.
    Repro {
        #[command(subcommand)]
        command: ReproCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ReproCommand {
    /// Serve a reproducer archive's filesystem to a manually-run
    /// compiler.
    Serve {
        archive: PathBuf,
        /// Port for the file server; 0 picks an ephemeral one.
        #[arg(long, default_value_t = 0)]
        port: u16,
        /// Print the connection details as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve {
            toitc,
            sdk_path,
            verbose,
            timeout_ms,
        } => {
            let toitc = toitc.unwrap_or_else(|| "toit.compile".to_string());
            let sdk_path = sdk_path_or_default(sdk_path, &toitc)?;
            toitlsp::run_server(ServerSettings {
                verbose,
                default_compiler_path: toitc,
                default_sdk_path: sdk_path,
                timeout: timeout(timeout_ms),
                return_compiler_errors: false,
            })
            .await
        }
        Command::Analyze {
            toitc,
            sdk_path,
            timeout_ms,
            files,
        } => {
            let compiler = cli_compiler(&toitc, sdk_path, timeout_ms)?;
            let uris = file_uris(&files)?;
            let no_errors = analyze_and_print(&compiler, &uris).await?;
            if !no_errors {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Archive {
            toitc,
            sdk_path,
            out,
            include_sdk,
            timeout_ms,
            files,
        } => {
            let compiler = cli_compiler(&toitc, sdk_path, timeout_ms)?;
            let uris = file_uris(&files)?;
            compiler
                .parse(&uris)
                .await
                .context("failed to parse the input files")?;

            let paths: Vec<String> = uris.iter().map(uri::uri_to_path).collect();
            let compiler_input = serde_json::to_string(&path::to_compiler_paths(paths))?;
            let writer = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            compiler.archive(ArchiveOptions {
                writer,
                info: "toitlsp archive",
                include_sdk,
                overwrite_compiler_input: Some(compiler_input),
            })?;
            println!("Created archive at {}", out.display());
            Ok(())
        }
        Command::Repro { command } => match command {
            ReproCommand::Serve {
                archive,
                port,
                json,
            } => serve_repro(&archive, port, json).await,
        },
    }
}

fn timeout(timeout_ms: u64) -> Option<Duration> {
    if timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms))
    }
}

/// Without an explicit SDK the compiler's own directory serves as one.
fn sdk_path_or_default(sdk_path: Option<String>, toitc: &str) -> Result<String> {
    if let Some(sdk_path) = sdk_path {
        return Ok(sdk_path);
    }
    let dir = Path::new(toitc).parent().unwrap_or(Path::new("."));
    let abs = std::path::absolute(dir)?;
    Ok(abs.to_string_lossy().into_owned())
}

fn cli_compiler(toitc: &str, sdk_path: Option<String>, timeout_ms: u64) -> Result<Compiler> {
    let sdk_path = sdk_path_or_default(sdk_path, toitc)?;
    let cwd = std::env::current_dir()?;
    let root_uri = uri::path_to_uri(&cwd.to_string_lossy())
        .context("working directory is not a valid root")?;
    Ok(Compiler::new(
        Arc::new(LocalFileSystem::new()),
        CompilerSettings {
            compiler_path: toitc.to_string(),
            sdk_path,
            timeout: timeout(timeout_ms),
            root_uri: Some(root_uri),
        },
    ))
}

fn file_uris(files: &[PathBuf]) -> Result<Vec<Url>> {
    let mut uris = Vec::with_capacity(files.len());
    for file in files {
        let abs = std::path::absolute(file)?;
        uris.push(
            uri::path_to_uri(&abs.to_string_lossy())
                .with_context(|| format!("invalid path {}", file.display()))?,
        );
    }
    Ok(uris)
}

/// Prints all diagnostics; returns whether none of them was an error.
async fn analyze_and_print(compiler: &Compiler, uris: &[Url]) -> Result<bool> {
    let result = compiler.analyze(uris).await?;
    let mut no_errors = true;

    for message in &result.diagnostics_without_position {
        no_errors = false;
        println!("{message}");
    }

    let mut diagnostic_uris: Vec<&Url> = result.diagnostics.keys().collect();
    diagnostic_uris.sort();
    for uri in diagnostic_uris {
        let mut diagnostics = result.diagnostics[uri].clone();
        diagnostics.sort_by_key(|d| {
            (
                d.range.start.line,
                d.range.start.character,
                d.range.end.line,
                d.range.end.character,
            )
        });
        let path = uri::uri_to_path(uri);
        for diagnostic in diagnostics {
            let prefix = match diagnostic.severity {
                Some(DiagnosticSeverity::ERROR) => "error: ",
                Some(DiagnosticSeverity::WARNING) => "warning: ",
                Some(DiagnosticSeverity::INFORMATION) => "information: ",
                Some(DiagnosticSeverity::HINT) => "hint: ",
                _ => "",
            };
            println!(
                "{path}:{}:{} {prefix}{}",
                diagnostic.range.start.line + 1,
                diagnostic.range.start.character + 1,
                diagnostic.message
            );
            if diagnostic.severity == Some(DiagnosticSeverity::ERROR) {
                no_errors = false;
            }
        }
    }
    Ok(no_errors)
}

async fn serve_repro(archive: &Path, port: u16, json: bool) -> Result<()> {
    let repro = ReproFileSystem::open(archive)
        .with_context(|| format!("failed to open {}", archive.display()))?;
    let sdk_path = repro.sdk_path().to_string();
    let compiler_input = repro.compiler_input().to_string();
    let compiler_flags = repro.compiler_flags().to_vec();

    let server = TcpFileServer::bind(Arc::new(repro), sdk_path, &format!("127.0.0.1:{port}"))
        .await
        .context("failed to bind the file server")?;
    let bound_port = server.port()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "port": bound_port,
                "compilerInput": compiler_input,
            })
        );
    } else {
        println!("Server started at {bound_port}");
        println!("Run the compiler with:");
        if compiler_flags.is_empty() {
            println!("  toit.compile -Xno_fork --lsp");
        } else {
            println!("  toit.compile -Xno_fork {}", compiler_flags.join(" "));
        }
        println!("Stdin for the compiler:");
        println!("{bound_port}");
        println!("{compiler_input}");
    }

    server.serve().await?;
    Ok(())
}
