//! Driver for the Toit compiler's `--lsp` mode.
//!
//! The compiler runs as a child process and talks to us over a single
//! stdio pipe pair carrying three logical streams: requests to a virtual
//! file server, our replies, and the analyzer output itself. This crate
//! multiplexes that pipe, serves the compiler's filesystem questions from
//! a stack of virtual filesystems, parses the textual summary format into
//! typed module summaries, and can capture everything a compiler
//! invocation saw into a reproducer archive.

pub mod archive;
pub mod driver;
pub mod error;
pub mod fs;
pub mod fs_protocol;
pub mod file_server;
pub mod multiplex;
pub mod path;
pub mod repro;
pub mod summary;
pub mod uri;

mod lineio;

pub use driver::{AnalyzeResult, Compiler, CompilerSettings};
pub use error::{CompilerError, ParseError};
pub use fs::{File, FileSystem, LocalFileSystem, MultiFileSystem};
