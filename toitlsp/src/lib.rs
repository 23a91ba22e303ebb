//! Language server for the Toit language.
//!
//! The server does not understand Toit itself; it drives the Toit
//! compiler's `--lsp` mode through [`toitlsp_compiler`] and keeps an
//! incremental, per-project view of analyzed modules so that edits only
//! trigger the work they require.

use tower_lsp::{LspService, Server};

pub mod analysis;
pub mod backend;
pub mod buffer_fs;
pub mod documents;
pub mod inheritance;
pub mod project;
pub mod settings;

pub use backend::Backend;
pub use settings::{ServerSettings, WorkspaceSettings};

/// Runs the LSP server over stdio.
pub async fn run_server(settings: ServerSettings) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(move |client| Backend::new(client, settings.clone()))
        .custom_method("toit/report_idle", Backend::toit_report_idle)
        .custom_method("toit/archive", Backend::toit_archive)
        .custom_method("toit/didOpenMany", Backend::toit_did_open_many)
        .custom_method("toit/snapshot_bundle", Backend::toit_snapshot_bundle)
        .custom_method("toit/reset_crash_rate_limit", Backend::toit_reset_crash_rate_limit)
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
