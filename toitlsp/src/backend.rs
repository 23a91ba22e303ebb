//! The request router: a tower-lsp backend wiring editor requests to the
//! document store, the analysis engine and the compiler driver.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

use toitlsp_compiler::driver::ArchiveOptions;
use toitlsp_compiler::fs::FileSystem;
use toitlsp_compiler::{path, uri, CompilerError};

use crate::documents::Documents;
use crate::project;
use crate::settings::{RawWorkspaceSettings, ServerSettings, WorkspaceSettings};

const IDLE_CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);
const CODE_REQUEST_CANCELLED: i64 = -32800;

/// `toit/didOpenMany` splits its file list into this many equal chunks
/// and analyzes them concurrently.
const DID_OPEN_MANY_CHUNKS: usize = 8;

pub struct Backend {
    client: Client,
    server_settings: ServerSettings,
    documents: Arc<Documents>,
    settings: RwLock<WorkspaceSettings>,
    root_uri: RwLock<Option<Url>>,
    supports_configuration: AtomicBool,
    next_analysis_revision: AtomicI64,
    last_crash_report: Mutex<Option<Instant>>,
    ready: watch::Sender<bool>,
    idle: Arc<IdleTracker>,
    shutdown: CancellationToken,
}

impl Backend {
    pub fn new(client: Client, server_settings: ServerSettings) -> Self {
        let (ready, _) = watch::channel(false);
        Backend {
            client,
            server_settings,
            documents: Arc::new(Documents::new()),
            settings: RwLock::new(WorkspaceSettings::default()),
            root_uri: RwLock::new(None),
            supports_configuration: AtomicBool::new(false),
            next_analysis_revision: AtomicI64::new(1),
            last_crash_report: Mutex::new(None),
            ready,
            idle: Arc::new(IdleTracker::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn documents(&self) -> Arc<Documents> {
        self.documents.clone()
    }

    pub(crate) fn server_settings(&self) -> &ServerSettings {
        &self.server_settings
    }

    pub(crate) fn workspace_settings(&self) -> WorkspaceSettings {
        self.settings.read().unwrap().clone()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn last_crash_report(&self) -> &Mutex<Option<Instant>> {
        &self.last_crash_report
    }

    /// The revision the next analysis will run under. Content updates are
    /// stamped with it so the following analysis covers them.
    pub(crate) fn upcoming_analysis_revision(&self) -> i64 {
        self.next_analysis_revision.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate_analysis_revision(&self) -> i64 {
        self.next_analysis_revision.fetch_add(1, Ordering::SeqCst)
    }

    /// Blocks until `initialized` installed the workspace settings.
    pub(crate) async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn track(&self) -> ProcessGuard {
        self.idle.track()
    }

    fn on_idle(&self, callback: IdleCallback) {
        self.idle.on_idle(callback);
    }

    async fn analyze_and_log(&self, what: &str, uris: Vec<Url>) {
        match self.analyze(uris).await {
            Ok(()) => tracing::debug!("successfully analyzed {what} request"),
            Err(e) => tracing::error!("failed to analyze {what} request: {e}"),
        }
    }

    // --- extension methods ------------------------------------------------

    pub async fn toit_report_idle(&self) -> jsonrpc::Result<()> {
        let _guard = self.track();
        let client = self.client.clone();
        self.on_idle(Box::pin(async move {
            client.send_notification::<ToitIdle>(None).await;
        }));
        Ok(())
    }

    pub async fn toit_reset_crash_rate_limit(&self) -> jsonrpc::Result<()> {
        let _guard = self.track();
        *self.last_crash_report.lock().unwrap() = None;
        Ok(())
    }

    pub async fn toit_did_open_many(&self, params: DidOpenManyParams) -> jsonrpc::Result<()> {
        let _guard = self.track();
        let uris: Vec<Url> = params.uris.iter().map(uri::canonicalize).collect();
        let revision = self.upcoming_analysis_revision();
        for uri in &uris {
            // Opened without content; the compiler reads them from disk.
            self.documents.open(uri, None, revision);
        }

        let chunk_size = uris.len().div_ceil(DID_OPEN_MANY_CHUNKS).max(1);
        let chunks: Vec<Vec<Url>> = uris.chunks(chunk_size).map(<[Url]>::to_vec).collect();
        let analyses = chunks.into_iter().map(|chunk| self.analyze(chunk));
        let results = futures::future::join_all(analyses).await;
        for result in results {
            if let Err(e) = result {
                tracing::error!("failed to analyze toit/didOpenMany request: {e}");
                return Err(to_jsonrpc_error(e));
            }
        }
        Ok(())
    }

    pub async fn toit_archive(&self, params: ArchiveParams) -> jsonrpc::Result<Vec<u8>> {
        let _guard = self.track();
        let mut uris = params.uris;
        if uris.is_empty() {
            uris.extend(params.uri);
        }
        let uris: Vec<Url> = uris.iter().map(uri::canonicalize).collect();
        let include_sdk = params.include_sdk.unwrap_or(true);

        self.wait_until_ready().await;
        let root = self.root_uri.read().unwrap().clone();
        let compiler = self.create_compiler(root);
        if let Err(e) = compiler.parse(&uris).await {
            return match self.handle_compiler_error(&compiler, e).await {
                Ok(()) => Ok(Vec::new()),
                Err(e) => Err(to_jsonrpc_error(e)),
            };
        }

        // The archive replays as compiler input, so the recorded file
        // list uses compiler-form paths.
        let paths: Vec<String> = uris.iter().map(uri::uri_to_path).collect();
        let compiler_input = serde_json::to_string(&path::to_compiler_paths(paths))
            .map_err(|e| jsonrpc::Error::invalid_params(e.to_string()))?;

        let mut buffer = Vec::new();
        compiler
            .archive(ArchiveOptions {
                writer: &mut buffer,
                info: "toit/archive",
                include_sdk,
                overwrite_compiler_input: Some(compiler_input),
            })
            .map_err(to_jsonrpc_error)?;
        Ok(buffer)
    }

    pub async fn toit_snapshot_bundle(
        &self,
        params: SnapshotBundleParams,
    ) -> jsonrpc::Result<SnapshotBundleResult> {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.uri);
        self.wait_until_ready().await;
        let root = self.root_uri.read().unwrap().clone();
        let compiler = self.create_compiler(root);
        match compiler.snapshot_bundle(&uri).await {
            Ok(bundle) => Ok(SnapshotBundleResult {
                snapshot_bundle: bundle,
            }),
            Err(e) => match self.handle_compiler_error(&compiler, e).await {
                Ok(()) => Err(jsonrpc::Error::internal_error()),
                Err(e) => Err(to_jsonrpc_error(e)),
            },
        }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> jsonrpc::Result<InitializeResult> {
        let _guard = self.track();
        let supports_configuration = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|w| w.configuration)
            .unwrap_or(false);
        self.supports_configuration
            .store(supports_configuration, Ordering::SeqCst);

        #[allow(deprecated)] // root_uri is how editors still hand us the workspace.
        let root_uri = params.root_uri;
        if let Some(root) = root_uri {
            *self.root_uri.write().unwrap() = Some(uri::canonicalize(&root));
        }

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "toitlsp".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ServerCapabilities {
                completion_provider: Some(CompletionOptions {
                    resolve_provider: Some(false),
                    trigger_characters: Some(vec![
                        ".".to_string(),
                        "-".to_string(),
                        "$".to_string(),
                    ]),
                    ..CompletionOptions::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(false),
                        })),
                        ..TextDocumentSyncOptions::default()
                    },
                )),
                semantic_tokens_provider: Some(
                    SemanticTokensServerCapabilities::SemanticTokensOptions(
                        SemanticTokensOptions {
                            legend: SemanticTokensLegend {
                                token_types: vec![
                                    SemanticTokenType::NAMESPACE,
                                    SemanticTokenType::CLASS,
                                    SemanticTokenType::INTERFACE,
                                    SemanticTokenType::PARAMETER,
                                    SemanticTokenType::VARIABLE,
                                ],
                                token_modifiers: vec![
                                    SemanticTokenModifier::DEFINITION,
                                    SemanticTokenModifier::READONLY,
                                    SemanticTokenModifier::STATIC,
                                    SemanticTokenModifier::ABSTRACT,
                                    SemanticTokenModifier::DEFAULT_LIBRARY,
                                ],
                            },
                            range: Some(false),
                            full: Some(SemanticTokensFullOptions::Bool(true)),
                            work_done_progress_options: WorkDoneProgressOptions::default(),
                        },
                    ),
                ),
                ..ServerCapabilities::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let _guard = self.track();
        let mut settings = WorkspaceSettings::default();
        if self.supports_configuration.load(Ordering::SeqCst) {
            match self.fetch_workspace_settings().await {
                Ok(fetched) => settings = fetched,
                Err(e) => {
                    tracing::error!("failed to fetch workspace settings: {e:?}");
                }
            }
        }
        let settings = settings.merge_defaults(&self.server_settings);
        *self.settings.write().unwrap() = settings;
        let _ = self.ready.send(true);
        tracing::info!("toitlsp ready");
    }

    async fn shutdown(&self) -> jsonrpc::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        tracing::debug!(%uri, "did_open");
        self.documents.open(
            &uri,
            Some(params.text_document.text),
            self.upcoming_analysis_revision(),
        );
        self.analyze_and_log("textDocument/didOpen", vec![uri]).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        tracing::debug!(%uri, "did_change");
        for change in params.content_changes {
            if change.range.is_some() {
                tracing::error!("only full-document updates are supported");
                return;
            }
            // The analysis scheduled right after runs at the next
            // revision, so that revision covers this content.
            self.documents
                .update(&uri, change.text, self.upcoming_analysis_revision());
        }
        self.analyze_and_log("textDocument/didChange", vec![uri]).await;
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        // A dirty buffer got a didChange before the save; the buffer now
        // equals the disk, so only the content is dropped.
        self.documents.clear_content(&uri);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        self.documents.close(&uri);
        if project::is_inside_dot_packages(&uri)
            && !self.workspace_settings().report_package_diagnostics
        {
            // Package diagnostics were only shown while the file was
            // open; clear the client's markers now.
            self.client.publish_diagnostics(uri, Vec::new(), None).await;
        }
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> jsonrpc::Result<Option<GotoDefinitionResponse>> {
        let _guard = self.track();
        let position_params = params.text_document_position_params;
        let uri = uri::canonicalize(&position_params.text_document.uri);
        self.wait_until_ready().await;
        let project = self.documents.project_uri_for(&uri, false);
        let compiler = self.create_compiler(Some(project));
        match compiler.goto_definition(&uri, position_params.position).await {
            Ok(locations) => Ok(Some(GotoDefinitionResponse::Array(locations))),
            Err(e) => match self.handle_compiler_error(&compiler, e).await {
                Ok(()) => Ok(None),
                Err(e) => Err(to_jsonrpc_error(e)),
            },
        }
    }

    async fn completion(
        &self,
        params: CompletionParams,
    ) -> jsonrpc::Result<Option<CompletionResponse>> {
        let _guard = self.track();
        let position_params = params.text_document_position;
        let uri = uri::canonicalize(&position_params.text_document.uri);
        self.wait_until_ready().await;
        let project = self.documents.project_uri_for(&uri, false);
        let compiler = self.create_compiler(Some(project));
        match compiler.complete(&uri, position_params.position).await {
            Ok(items) => Ok(Some(CompletionResponse::Array(items))),
            Err(e) => match self.handle_compiler_error(&compiler, e).await {
                Ok(()) => Ok(None),
                Err(e) => Err(to_jsonrpc_error(e)),
            },
        }
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> jsonrpc::Result<Option<DocumentSymbolResponse>> {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        self.wait_until_ready().await;
        let project = self.documents.project_uri_for(&uri, false);
        let analyzed = self.documents.analyzed_documents(&project);

        let mut summary = analyzed.summary(&uri);
        if summary.is_none() {
            self.analyze(vec![uri.clone()])
                .await
                .map_err(to_jsonrpc_error)?;
            summary = analyzed.summary(&uri);
        }
        let Some(summary) = summary else {
            return Ok(None);
        };

        let content = match self.documents.content(&uri) {
            Some(content) => content,
            None => {
                let local = toitlsp_compiler::fs::LocalFileSystem::new();
                let file = local
                    .read(&uri::uri_to_path(&uri))
                    .map_err(|e| to_jsonrpc_error(CompilerError::Io(e)))?;
                String::from_utf8_lossy(&file.content.unwrap_or_default()).into_owned()
            }
        };
        if content.is_empty() {
            return Ok(None);
        }
        Ok(Some(DocumentSymbolResponse::Nested(
            summary.document_symbols(&content),
        )))
    }

    async fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> jsonrpc::Result<Option<SemanticTokensResult>> {
        let _guard = self.track();
        let uri = uri::canonicalize(&params.text_document.uri);
        self.wait_until_ready().await;
        let project = self.documents.project_uri_for(&uri, false);
        let compiler = self.create_compiler(Some(project));
        match compiler.semantic_tokens(&uri).await {
            Ok(data) => Ok(Some(SemanticTokensResult::Tokens(SemanticTokens {
                result_id: None,
                data: decode_semantic_tokens(&data),
            }))),
            Err(e) => match self.handle_compiler_error(&compiler, e).await {
                Ok(()) => Ok(None),
                Err(e) => Err(to_jsonrpc_error(e)),
            },
        }
    }
}

impl Backend {
    async fn fetch_workspace_settings(&self) -> Result<WorkspaceSettings, jsonrpc::Error> {
        let items = vec![ConfigurationItem {
            scope_uri: None,
            section: Some("toitLanguageServer".to_string()),
        }];
        let mut values = self.client.configuration(items).await?;
        if values.is_empty() {
            return Ok(WorkspaceSettings::default());
        }
        let raw: RawWorkspaceSettings = serde_json::from_value(values.remove(0))
            .map_err(|e| jsonrpc::Error::invalid_params(e.to_string()))?;
        Ok(raw.into_settings())
    }
}

/// Raw semantic-token stream in groups of five, per the LSP legend.
fn decode_semantic_tokens(data: &[u32]) -> Vec<SemanticToken> {
    if data.len() % 5 != 0 {
        tracing::warn!(len = data.len(), "semantic token stream is not a multiple of five");
    }
    data.chunks_exact(5)
        .map(|c| SemanticToken {
            delta_line: c[0],
            delta_start: c[1],
            length: c[2],
            token_type: c[3],
            token_modifiers_bitset: c[4],
        })
        .collect()
}

fn to_jsonrpc_error(err: CompilerError) -> jsonrpc::Error {
    let code = if err.is_cancelled() {
        jsonrpc::ErrorCode::ServerError(CODE_REQUEST_CANCELLED)
    } else {
        jsonrpc::ErrorCode::InternalError
    };
    jsonrpc::Error {
        code,
        message: err.to_string().into(),
        data: None,
    }
}

// --- idle tracking --------------------------------------------------------

type IdleCallback = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Counts in-flight request handlers. Callbacks registered through
/// `on_idle` fire together once the count reaches zero.
#[derive(Default)]
struct IdleTracker {
    count: AtomicI64,
    callbacks: Mutex<Vec<IdleCallback>>,
}

impl IdleTracker {
    fn track(self: &Arc<Self>) -> ProcessGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ProcessGuard {
            tracker: self.clone(),
        }
    }

    fn on_idle(self: &Arc<Self>, callback: IdleCallback) {
        self.callbacks.lock().unwrap().push(callback);
        if self.count.load(Ordering::SeqCst) == 0 {
            self.drain();
        }
    }

    fn drain(self: &Arc<Self>) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        for callback in callbacks {
            tokio::spawn(async move {
                if tokio::time::timeout(IDLE_CALLBACK_TIMEOUT, callback)
                    .await
                    .is_err()
                {
                    tracing::warn!("idle callback timed out");
                }
            });
        }
    }
}

struct ProcessGuard {
    tracker: Arc<IdleTracker>,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.tracker.drain();
        }
    }
}

// --- extension wire types -------------------------------------------------

enum ToitIdle {}

impl Notification for ToitIdle {
    type Params = Option<serde_json::Value>;
    const METHOD: &'static str = "toit/idle";
}

#[derive(Debug, Deserialize)]
pub struct DidOpenManyParams {
    pub uris: Vec<Url>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArchiveParams {
    pub uris: Vec<Url>,
    pub uri: Option<Url>,
    pub include_sdk: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotBundleParams {
    pub uri: Url,
}

#[derive(Debug, Serialize)]
pub struct SnapshotBundleResult {
    pub snapshot_bundle: Vec<u8>,
}
