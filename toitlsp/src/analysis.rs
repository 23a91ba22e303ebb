//! The incremental analysis engine.
//!
//! Analyses are stamped with a revision shared with content updates: any
//! content bump after a revision was allocated marks that analysis stale
//! for the edited document. Per project, an analysis installs summaries,
//! collects the documents whose diagnostics must be (re)published, pulls
//! in transitive reverse dependencies of externally-changed summaries,
//! and recurses on documents that still need fresh results. Changed
//! summaries shared with other project roots re-enter the pass until the
//! cross-project fix-point stabilizes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tower_lsp::lsp_types::{MessageType, Url};

use toitlsp_compiler::fs::{LocalFileSystem, MultiFileSystem};
use toitlsp_compiler::{uri, Compiler, CompilerError, CompilerSettings};

use crate::backend::Backend;
use crate::buffer_fs::BufferFileSystem;
use crate::documents::{FIRST_ANALYSIS_AFTER_CONTENT_CHANGE, SUMMARY_CHANGED_EXTERNALLY};
use crate::project;

pub const CRASH_REPORT_RATE_LIMIT: Duration = Duration::from_secs(30);

/// Unstable summaries could bounce changes between projects forever;
/// stop propagating after this many passes.
const MAX_CROSS_PROJECT_PASSES: usize = 16;

impl Backend {
    /// Analyzes `uris` under a fresh revision and publishes diagnostics.
    pub async fn analyze(&self, uris: Vec<Url>) -> Result<(), CompilerError> {
        if uris.is_empty() {
            return Ok(());
        }
        self.wait_until_ready().await;
        let revision = self.allocate_analysis_revision();
        self.analyze_with_revision(uris, revision).await
    }

    async fn analyze_with_revision(
        &self,
        uris: Vec<Url>,
        revision: i64,
    ) -> Result<(), CompilerError> {
        tracing::debug!(?uris, revision, "analyzing");

        let documents = self.documents();
        let mut by_project: HashMap<Url, Vec<Url>> = HashMap::new();
        for uri in uris {
            let project = documents.project_uri_for(&uri, false);
            by_project.entry(project).or_default().push(uri);
        }

        let mut visited: HashSet<(Url, Url)> = by_project
            .iter()
            .flat_map(|(p, us)| us.iter().map(|u| (p.clone(), u.clone())))
            .collect();

        for pass in 0.. {
            if pass == MAX_CROSS_PROJECT_PASSES {
                tracing::warn!("cross-project analysis did not stabilize; giving up");
                break;
            }

            let mut changed: Vec<(Url, Url)> = Vec::new();
            for (project, uris) in std::mem::take(&mut by_project) {
                let project_changed = self.analyze_project(&project, uris, revision).await?;
                changed.extend(project_changed.into_iter().map(|u| (project.clone(), u)));
            }

            // Changed summaries may be active in other project roots;
            // those projects get their own pass at the same revision.
            for (origin, uri) in changed {
                for other in documents.project_uris_containing(&uri) {
                    if other == origin {
                        continue;
                    }
                    if visited.insert((other.clone(), uri.clone())) {
                        by_project.entry(other).or_default().push(uri.clone());
                    }
                }
            }
            if by_project.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// One per-project pass. Returns the documents whose summary changed
    /// externally.
    async fn analyze_project(
        &self,
        project: &Url,
        uris: Vec<Url>,
        revision: i64,
    ) -> Result<HashSet<Url>, CompilerError> {
        if uris.is_empty() {
            return Ok(HashSet::new());
        }

        let documents = self.documents();
        let compiler = self.create_compiler(Some(project.clone()));
        let mut result = match compiler.analyze(&uris).await {
            Ok(result) => result,
            Err(e) => {
                self.handle_compiler_error(&compiler, e).await?;
                return Ok(HashSet::new());
            }
        };

        // Out-of-protocol compiler messages go to stderr where the client
        // surfaces them without disturbing the protocol.
        for message in &result.diagnostics_without_position {
            eprintln!("{message}");
        }

        let analyzed = documents.analyzed_documents(project);

        if result.summaries.is_empty() {
            // No summaries and a positionless complaint about a requested
            // path means the entry is missing or unreadable.
            for uri in &uris {
                let entry_path = uri::uri_to_path(uri);
                let entry_problem = result.diagnostics.is_empty()
                    && result
                        .diagnostics_without_position
                        .iter()
                        .any(|m| m.contains(&entry_path));
                if !entry_problem {
                    continue;
                }
                if documents.is_open(uri) {
                    tracing::error!(%uri, "compiler could not read an open document");
                } else {
                    documents.delete(uri);
                }
            }
            return Ok(HashSet::new());
        }

        let mut report: HashSet<Url> = HashSet::new();
        for uri in &uris {
            if analyzed.analysis_revision(uri) < revision
                && documents.content_revision(uri) <= revision
            {
                report.insert(uri.clone());
            }
        }

        let analyzed_now: HashSet<Url> = result.summaries.keys().cloned().collect();
        let mut changed: HashSet<Url> = HashSet::new();
        for (uri, summary) in result.summaries {
            let content_revision = documents.content_revision(&uri);
            let bits =
                analyzed.update_after_analysis(&uri, revision, Arc::new(summary), content_revision);
            let externally_changed = bits & SUMMARY_CHANGED_EXTERNALLY != 0;
            let first_for_content = bits & FIRST_ANALYSIS_AFTER_CONTENT_CHANGE != 0;
            if externally_changed {
                changed.insert(uri.clone());
            }
            if externally_changed || first_for_content {
                report.insert(uri.clone());
            }
            let requested = analyzed.analysis_requested_by_revision(&uri);
            if requested != -1 && requested < revision {
                report.insert(uri.clone());
            }
        }

        // Externally-changed summaries invalidate their transitive
        // reverse dependencies: even an indirect importer may observe a
        // changed return type through a chain of calls.
        let mut stack: Vec<Url> = changed
            .iter()
            .flat_map(|u| analyzed.reverse_dependencies(u))
            .collect();
        while let Some(uri) = stack.pop() {
            if report.insert(uri.clone()) {
                stack.extend(analyzed.reverse_dependencies(&uri));
            }
        }

        // Only this project's documents are reported here; shared URIs
        // reach their other projects via the cross-project pass.
        report.retain(|u| documents.project_uri_for(u, false) == *project);
        if !self.workspace_settings().report_package_diagnostics {
            report.retain(|u| !project::is_inside_dot_packages(u) || documents.is_open(u));
        }

        for uri in &report {
            let requested = analyzed.analysis_requested_by_revision(uri);
            if analyzed_now.contains(uri) {
                let diagnostics = result.diagnostics.remove(uri).unwrap_or_default();
                self.client()
                    .publish_diagnostics(uri.clone(), diagnostics, None)
                    .await;
                if requested != -1 && requested < revision {
                    analyzed.set_analysis_requested_by_revision(uri, requested, -1);
                }
            } else if requested < revision {
                analyzed.set_analysis_requested_by_revision(uri, requested, revision);
            }
        }

        // Reported documents that were not analyzed in this run and have
        // no newer edit pending get analyzed now, at the same revision.
        let needs_analysis: Vec<Url> = report
            .iter()
            .filter(|u| {
                analyzed.analysis_revision(u) < revision
                    && documents.content_revision(u) <= revision
            })
            .cloned()
            .collect();

        if needs_analysis.len() == uris.len()
            && needs_analysis.iter().all(|u| uris.contains(u))
        {
            tracing::warn!(?needs_analysis, "analysis made no progress; giving up");
            return Ok(changed);
        }

        let sub_changed =
            Box::pin(self.analyze_project(project, needs_analysis, revision)).await?;
        changed.extend(sub_changed);
        Ok(changed)
    }

    pub(crate) fn create_compiler(&self, project: Option<Url>) -> Compiler {
        let settings = self.workspace_settings();
        let fs = MultiFileSystem::new(vec![
            Box::new(BufferFileSystem::new(self.documents())),
            Box::new(LocalFileSystem::new()),
        ]);
        Compiler::new(
            Arc::new(fs),
            CompilerSettings {
                compiler_path: settings.compiler_path.clone(),
                sdk_path: settings.sdk_path.clone(),
                timeout: settings.timeout,
                root_uri: project,
            },
        )
        .with_cancellation(self.shutdown_token().child_token())
    }

    /// Reports a failed invocation to the client. Recoverable errors are
    /// swallowed after reporting; everything else comes back to the
    /// caller.
    pub(crate) async fn handle_compiler_error(
        &self,
        compiler: &Compiler,
        err: CompilerError,
    ) -> Result<(), CompilerError> {
        if self.server_settings().return_compiler_errors {
            return Err(err);
        }
        let settings = self.workspace_settings();
        match &err {
            CompilerError::Protocol(_) | CompilerError::Parse(_) => {
                tracing::info!("compiler error: {err}");
                if settings.should_write_repro_on_crash {
                    self.client()
                        .show_message(MessageType::INFO, err.to_string())
                        .await;
                } else {
                    self.client()
                        .log_message(MessageType::LOG, err.to_string())
                        .await;
                }
                Ok(())
            }
            CompilerError::Crash(_) => {
                if !self.take_crash_report_slot() {
                    tracing::debug!("compiler crash was rate limited: {err}");
                    return Ok(());
                }
                if settings.should_write_repro_on_crash {
                    let path = self.write_repro(compiler, &settings.repro_directory)?;
                    self.client()
                        .show_message(
                            MessageType::ERROR,
                            format!("Compiler crashed. Repro created: {}", path.display()),
                        )
                        .await;
                } else {
                    self.client()
                        .log_message(MessageType::LOG, err.to_string())
                        .await;
                }
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Claims the one crash report allowed per rate-limit window.
    fn take_crash_report_slot(&self) -> bool {
        let mut last = self.last_crash_report().lock().unwrap();
        if let Some(at) = *last {
            if at.elapsed() < CRASH_REPORT_RATE_LIMIT {
                return false;
            }
        }
        *last = Some(Instant::now());
        true
    }

    fn write_repro(
        &self,
        compiler: &Compiler,
        repro_directory: &str,
    ) -> Result<std::path::PathBuf, CompilerError> {
        std::fs::create_dir_all(repro_directory)?;
        let file = tempfile::Builder::new()
            .prefix("repro-")
            .suffix(".tar")
            .tempfile_in(repro_directory)
            .map_err(|e| {
                tracing::info!("failed to create temp file for repro: {e}");
                CompilerError::Io(e)
            })?;
        let (handle, path) = file.keep().map_err(|e| CompilerError::Io(e.error))?;
        compiler.archive(toitlsp_compiler::driver::ArchiveOptions {
            writer: handle,
            info: "",
            include_sdk: true,
            overwrite_compiler_input: None,
        })?;
        Ok(path)
    }
}
