//! Document state: open buffers and per-project analysis results.
//!
//! Open buffers are shared across projects, keyed by URI. Analysis state
//! is per project root: the same URI may be analyzed independently in
//! several projects, each with its own summary, reverse dependencies and
//! analysis revision.
//!
//! Locks are short-lived and never held across compiler I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tower_lsp::lsp_types::Url;

use toitlsp_compiler::summary::Module;

use crate::project;

/// Set when a new summary differs from the previous one in a way that is
/// visible to modules importing it.
pub const SUMMARY_CHANGED_EXTERNALLY: u8 = 1;
/// Set when this analysis is the first to cover the current content
/// revision of the document.
pub const FIRST_ANALYSIS_AFTER_CONTENT_CHANGE: u8 = 2;

#[derive(Debug, Clone)]
pub struct OpenedDocument {
    /// Present while the buffer is dirty; dropped on save.
    pub content: Option<String>,
    pub revision: i64,
}

#[derive(Clone, Default)]
pub struct AnalyzedDocument {
    pub summary: Option<Arc<Module>>,
    pub reverse_deps: HashSet<Url>,
    pub analysis_revision: i64,
    pub analysis_requested_by_revision: i64,
}

impl AnalyzedDocument {
    fn new() -> Self {
        AnalyzedDocument {
            summary: None,
            reverse_deps: HashSet::new(),
            analysis_revision: -1,
            analysis_requested_by_revision: -1,
        }
    }
}

/// The analyzed documents of one project root.
#[derive(Default)]
pub struct AnalyzedDocuments {
    docs: RwLock<HashMap<Url, AnalyzedDocument>>,
}

impl AnalyzedDocuments {
    pub fn get(&self, uri: &Url) -> Option<AnalyzedDocument> {
        self.docs.read().unwrap().get(uri).cloned()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.docs.read().unwrap().contains_key(uri)
    }

    pub fn analysis_revision(&self, uri: &Url) -> i64 {
        self.docs
            .read()
            .unwrap()
            .get(uri)
            .map_or(-1, |d| d.analysis_revision)
    }

    pub fn analysis_requested_by_revision(&self, uri: &Url) -> i64 {
        self.docs
            .read()
            .unwrap()
            .get(uri)
            .map_or(-1, |d| d.analysis_requested_by_revision)
    }

    /// Compare-and-set of the pending-request marker, so a concurrent
    /// analysis that already satisfied a newer request is not clobbered.
    pub fn set_analysis_requested_by_revision(&self, uri: &Url, expected: i64, value: i64) {
        let mut docs = self.docs.write().unwrap();
        let doc = docs.entry(uri.clone()).or_insert_with(AnalyzedDocument::new);
        if doc.analysis_requested_by_revision == expected {
            doc.analysis_requested_by_revision = value;
        }
    }

    pub fn reverse_dependencies(&self, uri: &Url) -> HashSet<Url> {
        self.docs
            .read()
            .unwrap()
            .get(uri)
            .map(|d| d.reverse_deps.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self, uri: &Url) -> Option<Arc<Module>> {
        self.docs.read().unwrap().get(uri)?.summary.clone()
    }

    pub fn summaries(&self) -> HashMap<Url, Arc<Module>> {
        self.docs
            .read()
            .unwrap()
            .iter()
            .filter_map(|(uri, doc)| Some((uri.clone(), doc.summary.clone()?)))
            .collect()
    }

    /// Installs an analysis result. An analysis whose revision does not
    /// exceed the installed one loses; this is the linearization point
    /// for overlapping analyses.
    ///
    /// Returns a bitset of [`SUMMARY_CHANGED_EXTERNALLY`] and
    /// [`FIRST_ANALYSIS_AFTER_CONTENT_CHANGE`].
    pub fn update_after_analysis(
        &self,
        uri: &Url,
        analysis_revision: i64,
        summary: Arc<Module>,
        content_revision: i64,
    ) -> u8 {
        let mut docs = self.docs.write().unwrap();
        let doc = docs.entry(uri.clone()).or_insert_with(AnalyzedDocument::new);
        if doc.analysis_revision >= analysis_revision {
            return 0;
        }

        let old_summary = doc.summary.clone();
        let old_revision = doc.analysis_revision;
        let old_deps: HashSet<Url> = old_summary
            .as_ref()
            .map(|s| s.dependencies.iter().cloned().collect())
            .unwrap_or_default();
        let new_deps: HashSet<Url> = summary.dependencies.iter().cloned().collect();

        for removed in old_deps.difference(&new_deps) {
            let dep = docs
                .entry(removed.clone())
                .or_insert_with(AnalyzedDocument::new);
            if !dep.reverse_deps.remove(uri) {
                tracing::error!(%uri, dep_uri = %removed, "reverse dependency was already gone");
            }
        }
        for added in new_deps.difference(&old_deps) {
            docs.entry(added.clone())
                .or_insert_with(AnalyzedDocument::new)
                .reverse_deps
                .insert(uri.clone());
        }

        let externally_changed = match &old_summary {
            None => true,
            Some(old) => !old.equals_external(&summary),
        };

        let doc = docs.entry(uri.clone()).or_insert_with(AnalyzedDocument::new);
        doc.summary = Some(summary);
        doc.analysis_revision = analysis_revision;

        let mut res = 0;
        if old_revision < content_revision && content_revision <= analysis_revision {
            res |= FIRST_ANALYSIS_AFTER_CONTENT_CHANGE;
        }
        if externally_changed {
            res |= SUMMARY_CHANGED_EXTERNALLY;
        }
        res
    }

    /// Drops the document and unlinks it from its dependencies.
    pub fn remove(&self, uri: &Url) {
        let mut docs = self.docs.write().unwrap();
        let Some(doc) = docs.remove(uri) else {
            return;
        };
        if let Some(summary) = doc.summary {
            for dep in &summary.dependencies {
                if let Some(dep_doc) = docs.get_mut(dep) {
                    dep_doc.reverse_deps.remove(uri);
                }
            }
        }
    }
}

#[derive(Default)]
struct DocumentsInner {
    open: HashMap<Url, OpenedDocument>,
    project_of: HashMap<Url, Url>,
    analyzed: HashMap<Url, Arc<AnalyzedDocuments>>,
}

/// The connection-wide document store.
#[derive(Default)]
pub struct Documents {
    inner: RwLock<DocumentsInner>,
}

impl Documents {
    pub fn new() -> Self {
        Documents::default()
    }

    /// Installs or replaces the open buffer for `uri`. `content` is
    /// `None` when the document is opened from disk (`didOpenMany`).
    pub fn open(&self, uri: &Url, content: Option<String>, revision: i64) {
        let mut inner = self.inner.write().unwrap();
        if inner.open.contains_key(uri) {
            tracing::debug!(%uri, "document already open");
        }
        inner
            .open
            .insert(uri.clone(), OpenedDocument { content, revision });
    }

    pub fn update(&self, uri: &Url, content: String, revision: i64) {
        let mut inner = self.inner.write().unwrap();
        if !inner.open.contains_key(uri) {
            // Keep going with a stub entry so later transitions stay
            // coherent.
            tracing::error!(%uri, "document isn't open as expected");
        }
        let doc = inner.open.entry(uri.clone()).or_insert(OpenedDocument {
            content: None,
            revision,
        });
        doc.content = Some(content);
        doc.revision = revision;
    }

    /// On save the buffer equals the disk; only the content is dropped.
    pub fn clear_content(&self, uri: &Url) {
        let mut inner = self.inner.write().unwrap();
        match inner.open.get_mut(uri) {
            Some(doc) => doc.content = None,
            None => tracing::error!(%uri, "document isn't open as expected"),
        }
    }

    pub fn close(&self, uri: &Url) {
        let mut inner = self.inner.write().unwrap();
        if inner.open.remove(uri).is_none() {
            tracing::error!(%uri, "closed a document that wasn't open");
        }
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.inner.read().unwrap().open.contains_key(uri)
    }

    pub fn open_document(&self, uri: &Url) -> Option<OpenedDocument> {
        self.inner.read().unwrap().open.get(uri).cloned()
    }

    pub fn content(&self, uri: &Url) -> Option<String> {
        self.inner.read().unwrap().open.get(uri)?.content.clone()
    }

    pub fn content_revision(&self, uri: &Url) -> i64 {
        self.inner.read().unwrap().open.get(uri).map_or(0, |d| d.revision)
    }

    /// The project root of `uri`, cached. With `recompute`, the cached
    /// value and every document sharing its old project are recomputed as
    /// well, since packages may have appeared or vanished.
    pub fn project_uri_for(&self, uri: &Url, recompute: bool) -> Url {
        if !recompute {
            if let Some(project) = self.inner.read().unwrap().project_of.get(uri) {
                return project.clone();
            }
        }
        let project = project::compute_project_uri(uri);
        let mut inner = self.inner.write().unwrap();
        if recompute {
            if let Some(old_project) = inner.project_of.get(uri).cloned() {
                if old_project != project {
                    let stale: Vec<Url> = inner
                        .project_of
                        .iter()
                        .filter(|(other, p)| **p == old_project && *other != uri)
                        .map(|(other, _)| other.clone())
                        .collect();
                    for other in stale {
                        let fresh = project::compute_project_uri(&other);
                        inner.project_of.insert(other, fresh);
                    }
                }
            }
        }
        inner.project_of.insert(uri.clone(), project.clone());
        project
    }

    /// The analyzed-documents map of `project`, created on first use.
    pub fn analyzed_documents(&self, project: &Url) -> Arc<AnalyzedDocuments> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(docs) = inner.analyzed.get(project) {
                return docs.clone();
            }
        }
        self.inner
            .write()
            .unwrap()
            .analyzed
            .entry(project.clone())
            .or_default()
            .clone()
    }

    /// All project roots whose analyzed map knows `uri`.
    pub fn project_uris_containing(&self, uri: &Url) -> Vec<Url> {
        self.inner
            .read()
            .unwrap()
            .analyzed
            .iter()
            .filter(|(_, docs)| docs.contains(uri))
            .map(|(project, _)| project.clone())
            .collect()
    }

    /// Removes `uri` everywhere: the open map and every project.
    pub fn delete(&self, uri: &Url) {
        let analyzed: Vec<Arc<AnalyzedDocuments>> = {
            let mut inner = self.inner.write().unwrap();
            inner.open.remove(uri);
            inner.project_of.remove(uri);
            inner.analyzed.values().cloned().collect()
        };
        for docs in analyzed {
            docs.remove(uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toitlsp_compiler::summary::Module;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn module(uri: &str, deps: &[&str]) -> Arc<Module> {
        Arc::new(Module {
            uri: url(uri),
            dependencies: deps.iter().map(|d| url(d)).collect(),
            exported_modules: Vec::new(),
            exports: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            toitdoc: None,
        })
    }

    fn assert_reverse_dep_invariant(docs: &AnalyzedDocuments) {
        let map = docs.docs.read().unwrap();
        // Every dependency edge has its reverse edge...
        for (uri, doc) in map.iter() {
            if let Some(summary) = &doc.summary {
                for dep in &summary.dependencies {
                    assert!(
                        map[dep].reverse_deps.contains(uri),
                        "missing reverse edge {dep} -> {uri}"
                    );
                }
            }
        }
        // ...and no reverse edge lacks its dependency edge.
        for (uri, doc) in map.iter() {
            for rev in &doc.reverse_deps {
                let summary = map[rev].summary.as_ref().expect("rev dep must have summary");
                assert!(
                    summary.dependencies.contains(uri),
                    "stale reverse edge {uri} -> {rev}"
                );
            }
        }
    }

    #[test]
    fn update_after_analysis_maintains_reverse_deps() {
        let docs = AnalyzedDocuments::default();
        let a = url("file:///a.toit");

        let bits = docs.update_after_analysis(&a, 1, module("file:///a.toit", &["file:///b.toit"]), 0);
        assert_eq!(bits, SUMMARY_CHANGED_EXTERNALLY | FIRST_ANALYSIS_AFTER_CONTENT_CHANGE);
        assert_reverse_dep_invariant(&docs);
        assert!(docs
            .reverse_dependencies(&url("file:///b.toit"))
            .contains(&a));

        // Dependency moves from b to c.
        let bits = docs.update_after_analysis(&a, 2, module("file:///a.toit", &["file:///c.toit"]), 0);
        assert_eq!(bits & SUMMARY_CHANGED_EXTERNALLY, SUMMARY_CHANGED_EXTERNALLY);
        assert_reverse_dep_invariant(&docs);
        assert!(docs.reverse_dependencies(&url("file:///b.toit")).is_empty());
        assert!(docs
            .reverse_dependencies(&url("file:///c.toit"))
            .contains(&a));
    }

    #[test]
    fn stale_analyses_lose() {
        let docs = AnalyzedDocuments::default();
        let a = url("file:///a.toit");
        docs.update_after_analysis(&a, 5, module("file:///a.toit", &[]), 0);
        let bits = docs.update_after_analysis(&a, 3, module("file:///a.toit", &["file:///b.toit"]), 0);
        assert_eq!(bits, 0);
        assert_eq!(docs.analysis_revision(&a), 5);
        assert!(docs.reverse_dependencies(&url("file:///b.toit")).is_empty());
    }

    #[test]
    fn unchanged_summaries_set_no_external_bit() {
        let docs = AnalyzedDocuments::default();
        let a = url("file:///a.toit");
        docs.update_after_analysis(&a, 1, module("file:///a.toit", &[]), 0);
        let bits = docs.update_after_analysis(&a, 2, module("file:///a.toit", &[]), 0);
        assert_eq!(bits, 0);
        assert_eq!(docs.analysis_revision(&a), 2);
    }

    #[test]
    fn first_analysis_bit_tracks_content_revision() {
        let docs = AnalyzedDocuments::default();
        let a = url("file:///a.toit");
        // Analysis at revision 2 covers content revision 2.
        let bits = docs.update_after_analysis(&a, 2, module("file:///a.toit", &[]), 2);
        assert_ne!(bits & FIRST_ANALYSIS_AFTER_CONTENT_CHANGE, 0);
        // A newer edit (content revision 5) isn't covered by revision 3.
        let bits = docs.update_after_analysis(&a, 3, module("file:///a.toit", &["file:///x.toit"]), 5);
        assert_eq!(bits & FIRST_ANALYSIS_AFTER_CONTENT_CHANGE, 0);
    }

    #[test]
    fn requested_by_revision_uses_compare_and_set() {
        let docs = AnalyzedDocuments::default();
        let a = url("file:///a.toit");
        docs.set_analysis_requested_by_revision(&a, -1, 4);
        assert_eq!(docs.analysis_requested_by_revision(&a), 4);
        // Wrong expectation leaves the marker alone.
        docs.set_analysis_requested_by_revision(&a, 2, -1);
        assert_eq!(docs.analysis_requested_by_revision(&a), 4);
        docs.set_analysis_requested_by_revision(&a, 4, -1);
        assert_eq!(docs.analysis_requested_by_revision(&a), -1);
    }

    #[test]
    fn delete_unlinks_from_every_project() {
        let documents = Documents::new();
        let a = url("file:///a.toit");
        let p1 = url("file:///proj1");
        let p2 = url("file:///proj2");
        documents.open(&a, Some("content".to_string()), 1);
        documents
            .analyzed_documents(&p1)
            .update_after_analysis(&a, 1, module("file:///a.toit", &["file:///b.toit"]), 1);
        documents
            .analyzed_documents(&p2)
            .update_after_analysis(&a, 1, module("file:///a.toit", &[]), 1);

        assert_eq!(documents.project_uris_containing(&a).len(), 2);
        documents.delete(&a);
        assert!(!documents.is_open(&a));
        assert!(documents.project_uris_containing(&a).is_empty());
        assert!(documents
            .analyzed_documents(&p1)
            .reverse_dependencies(&url("file:///b.toit"))
            .is_empty());
    }

    #[test]
    fn recompute_refreshes_documents_sharing_the_old_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(root.join("src")).unwrap();
        let doc_a = toitlsp_compiler::uri::path_to_uri(
            &root.join("src/a.toit").to_string_lossy(),
        )
        .unwrap();
        let doc_b = toitlsp_compiler::uri::path_to_uri(
            &root.join("src/b.toit").to_string_lossy(),
        )
        .unwrap();

        let documents = Documents::new();
        let before_a = documents.project_uri_for(&doc_a, false);
        let before_b = documents.project_uri_for(&doc_b, false);
        assert_eq!(before_a, before_b);

        // A package file appears: the project root moves down to `ws`.
        std::fs::write(root.join("package.yaml"), "name: ws\n").unwrap();
        let after_a = documents.project_uri_for(&doc_a, true);
        assert_ne!(after_a, before_a);
        // The sibling shared the stale project and was recomputed too.
        let after_b = documents.project_uri_for(&doc_b, false);
        assert_eq!(after_a, after_b);
    }

    #[test]
    fn open_update_clear_close_lifecycle() {
        let documents = Documents::new();
        let a = url("file:///a.toit");
        documents.open(&a, Some("v1".to_string()), 1);
        assert_eq!(documents.content(&a).as_deref(), Some("v1"));
        documents.update(&a, "v2".to_string(), 2);
        assert_eq!(documents.content_revision(&a), 2);
        documents.clear_content(&a);
        assert!(documents.content(&a).is_none());
        assert!(documents.is_open(&a));
        documents.close(&a);
        assert!(!documents.is_open(&a));
    }
}
