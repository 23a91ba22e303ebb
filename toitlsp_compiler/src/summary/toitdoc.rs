//! Toitdoc contents attached to summary elements.

use tower_lsp::lsp_types::Url;

#[derive(Debug, Clone)]
pub struct DocContents {
    pub sections: Vec<DocSection>,
}

#[derive(Debug, Clone)]
pub struct DocSection {
    pub title: String,
    pub statements: Vec<DocStatement>,
}

#[derive(Debug, Clone)]
pub enum DocStatement {
    CodeSection { text: String },
    Itemized { items: Vec<DocItem> },
    Paragraph { expressions: Vec<DocExpression> },
}

#[derive(Debug, Clone)]
pub struct DocItem {
    pub statements: Vec<DocStatement>,
}

#[derive(Debug, Clone)]
pub enum DocExpression {
    Text(String),
    Code(String),
    Reference(DocReference),
}

/// What a toitdoc `$ref` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DocReferenceKind {
    Other,
    Class,
    Global,
    GlobalMethod,
    StaticMethod,
    Constructor,
    Factory,
    Method,
    Field,
}

impl DocReferenceKind {
    pub fn from_wire(value: i64) -> Option<DocReferenceKind> {
        Some(match value {
            0 => DocReferenceKind::Other,
            1 => DocReferenceKind::Class,
            2 => DocReferenceKind::Global,
            3 => DocReferenceKind::GlobalMethod,
            4 => DocReferenceKind::StaticMethod,
            5 => DocReferenceKind::Constructor,
            6 => DocReferenceKind::Factory,
            7 => DocReferenceKind::Method,
            8 => DocReferenceKind::Field,
            _ => return None,
        })
    }

    pub fn is_method_reference(self) -> bool {
        DocReferenceKind::GlobalMethod <= self && self <= DocReferenceKind::Method
    }

    /// Static methods and everything below them are scoped to a holder
    /// class whose name travels with the reference.
    pub fn has_holder(self) -> bool {
        self >= DocReferenceKind::StaticMethod
    }
}

#[derive(Debug, Clone)]
pub struct DocReference {
    pub text: String,
    pub kind: DocReferenceKind,
    pub module_uri: Option<Url>,
    pub holder: Option<String>,
    pub name: String,
    pub shape: Option<DocShape>,
}

/// Shape disambiguating overloaded method references. Optionality is
/// already resolved at this stage; all parameters count as required.
#[derive(Debug, Clone)]
pub struct DocShape {
    pub arity: i64,
    pub total_block_count: i64,
    pub named_block_count: i64,
    pub is_setter: bool,
    /// Non-block names first, each group alphabetical.
    pub names: Vec<String>,
}
