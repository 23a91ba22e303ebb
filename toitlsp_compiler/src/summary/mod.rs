//! Typed module summaries produced by the compiler.
//!
//! A summary describes everything other modules can see of a module:
//! dependencies, exports, classes with their members, top-level functions
//! and globals. Source ranges are byte offsets into the module's content;
//! [`Lines`] converts them to LSP positions on demand.
//!
//! "External equality" compares only the parts visible to dependent
//! modules. Positions and toitdoc text do not participate, so a comment
//! edit does not invalidate importers.

mod toitdoc;

pub mod text;

pub use toitdoc::{
    DocContents, DocExpression, DocItem, DocReference, DocReferenceKind, DocSection, DocShape,
    DocStatement,
};

use tower_lsp::lsp_types::{self as lsp, Url};

#[derive(Debug, Clone)]
pub struct Module {
    pub uri: Url,
    pub dependencies: Vec<Url>,
    pub exported_modules: Vec<Url>,
    pub exports: Vec<Export>,
    pub classes: Vec<Class>,
    pub functions: Vec<Method>,
    pub globals: Vec<Method>,
    pub toitdoc: Option<DocContents>,
}

/// A class, top-level function or global, addressed by its local id.
#[derive(Debug, Clone, Copy)]
pub enum TopLevelElement<'a> {
    Class(&'a Class),
    Function(&'a Method),
    Global(&'a Method),
}

impl Module {
    /// Resolves a local id into the classes ++ functions ++ globals
    /// sequence. The first class has id 0.
    pub fn top_level_element_by_id(&self, id: i64) -> Option<TopLevelElement<'_>> {
        let mut i = usize::try_from(id).ok()?;
        if i < self.classes.len() {
            return Some(TopLevelElement::Class(&self.classes[i]));
        }
        i -= self.classes.len();
        if i < self.functions.len() {
            return Some(TopLevelElement::Function(&self.functions[i]));
        }
        i -= self.functions.len();
        self.globals.get(i).map(TopLevelElement::Global)
    }

    pub fn equals_external(&self, other: &Module) -> bool {
        self.uri == other.uri
            && self.dependencies == other.dependencies
            && self.exported_modules == other.exported_modules
            && slices_equal(&self.exports, &other.exports, Export::equals_external)
            && slices_equal(&self.classes, &other.classes, Class::equals_external)
            && slices_equal(&self.functions, &other.functions, Method::equals_external)
            && slices_equal(&self.globals, &other.globals, Method::equals_external)
    }

    /// Document symbols for this module, with member children under their
    /// classes. `content` is the module source the ranges refer to.
    pub fn document_symbols(&self, content: &str) -> Vec<lsp::DocumentSymbol> {
        let mut lines = Lines::new(content);
        let mut res = Vec::new();
        for class in &self.classes {
            res.push(class.document_symbol(&mut lines));
        }
        for function in &self.functions {
            res.push(function.document_symbol(&mut lines));
        }
        for global in &self.globals {
            res.push(global.document_symbol(&mut lines));
        }
        res
    }
}

fn slices_equal<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

/// Byte-offset range within a module's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    fn lsp_range(&self, lines: &mut Lines) -> lsp::Range {
        lsp::Range {
            start: lines.lsp_position(self.start),
            end: lines.lsp_position(self.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Ambiguous,
    Nodes,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub references: Vec<TopLevelReference>,
}

impl Export {
    pub fn equals_external(&self, other: &Export) -> bool {
        self.name == other.name && self.kind == other.kind && self.references == other.references
    }
}

/// Reference to a top-level element in some module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopLevelReference {
    pub module: Url,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Any,
    None,
    Block,
    Class(TopLevelReference),
}

impl Type {
    pub fn is_block(&self) -> bool {
        matches!(self, Type::Block)
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub range: Range,
    pub toplevel_id: i64,
    pub is_interface: bool,
    pub is_abstract: bool,
    pub super_class: Option<TopLevelReference>,
    pub interfaces: Vec<TopLevelReference>,
    pub statics: Vec<Method>,
    pub constructors: Vec<Method>,
    pub factories: Vec<Method>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub toitdoc: Option<DocContents>,
}

impl Class {
    pub fn equals_external(&self, other: &Class) -> bool {
        self.name == other.name
            && self.is_interface == other.is_interface
            && self.is_abstract == other.is_abstract
            && self.super_class == other.super_class
            && self.interfaces == other.interfaces
            && slices_equal(&self.statics, &other.statics, Method::equals_external)
            && slices_equal(&self.constructors, &other.constructors, Method::equals_external)
            && slices_equal(&self.factories, &other.factories, Method::equals_external)
            && slices_equal(&self.fields, &other.fields, Field::equals_external)
            && slices_equal(&self.methods, &other.methods, Method::equals_external)
    }

    fn document_symbol(&self, lines: &mut Lines) -> lsp::DocumentSymbol {
        let mut children = Vec::new();
        for methods in [&self.statics, &self.constructors, &self.factories, &self.methods] {
            for m in methods.iter().filter(|m| !m.is_synthetic) {
                children.push(m.document_symbol(lines));
            }
        }
        for f in &self.fields {
            children.push(f.document_symbol(lines));
        }
        let kind = if self.is_interface {
            lsp::SymbolKind::INTERFACE
        } else {
            lsp::SymbolKind::CLASS
        };
        document_symbol(&self.name, None, kind, self.range.lsp_range(lines), children)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Instance,
    GlobalFunction,
    Global,
    Constructor,
    Factory,
}

impl MethodKind {
    fn symbol_kind(self) -> lsp::SymbolKind {
        match self {
            MethodKind::Instance => lsp::SymbolKind::METHOD,
            MethodKind::GlobalFunction => lsp::SymbolKind::FUNCTION,
            MethodKind::Global => lsp::SymbolKind::VARIABLE,
            MethodKind::Constructor | MethodKind::Factory => lsp::SymbolKind::CONSTRUCTOR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub range: Range,
    /// Local id for top-level functions and globals, `-1` for members.
    pub toplevel_id: i64,
    pub kind: MethodKind,
    pub parameters: Vec<Parameter>,
    pub return_type: Type,
    pub is_synthetic: bool,
    pub is_abstract: bool,
    pub toitdoc: Option<DocContents>,
}

impl Method {
    pub fn equals_external(&self, other: &Method) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.is_abstract == other.is_abstract
            && slices_equal(&self.parameters, &other.parameters, Parameter::equals_external)
            && self.return_type == other.return_type
    }

    fn document_symbol(&self, lines: &mut Lines) -> lsp::DocumentSymbol {
        let mut params = Vec::new();
        for p in &self.parameters {
            let mut param = p.name.clone();
            if p.is_named {
                param = format!("--{param}");
            }
            if !p.is_required {
                param.push('=');
            }
            if p.type_.is_block() {
                param = format!("[{param}]");
            }
            params.push(param);
        }
        document_symbol(
            &self.name,
            Some(params.join(" ")),
            self.kind.symbol_kind(),
            self.range.lsp_range(lines),
            Vec::new(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub range: Range,
    pub is_final: bool,
    pub type_: Type,
    pub toitdoc: Option<DocContents>,
}

impl Field {
    pub fn equals_external(&self, other: &Field) -> bool {
        self.name == other.name && self.is_final == other.is_final && self.type_ == other.type_
    }

    fn document_symbol(&self, lines: &mut Lines) -> lsp::DocumentSymbol {
        document_symbol(
            &self.name,
            None,
            lsp::SymbolKind::FIELD,
            self.range.lsp_range(lines),
            Vec::new(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub original_index: i64,
    pub is_required: bool,
    pub is_named: bool,
    pub type_: Type,
}

impl Parameter {
    pub fn equals_external(&self, other: &Parameter) -> bool {
        self.name == other.name
            && self.is_required == other.is_required
            && self.is_named == other.is_named
            && self.type_ == other.type_
    }
}

fn symbol_name(name: &str) -> String {
    if name.is_empty() {
        // The compiler emits empty names for error nodes.
        "<Error>".to_string()
    } else {
        name.to_string()
    }
}

#[allow(deprecated)] // DocumentSymbol::deprecated must be initialized.
fn document_symbol(
    name: &str,
    detail: Option<String>,
    kind: lsp::SymbolKind,
    range: lsp::Range,
    children: Vec<lsp::DocumentSymbol>,
) -> lsp::DocumentSymbol {
    lsp::DocumentSymbol {
        name: symbol_name(name),
        detail,
        kind,
        tags: None,
        deprecated: None,
        range,
        selection_range: range,
        children: if children.is_empty() { None } else { Some(children) },
    }
}

/// Line-offset table converting byte offsets to LSP positions. Lookups
/// remember their last hit since ranges usually arrive in source order.
pub struct Lines {
    offsets: Vec<usize>,
    total: usize,
    last_hit: usize,
}

impl Lines {
    pub fn new(content: &str) -> Self {
        let mut offsets = vec![0];
        for (i, b) in content.bytes().enumerate() {
            if b == b'\n' {
                offsets.push(i + 1);
            }
        }
        Lines {
            offsets,
            total: content.len(),
            last_hit: 0,
        }
    }

    pub fn lsp_position(&mut self, offset: i64) -> lsp::Position {
        if offset < 0 || offset as usize >= self.total {
            return lsp::Position::default();
        }
        let offset = offset as usize;
        let from = if self.offsets[self.last_hit] <= offset {
            self.last_hit
        } else {
            0
        };
        let idx = from + last_le_index(&self.offsets[from..], offset);
        self.last_hit = idx;
        lsp::Position {
            line: idx as u32,
            character: (offset - self.offsets[idx]) as u32,
        }
    }
}

/// Greatest index whose element is `<= needle`. `arr` must be sorted and
/// start at or below `needle`.
pub(crate) fn last_le_index(arr: &[usize], needle: usize) -> usize {
    arr.partition_point(|&x| x <= needle).saturating_sub(1)
}
