//! Parser for the compiler's textual summary format.
//!
//! The format is positional and line-oriented: counts announce how many
//! records follow, and strings that may contain newlines are size
//! prefixed. Cross-module references arrive as global ids; a header table
//! mapping each module to its top-level offset resolves them to
//! `(module, local-id)` pairs.

use std::collections::HashMap;
use std::io::BufRead;

use tower_lsp::lsp_types::Url;

use crate::error::ParseError;
use crate::lineio::{read_count, read_int, read_line, read_sized, read_uri};
use crate::summary::{
    Class, DocContents, DocExpression, DocItem, DocReference, DocReferenceKind, DocSection,
    DocShape, DocStatement, Export, ExportKind, Field, Method, MethodKind, Module, Parameter,
    Range, TopLevelReference, Type,
};

/// Parses the summary block that follows a `SUMMARY` line.
pub fn parse_summaries(reader: &mut impl BufRead) -> Result<HashMap<Url, Module>, ParseError> {
    SummaryReader::new(reader).read_all()
}

struct SummaryReader<'a, R: BufRead> {
    reader: &'a mut R,
    module_uris: Vec<Url>,
    toplevel_offsets: Vec<i64>,
    curr_module: usize,
    curr_toplevel: i64,
}

impl<'a, R: BufRead> SummaryReader<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        SummaryReader {
            reader,
            module_uris: Vec::new(),
            toplevel_offsets: Vec::new(),
            curr_module: 0,
            curr_toplevel: 0,
        }
    }

    fn read_all(mut self) -> Result<HashMap<Url, Module>, ParseError> {
        let module_count = read_count(self.reader)?;
        let mut offset = 0;
        for _ in 0..module_count {
            let uri = read_uri(self.reader)?;
            self.module_uris.push(uri);
            self.toplevel_offsets.push(offset);
            offset += read_int(self.reader)?;
        }

        let mut res = HashMap::with_capacity(module_count);
        for i in 0..module_count {
            self.curr_module = i;
            let module = self.read_module()?;
            res.insert(module.uri.clone(), module);
        }
        Ok(res)
    }

    fn read_module(&mut self) -> Result<Module, ParseError> {
        self.curr_toplevel = 0;
        let uri = read_uri(self.reader)?;
        if uri != self.module_uris[self.curr_module] {
            return Err(ParseError::malformed(format!(
                "module uri did not match header: header '{}', body '{}'",
                self.module_uris[self.curr_module], uri
            )));
        }

        let dependencies = self.read_uris()?;
        let exported_modules = self.read_uris()?;
        let exports = self.read_exports()?;
        // Declaration order defines the local ids: classes first, then
        // top-level functions, then globals.
        let classes = self.read_classes()?;
        let functions = self.read_method_list()?;
        let globals = self.read_method_list()?;
        let toitdoc = self.read_toitdoc()?;

        Ok(Module {
            uri,
            dependencies,
            exported_modules,
            exports,
            classes,
            functions,
            globals,
            toitdoc,
        })
    }

    fn read_uris(&mut self) -> Result<Vec<Url>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            res.push(read_uri(self.reader)?);
        }
        Ok(res)
    }

    fn read_exports(&mut self) -> Result<Vec<Export>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_line(self.reader)?;
            let kind = if read_line(self.reader)? == "AMBIGUOUS" {
                ExportKind::Ambiguous
            } else {
                ExportKind::Nodes
            };
            let references = self.read_references()?;
            res.push(Export {
                name,
                kind,
                references,
            });
        }
        Ok(res)
    }

    fn read_classes(&mut self) -> Result<Vec<Class>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            res.push(self.read_class()?);
        }
        Ok(res)
    }

    fn read_class(&mut self) -> Result<Class, ParseError> {
        let toplevel_id = self.curr_toplevel;
        self.curr_toplevel += 1;

        let name = read_line(self.reader)?;
        let range = self.read_range()?;
        let global_id = read_int(self.reader)?;
        let asserted = toplevel_id + self.toplevel_offsets[self.curr_module];
        if global_id != asserted {
            return Err(ParseError::malformed(format!(
                "class global id {global_id} does not match expected {asserted}"
            )));
        }

        let kind = read_line(self.reader)?;
        Ok(Class {
            name,
            range,
            toplevel_id,
            is_interface: kind == "interface",
            is_abstract: kind == "abstract",
            super_class: self.read_optional_reference()?,
            interfaces: self.read_references()?,
            statics: self.read_method_list()?,
            constructors: self.read_method_list()?,
            factories: self.read_method_list()?,
            fields: self.read_fields()?,
            methods: self.read_method_list()?,
            toitdoc: self.read_toitdoc()?,
        })
    }

    fn read_fields(&mut self) -> Result<Vec<Field>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_line(self.reader)?;
            let range = self.read_range()?;
            let is_final = read_line(self.reader)? == "final";
            let type_ = self.read_type()?;
            let toitdoc = self.read_toitdoc()?;
            res.push(Field {
                name,
                range,
                is_final,
                type_,
                toitdoc,
            });
        }
        Ok(res)
    }

    fn read_method_list(&mut self) -> Result<Vec<Method>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            res.push(self.read_method()?);
        }
        Ok(res)
    }

    fn read_method(&mut self) -> Result<Method, ParseError> {
        let name = read_line(self.reader)?;
        let range = self.read_range()?;
        let global_id = read_int(self.reader)?;
        let mut toplevel_id = global_id;
        if toplevel_id != -1 {
            toplevel_id -= self.toplevel_offsets[self.curr_module];
        }

        let kind_word = read_line(self.reader)?;
        let mut is_synthetic = false;
        let mut is_abstract = false;
        let kind = match kind_word.as_str() {
            "instance" | "abstract" | "field stub" => {
                is_abstract = kind_word == "abstract";
                is_synthetic = kind_word == "field stub";
                if global_id != -1 {
                    return Err(ParseError::malformed(format!(
                        "global id for an instance method should be -1 but was {global_id}"
                    )));
                }
                MethodKind::Instance
            }
            "global fun" => {
                // Id -1 marks a class-static; only true top-levels
                // consume a local id.
                if global_id != -1 {
                    self.check_toplevel_id(toplevel_id, "global function")?;
                }
                MethodKind::GlobalFunction
            }
            "global initializer" => {
                if global_id != -1 {
                    self.check_toplevel_id(toplevel_id, "global")?;
                }
                MethodKind::Global
            }
            "constructor" | "default constructor" => {
                is_synthetic = kind_word == "default constructor";
                if global_id != -1 {
                    return Err(ParseError::malformed(format!(
                        "global id for a constructor should be -1 but was {global_id}"
                    )));
                }
                MethodKind::Constructor
            }
            "factory" => {
                if global_id != -1 {
                    return Err(ParseError::malformed(format!(
                        "global id for a factory should be -1 but was {global_id}"
                    )));
                }
                MethodKind::Factory
            }
            other => {
                return Err(ParseError::malformed(format!("unknown method kind: {other}")));
            }
        };

        Ok(Method {
            name,
            range,
            toplevel_id,
            kind,
            parameters: self.read_parameters()?,
            return_type: self.read_type()?,
            is_synthetic,
            is_abstract,
            toitdoc: self.read_toitdoc()?,
        })
    }

    fn check_toplevel_id(&mut self, id: i64, what: &str) -> Result<(), ParseError> {
        if self.curr_toplevel != id {
            return Err(ParseError::malformed(format!(
                "local id for the {what} did not match: was {id}, should have been {}",
                self.curr_toplevel
            )));
        }
        self.curr_toplevel += 1;
        Ok(())
    }

    fn read_parameters(&mut self) -> Result<Vec<Parameter>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_line(self.reader)?;
            let original_index = read_int(self.reader)?;
            let kind = read_line(self.reader)?;
            let is_required = kind == "required" || kind == "required named";
            let is_named = kind == "required named" || kind == "optional named";
            let type_ = self.read_type()?;
            res.push(Parameter {
                name,
                original_index,
                is_required,
                is_named,
                type_,
            });
        }
        Ok(res)
    }

    fn read_type(&mut self) -> Result<Type, ParseError> {
        let line = read_line(self.reader)?;
        if line == "[block]" {
            return Ok(Type::Block);
        }
        let id: i64 = line
            .parse()
            .map_err(|_| ParseError::malformed(format!("invalid type id '{line}'")))?;
        match id {
            -1 => Ok(Type::Any),
            -2 => Ok(Type::None),
            _ => Ok(Type::Class(self.reference_from_global_id(id)?)),
        }
    }

    fn reference_from_global_id(&self, id: i64) -> Result<TopLevelReference, ParseError> {
        if id < 0 {
            return Err(ParseError::malformed(format!(
                "global id must be non-negative, was {id}"
            )));
        }
        let idx = self
            .toplevel_offsets
            .partition_point(|&offset| offset <= id)
            .saturating_sub(1);
        Ok(TopLevelReference {
            module: self.module_uris[idx].clone(),
            id: id - self.toplevel_offsets[idx],
        })
    }

    fn read_references(&mut self) -> Result<Vec<TopLevelReference>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            match self.read_optional_reference()? {
                Some(r) => res.push(r),
                None => {
                    return Err(ParseError::malformed(
                        "negative global id in reference list",
                    ));
                }
            }
        }
        Ok(res)
    }

    fn read_optional_reference(&mut self) -> Result<Option<TopLevelReference>, ParseError> {
        let id = read_int(self.reader)?;
        if id < 0 {
            return Ok(None);
        }
        Ok(Some(self.reference_from_global_id(id)?))
    }

    fn read_range(&mut self) -> Result<Range, ParseError> {
        let start = read_int(self.reader)?;
        let end = read_int(self.reader)?;
        Ok(Range { start, end })
    }

    fn read_toitdoc(&mut self) -> Result<Option<DocContents>, ParseError> {
        let sections = self.read_doc_sections()?;
        if sections.is_empty() {
            return Ok(None);
        }
        Ok(Some(DocContents { sections }))
    }

    fn read_doc_sections(&mut self) -> Result<Vec<DocSection>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            let title = read_sized(self.reader)?;
            let statements = self.read_doc_statements()?;
            res.push(DocSection { title, statements });
        }
        Ok(res)
    }

    fn read_doc_statements(&mut self) -> Result<Vec<DocStatement>, ParseError> {
        let count = read_count(self.reader)?;
        let mut res = Vec::with_capacity(count);
        for _ in 0..count {
            res.push(self.read_doc_statement()?);
        }
        Ok(res)
    }

    fn read_doc_statement(&mut self) -> Result<DocStatement, ParseError> {
        let kind = read_line(self.reader)?;
        match kind.as_str() {
            "CODE SECTION" => Ok(DocStatement::CodeSection {
                text: read_sized(self.reader)?,
            }),
            "ITEMIZED" => {
                let count = read_count(self.reader)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let item_kind = read_line(self.reader)?;
                    if item_kind != "ITEM" {
                        return Err(ParseError::malformed(format!(
                            "unknown item format: {item_kind}"
                        )));
                    }
                    items.push(DocItem {
                        statements: self.read_doc_statements()?,
                    });
                }
                Ok(DocStatement::Itemized { items })
            }
            "PARAGRAPH" => {
                let count = read_count(self.reader)?;
                let mut expressions = Vec::with_capacity(count);
                for _ in 0..count {
                    expressions.push(self.read_doc_expression()?);
                }
                Ok(DocStatement::Paragraph { expressions })
            }
            other => Err(ParseError::malformed(format!(
                "unknown statement kind: {other}"
            ))),
        }
    }

    fn read_doc_expression(&mut self) -> Result<DocExpression, ParseError> {
        let kind = read_line(self.reader)?;
        match kind.as_str() {
            "TEXT" => Ok(DocExpression::Text(read_sized(self.reader)?)),
            "CODE" => Ok(DocExpression::Code(read_sized(self.reader)?)),
            "REF" => Ok(DocExpression::Reference(self.read_doc_reference()?)),
            other => Err(ParseError::malformed(format!(
                "unknown expression kind: {other}"
            ))),
        }
    }

    fn read_doc_reference(&mut self) -> Result<DocReference, ParseError> {
        let text = read_sized(self.reader)?;
        let kind_value = read_int(self.reader)?;
        let kind = match DocReferenceKind::from_wire(kind_value) {
            Some(kind) => kind,
            None if kind_value < 0 => DocReferenceKind::Other,
            None => {
                return Err(ParseError::malformed(format!(
                    "invalid reference kind: {kind_value}"
                )));
            }
        };
        if kind == DocReferenceKind::Other {
            return Ok(DocReference {
                text,
                kind,
                module_uri: None,
                holder: None,
                name: String::new(),
                shape: None,
            });
        }

        let module_uri = Some(read_uri(self.reader)?);
        let holder = if kind.has_holder() {
            Some(read_sized(self.reader)?)
        } else {
            None
        };
        let name = read_sized(self.reader)?;
        let shape = if kind.is_method_reference() {
            Some(self.read_doc_shape()?)
        } else {
            None
        };
        Ok(DocReference {
            text,
            kind,
            module_uri,
            holder,
            name,
            shape,
        })
    }

    fn read_doc_shape(&mut self) -> Result<DocShape, ParseError> {
        let arity = read_int(self.reader)?;
        let total_block_count = read_int(self.reader)?;
        let names_count = read_count(self.reader)?;
        let named_block_count = read_int(self.reader)?;
        let is_setter = read_line(self.reader)? == "setter";
        let mut names = Vec::with_capacity(names_count);
        for _ in 0..names_count {
            names.push(read_sized(self.reader)?);
        }
        Ok(DocShape {
            arity,
            total_block_count,
            named_block_count,
            is_setter,
            names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use std::io::Cursor;

    struct Emitter {
        out: String,
    }

    impl Emitter {
        fn new() -> Self {
            Emitter { out: String::new() }
        }

        fn line(&mut self, s: &str) -> &mut Self {
            writeln!(self.out, "{s}").unwrap();
            self
        }

        fn int(&mut self, n: i64) -> &mut Self {
            writeln!(self.out, "{n}").unwrap();
            self
        }

        fn sized(&mut self, s: &str) -> &mut Self {
            writeln!(self.out, "{}", s.len()).unwrap();
            writeln!(self.out, "{s}").unwrap();
            self
        }

        /// Empty method with the given name, kind word and global id.
        fn method(&mut self, name: &str, kind: &str, global_id: i64) -> &mut Self {
            self.line(name).int(0).int(name.len() as i64).int(global_id);
            self.line(kind);
            self.int(0); // parameters
            self.int(-1); // return type: any
            self.int(0); // toitdoc sections
            self
        }
    }

    fn parse(text: &str) -> HashMap<Url, Module> {
        parse_summaries(&mut Cursor::new(text.as_bytes())).unwrap()
    }

    fn single_module_header(e: &mut Emitter, path: &str, toplevel_count: i64) {
        e.int(1);
        e.line(path);
        e.int(toplevel_count);
        e.line(path);
        e.int(0); // dependencies
        e.int(0); // exported modules
        e.int(0); // exports
    }

    #[test]
    fn parses_a_minimal_module() {
        let mut e = Emitter::new();
        single_module_header(&mut e, "/m.toit", 1);
        e.int(0); // classes
        e.int(1); // functions
        e.method("main", "global fun", 0);
        e.int(0); // globals
        e.int(0); // module toitdoc

        let modules = parse(&e.out);
        let module = modules.values().next().unwrap();
        assert_eq!(module.uri.as_str(), "file:///m.toit");
        assert_eq!(module.functions.len(), 1);
        let main = &module.functions[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.kind, MethodKind::GlobalFunction);
        assert_eq!(main.toplevel_id, 0);
        assert_eq!(main.return_type, Type::Any);
    }

    #[test]
    fn resolves_global_ids_across_modules() {
        // Module 0 declares 3 top-levels, module 1 declares 2. A type
        // reference with global id 4 must land in module 1, local id 1.
        let mut e = Emitter::new();
        e.int(2);
        e.line("/a.toit").int(3);
        e.line("/b.toit").int(2);

        // Module /a.toit: three functions, the last taking a parameter
        // typed by global id 4 and returning global id 2.
        e.line("/a.toit").int(0).int(0).int(0);
        e.int(0); // classes
        e.int(3);
        e.method("f0", "global fun", 0);
        e.method("f1", "global fun", 1);
        e.line("f2").int(0).int(2).int(2).line("global fun");
        e.int(1); // one parameter
        e.line("x").int(0).line("required").int(4);
        e.int(2); // return type: global id 2
        e.int(0); // toitdoc
        e.int(0); // globals
        e.int(0); // module toitdoc

        // Module /b.toit: two functions.
        e.line("/b.toit").int(0).int(0).int(0);
        e.int(0);
        e.int(2);
        e.method("g0", "global fun", 3);
        e.method("g1", "global fun", 4);
        e.int(0);
        e.int(0);

        let modules = parse(&e.out);
        let a = &modules[&Url::parse("file:///a.toit").unwrap()];
        let f2 = &a.functions[2];
        match &f2.parameters[0].type_ {
            Type::Class(r) => {
                assert_eq!(r.module.as_str(), "file:///b.toit");
                assert_eq!(r.id, 1);
            }
            other => panic!("unexpected type {other:?}"),
        }
        match &f2.return_type {
            Type::Class(r) => {
                assert_eq!(r.module.as_str(), "file:///a.toit");
                assert_eq!(r.id, 2);
            }
            other => panic!("unexpected type {other:?}"),
        }
    }

    #[test]
    fn parses_classes_with_members() {
        let mut e = Emitter::new();
        single_module_header(&mut e, "/c.toit", 1);
        e.int(1); // one class
        e.line("Point").int(0).int(10).int(0); // name, range, global id
        e.line("class");
        e.int(-1); // no superclass
        e.int(0); // interfaces
        e.int(0); // statics
        e.int(1); // constructors
        e.method("constructor", "default constructor", -1);
        e.int(0); // factories
        e.int(1); // fields
        e.line("x").int(0).int(1).line("final").int(-1).int(0);
        e.int(1); // methods
        e.line("x=").int(0).int(1).int(-1).line("field stub");
        e.int(1);
        e.line("value").int(0).line("required").int(-1);
        e.int(-2); // returns none
        e.int(0); // toitdoc
        e.int(0); // class toitdoc
        e.int(0); // functions
        e.int(0); // globals
        e.int(0); // module toitdoc

        let modules = parse(&e.out);
        let module = modules.values().next().unwrap();
        let class = &module.classes[0];
        assert_eq!(class.name, "Point");
        assert!(!class.is_interface && !class.is_abstract);
        assert!(class.super_class.is_none());
        assert!(class.constructors[0].is_synthetic);
        assert!(class.fields[0].is_final);
        let stub = &class.methods[0];
        assert!(stub.is_synthetic);
        assert_eq!(stub.kind, MethodKind::Instance);
        assert_eq!(stub.return_type, Type::None);
    }

    #[test]
    fn parses_toitdoc_trees() {
        let mut e = Emitter::new();
        single_module_header(&mut e, "/d.toit", 0);
        e.int(0); // classes
        e.int(0); // functions
        e.int(0); // globals
        e.int(1); // module toitdoc: one section
        e.sized("Usage");
        e.int(2); // two statements
        e.line("PARAGRAPH");
        e.int(2);
        e.line("TEXT").sized("multi\nline text");
        e.line("REF").sized("some-fn");
        e.int(3); // global method reference
        e.line("/d.toit");
        e.sized("some-fn");
        e.int(2).int(0).int(1).int(0); // shape: arity 2, 1 name
        e.line("not-setter");
        e.sized("flag");
        e.line("CODE SECTION");
        e.sized("main: print 1");

        let modules = parse(&e.out);
        let doc = modules.values().next().unwrap().toitdoc.as_ref().unwrap();
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].title, "Usage");
        match &doc.sections[0].statements[0] {
            DocStatement::Paragraph { expressions } => {
                match &expressions[0] {
                    DocExpression::Text(t) => assert_eq!(t, "multi\nline text"),
                    other => panic!("unexpected expression {other:?}"),
                }
                match &expressions[1] {
                    DocExpression::Reference(r) => {
                        assert_eq!(r.kind, DocReferenceKind::GlobalMethod);
                        assert_eq!(r.name, "some-fn");
                        let shape = r.shape.as_ref().unwrap();
                        assert_eq!(shape.arity, 2);
                        assert_eq!(shape.names, vec!["flag"]);
                        assert!(!shape.is_setter);
                    }
                    other => panic!("unexpected expression {other:?}"),
                }
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn rejects_mismatched_class_ids() {
        let mut e = Emitter::new();
        single_module_header(&mut e, "/m.toit", 1);
        e.int(1);
        e.line("A").int(0).int(1).int(7); // global id 7, should be 0
        e.line("class");

        let err = parse_summaries(&mut Cursor::new(e.out.as_bytes())).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn external_round_trip_survives_non_external_noise() {
        // Two emissions of the same module that differ only in ranges and
        // toitdoc parse to externally equal summaries.
        let emit = |range_base: i64, with_doc: bool| {
            let mut e = Emitter::new();
            single_module_header(&mut e, "/m.toit", 1);
            e.int(0);
            e.int(1);
            e.line("run").int(range_base).int(range_base + 3).int(0);
            e.line("global fun");
            e.int(1);
            e.line("xs").int(0).line("optional named").line("[block]");
            e.int(-1);
            if with_doc {
                e.int(1);
                e.sized("");
                e.int(1);
                e.line("PARAGRAPH");
                e.int(1);
                e.line("TEXT").sized("docs");
            } else {
                e.int(0);
            }
            e.int(0);
            e.int(0);
            e.out
        };

        let a = parse(&emit(0, false));
        let b = parse(&emit(100, true));
        let uri = Url::parse("file:///m.toit").unwrap();
        assert!(a[&uri].equals_external(&b[&uri]));
    }
}
