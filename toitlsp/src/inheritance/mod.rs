//! Inheritance resolution over analyzed summaries.
//!
//! For every class this computes which super members stay visible
//! (inherited), and for every member which super members it shadows.
//! Shadowing can be partial: a subclass overload may only capture part
//! of a super member's arity range or named-parameter combinations. The
//! toitdoc exporter consumes the result; the engine itself does not
//! depend on it.

mod shadow;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tower_lsp::lsp_types::Url;

use toitlsp_compiler::summary::{Class, Module, TopLevelElement, TopLevelReference};

use shadow::{ShadowContext, ShapedMember};

/// Identifies a class by its module and local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassId {
    pub module: Url,
    pub id: i64,
}

impl ClassId {
    pub fn from_reference(reference: &TopLevelReference) -> Self {
        ClassId {
            module: reference.module.clone(),
            id: reference.id,
        }
    }
}

/// A method or field slot within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberSlot {
    Method(usize),
    Field(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId {
    pub class: ClassId,
    pub slot: MemberSlot,
}

impl MemberId {
    pub fn method(class: ClassId, index: usize) -> Self {
        MemberId {
            class,
            slot: MemberSlot::Method(index),
        }
    }

    pub fn field(class: ClassId, index: usize) -> Self {
        MemberId {
            class,
            slot: MemberSlot::Field(index),
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self.slot, MemberSlot::Field(_))
    }
}

/// A super member still visible in a subclass, with the members that
/// capture part of its call space.
#[derive(Debug, Clone)]
pub struct InheritedMember {
    pub member: MemberId,
    pub partially_shadowed_by: Vec<MemberId>,
}

#[derive(Debug, Default)]
pub struct InheritanceResult {
    /// Depth in the hierarchy; a class without superclass has depth 1.
    pub class_depth: HashMap<ClassId, usize>,
    pub inherited: HashMap<ClassId, Vec<InheritedMember>>,
    /// Per class, which super members each member shadows. The same
    /// member can shadow different super members at different points of
    /// the hierarchy, hence the class in the key.
    pub shadowed: HashMap<(ClassId, MemberId), Vec<MemberId>>,
}

/// Looks summary elements up by id.
pub(crate) struct Resolver<'a> {
    summaries: &'a HashMap<Url, Arc<Module>>,
}

impl Resolver<'_> {
    pub(crate) fn class(&self, id: &ClassId) -> Option<&Class> {
        match self.summaries.get(&id.module)?.top_level_element_by_id(id.id) {
            Some(TopLevelElement::Class(class)) => Some(class),
            _ => None,
        }
    }

    fn member_name(&self, member: &MemberId) -> Option<String> {
        let class = self.class(&member.class)?;
        match member.slot {
            MemberSlot::Method(i) => class.methods.get(i).map(|m| m.name.clone()),
            MemberSlot::Field(i) => class.fields.get(i).map(|f| f.name.clone()),
        }
    }
}

/// Computes inherited members and shadowing for every class in
/// `summaries`.
pub fn compute_inheritance(summaries: &HashMap<Url, Arc<Module>>) -> InheritanceResult {
    let resolver = Resolver { summaries };
    let mut computation = Computation {
        resolver: &resolver,
        done: HashSet::new(),
        result: InheritanceResult::default(),
    };

    for (uri, module) in summaries {
        for class in &module.classes {
            computation.do_class(&ClassId {
                module: uri.clone(),
                id: class.toplevel_id,
            });
        }
    }

    let mut result = computation.result;
    sort_result(&resolver, &mut result);
    result
}

struct Computation<'a> {
    resolver: &'a Resolver<'a>,
    done: HashSet<ClassId>,
    result: InheritanceResult,
}

impl Computation<'_> {
    fn do_class(&mut self, class_id: &ClassId) {
        if !self.done.insert(class_id.clone()) {
            return;
        }
        let resolver = self.resolver;
        let Some(class) = resolver.class(class_id) else {
            tracing::error!(?class_id, "class reference does not resolve");
            return;
        };

        let Some(super_ref) = &class.super_class else {
            self.result.class_depth.insert(class_id.clone(), 1);
            self.result.inherited.insert(class_id.clone(), Vec::new());
            return;
        };
        let super_id = ClassId::from_reference(super_ref);

        // The superclass first; its inherited list carries everything
        // visible above it, so one level of lookup suffices.
        self.do_class(&super_id);
        let super_depth = self.result.class_depth.get(&super_id).copied().unwrap_or(0);
        self.result
            .class_depth
            .insert(class_id.clone(), super_depth + 1);

        let super_shaped = self.super_members_by_name(&super_id);
        let cls_shaped = self.own_members_by_name(class_id);

        let InheritanceResult {
            class_depth,
            inherited: inherited_map,
            shadowed,
        } = &mut self.result;
        let context = ShadowContext {
            resolver,
            class_depth,
        };

        let mut inherited = Vec::new();
        for (name, super_members) in super_shaped {
            let cls_members: Vec<&ShapedMember> = cls_shaped
                .get(&name)
                .map(|members| members.iter().collect())
                .unwrap_or_default();
            if cls_members.is_empty() {
                // Nothing of that name here: everything stays visible.
                for super_member in super_members {
                    inherited.push(InheritedMember {
                        member: super_member.member,
                        partially_shadowed_by: super_member.old_overriders,
                    });
                }
                continue;
            }
            for super_member in super_members {
                let mut overridden_by: HashSet<MemberId> = HashSet::new();
                let fully = context.compute_override(
                    &super_member,
                    &super_member.old_overriders,
                    &cls_members,
                    &mut overridden_by,
                );
                let overridden_by: Vec<MemberId> = overridden_by.into_iter().collect();
                if !fully {
                    inherited.push(InheritedMember {
                        member: super_member.member.clone(),
                        partially_shadowed_by: overridden_by.clone(),
                    });
                }
                for overrider in overridden_by {
                    shadowed
                        .entry((class_id.clone(), overrider))
                        .or_default()
                        .push(super_member.member.clone());
                }
            }
        }
        inherited_map.insert(class_id.clone(), inherited);
    }

    /// Everything visible on the superclass: its own methods and fields
    /// plus its inherited members (flattened to their defining member,
    /// keeping the recorded partial shadowers).
    fn super_members_by_name(&self, super_id: &ClassId) -> HashMap<String, Vec<ShapedMember>> {
        let mut res: HashMap<String, Vec<ShapedMember>> = HashMap::new();
        if let Some(super_class) = self.resolver.class(super_id) {
            for i in 0..super_class.methods.len() {
                if let Some(shaped) = self.resolver.shaped(&MemberId::method(super_id.clone(), i)) {
                    res.entry(shaped.name.clone()).or_default().push(shaped);
                }
            }
            for i in 0..super_class.fields.len() {
                if let Some(shaped) = self.resolver.shaped(&MemberId::field(super_id.clone(), i)) {
                    res.entry(shaped.name.clone()).or_default().push(shaped);
                }
            }
        }
        if let Some(inherited) = self.result.inherited.get(super_id) {
            for entry in inherited {
                if let Some(mut shaped) = self.resolver.shaped(&entry.member) {
                    shaped.old_overriders = entry.partially_shadowed_by.clone();
                    res.entry(shaped.name.clone()).or_default().push(shaped);
                }
            }
        }
        res
    }

    fn own_members_by_name(&self, class_id: &ClassId) -> HashMap<String, Vec<ShapedMember>> {
        let mut res: HashMap<String, Vec<ShapedMember>> = HashMap::new();
        let Some(class) = self.resolver.class(class_id) else {
            return res;
        };
        for i in 0..class.methods.len() {
            if let Some(shaped) = self.resolver.shaped(&MemberId::method(class_id.clone(), i)) {
                res.entry(shaped.name.clone()).or_default().push(shaped);
            }
        }
        for i in 0..class.fields.len() {
            if let Some(shaped) = self.resolver.shaped(&MemberId::field(class_id.clone(), i)) {
                res.entry(shaped.name.clone()).or_default().push(shaped);
            }
        }
        res
    }
}

/// Deterministic output order: holder depth, methods before fields, then
/// name and shape.
fn sort_result(resolver: &Resolver<'_>, result: &mut InheritanceResult) {
    let depth = result.class_depth.clone();
    let less = |a: &MemberId, b: &MemberId| member_ordering(resolver, &depth, a, b);
    for inherited in result.inherited.values_mut() {
        inherited.sort_by(|a, b| less(&a.member, &b.member));
        for entry in inherited.iter_mut() {
            entry.partially_shadowed_by.sort_by(&less);
        }
    }
    for shadowed in result.shadowed.values_mut() {
        shadowed.sort_by(&less);
    }
}

fn member_ordering(
    resolver: &Resolver<'_>,
    depth: &HashMap<ClassId, usize>,
    a: &MemberId,
    b: &MemberId,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let depth_a = depth.get(&a.class).copied().unwrap_or(0);
    let depth_b = depth.get(&b.class).copied().unwrap_or(0);
    depth_a
        .cmp(&depth_b)
        .then_with(|| a.is_field().cmp(&b.is_field()))
        .then_with(|| {
            resolver
                .member_name(a)
                .unwrap_or_default()
                .cmp(&resolver.member_name(b).unwrap_or_default())
        })
        .then_with(|| {
            let (Some(sa), Some(sb)) = (resolver.shaped(a), resolver.shaped(b)) else {
                return Ordering::Equal;
            };
            shape_ordering(&sa, &sb)
        })
}

fn shape_ordering(a: &ShapedMember, b: &ShapedMember) -> std::cmp::Ordering {
    let (a, b) = (&a.shape, &b.shape);
    a.min_positional
        .cmp(&b.min_positional)
        .then(a.max_positional.cmp(&b.max_positional))
        .then(a.positional_block_count.cmp(&b.positional_block_count))
        .then(a.named.len().cmp(&b.named.len()))
        .then_with(|| {
            for (na, nb) in a.named.iter().zip(&b.named) {
                // Non-block first, optional first.
                let ord = na
                    .name
                    .cmp(&nb.name)
                    .then(na.is_block.cmp(&nb.is_block))
                    .then(nb.is_optional.cmp(&na.is_optional));
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use toitlsp_compiler::summary::{
        Class, Method, MethodKind, Module, Parameter, Range, Type,
    };

    fn module_uri() -> Url {
        Url::parse("file:///module.toit").unwrap()
    }

    /// Parses `foo x y= --named= [b]` into a method: postfix `=` marks
    /// optional, `--` marks named, brackets mark blocks.
    fn parse_method(text: &str) -> Method {
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap().to_string();
        let mut parameters = Vec::new();
        for (i, mut part) in parts.enumerate() {
            let mut type_ = Type::Any;
            if part.starts_with('[') {
                type_ = Type::Block;
                part = &part[1..part.len() - 1];
            }
            let mut part = part.to_string();
            let is_optional = part.ends_with('=');
            if is_optional {
                part.pop();
            }
            let is_named = part.starts_with("--");
            let name = part.trim_start_matches("--").to_string();
            parameters.push(Parameter {
                name,
                original_index: i as i64,
                is_required: !is_optional,
                is_named,
                type_,
            });
        }
        Method {
            name,
            range: Range::default(),
            toplevel_id: -1,
            kind: MethodKind::Instance,
            parameters,
            return_type: Type::Any,
            is_synthetic: false,
            is_abstract: false,
            toitdoc: None,
        }
    }

    /// Tiny class DSL: `class B extends A` headers followed by method
    /// lines.
    fn parse_summaries(text: &str) -> HashMap<Url, Arc<Module>> {
        fn finish(current: &mut Option<Class>, classes: &mut Vec<Class>, ids: &mut HashMap<String, i64>) {
            if let Some(class) = current.take() {
                ids.insert(class.name.clone(), class.toplevel_id);
                classes.push(class);
            }
        }

        let uri = module_uri();
        let mut classes: Vec<Class> = Vec::new();
        let mut ids: HashMap<String, i64> = HashMap::new();
        let mut current: Option<Class> = None;
        for line in text.lines() {
            let line = line.trim_end_matches(':');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("class ") {
                finish(&mut current, &mut classes, &mut ids);
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let super_class = if parts.len() > 2 {
                    assert_eq!(parts[1], "extends");
                    Some(TopLevelReference {
                        module: uri.clone(),
                        id: ids[parts[2]],
                    })
                } else {
                    None
                };
                current = Some(Class {
                    name: parts[0].to_string(),
                    range: Range::default(),
                    toplevel_id: classes.len() as i64,
                    is_interface: false,
                    is_abstract: false,
                    super_class,
                    interfaces: Vec::new(),
                    statics: Vec::new(),
                    constructors: Vec::new(),
                    factories: Vec::new(),
                    fields: Vec::new(),
                    methods: Vec::new(),
                    toitdoc: None,
                });
            } else {
                current
                    .as_mut()
                    .expect("method line before class header")
                    .methods
                    .push(parse_method(line));
            }
        }
        finish(&mut current, &mut classes, &mut ids);

        let mut summaries = HashMap::new();
        summaries.insert(
            uri.clone(),
            Arc::new(Module {
                uri,
                dependencies: Vec::new(),
                exported_modules: Vec::new(),
                exports: Vec::new(),
                classes,
                functions: Vec::new(),
                globals: Vec::new(),
                toitdoc: None,
            }),
        );
        summaries
    }

    fn class(index: i64) -> ClassId {
        ClassId {
            module: module_uri(),
            id: index,
        }
    }

    fn method(class_index: i64, method_index: usize) -> MemberId {
        MemberId::method(class(class_index), method_index)
    }

    fn shadowed<'a>(
        result: &'a InheritanceResult,
        cls: i64,
        member: MemberId,
    ) -> &'a [MemberId] {
        result
            .shadowed
            .get(&(class(cls), member))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[test]
    fn different_names_do_not_shadow() {
        let summaries = parse_summaries(
            "class A:\n  foo:\n\nclass B extends A:\n  bar:\n",
        );
        let result = compute_inheritance(&summaries);
        assert!(result.inherited[&class(0)].is_empty());
        let inherited_b = &result.inherited[&class(1)];
        assert_eq!(inherited_b.len(), 1);
        assert_eq!(inherited_b[0].member, method(0, 0));
        assert!(inherited_b[0].partially_shadowed_by.is_empty());
        assert!(result.shadowed.is_empty());
    }

    #[test]
    fn inheritance_travels_through_empty_classes() {
        let summaries = parse_summaries(
            "class A:\n  foo:\n\nclass B extends A:\nclass C extends B:\nclass D extends C:\n",
        );
        let result = compute_inheritance(&summaries);
        for idx in 1..=3 {
            let inherited = &result.inherited[&class(idx)];
            assert_eq!(inherited.len(), 1, "class {idx}");
            assert_eq!(inherited[0].member, method(0, 0));
        }
        assert_eq!(result.class_depth[&class(3)], 4);
        assert!(result.shadowed.is_empty());
    }

    #[test]
    fn different_arity_does_not_shadow() {
        let summaries = parse_summaries(
            "class A:\n  foo:\n\nclass B extends A:\n  foo x:\n",
        );
        let result = compute_inheritance(&summaries);
        let inherited_b = &result.inherited[&class(1)];
        assert_eq!(inherited_b.len(), 1);
        assert_eq!(inherited_b[0].member, method(0, 0));
        assert!(inherited_b[0].partially_shadowed_by.is_empty());
        assert!(result.shadowed.is_empty());
    }

    #[test]
    fn same_shape_shadows_fully() {
        let summaries = parse_summaries(
            "class A:\n  foo x:\n\nclass B extends A:\n  foo x:\n",
        );
        let result = compute_inheritance(&summaries);
        assert!(result.inherited[&class(0)].is_empty());
        assert!(result.inherited[&class(1)].is_empty());
        assert_eq!(shadowed(&result, 1, method(1, 0)), &[method(0, 0)]);
        assert!(shadowed(&result, 0, method(0, 0)).is_empty());
    }

    #[test]
    fn smaller_arity_shadows_partially() {
        let summaries = parse_summaries(
            "class A:\n  foo x y=:\n\nclass B extends A:\n  foo x:\n",
        );
        let result = compute_inheritance(&summaries);
        assert!(result.inherited[&class(0)].is_empty());
        let inherited_b = &result.inherited[&class(1)];
        assert_eq!(inherited_b.len(), 1);
        assert_eq!(inherited_b[0].member, method(0, 0));
        assert_eq!(inherited_b[0].partially_shadowed_by, vec![method(1, 0)]);
        assert_eq!(shadowed(&result, 1, method(1, 0)), &[method(0, 0)]);
    }

    #[test]
    fn partial_shadowers_carry_down_the_hierarchy() {
        let summaries = parse_summaries(
            "class A:\n  foo x y=:\n\nclass B extends A:\n  foo x:\n\n\
             class C extends B:\n  foo x:\n\nclass D extends B:\n  foo x:\n",
        );
        let result = compute_inheritance(&summaries);
        for idx in [1, 2, 3] {
            let inherited = &result.inherited[&class(idx)];
            assert_eq!(inherited.len(), 1, "class {idx}");
            assert_eq!(inherited[0].member, method(0, 0));
        }
        // C.foo displaces B.foo as the partial shadower of A.foo and
        // fully shadows B.foo itself.
        assert_eq!(
            shadowed(&result, 2, method(2, 0)),
            &[method(0, 0), method(1, 0)]
        );
        assert_eq!(
            shadowed(&result, 3, method(3, 0)),
            &[method(0, 0), method(1, 0)]
        );
    }

    #[test]
    fn named_and_positional_shadowing_combine() {
        let summaries = parse_summaries(
            "class A:\n  foo x y=:\n\nclass B extends A:\n  foo x --named=:\n\n\
             class C extends B:\n  foo x:\n\nclass D extends C:\n  foo x y= --named=:\n",
        );
        let result = compute_inheritance(&summaries);
        assert!(result.inherited[&class(0)].is_empty());
        assert_eq!(result.inherited[&class(1)].len(), 1);
        let inherited_c = &result.inherited[&class(2)];
        assert_eq!(inherited_c.len(), 2);
        assert_eq!(inherited_c[0].member, method(0, 0));
        assert_eq!(inherited_c[1].member, method(1, 0));
        // D covers the whole space: nothing stays visible.
        assert!(result.inherited[&class(3)].is_empty());
        assert_eq!(
            shadowed(&result, 3, method(3, 0)),
            &[method(0, 0), method(1, 0), method(2, 0)]
        );
    }

    #[test]
    fn optional_named_parameters_split_into_branches() {
        let summaries = parse_summaries(
            "class A:\n  foo --a= --b= --c=:\n\n\
             class B extends A:\n  foo --a --b --c:\n  foo --a --b:\n  foo --a --c:\n  \
             foo --a:\n  foo --b --c:\n  foo --b:\n  foo --c:\n\n\
             class C extends B:\n  foo:\n",
        );
        let result = compute_inheritance(&summaries);
        assert!(result.inherited[&class(0)].is_empty());
        // The overloads only cover calls with at least one named
        // argument; A.foo stays reachable in B.
        assert_eq!(result.inherited[&class(1)].len(), 1);
        assert_eq!(result.inherited[&class(1)][0].member, method(0, 0));

        // C.foo plugs the no-argument hole: A.foo disappears, the seven
        // overloads stay, sorted by named-parameter shape.
        let inherited_c = &result.inherited[&class(2)];
        let expected: Vec<MemberId> = [3, 5, 6, 1, 2, 4, 0]
            .into_iter()
            .map(|i| method(1, i))
            .collect();
        let got: Vec<MemberId> = inherited_c.iter().map(|m| m.member.clone()).collect();
        assert_eq!(got, expected);

        for i in 0..7 {
            assert_eq!(shadowed(&result, 1, method(1, i)), &[method(0, 0)]);
        }
        assert_eq!(shadowed(&result, 2, method(2, 0)), &[method(0, 0)]);
    }

    #[test]
    fn mismatched_optionals_shadow_partially() {
        let summaries = parse_summaries(
            "class A:\n  foo --a --b= --z:\n\nclass B extends A:\n  foo --a --x= --y= --z:\n",
        );
        let result = compute_inheritance(&summaries);
        let inherited_b = &result.inherited[&class(1)];
        assert_eq!(inherited_b.len(), 1);
        assert_eq!(inherited_b[0].member, method(0, 0));
        assert_eq!(shadowed(&result, 1, method(1, 0)), &[method(0, 0)]);
    }

    #[test]
    fn fields_need_getter_and_setter_overrides() {
        // A getter alone leaves the field visible; adding the setter
        // completes the shadow.
        let uri = module_uri();
        let mut summaries = parse_summaries(
            "class A:\n\nclass B extends A:\n  x:\n\nclass C extends A:\n  x:\n  x= value:\n",
        );
        {
            let module = Arc::get_mut(summaries.get_mut(&uri).unwrap()).unwrap();
            module.classes[0].fields.push(toitlsp_compiler::summary::Field {
                name: "x".to_string(),
                range: Range::default(),
                is_final: false,
                type_: Type::Any,
                toitdoc: None,
            });
        }
        let result = compute_inheritance(&summaries);

        let field = MemberId::field(class(0), 0);
        let inherited_b = &result.inherited[&class(1)];
        assert_eq!(inherited_b.len(), 1);
        assert_eq!(inherited_b[0].member, field);
        assert_eq!(inherited_b[0].partially_shadowed_by, vec![method(1, 0)]);

        assert!(result.inherited[&class(2)].is_empty());
        assert_eq!(shadowed(&result, 2, method(2, 0)), &[field.clone()]);
        assert_eq!(shadowed(&result, 2, method(2, 1)), &[field]);
    }
}
