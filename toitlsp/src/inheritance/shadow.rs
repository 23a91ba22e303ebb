//! Member shapes and the shadowing computation.
//!
//! A shape reduces a member to what overload resolution sees: positional
//! arity range, block counts, setter-ness and the sorted named
//! parameters. A subclass member shadows a super member fully when every
//! call that could reach the super member is captured; optional named
//! parameters split the check into with/without branches.

use std::collections::{HashMap, HashSet};

use toitlsp_compiler::summary::Type;

use super::{ClassId, MemberId, Resolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NamedParam {
    pub name: String,
    pub is_block: bool,
    pub is_optional: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Shape {
    pub min_positional: usize,
    pub max_positional: usize,
    pub positional_block_count: usize,
    pub is_setter: bool,
    /// A field acts as getter and setter at once; `is_setter` is false.
    pub is_field: bool,
    /// Sorted by name.
    pub named: Vec<NamedParam>,
}

#[derive(Debug, Clone)]
pub(crate) struct ShapedMember {
    pub name: String,
    pub member: MemberId,
    pub shape: Shape,
    /// Super members partially shadowing `member` in classes between its
    /// holder and the class under consideration. Only populated for
    /// members arriving through an inherited list.
    pub old_overriders: Vec<MemberId>,
}

impl Resolver<'_> {
    pub(crate) fn shaped(&self, member: &MemberId) -> Option<ShapedMember> {
        match member.slot {
            super::MemberSlot::Field(i) => {
                let field = self.class(&member.class)?.fields.get(i)?;
                Some(ShapedMember {
                    name: field.name.clone(),
                    member: member.clone(),
                    shape: Shape {
                        min_positional: 0,
                        max_positional: 0,
                        positional_block_count: 0,
                        is_setter: false,
                        is_field: true,
                        named: Vec::new(),
                    },
                    old_overriders: Vec::new(),
                })
            }
            super::MemberSlot::Method(i) => {
                let method = self.class(&member.class)?.methods.get(i)?;
                let is_setter = method.name.ends_with('=');
                let name = method.name.trim_end_matches('=').to_string();
                let mut min_positional = 0;
                let mut max_positional = 0;
                let mut positional_block_count = 0;
                let mut named = Vec::new();
                for param in &method.parameters {
                    let is_block = matches!(param.type_, Type::Block);
                    let is_optional = !param.is_required;
                    if param.is_named {
                        named.push(NamedParam {
                            name: param.name.clone(),
                            is_block,
                            is_optional,
                        });
                        continue;
                    }
                    if is_block {
                        positional_block_count += 1;
                        continue;
                    }
                    max_positional += 1;
                    if !is_optional {
                        min_positional += 1;
                    }
                }
                named.sort_by(|a, b| a.name.cmp(&b.name));
                Some(ShapedMember {
                    name,
                    member: member.clone(),
                    shape: Shape {
                        min_positional,
                        max_positional,
                        positional_block_count,
                        is_setter,
                        is_field: false,
                        named,
                    },
                    old_overriders: Vec::new(),
                })
            }
        }
    }
}

/// A shape that can be called like a getter: no required arguments.
fn is_getter_shape(shape: &Shape) -> bool {
    if shape.is_setter {
        return false;
    }
    if shape.is_field {
        return true;
    }
    if shape.min_positional != 0 || shape.positional_block_count != 0 {
        return false;
    }
    shape.named.iter().all(|n| n.is_optional)
}

/// Cursor over a shaped member's named parameters.
#[derive(Clone, Copy)]
struct ShapedIter<'a> {
    shaped: &'a ShapedMember,
    index: usize,
}

impl<'a> ShapedIter<'a> {
    fn new(shaped: &'a ShapedMember) -> Self {
        ShapedIter { shaped, index: 0 }
    }

    fn current(&self) -> Option<&'a NamedParam> {
        self.shaped.shape.named.get(self.index)
    }

    fn advance(&mut self) {
        if self.index < self.shaped.shape.named.len() {
            self.index += 1;
        }
    }
}

pub(crate) struct ShadowContext<'a> {
    pub resolver: &'a Resolver<'a>,
    pub class_depth: &'a HashMap<ClassId, usize>,
}

impl ShadowContext<'_> {
    /// Decides whether `super_member` is still visible next to `members`.
    ///
    /// Returns whether the super member is fully shadowed, and fills
    /// `overridden_by` with every member (old or new) that shadows it.
    /// Old overriders are only kept when the new members leave them
    /// relevant.
    pub(crate) fn compute_override(
        &self,
        super_member: &ShapedMember,
        old_overriders: &[MemberId],
        members: &[&ShapedMember],
        overridden_by: &mut HashSet<MemberId>,
    ) -> bool {
        let members = filter_overriding(super_member, members);
        if members.is_empty() {
            overridden_by.extend(old_overriders.iter().cloned());
            return false;
        }

        let old_shaped: Vec<ShapedMember> = old_overriders
            .iter()
            .filter_map(|m| self.resolver.shaped(m))
            .collect();
        self.setter_phase(super_member, &old_shaped, &members, overridden_by)
    }

    /// Simple setters can only be shadowed by setters or fields.
    fn setter_phase(
        &self,
        super_member: &ShapedMember,
        old_overriders: &[ShapedMember],
        members: &[&ShapedMember],
        overridden_by: &mut HashSet<MemberId>,
    ) -> bool {
        if !super_member.shape.is_setter {
            return self.field_phase(super_member, old_overriders, members, overridden_by);
        }
        for member in members {
            if member.shape.is_field || member.shape.is_setter {
                overridden_by.insert(member.member.clone());
                return true;
            }
        }
        false
    }

    /// A field needs both its getter and its setter shape overridden.
    fn field_phase(
        &self,
        super_member: &ShapedMember,
        old_overriders: &[ShapedMember],
        members: &[&ShapedMember],
        overridden_by: &mut HashSet<MemberId>,
    ) -> bool {
        if !super_member.shape.is_field {
            let super_iter = ShapedIter::new(super_member);
            let old_iters: Vec<ShapedIter> = old_overriders.iter().map(ShapedIter::new).collect();
            let new_iters: Vec<ShapedIter> = members.iter().map(|m| ShapedIter::new(m)).collect();
            return self.named_phase(super_iter, old_iters, new_iters, overridden_by);
        }

        let mut getter_override: Option<&ShapedMember> = None;
        let mut setter_override: Option<&ShapedMember> = None;
        for member in members {
            if member.shape.is_field {
                overridden_by.insert(member.member.clone());
                return true;
            } else if member.shape.is_setter {
                setter_override = Some(member);
            } else if is_getter_shape(&member.shape) {
                getter_override = Some(member);
            }
            if let (Some(getter), Some(setter)) = (getter_override, setter_override) {
                overridden_by.insert(getter.member.clone());
                overridden_by.insert(setter.member.clone());
                return true;
            }
        }

        for old in old_overriders {
            if setter_override.is_none() && old.shape.is_setter {
                setter_override = Some(old);
            } else if getter_override.is_none() && !old.shape.is_setter {
                getter_override = Some(old);
            }
        }

        if let Some(getter) = getter_override {
            overridden_by.insert(getter.member.clone());
        }
        if let Some(setter) = setter_override {
            overridden_by.insert(setter.member.clone());
        }
        getter_override.is_some() && setter_override.is_some()
    }

    /// Walks the super member's named parameters. A required name is
    /// present in every filtered overrider; an optional name splits the
    /// check into a branch with the argument and a branch without.
    fn named_phase(
        &self,
        mut super_iter: ShapedIter<'_>,
        old_iters: Vec<ShapedIter<'_>>,
        new_iters: Vec<ShapedIter<'_>>,
        overridden_by: &mut HashSet<MemberId>,
    ) -> bool {
        if new_iters.is_empty() && old_iters.is_empty() {
            // A branch of an optional parameter nobody handles.
            return false;
        }

        while let Some(current) = super_iter.current().cloned() {
            super_iter.advance();

            if !current.is_optional {
                // Filtering guaranteed every candidate has the name.
                continue;
            }

            let (required_new, optional_new, not_exist_new) =
                categorize_named(&current.name, &new_iters);
            let (required_old, optional_old, not_exist_old) =
                categorize_named(&current.name, &old_iters);

            if required_new.is_empty()
                && required_old.is_empty()
                && not_exist_new.is_empty()
                && not_exist_old.is_empty()
            {
                // Everyone treats it as optional too.
                continue;
            }

            if !old_iters.is_empty() {
                let with_new = concat(&required_new, &optional_new);
                let with_old = concat(&required_old, &optional_old);
                let with_full = self.named_phase(super_iter, with_old, with_new, overridden_by);

                let without_new = concat(&optional_new, &not_exist_new);
                let without_old = concat(&optional_old, &not_exist_old);
                let without_full =
                    self.named_phase(super_iter, without_old, without_new, overridden_by);

                return with_full && without_full;
            }

            // With no old overriders the optional bucket cannot overlap
            // the other two; a fully-covering optional bucket decides on
            // its own.
            let optional_full =
                self.named_phase(super_iter, Vec::new(), optional_new, overridden_by);
            if optional_full {
                return true;
            }

            let required_full =
                self.named_phase(super_iter, Vec::new(), required_new, overridden_by);
            let not_exist_full =
                self.named_phase(super_iter, Vec::new(), not_exist_new, overridden_by);
            return required_full && not_exist_full;
        }

        self.positional_phase(super_iter, &old_iters, &new_iters, overridden_by)
    }

    /// Checks that the super member's positional arity range is fully
    /// covered by the overriders.
    fn positional_phase(
        &self,
        super_iter: ShapedIter<'_>,
        old_iters: &[ShapedIter<'_>],
        new_iters: &[ShapedIter<'_>],
        overridden_by: &mut HashSet<MemberId>,
    ) -> bool {
        let super_min = super_iter.shaped.shape.min_positional;
        let super_max = super_iter.shaped.shape.max_positional;

        // Covered arities: 1 marks a new overrider, negated class depth
        // marks an old one, so a deeper old overrider displaces a
        // shallower one.
        let mut arities = vec![0i64; super_max - super_min + 1];

        for new in new_iters {
            let shape = &new.shaped.shape;
            overridden_by.insert(new.shaped.member.clone());
            let from = shape.min_positional.max(super_min) - super_min;
            let to = shape.max_positional.min(super_max) - super_min;
            for slot in &mut arities[from..=to] {
                *slot = 1;
            }
        }

        for old in old_iters {
            let mut added_as_overrider = false;
            let shape = &old.shaped.shape;
            let from = shape.min_positional.max(super_min) - super_min;
            let to = shape.max_positional.min(super_max) - super_min;
            for slot in &mut arities[from..=to] {
                if *slot <= 0 {
                    let depth = self
                        .class_depth
                        .get(&old.shaped.member.class)
                        .copied()
                        .unwrap_or(0) as i64;
                    if -depth < *slot {
                        *slot = -depth;
                        if !added_as_overrider {
                            overridden_by.insert(old.shaped.member.clone());
                        }
                        added_as_overrider = true;
                    }
                }
            }
        }

        // A hole leaves the super member reachable.
        arities.iter().all(|&marker| marker != 0)
    }
}

fn concat<'a>(a: &[ShapedIter<'a>], b: &[ShapedIter<'a>]) -> Vec<ShapedIter<'a>> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// Splits `iterators` by how they handle the named parameter `name`,
/// advancing each past every name up to and including it.
fn categorize_named<'a>(
    name: &str,
    iterators: &[ShapedIter<'a>],
) -> (Vec<ShapedIter<'a>>, Vec<ShapedIter<'a>>, Vec<ShapedIter<'a>>) {
    let mut required = Vec::new();
    let mut optional = Vec::new();
    let mut not_exist = Vec::new();

    for entry in iterators {
        let mut entry = *entry;
        loop {
            let Some(current) = entry.current().cloned() else {
                not_exist.push(entry);
                break;
            };
            if current.name.as_str() > name {
                not_exist.push(entry);
                break;
            }
            // Consume the name whether or not it is the one sought.
            entry.advance();
            if current.name == name {
                if current.is_optional {
                    optional.push(entry);
                } else {
                    required.push(entry);
                }
                break;
            }
        }
    }
    (required, optional, not_exist)
}

/// Keeps only the members whose shape overlaps the super member's: these
/// shadow it at least partially.
fn filter_overriding<'a>(
    super_member: &ShapedMember,
    members: &[&'a ShapedMember],
) -> Vec<&'a ShapedMember> {
    let super_shape = &super_member.shape;
    let mut result = Vec::new();
    for member in members {
        if super_shape.is_field {
            if member.shape.is_setter || is_getter_shape(&member.shape) {
                result.push(*member);
            }
            continue;
        }
        if super_shape.is_setter {
            if member.shape.is_setter || member.shape.is_field {
                result.push(*member);
            }
            continue;
        }
        let shape = &member.shape;
        if shape.min_positional > super_shape.max_positional
            || shape.max_positional < super_shape.min_positional
            || shape.positional_block_count != super_shape.positional_block_count
        {
            continue;
        }

        let mut super_iter = ShapedIter::new(super_member);
        let mut member_iter = ShapedIter::new(member);
        let mut matches = true;
        while matches {
            let Some(super_named) = super_iter.current().cloned() else {
                break;
            };
            super_iter.advance();

            loop {
                // Peek before advancing; a later super name may need the
                // current member name again.
                let Some(named) = member_iter.current().cloned() else {
                    if !super_named.is_optional {
                        matches = false;
                    }
                    break;
                };
                if named.name > super_named.name {
                    if !super_named.is_optional {
                        matches = false;
                    }
                    break;
                }

                member_iter.advance();

                if named.name == super_named.name {
                    if super_named.is_block != named.is_block {
                        matches = false;
                    }
                    break;
                }

                // named.name < super_named.name
                if !named.is_optional {
                    // The member requires a name the super doesn't have.
                    matches = false;
                    break;
                }
            }
        }
        while matches {
            let Some(current) = member_iter.current().cloned() else {
                break;
            };
            member_iter.advance();
            if !current.is_optional {
                matches = false;
            }
        }
        if matches {
            result.push(*member);
        }
    }
    result
}
