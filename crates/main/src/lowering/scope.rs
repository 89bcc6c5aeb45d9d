////////////////////////////////////////////////////////////////////////////////
// This file is part of "Ad Astra", an embeddable scripting programming       //
// language platform.                                                         //
//                                                                            //
// This work is proprietary software with source-available code.              //
//                                                                            //
// To copy, use, distribute, or contribute to this work, you must agree to    //
// the terms of the General License Agreement:                                //
//                                                                            //
// https://github.com/Eliah-Lakhin/ad-astra/blob/master/EULA.md               //
//                                                                            //
// The agreement grants a Basic Commercial License, allowing you to use       //
// this work in non-commercial and limited commercial products with a total   //
// gross revenue cap. To remove this commercial limit for one of your         //
// products, you must acquire a Full Commercial License.                      //
//                                                                            //
// If you contribute to the source code, documentation, or related materials, //
// you must grant me an exclusive license to these contributions.             //
// Contributions are governed by the "Contributions" section of the General   //
// License Agreement.                                                         //
//                                                                            //
// Copying the work in parts is strictly forbidden, except as permitted       //
// under the General License Agreement.                                       //
//                                                                            //
// If you do not or cannot agree to the terms of this Agreement,              //
// do not use this work.                                                      //
//                                                                            //
// This work is provided "as is", without any warranties, express or implied, //
// except where such disclaimers are legally invalid.                         //
//                                                                            //
// Copyright (c) 2024 Ilya Lakhin (Илья Александрович Лахин).                 //
// All rights reserved.                                                       //
////////////////////////////////////////////////////////////////////////////////

use std::fmt::{Display, Formatter};

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use log::trace;

use crate::{
    assembly::{Assembler, Label, Slot},
    report::{suggestion, system_panic, LOWERING_LOG},
};

/// A kind of the non-local transfer of control.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EscapeKind {
    Break,
    Continue,
    Return,
}

impl Display for EscapeKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Break => formatter.write_str("break"),
            Self::Continue => formatter.write_str("continue"),
            Self::Return => formatter.write_str("return"),
        }
    }
}

/// A non-local transfer of control: `break`, `break <name>`, `continue`,
/// `continue <name>`, or `return`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Escape {
    pub kind: EscapeKind,
    pub name: Option<CompactString>,
}

impl Display for Escape {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => formatter.write_fmt(format_args!("{} {name}", self.kind)),
            None => Display::fmt(&self.kind, formatter),
        }
    }
}

impl Escape {
    #[inline(always)]
    pub fn break_to(name: Option<&str>) -> Self {
        Self {
            kind: EscapeKind::Break,
            name: name.map(CompactString::from),
        }
    }

    #[inline(always)]
    pub fn continue_to(name: Option<&str>) -> Self {
        Self {
            kind: EscapeKind::Continue,
            name: name.map(CompactString::from),
        }
    }

    #[inline(always)]
    pub fn ret() -> Self {
        Self {
            kind: EscapeKind::Return,
            name: None,
        }
    }
}

/// A label that substitutes the real target of an escape crossing a region
/// whose exit requires extra work (a finally block or an outlined unit
/// boundary).
///
/// The region that owns the temporary label marks it at the position where
/// it performs the extra work and then continues the escape.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TemporaryLabel {
    pub label: Label,
    pub escape: Escape,

    /// The real target of the escape, if the target belongs to the same
    /// routine.
    pub real: Option<Label>,
}

/// Reports which exit labels of a loop, switch, or labeled statement have
/// been targeted by jumps.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ScopeUsage {
    pub break_used: bool,
    pub continue_used: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ScopeKind {
    Routine,
    Loop,
    Switch,
    Labeled,
    Finally,
    Outline,
}

impl Display for ScopeKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Routine => formatter.write_str("routine"),
            Self::Loop => formatter.write_str("loop"),
            Self::Switch => formatter.write_str("switch"),
            Self::Labeled => formatter.write_str("labeled statement"),
            Self::Finally => formatter.write_str("finally region"),
            Self::Outline => formatter.write_str("outlined unit"),
        }
    }
}

impl ScopeKind {
    // Escapes crossing these scopes go through temporary labels.
    #[inline(always)]
    fn is_boundary(self) -> bool {
        matches!(self, Self::Finally | Self::Outline)
    }
}

// Escapes that an outlined unit can signal to its call site.
#[derive(Clone, Default, Debug)]
pub(crate) struct OuterView {
    break_names: AHashSet<CompactString>,
    continue_names: AHashSet<CompactString>,
    unnamed_break: bool,
    unnamed_continue: bool,
    returns: bool,
}

impl OuterView {
    fn allows(&self, escape: &Escape) -> bool {
        match (escape.kind, &escape.name) {
            (EscapeKind::Break, None) => self.unnamed_break,
            (EscapeKind::Break, Some(name)) => self.break_names.contains(name),
            (EscapeKind::Continue, None) => self.unnamed_continue,
            (EscapeKind::Continue, Some(name)) => self.continue_names.contains(name),
            (EscapeKind::Return, _) => self.returns,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.break_names.extend(other.break_names.iter().cloned());
        self.continue_names
            .extend(other.continue_names.iter().cloned());
        self.unnamed_break |= other.unnamed_break;
        self.unnamed_continue |= other.unnamed_continue;
        self.returns |= other.returns;
    }
}

pub(crate) struct LabelScope {
    pub(crate) kind: ScopeKind,
    parent: Option<usize>,
    names: Vec<CompactString>,
    break_target: Option<Label>,
    continue_target: Option<Label>,
    return_target: Option<Label>,
    pub(crate) completion_slot: Option<Slot>,
    temporaries: AHashMap<Escape, TemporaryLabel>,
    used: Vec<Escape>,
    outer: Option<OuterView>,
    usage: ScopeUsage,
}

impl LabelScope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            parent: None,
            names: Vec::new(),
            break_target: None,
            continue_target: None,
            return_target: None,
            completion_slot: None,
            temporaries: AHashMap::new(),
            used: Vec::new(),
            outer: None,
            usage: ScopeUsage::default(),
        }
    }

    #[inline(always)]
    pub(crate) fn usage(&self) -> ScopeUsage {
        self.usage
    }

    /// The temporary labels of this scope in the order of their first use.
    pub(crate) fn take_temporaries(&mut self) -> Vec<TemporaryLabel> {
        let mut temporaries = Vec::with_capacity(self.used.len());

        for escape in self.used.drain(..) {
            let Some(temporary) = self.temporaries.remove(&escape) else {
                system_panic!("Missing temporary label for \"{escape}\".");
            };

            temporaries.push(temporary);
        }

        temporaries
    }

    fn target_for(&self, escape: &Escape) -> Option<Label> {
        match (escape.kind, &escape.name) {
            (EscapeKind::Break, None) => match self.kind {
                ScopeKind::Loop | ScopeKind::Switch => self.break_target,
                _ => None,
            },

            (EscapeKind::Break, Some(name)) => match self.names.contains(name) {
                true => self.break_target,
                false => None,
            },

            (EscapeKind::Continue, None) => match self.kind {
                ScopeKind::Loop => self.continue_target,
                _ => None,
            },

            (EscapeKind::Continue, Some(name)) => {
                if !self.names.contains(name) {
                    return None;
                }

                let Some(target) = self.continue_target else {
                    system_panic!("\"continue {name}\" targets a non-loop {}.", self.kind);
                };

                Some(target)
            }

            (EscapeKind::Return, _) => self.return_target,
        }
    }
}

/// A resolved escape target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Resolved {
    pub(crate) label: Label,

    // The local that carries the returned value to the target.
    pub(crate) carrier: Option<Slot>,
}

/// The stack of the label scopes of a single routine.
pub(crate) struct ScopeStack {
    frames: Vec<LabelScope>,
}

impl ScopeStack {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self { frames: Vec::new() }
    }

    #[inline(always)]
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn push_routine(&mut self, return_target: Label, return_slot: Slot) {
        let mut scope = LabelScope::new(ScopeKind::Routine);

        scope.return_target = Some(return_target);
        scope.completion_slot = Some(return_slot);

        self.push(scope);
    }

    pub(crate) fn push_outline(&mut self, outer: OuterView, pending_slot: Slot) {
        let mut scope = LabelScope::new(ScopeKind::Outline);

        scope.outer = Some(outer);
        scope.completion_slot = Some(pending_slot);

        self.push(scope);
    }

    pub(crate) fn push_finally(&mut self, completion_slot: Slot) {
        let mut scope = LabelScope::new(ScopeKind::Finally);

        scope.completion_slot = Some(completion_slot);

        self.push(scope);
    }

    pub(crate) fn push_target(
        &mut self,
        kind: ScopeKind,
        break_target: Label,
        continue_target: Option<Label>,
        names: &[CompactString],
    ) {
        for name in names {
            if self.is_name_active(name) {
                system_panic!("Duplicate label \"{name}\" in the {kind} scope chain.");
            }
        }

        let mut scope = LabelScope::new(kind);

        scope.names = names.to_vec();
        scope.break_target = Some(break_target);
        scope.continue_target = continue_target;

        self.push(scope);
    }

    pub(crate) fn pop(&mut self, kind: ScopeKind) -> LabelScope {
        let Some(scope) = self.frames.pop() else {
            system_panic!("Exit from a {kind} scope while no scope is active.");
        };

        if scope.kind != kind {
            system_panic!(
                "Mismatched scope nesting. Exit from a {kind} scope while a {} scope is \
                active.",
                scope.kind,
            );
        }

        if scope.parent != self.frames.len().checked_sub(1) {
            system_panic!("Broken parent link of a {kind} scope.");
        }

        scope
    }

    /// Resolves the target of the escape from the current position.
    ///
    /// If the target lies outside of a finally region or an outlined unit
    /// boundary, returns a temporary label registered in the innermost
    /// crossed region instead. Repeated resolutions of the same escape within
    /// the same region return the same temporary label.
    pub(crate) fn resolve<A: Assembler>(&mut self, assembler: &mut A, escape: &Escape) -> Resolved {
        let mut crossed = None;
        let mut cursor = self.frames.len().checked_sub(1);

        while let Some(index) = cursor {
            let frame = &self.frames[index];

            if let Some(label) = frame.target_for(escape) {
                let Some(boundary) = crossed else {
                    return self.direct(index, label, escape);
                };

                return self.temporary(assembler, boundary, escape, Some(label));
            }

            if frame.kind.is_boundary() && crossed.is_none() {
                crossed = Some(index);
            }

            if let Some(outer) = &frame.outer {
                if !outer.allows(escape) {
                    break;
                }

                return self.temporary(assembler, crossed.unwrap_or(index), escape, None);
            }

            cursor = frame.parent;
        }

        self.fail(escape)
    }

    pub(crate) fn outer_view(&self) -> OuterView {
        let mut view = OuterView::default();
        let mut cursor = self.frames.len().checked_sub(1);

        while let Some(index) = cursor {
            let frame = &self.frames[index];

            match frame.kind {
                ScopeKind::Routine => view.returns = true,

                ScopeKind::Loop => {
                    view.unnamed_break = true;
                    view.unnamed_continue = true;
                    view.break_names.extend(frame.names.iter().cloned());
                    view.continue_names.extend(frame.names.iter().cloned());
                }

                ScopeKind::Switch => {
                    view.unnamed_break = true;
                    view.break_names.extend(frame.names.iter().cloned());
                }

                ScopeKind::Labeled => {
                    view.break_names.extend(frame.names.iter().cloned());
                }

                ScopeKind::Finally => (),

                ScopeKind::Outline => {
                    if let Some(outer) = &frame.outer {
                        view.merge(outer);
                    }
                }
            }

            cursor = frame.parent;
        }

        view
    }

    #[inline(always)]
    fn push(&mut self, mut scope: LabelScope) {
        scope.parent = self.frames.len().checked_sub(1);

        self.frames.push(scope);
    }

    fn direct(&mut self, index: usize, label: Label, escape: &Escape) -> Resolved {
        let frame = &mut self.frames[index];

        match escape.kind {
            EscapeKind::Break => frame.usage.break_used = true,
            EscapeKind::Continue => frame.usage.continue_used = true,
            EscapeKind::Return => (),
        }

        let carrier = match escape.kind {
            EscapeKind::Return => frame.completion_slot,
            _ => None,
        };

        Resolved { label, carrier }
    }

    fn temporary<A: Assembler>(
        &mut self,
        assembler: &mut A,
        boundary: usize,
        escape: &Escape,
        real: Option<Label>,
    ) -> Resolved {
        let frame = &mut self.frames[boundary];

        let carrier = match escape.kind {
            EscapeKind::Return => frame.completion_slot,
            _ => None,
        };

        if let Some(temporary) = frame.temporaries.get(escape) {
            return Resolved {
                label: temporary.label,
                carrier,
            };
        }

        let label = assembler.new_label();

        trace!(
            target: LOWERING_LOG,
            "Temporary label {label} for \"{escape}\" crossing the {}.",
            frame.kind,
        );

        let _ = frame.temporaries.insert(
            escape.clone(),
            TemporaryLabel {
                label,
                escape: escape.clone(),
                real,
            },
        );

        frame.used.push(escape.clone());

        Resolved { label, carrier }
    }

    fn is_name_active(&self, name: &CompactString) -> bool {
        self.frames.iter().any(|frame| {
            frame.names.contains(name)
                || frame.outer.as_ref().map_or(false, |outer| {
                    outer.break_names.contains(name) || outer.continue_names.contains(name)
                })
        })
    }

    fn fail(&self, escape: &Escape) -> ! {
        match (escape.kind, &escape.name) {
            (EscapeKind::Return, _) => system_panic!("\"return\" outside of a routine body."),

            (EscapeKind::Break, None) => {
                system_panic!("Unnamed \"break\" outside of a loop or a switch.")
            }

            (EscapeKind::Continue, None) => system_panic!("Unnamed \"continue\" outside of a loop."),

            (kind, Some(name)) => {
                let mut candidates = Vec::new();

                for frame in &self.frames {
                    candidates.extend(frame.names.iter().map(CompactString::as_str));

                    if let Some(outer) = &frame.outer {
                        candidates.extend(outer.break_names.iter().map(CompactString::as_str));
                    }
                }

                let tail = suggestion(name, candidates);

                system_panic!("Label \"{name}\" of \"{kind} {name}\" not found.{tail}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use compact_str::CompactString;

    use crate::{
        assembly::{Assembler, Assembly, Signature, Slot, SlotType},
        lowering::{
            scope::{OuterView, ScopeKind, ScopeStack},
            Escape,
        },
    };

    fn assembly() -> Assembly {
        Assembly::new(Signature::new("test", [], Some(SlotType::Object)))
    }

    fn names(names: &[&str]) -> Vec<CompactString> {
        names.iter().map(|name| CompactString::from(*name)).collect()
    }

    #[test]
    fn test_direct_resolution() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let ret = assembly.new_label();
        let exit = assembly.new_label();
        let next = assembly.new_label();
        let slot = assembly.define_local(SlotType::Object);

        scopes.push_routine(ret, slot);
        scopes.push_target(ScopeKind::Loop, exit, Some(next), &names(&["outer"]));

        let unnamed = scopes.resolve(&mut assembly, &Escape::break_to(None));
        let named = scopes.resolve(&mut assembly, &Escape::continue_to(Some("outer")));
        let returned = scopes.resolve(&mut assembly, &Escape::ret());

        assert_eq!(unnamed.label, exit);
        assert_eq!(named.label, next);
        assert_eq!(returned.label, ret);
        assert_eq!(returned.carrier, Some(slot));

        let usage = scopes.pop(ScopeKind::Loop).usage();

        assert!(usage.break_used);
        assert!(usage.continue_used);
    }

    #[test]
    fn test_temporary_per_region() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let ret = assembly.new_label();
        let exit = assembly.new_label();
        let next = assembly.new_label();
        let return_slot = assembly.define_local(SlotType::Object);
        let first_slot = assembly.define_local(SlotType::Object);
        let second_slot = assembly.define_local(SlotType::Object);

        scopes.push_routine(ret, return_slot);
        scopes.push_target(ScopeKind::Loop, exit, Some(next), &[]);
        scopes.push_finally(first_slot);

        let first = scopes.resolve(&mut assembly, &Escape::break_to(None));
        let repeated = scopes.resolve(&mut assembly, &Escape::break_to(None));

        assert_eq!(first, repeated);
        assert_ne!(first.label, exit);

        let mut region = scopes.pop(ScopeKind::Finally);
        let temporaries = region.take_temporaries();

        assert_eq!(temporaries.len(), 1);
        assert_eq!(temporaries[0].label, first.label);
        assert_eq!(temporaries[0].real, Some(exit));

        scopes.push_finally(second_slot);

        let second = scopes.resolve(&mut assembly, &Escape::break_to(None));

        assert_ne!(second.label, first.label);

        let returned = scopes.resolve(&mut assembly, &Escape::ret());

        assert_eq!(returned.carrier, Some(second_slot));

        let mut region = scopes.pop(ScopeKind::Finally);
        let temporaries = region.take_temporaries();

        assert_eq!(temporaries.len(), 2);
        assert_eq!(temporaries[0].escape, Escape::break_to(None));
        assert_eq!(temporaries[1].escape, Escape::ret());

        assert!(!scopes.pop(ScopeKind::Loop).usage().break_used);
    }

    #[test]
    fn test_outline_boundary() {
        let mut assembly = assembly();
        let mut parent = ScopeStack::new();

        let ret = assembly.new_label();
        let exit = assembly.new_label();
        let slot = assembly.define_local(SlotType::Object);

        parent.push_routine(ret, slot);
        parent.push_target(ScopeKind::Labeled, exit, None, &names(&["block"]));

        let outer = parent.outer_view();

        let mut child = ScopeStack::new();

        child.push_outline(outer, Slot(7));

        let named = child.resolve(&mut assembly, &Escape::break_to(Some("block")));
        let returned = child.resolve(&mut assembly, &Escape::ret());

        assert_eq!(returned.carrier, Some(Slot(7)));

        let mut root = child.pop(ScopeKind::Outline);
        let temporaries = root.take_temporaries();

        assert_eq!(temporaries.len(), 2);
        assert_eq!(temporaries[0].label, named.label);
        assert_eq!(temporaries[0].real, None);
    }

    #[test]
    #[should_panic(expected = "Did you mean \"outer\"?")]
    fn test_unknown_name() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let exit = assembly.new_label();

        scopes.push_target(ScopeKind::Loop, exit, Some(exit), &names(&["outer"]));

        let _ = scopes.resolve(&mut assembly, &Escape::break_to(Some("outre")));
    }

    #[test]
    #[should_panic(expected = "Unnamed \"break\" outside of a loop or a switch.")]
    fn test_unnamed_break_outside_loop() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let exit = assembly.new_label();

        scopes.push_target(ScopeKind::Labeled, exit, None, &names(&["block"]));

        let _ = scopes.resolve(&mut assembly, &Escape::break_to(None));
    }

    #[test]
    #[should_panic(expected = "targets a non-loop")]
    fn test_continue_to_block() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let exit = assembly.new_label();

        scopes.push_target(ScopeKind::Labeled, exit, None, &names(&["block"]));

        let _ = scopes.resolve(&mut assembly, &Escape::continue_to(Some("block")));
    }

    #[test]
    #[should_panic(expected = "Mismatched scope nesting")]
    fn test_mismatched_nesting() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let exit = assembly.new_label();

        scopes.push_target(ScopeKind::Switch, exit, None, &[]);

        let _ = scopes.pop(ScopeKind::Loop);
    }

    #[test]
    #[should_panic(expected = "Duplicate label \"outer\"")]
    fn test_duplicate_name() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let first = assembly.new_label();
        let second = assembly.new_label();

        scopes.push_target(ScopeKind::Loop, first, Some(first), &names(&["outer"]));
        scopes.push_target(ScopeKind::Labeled, second, None, &names(&["outer"]));
    }

    #[test]
    fn test_outer_view() {
        let mut assembly = assembly();
        let mut scopes = ScopeStack::new();

        let exit = assembly.new_label();

        scopes.push_target(ScopeKind::Switch, exit, None, &names(&["sw"]));

        let view: OuterView = scopes.outer_view();

        assert!(view.allows(&Escape::break_to(None)));
        assert!(view.allows(&Escape::break_to(Some("sw"))));
        assert!(!view.allows(&Escape::continue_to(None)));
        assert!(!view.allows(&Escape::ret()));
    }
}
