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

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;
use compact_str::{format_compact, CompactString};
use log::debug;

use crate::{
    assembly::{
        Assembler,
        Callee,
        Condition,
        RuntimeFn,
        Signature,
        Slot,
        SlotType,
        SubroutineIndex,
    },
    lowering::{
        scope::ScopeKind,
        switch::emit_switch,
        CompletionType,
        Escape,
        EscapeKind,
        Lowering,
        UnitId,
        UnitKind,
    },
    report::{system_panic, LOWERING_LOG},
};

/// An identity of a syntax tree node, stable across repeated compilations of
/// the same tree.
pub type NodeKey = u64;

/// The outlined unit completed normally.
pub const NORMAL_SIGNAL: i32 = 0;

/// The outlined unit returned from the enclosing routine.
pub const RETURN_SIGNAL: i32 = 1;

/// The outlined unit has been suspended.
pub const SUSPEND_SIGNAL: i32 = -1;

/// The escapes of an outlined unit that its call site must perform.
///
/// The escape with index `i` is signaled by the value `i + 1`. The return
/// escape, when present, always comes first and has the [RETURN_SIGNAL].
/// The other escapes follow in the order of their first use in the unit.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelState {
    escapes: Vec<Escape>,
    suspends: bool,
}

impl LabelState {
    fn new(used: impl IntoIterator<Item = Escape>, suspends: bool) -> Self {
        let mut escapes = Vec::new();
        let mut returns = false;

        for escape in used {
            match escape.kind {
                EscapeKind::Return => returns = true,
                _ => escapes.push(escape),
            }
        }

        if returns {
            escapes.insert(0, Escape::ret());
        }

        Self { escapes, suspends }
    }

    #[inline(always)]
    pub fn escapes(&self) -> &[Escape] {
        &self.escapes
    }

    /// The number of non-normal signals, excluding the suspension signal.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.escapes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.escapes.is_empty()
    }

    /// Returns true if the unit contains a suspension point.
    #[inline(always)]
    pub fn suspends(&self) -> bool {
        self.suspends
    }

    pub fn signal_of(&self, escape: &Escape) -> Option<i32> {
        let index = self
            .escapes
            .iter()
            .position(|candidate| candidate == escape)?;

        Some(signal(index))
    }

    pub fn escape_of(&self, signal: i32) -> Option<&Escape> {
        let index = usize::try_from(signal.checked_sub(1)?).ok()?;

        self.escapes.get(index)
    }
}

/// A compiled outlined unit.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OutlinedCall {
    subroutine: SubroutineIndex,
    unit: UnitId,
    state: LabelState,
    params: Vec<SlotType>,
    may_suspend: bool,
    produces_value: bool,
    completion: CompletionType,
}

impl OutlinedCall {
    /// The index of the unit's subroutine in the calling routine.
    #[inline(always)]
    pub fn subroutine(&self) -> SubroutineIndex {
        self.subroutine
    }

    #[inline(always)]
    pub fn state(&self) -> &LabelState {
        &self.state
    }

    /// The types of the arguments the call site must pass.
    #[inline(always)]
    pub fn params(&self) -> &[SlotType] {
        &self.params
    }

    /// Returns true if the unit reports its completion value.
    #[inline(always)]
    pub fn produces_value(&self) -> bool {
        self.produces_value
    }

    /// The completion of the unit's body.
    #[inline(always)]
    pub fn completion(&self) -> CompletionType {
        self.completion
    }
}

/// A request to compile an outlined unit.
#[derive(Clone, Copy, Debug)]
pub struct OutlineRequest<'a> {
    /// A suffix of the unit's subroutine name.
    pub name: &'a str,

    /// The types of the unit's arguments.
    pub params: &'a [SlotType],

    /// Must be set if the unit's body contains a suspension point.
    pub may_suspend: bool,
}

/// A memo of the outlined units, keyed by the syntax tree node and an
/// optional label name.
///
/// The cache is a shared handle: its clones refer to the same memo. A root
/// routine compilation passes its handle to the nested compilations.
///
/// A compiled unit is callable only from the routine that compiled it, so
/// each routine sees its own part of the memo. A request for a node
/// memoized by another routine compiles the unit again.
#[derive(Clone, Default)]
pub struct HelperCache {
    inner: Rc<RefCell<HelperCacheInner>>,
}

#[derive(Default)]
struct HelperCacheInner {
    calls: AHashMap<(UnitId, NodeKey, Option<CompactString>), OutlinedCall>,
    units: usize,
}

impl HelperCache {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of memoized units.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.inner.borrow().calls.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if both handles refer to the same memo.
    #[inline(always)]
    pub fn is_shared_with(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn get(&self, unit: UnitId, key: NodeKey, label: Option<&str>) -> Option<OutlinedCall> {
        self.inner
            .borrow()
            .calls
            .get(&(unit, key, label.map(CompactString::from)))
            .cloned()
    }

    fn insert(&self, key: NodeKey, label: Option<&str>, call: OutlinedCall) {
        let _ = self
            .inner
            .borrow_mut()
            .calls
            .insert((call.unit, key, label.map(CompactString::from)), call);
    }

    pub(super) fn next_unit(&self) -> UnitId {
        let mut inner = self.inner.borrow_mut();

        let unit = inner.units;

        inner.units += 1;

        unit
    }
}

impl<A: Assembler> Lowering<A> {
    /// Compiles a separately callable unit.
    ///
    /// The `body` function receives the lowering context of the unit and
    /// compiles the unit's code into it. The unit's arguments are available
    /// through [params](Lowering::params) of that context. The escapes that
    /// leave the unit are turned into signals returned to the call site.
    ///
    /// The unit reports its completion value to the call site if this
    /// routine tracks completion values.
    pub fn outline<E>(
        &mut self,
        request: OutlineRequest,
        body: impl FnOnce(&mut Lowering<A>) -> Result<(), E>,
    ) -> Result<OutlinedCall, E> {
        if request.may_suspend && !self.is_resumable() {
            system_panic!(
                "Resumable outlined unit {:?} requested by non-resumable routine {:?}.",
                request.name,
                self.assembler.signature().name,
            );
        }

        let produces_value = self.completion.is_some();

        let mut params = Vec::with_capacity(request.params.len() + 2);

        if request.may_suspend {
            params.push(SlotType::Object);
        }

        params.push(SlotType::Object);
        params.extend_from_slice(request.params);

        let name = format_compact!("{}${}", self.assembler.signature().name, request.name);

        let assembler = self.assembler.subroutine(Signature::new(
            name.clone(),
            params,
            Some(SlotType::Int),
        ));

        let mut child = Lowering::start(
            assembler,
            self.config,
            UnitKind::Outlined {
                may_suspend: request.may_suspend,
            },
            self.helpers.clone(),
            Some(self.scopes.outer_view()),
            produces_value,
        );

        body(&mut child)?;

        let (assembler, state, completion) = child.finish_outlined();

        let subroutine = self.assembler.commit(assembler);

        debug!(
            target: LOWERING_LOG,
            "Outlined unit {name:?} compiled as fn{subroutine}. Signals: {}{}.",
            state
                .escapes()
                .iter()
                .enumerate()
                .map(|(index, escape)| format!("{} => {escape}", signal(index)))
                .collect::<Vec<_>>()
                .join(", "),
            match state.suspends() {
                true => " (suspends)",
                false => "",
            },
        );

        Ok(OutlinedCall {
            subroutine,
            unit: self.unit,
            state,
            params: request.params.to_vec(),
            may_suspend: request.may_suspend,
            produces_value,
            completion,
        })
    }

    /// Returns the unit of the node and label memoized by this routine.
    #[inline(always)]
    pub fn outlined(&self, key: NodeKey, label: Option<&str>) -> Option<OutlinedCall> {
        self.helpers.get(self.unit, key, label)
    }

    /// Same as [outline](Lowering::outline), but returns the memoized unit if
    /// this routine has compiled the unit of the same node and label before.
    pub fn outline_cached<E>(
        &mut self,
        key: NodeKey,
        label: Option<&str>,
        request: OutlineRequest,
        body: impl FnOnce(&mut Lowering<A>) -> Result<(), E>,
    ) -> Result<OutlinedCall, E> {
        if let Some(call) = self.outlined(key, label) {
            debug!(target: LOWERING_LOG, "Outlined unit of node {key} reused.");

            return Ok(call);
        }

        let call = self.outline(request, body)?;

        self.helpers.insert(key, label, call.clone());

        Ok(call)
    }

    /// Calls the outlined unit and performs the escapes it signals.
    ///
    /// The `args` function pushes the unit's arguments. If the unit may
    /// suspend, the arguments are evaluated again each time the suspended
    /// unit is re-entered.
    ///
    /// If `want_value` is set and the unit completes normally, the unit's
    /// completion value remains on the stack after the call:
    /// `() -> (object)`. The code after the call of an abruptly completing
    /// unit is unreachable.
    pub fn invoke<E>(
        &mut self,
        call: &OutlinedCall,
        args: impl FnOnce(&mut Self) -> Result<(), E>,
        want_value: bool,
    ) -> Result<CompletionType, E> {
        if call.unit != self.unit {
            system_panic!("Outlined unit invoked by a foreign routine.");
        }

        if want_value && !call.produces_value {
            system_panic!("Outlined unit does not produce a completion value.");
        }

        let state = &call.state;

        let out = self.assembler.define_local(SlotType::Object);

        self.assembler
            .invoke(Callee::Runtime(RuntimeFn::NewOutCell));
        self.assembler.store(out);

        if let (true, Some(completion)) = (call.produces_value, self.completion) {
            self.assembler.load(out);
            self.assembler.load(completion);
            self.assembler
                .invoke(Callee::Runtime(RuntimeFn::OutCellSet));
        }

        let inner = match state.suspends {
            false => None,

            true => {
                let inner = self.assembler.define_local(SlotType::Object);

                self.assembler.push_null();
                self.assembler.store(inner);

                Some((inner, self.assembler.new_label()))
            }
        };

        if let Some((_, retry)) = inner {
            self.assembler.mark(retry);
        }

        if call.may_suspend {
            match inner {
                Some((inner, _)) => self.assembler.load(inner),
                None => self.assembler.push_null(),
            }
        }

        self.assembler.load(out);

        args(self)?;

        self.assembler
            .invoke(Callee::Subroutine(call.subroutine));

        match state.is_empty() && !state.suspends {
            true => self.assembler.pop(),

            false => {
                let signal_slot = self.assembler.define_local(SlotType::Int);

                self.assembler.store(signal_slot);

                let normal = self.assembler.new_label();

                let suspension = match inner {
                    Some(..) => {
                        let label = self.assembler.new_label();

                        self.assembler.load(signal_slot);
                        self.assembler.branch(Condition::Negative, label);

                        Some(label)
                    }

                    None => None,
                };

                let stubs = state
                    .escapes
                    .iter()
                    .enumerate()
                    .map(|(index, escape)| (signal(index), self.assembler.new_label(), escape))
                    .collect::<Vec<_>>();

                match stubs.len() <= self.config.equality_dispatch_limit {
                    true => {
                        for (signal, stub, _) in &stubs {
                            self.assembler.load(signal_slot);
                            self.assembler.branch(Condition::Equal(*signal), *stub);
                        }

                        self.assembler.jump(normal);
                    }

                    false => {
                        let mut cases = stubs
                            .iter()
                            .map(|(signal, stub, _)| (*signal, *stub))
                            .collect::<Vec<_>>();

                        self.assembler.load(signal_slot);

                        emit_switch(&mut self.assembler, &self.config, &mut cases, normal);
                    }
                }

                for (_, stub, escape) in stubs {
                    self.assembler.mark(stub);

                    match escape.kind {
                        EscapeKind::Return => {
                            self.assembler.load(out);
                            self.assembler
                                .invoke(Callee::Runtime(RuntimeFn::OutCellGet));
                            self.emit_return();
                        }

                        EscapeKind::Break | EscapeKind::Continue => {
                            if let (true, Some(completion)) =
                                (call.produces_value, self.completion)
                            {
                                self.assembler.load(out);
                                self.assembler
                                    .invoke(Callee::Runtime(RuntimeFn::OutCellGet));
                                self.assembler.store(completion);
                            }

                            self.emit_escape(escape, None);
                        }
                    }
                }

                if let (Some(label), Some((inner, retry))) = (suspension, inner) {
                    self.assembler.mark(label);
                    self.assembler.load(out);
                    self.assembler
                        .invoke(Callee::Runtime(RuntimeFn::OutCellGet));
                    self.assembler.store(inner);
                    self.suspend_chained(inner);
                    self.assembler.jump(retry);
                }

                self.assembler.mark(normal);
                self.assembler.release_local(signal_slot);
            }
        }

        // An abruptly completing unit never reports the normal signal.
        if call.completion.is_abrupt() && self.assembler.is_reachable() {
            self.assembler.push_null();
            self.assembler.throw();
        }

        if let Some((inner, _)) = inner {
            if self.assembler.is_reachable() {
                self.assembler.push_null();
                self.assembler.store(inner);
            }

            self.assembler.release_local(inner);
        }

        if want_value && self.assembler.is_reachable() {
            self.assembler.load(out);
            self.assembler
                .invoke(Callee::Runtime(RuntimeFn::OutCellGet));
        }

        self.assembler.release_local(out);

        Ok(call.completion)
    }

    fn finish_outlined(mut self) -> (A, LabelState, CompletionType) {
        self.close_root_variables();

        let completion = match self.assembler.is_reachable() {
            true => CompletionType::Normal,
            false => CompletionType::Abrupt,
        };

        let Some(out) = self.out else {
            system_panic!("Outlined unit without the out cell.");
        };

        if completion.is_normal() {
            self.report_completion(out);
            self.assembler.push_int(NORMAL_SIGNAL);
            self.assembler.ret();
        }

        let mut root = self.scopes.pop(ScopeKind::Outline);

        if self.scopes.depth() != 0 {
            system_panic!("Unbalanced label scopes at the end of the outlined unit.");
        }

        let temporaries = root.take_temporaries();

        let suspends = self
            .resume
            .as_ref()
            .map_or(false, |resume| resume.suspends());

        let state = LabelState::new(
            temporaries.iter().map(|temporary| temporary.escape.clone()),
            suspends,
        );

        for (index, escape) in state.escapes.iter().enumerate() {
            let Some(temporary) = temporaries
                .iter()
                .find(|temporary| &temporary.escape == escape)
            else {
                system_panic!("Missing temporary label of \"{escape}\".");
            };

            self.assembler.mark(temporary.label);

            match escape.kind {
                EscapeKind::Return => {
                    self.assembler.load(out);
                    self.assembler.load(self.return_slot);
                    self.assembler
                        .invoke(Callee::Runtime(RuntimeFn::OutCellSet));
                }

                EscapeKind::Break | EscapeKind::Continue => self.report_completion(out),
            }

            self.assembler.push_int(signal(index));
            self.assembler.ret();
        }

        let _ = self.emit_dispatcher();

        debug!(
            target: LOWERING_LOG,
            "Outlined unit {:?} finished.",
            self.assembler.signature().name,
        );

        (self.assembler, state, completion)
    }

    fn report_completion(&mut self, out: Slot) {
        let Some(completion) = self.completion else {
            return;
        };

        self.assembler.load(out);
        self.assembler.load(completion);
        self.assembler
            .invoke(Callee::Runtime(RuntimeFn::OutCellSet));
    }
}

#[inline(always)]
fn signal(index: usize) -> i32 {
    match cast::i32(index) {
        Ok(index) if index < i32::MAX => index + 1,
        _ => system_panic!("Too many outlined unit signals."),
    }
}
