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

//! The control-flow lowering core.
//!
//! A [Lowering] object accompanies the compilation of a single routine. The
//! code generator walks the syntax tree, emits the ordinary code directly
//! into the [Assembler], and calls into the Lowering object for everything
//! related to the non-local control flow:
//!
//!  - Opening and closing the loop, switch, labeled statement, and variable
//!    scopes, and resolving the `break`, `continue`, and `return` targets.
//!  - Lowering the try-finally regions, where every escape from the protected
//!    block is routed through a copy of the finalizer.
//!  - Marking the suspension points of the resumable routines (generators and
//!    async functions). The Lowering object captures the live operand stack
//!    and the live locals at each point, and emits the resume dispatcher that
//!    restores them.
//!  - Splitting a part of the routine into a separately callable unit whose
//!    non-local escapes are reported back to the call site as integer
//!    signals.
//!
//! The Lowering object never inspects the syntax tree. The statement
//! completion analysis is expressed through the [CompletionType] algebra
//! that the code generator composes itself.

mod completion;
mod outline;
mod region;
mod resume;
mod scope;
mod switch;

use compact_str::CompactString;
use log::debug;

pub use crate::lowering::{
    completion::CompletionType,
    outline::{
        HelperCache,
        LabelState,
        NodeKey,
        OutlineRequest,
        OutlinedCall,
        NORMAL_SIGNAL,
        RETURN_SIGNAL,
        SUSPEND_SIGNAL,
    },
    region::FinallyExits,
    resume::{DispatchEntry, DispatchTable, ExecutionSnapshot, Occurrence},
    scope::{Escape, EscapeKind, ScopeUsage, TemporaryLabel},
};
use crate::{
    assembly::{Assembler, Callee, Condition, Label, RuntimeFn, Signature, Slot, SlotType},
    config::LoweringConfig,
    lowering::{
        resume::ResumeState,
        scope::{OuterView, ScopeKind, ScopeStack},
    },
    report::{system_panic, LOWERING_LOG},
};

/// A kind of the routine compiled by the [Lowering] object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RoutineKind {
    /// An ordinary routine that runs to completion.
    Plain,

    /// A generator or an async function.
    ///
    /// The first parameter of the routine is the resume handle. The caller
    /// passes null to start the routine, and the previously returned handle
    /// to resume it. The routine returns either the final value or a resume
    /// handle if it has been suspended.
    Resumable,
}

impl RoutineKind {
    /// Builds a signature of a routine of this kind with the specified user
    /// parameters.
    pub fn signature(self, name: impl Into<CompactString>, params: &[SlotType]) -> Signature {
        let mut all = Vec::with_capacity(params.len() + 1);

        if let Self::Resumable = self {
            all.push(SlotType::Object);
        }

        all.extend_from_slice(params);

        Signature::new(name, all, Some(SlotType::Object))
    }
}

/// Options of the routine compilation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RoutineOptions {
    pub kind: RoutineKind,

    /// If set, the routine keeps the completion value of the last executed
    /// expression statement and returns it when the control reaches the end
    /// of the routine body (script and eval routines).
    pub track_completion: bool,
}

/// The result of the routine lowering.
pub struct Lowered<A: Assembler> {
    pub assembler: A,

    /// The resume dispatch table of a resumable routine.
    pub dispatch: Option<DispatchTable>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum UnitKind {
    Routine(RoutineKind),
    Outlined { may_suspend: bool },
}

pub(crate) type UnitId = usize;

/// The lowering context of a single routine.
///
/// See the [module documentation](crate::lowering) for details.
pub struct Lowering<A: Assembler> {
    assembler: A,
    config: LoweringConfig,
    kind: UnitKind,
    unit: UnitId,
    helpers: HelperCache,
    scopes: ScopeStack,
    variables: Vec<Vec<Slot>>,
    resume: Option<ResumeState>,
    params: Vec<Slot>,
    out: Option<Slot>,
    exit: Label,
    return_slot: Slot,
    completion: Option<Slot>,
}

impl<A: Assembler> Lowering<A> {
    /// Starts the lowering of a routine.
    ///
    /// The assembler's signature must follow the [RoutineKind::signature]
    /// layout.
    pub fn new(assembler: A, config: LoweringConfig, options: RoutineOptions) -> Self {
        Self::with_helpers(assembler, config, options, HelperCache::new())
    }

    /// Starts the lowering of a routine that shares the outlined units cache
    /// with other routines.
    pub fn with_helpers(
        assembler: A,
        config: LoweringConfig,
        options: RoutineOptions,
        helpers: HelperCache,
    ) -> Self {
        let signature = assembler.signature();

        if signature.result != Some(SlotType::Object) {
            system_panic!("Routine {:?} must return an object.", signature.name);
        }

        if let RoutineKind::Resumable = options.kind {
            if signature.params.first() != Some(&SlotType::Object) {
                system_panic!(
                    "Resumable routine {:?} must receive the resume handle first.",
                    signature.name,
                );
            }
        }

        Self::start(
            assembler,
            config,
            UnitKind::Routine(options.kind),
            helpers,
            None,
            options.track_completion,
        )
    }

    fn start(
        mut assembler: A,
        config: LoweringConfig,
        kind: UnitKind,
        helpers: HelperCache,
        outer: Option<OuterView>,
        track_completion: bool,
    ) -> Self {
        let unit = helpers.next_unit();
        let signature = assembler.signature().clone();

        let (handle, out, first_param) = match kind {
            UnitKind::Routine(RoutineKind::Plain) => (None, None, 0),
            UnitKind::Routine(RoutineKind::Resumable) => (Some(signature.param_slot(0)), None, 1),

            UnitKind::Outlined { may_suspend: false } => (None, Some(signature.param_slot(0)), 1),

            UnitKind::Outlined { may_suspend: true } => (
                Some(signature.param_slot(0)),
                Some(signature.param_slot(1)),
                2,
            ),
        };

        let params = (first_param..signature.params.len())
            .map(|index| signature.param_slot(index))
            .collect::<Vec<_>>();

        debug!(
            target: LOWERING_LOG,
            "Lowering of {:?} started ({kind:?}).",
            signature.name,
        );

        let resume = match handle {
            Some(handle) => {
                let dispatcher = assembler.new_label();
                let entry = assembler.new_label();

                assembler.load(handle);
                assembler.branch(Condition::NonNull, dispatcher);
                assembler.mark(entry);

                Some(ResumeState::new(handle, dispatcher, entry))
            }

            None => None,
        };

        let exit = assembler.new_label();

        let return_slot = assembler.define_local(SlotType::Object);

        assembler.push_null();
        assembler.store(return_slot);

        let completion = match track_completion {
            false => None,

            true => {
                let slot = assembler.define_local(SlotType::Object);

                match out {
                    Some(out) => {
                        assembler.load(out);
                        assembler.invoke(Callee::Runtime(RuntimeFn::OutCellGet));
                    }

                    None => assembler.push_null(),
                }

                assembler.store(slot);

                Some(slot)
            }
        };

        let mut scopes = ScopeStack::new();

        match outer {
            Some(outer) => scopes.push_outline(outer, return_slot),
            None => scopes.push_routine(exit, return_slot),
        }

        Self {
            assembler,
            config,
            kind,
            unit,
            helpers,
            scopes,
            variables: vec![Vec::new()],
            resume,
            params,
            out,
            exit,
            return_slot,
            completion,
        }
    }

    /// Finishes the routine: emits the implicit return at the end of the
    /// body, the return epilogue, and the resume dispatcher.
    pub fn finish(mut self) -> Lowered<A> {
        if let UnitKind::Outlined { .. } = self.kind {
            system_panic!("Outlined units are finished by the outline function.");
        }

        self.close_root_variables();

        if self.assembler.is_reachable() {
            match self.completion {
                Some(slot) => self.assembler.load(slot),
                None => self.assembler.push_null(),
            }

            self.emit_return();
        }

        let _ = self.scopes.pop(ScopeKind::Routine);

        if self.scopes.depth() != 0 {
            system_panic!("Unbalanced label scopes at the end of the routine.");
        }

        self.assembler.mark(self.exit);
        self.assembler.load(self.return_slot);
        self.assembler.ret();

        let dispatch = self.emit_dispatcher();

        debug!(
            target: LOWERING_LOG,
            "Lowering of {:?} finished.",
            self.assembler.signature().name,
        );

        Lowered {
            assembler: self.assembler,
            dispatch,
        }
    }

    #[inline(always)]
    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    /// Gives direct access to the assembler to emit the ordinary code.
    #[inline(always)]
    pub fn assembler_mut(&mut self) -> &mut A {
        &mut self.assembler
    }

    #[inline(always)]
    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    #[inline(always)]
    pub fn helpers(&self) -> &HelperCache {
        &self.helpers
    }

    /// The local slots of the user parameters of the routine.
    #[inline(always)]
    pub fn params(&self) -> &[Slot] {
        &self.params
    }

    /// Returns true if the routine may contain suspension points.
    #[inline(always)]
    pub fn is_resumable(&self) -> bool {
        self.resume.is_some()
    }

    /// The local that keeps the completion value of the routine, if the
    /// routine tracks completion values.
    #[inline(always)]
    pub fn completion_slot(&self) -> Option<Slot> {
        self.completion
    }

    /// `(value) -> ()`: stores the value as the current completion value, or
    /// drops it if the routine does not track completion values.
    pub fn store_completion(&mut self, ty: SlotType) {
        let Some(slot) = self.completion else {
            self.assembler.pop();
            return;
        };

        if ty.is_primitive() {
            self.assembler.box_value(ty);
        }

        self.assembler.store(slot);
    }

    pub fn enter_variable_scope(&mut self) {
        self.variables.push(Vec::new());
    }

    /// Allocates a local slot that lives until the end of the current
    /// variable scope.
    pub fn define_variable(&mut self, ty: SlotType) -> Slot {
        let slot = self.assembler.define_local(ty);

        let Some(scope) = self.variables.last_mut() else {
            system_panic!("Variable definition outside of a variable scope.");
        };

        scope.push(slot);

        slot
    }

    pub fn exit_variable_scope(&mut self) {
        if self.variables.len() <= 1 {
            system_panic!("Exit from the root variable scope.");
        }

        self.release_variables();
    }

    pub fn within_variable_scope<T, E>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        self.enter_variable_scope();

        let result = body(self);

        self.exit_variable_scope();

        result
    }

    /// Opens the scope of a loop statement.
    ///
    /// The `names` are the labels of the statement (`outer: while ..`).
    pub fn enter_loop(&mut self, break_target: Label, continue_target: Label, names: &[CompactString]) {
        self.scopes
            .push_target(ScopeKind::Loop, break_target, Some(continue_target), names);
    }

    pub fn exit_loop(&mut self) -> ScopeUsage {
        self.scopes.pop(ScopeKind::Loop).usage()
    }

    pub fn enter_switch(&mut self, break_target: Label, names: &[CompactString]) {
        self.scopes
            .push_target(ScopeKind::Switch, break_target, None, names);
    }

    pub fn exit_switch(&mut self) -> ScopeUsage {
        self.scopes.pop(ScopeKind::Switch).usage()
    }

    /// Opens the scope of a labeled non-loop statement. Only the named
    /// `break` statements can target such statements.
    pub fn enter_labeled(&mut self, break_target: Label, names: &[CompactString]) {
        self.scopes
            .push_target(ScopeKind::Labeled, break_target, None, names);
    }

    pub fn exit_labeled(&mut self) -> ScopeUsage {
        self.scopes.pop(ScopeKind::Labeled).usage()
    }

    pub fn within_loop<T, E>(
        &mut self,
        break_target: Label,
        continue_target: Label,
        names: &[CompactString],
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<(T, ScopeUsage), E> {
        self.enter_loop(break_target, continue_target, names);

        let result = body(self);

        let usage = self.exit_loop();

        Ok((result?, usage))
    }

    pub fn within_switch<T, E>(
        &mut self,
        break_target: Label,
        names: &[CompactString],
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<(T, ScopeUsage), E> {
        self.enter_switch(break_target, names);

        let result = body(self);

        let usage = self.exit_switch();

        Ok((result?, usage))
    }

    pub fn within_labeled<T, E>(
        &mut self,
        break_target: Label,
        names: &[CompactString],
        body: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<(T, ScopeUsage), E> {
        self.enter_labeled(break_target, names);

        let result = body(self);

        let usage = self.exit_labeled();

        Ok((result?, usage))
    }

    /// Resolves the target of `break` (or `break <name>`) from the current
    /// position.
    ///
    /// If the jump crosses a finally region or leaves the outlined unit, the
    /// returned label is a temporary label of the innermost crossed region.
    pub fn break_label(&mut self, name: Option<&str>) -> Label {
        self.scopes
            .resolve(&mut self.assembler, &Escape::break_to(name))
            .label
    }

    /// Resolves the target of `continue` (or `continue <name>`) from the
    /// current position.
    pub fn continue_label(&mut self, name: Option<&str>) -> Label {
        self.scopes
            .resolve(&mut self.assembler, &Escape::continue_to(name))
            .label
    }

    /// Resolves the target of `return` and the local that must receive the
    /// returned value before the jump.
    pub fn return_label(&mut self) -> (Label, Slot) {
        let resolved = self.scopes.resolve(&mut self.assembler, &Escape::ret());

        let Some(carrier) = resolved.carrier else {
            system_panic!("Return target without a value carrier.");
        };

        (resolved.label, carrier)
    }

    pub fn emit_break(&mut self, name: Option<&str>) {
        let target = self.break_label(name);

        self.assembler.jump(target);
    }

    pub fn emit_continue(&mut self, name: Option<&str>) {
        let target = self.continue_label(name);

        self.assembler.jump(target);
    }

    /// `(object) -> ()`: returns the value from the routine.
    pub fn emit_return(&mut self) {
        let (target, carrier) = self.return_label();

        self.assembler.store(carrier);
        self.assembler.jump(target);
    }

    // Continues an escape that has been intercepted by a temporary label.
    pub(crate) fn emit_escape(&mut self, escape: &Escape, carrier: Option<Slot>) {
        match escape.kind {
            EscapeKind::Return => {
                let Some(carrier) = carrier else {
                    system_panic!("Intercepted return without a value carrier.");
                };

                self.assembler.load(carrier);
                self.emit_return();
            }

            EscapeKind::Break | EscapeKind::Continue => {
                let target = self.scopes.resolve(&mut self.assembler, escape).label;

                self.assembler.jump(target);
            }
        }
    }

    // Slots that never take part in the captured state.
    fn reserved_slots(&self) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(2);

        if let Some(resume) = &self.resume {
            slots.push(resume.handle);
        }

        if let Some(out) = self.out {
            slots.push(out);
        }

        slots
    }

    fn close_root_variables(&mut self) {
        if self.variables.len() != 1 {
            system_panic!(
                "Unbalanced variable scopes at the end of {:?}.",
                self.assembler.signature().name,
            );
        }

        self.release_variables();
    }

    fn release_variables(&mut self) {
        let Some(scope) = self.variables.pop() else {
            system_panic!("Variable scope stack underflow.");
        };

        for slot in scope.into_iter().rev() {
            self.assembler.release_local(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Assembler, Assembly, Cmd, Slot, SlotType},
        config::LoweringConfig,
        lowering::{Lowering, RoutineKind, RoutineOptions},
    };

    fn plain(track_completion: bool) -> Lowering<Assembly> {
        Lowering::new(
            Assembly::new(RoutineKind::Plain.signature("test", &[SlotType::Int])),
            LoweringConfig::new(),
            RoutineOptions {
                kind: RoutineKind::Plain,
                track_completion,
            },
        )
    }

    #[test]
    fn test_signature_layout() {
        let signature = RoutineKind::Resumable.signature("gen", &[SlotType::Int]);

        assert_eq!(signature.params, vec![SlotType::Object, SlotType::Int]);
        assert_eq!(signature.result, Some(SlotType::Object));
    }

    #[test]
    fn test_params() {
        let lowering = plain(false);

        assert_eq!(lowering.params(), &[Slot(0)]);
        assert!(!lowering.is_resumable());
        assert_eq!(lowering.completion_slot(), None);
    }

    #[test]
    fn test_implicit_return() {
        let lowering = plain(true);

        assert!(lowering.completion_slot().is_some());

        let lowered = lowering.finish();

        assert!(lowered.dispatch.is_none());

        let assembly = lowered.assembler;

        assembly.finish();

        assert!(matches!(assembly.commands().last(), Some(Cmd::Return(..))));
    }

    #[test]
    fn test_variable_scopes() {
        let mut lowering = plain(false);

        let first = lowering
            .within_variable_scope::<_, ()>(|lowering| Ok(lowering.define_variable(SlotType::Int)))
            .unwrap();

        let second = lowering.define_variable(SlotType::Bool);

        assert_eq!(first, second);

        lowering.assembler_mut().push_int(5);
        lowering.store_completion(SlotType::Int);

        assert!(lowering.assembler().stack_snapshot().is_empty());

        let _ = lowering.finish();
    }

    #[test]
    #[should_panic(expected = "Exit from the root variable scope.")]
    fn test_unbalanced_variable_scopes() {
        let mut lowering = plain(false);

        lowering.exit_variable_scope();
    }

    #[test]
    fn test_error_path_pops_scope() {
        let mut lowering = plain(false);

        let exit = lowering.assembler_mut().new_label();
        let next = lowering.assembler_mut().new_label();

        let result = lowering.within_loop::<(), _>(exit, next, &[], |lowering| {
            lowering.emit_break(None);

            Err("compilation error")
        });

        assert_eq!(result, Err("compilation error"));
        assert_eq!(lowering.scopes.depth(), 1);
    }
}
