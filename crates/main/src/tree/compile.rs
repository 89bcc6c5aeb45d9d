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

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
};

use ahash::AHashMap;
use compact_str::{format_compact, CompactString};

use crate::{
    assembly::{Assembler, Callee, Condition, OpCmd, RuntimeFn, Slot, SlotType},
    config::LoweringConfig,
    lowering::{CompletionType, Lowered, Lowering, NodeKey, OutlineRequest, RoutineOptions},
    tree::{Expr, Stmt},
};

/// An error of the statement tree compilation.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum TreeError {
    /// The variable is not defined in the current scope.
    UnknownVariable(CompactString),

    /// The expression produces a value of unexpected type.
    TypeMismatch { expected: SlotType, found: SlotType },

    /// A `yield` or an `await` expression outside of a resumable routine.
    UnexpectedSuspension,

    /// The number of the parameter names does not match the routine
    /// signature.
    ParamCount { expected: usize, found: usize },
}

impl Display for TreeError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownVariable(name) => {
                formatter.write_fmt(format_args!("unknown variable {name:?}"))
            }

            Self::TypeMismatch { expected, found } => {
                formatter.write_fmt(format_args!("expected {expected} value, found {found}"))
            }

            Self::UnexpectedSuspension => {
                formatter.write_str("suspension point outside of a resumable routine")
            }

            Self::ParamCount { expected, found } => formatter.write_fmt(format_args!(
                "expected {expected} parameter names, found {found}",
            )),
        }
    }
}

impl StdError for TreeError {}

/// Lowers the statements into the routine.
///
/// The `params` are the names and the types of the user parameters of the
/// routine. They must follow the assembler's signature, excluding the
/// resume handle of a resumable routine.
pub fn compile_routine<A: Assembler>(
    assembler: A,
    config: LoweringConfig,
    options: RoutineOptions,
    params: &[(&str, SlotType)],
    body: &[Stmt],
) -> Result<Lowered<A>, TreeError> {
    let mut lowering = Lowering::new(assembler, config, options);

    if lowering.params().len() != params.len() {
        return Err(TreeError::ParamCount {
            expected: lowering.params().len(),
            found: params.len(),
        });
    }

    let mut compiler = TreeCompiler::default();

    for ((name, ty), slot) in params.iter().zip(lowering.params()) {
        compiler.bind(name, Variable { slot: *slot, ty: *ty });
    }

    let _ = compiler.lower_stmts(&mut lowering, body)?;

    Ok(lowering.finish())
}

#[derive(Clone, Copy, Debug)]
struct Variable {
    slot: Slot,
    ty: SlotType,
}

#[derive(Clone)]
struct TreeCompiler {
    env: Vec<AHashMap<CompactString, Variable>>,
}

impl Default for TreeCompiler {
    #[inline(always)]
    fn default() -> Self {
        Self {
            env: vec![AHashMap::new()],
        }
    }
}

impl TreeCompiler {
    fn lower_stmts<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        stmts: &[Stmt],
    ) -> Result<CompletionType, TreeError> {
        let mut completion = CompletionType::Normal;

        for stmt in stmts {
            let CompletionType::Normal = completion else {
                break;
            };

            completion = completion.then(self.lower_stmt(lowering, stmt)?);
        }

        Ok(completion)
    }

    fn lower_scoped<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        stmts: &[Stmt],
    ) -> Result<CompletionType, TreeError> {
        self.env.push(AHashMap::new());

        let result =
            lowering.within_variable_scope(|lowering| self.lower_stmts(lowering, stmts));

        let _ = self.env.pop();

        result
    }

    fn lower_stmt<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        stmt: &Stmt,
    ) -> Result<CompletionType, TreeError> {
        match stmt {
            Stmt::Expr(expr) => {
                let ty = self.lower_expr(lowering, expr)?;

                lowering.store_completion(ty);

                Ok(CompletionType::Normal)
            }

            Stmt::Let { name, value } => {
                let ty = self.lower_expr(lowering, value)?;
                let slot = lowering.define_variable(ty);

                lowering.assembler_mut().store(slot);

                self.bind(name, Variable { slot, ty });

                Ok(CompletionType::Normal)
            }

            Stmt::Block(body) => self.lower_scoped(lowering, body),

            Stmt::If {
                test,
                then,
                otherwise,
            } => self.lower_if(lowering, test, then, otherwise),

            Stmt::While { labels, test, body } => self.lower_while(lowering, labels, test, body),

            Stmt::Labeled { .. } => self.lower_labeled(lowering, stmt),

            Stmt::Break(name) => {
                lowering.emit_break(name.as_deref());

                Ok(CompletionType::Abrupt)
            }

            Stmt::Continue(name) => {
                lowering.emit_continue(name.as_deref());

                Ok(CompletionType::Abrupt)
            }

            Stmt::Return(value) => {
                match value {
                    Some(value) => self.lower_object(lowering, value)?,
                    None => lowering.assembler_mut().push_null(),
                }

                lowering.emit_return();

                Ok(CompletionType::Abrupt)
            }

            Stmt::Throw(value) => {
                self.lower_object(lowering, value)?;

                lowering.assembler_mut().throw();

                Ok(CompletionType::Abrupt)
            }

            Stmt::TryFinally { body, finalizer } => {
                let mut body_compiler = self.clone();
                let mut finalizer_compiler = self.clone();

                lowering.lower_try_finally(
                    |lowering| body_compiler.lower_scoped(lowering, body),
                    |lowering| finalizer_compiler.lower_scoped(lowering, finalizer),
                )
            }

            Stmt::Outlined { key, body } => self.lower_outlined(lowering, *key, body),
        }
    }

    fn lower_if<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        test: &Expr,
        then: &[Stmt],
        otherwise: &[Stmt],
    ) -> Result<CompletionType, TreeError> {
        match constant(test) {
            Some(true) => return self.lower_scoped(lowering, then),
            Some(false) => return self.lower_scoped(lowering, otherwise),
            None => (),
        }

        let otherwise_label = lowering.assembler_mut().new_label();
        let join = lowering.assembler_mut().new_label();

        self.lower_test(lowering, test)?;

        lowering
            .assembler_mut()
            .branch(Condition::False, otherwise_label);

        let then_completion = self.lower_scoped(lowering, then)?;

        if then_completion.is_normal() {
            lowering.assembler_mut().jump(join);
        }

        lowering.assembler_mut().mark(otherwise_label);

        let otherwise_completion = self.lower_scoped(lowering, otherwise)?;

        let completion = then_completion.select(otherwise_completion);

        if completion.is_normal() {
            lowering.assembler_mut().mark(join);
        }

        Ok(completion)
    }

    fn lower_while<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        labels: &[CompactString],
        test: &Expr,
        body: &[Stmt],
    ) -> Result<CompletionType, TreeError> {
        let constant = constant(test);

        if let Some(false) = constant {
            return Ok(CompletionType::Normal);
        }

        let head = lowering.assembler_mut().new_label();
        let exit = lowering.assembler_mut().new_label();

        lowering.assembler_mut().mark(head);

        if constant.is_none() {
            self.lower_test(lowering, test)?;

            lowering.assembler_mut().branch(Condition::False, exit);
        }

        let (_, usage) =
            lowering.within_loop(exit, head, labels, |lowering| self.lower_scoped(lowering, body))?;

        if lowering.assembler().is_reachable() {
            lowering.assembler_mut().jump(head);
        }

        let completion = match constant {
            Some(true) => CompletionType::Abrupt.normal(usage.break_used),
            _ => CompletionType::Normal,
        };

        if completion.is_normal() {
            lowering.assembler_mut().mark(exit);
        }

        Ok(completion)
    }

    fn lower_labeled<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        stmt: &Stmt,
    ) -> Result<CompletionType, TreeError> {
        let mut names = Vec::new();
        let mut target = stmt;

        while let Stmt::Labeled { label, body } = target {
            names.push(label.clone());
            target = body.as_ref();
        }

        if let Stmt::While { labels, test, body } = target {
            names.extend(labels.iter().cloned());

            return self.lower_while(lowering, &names, test, body);
        }

        let exit = lowering.assembler_mut().new_label();

        let (completion, usage) =
            lowering.within_labeled(exit, &names, |lowering| self.lower_stmt(lowering, target))?;

        let completion = completion.select(CompletionType::Abrupt.normal(usage.break_used));

        if completion.is_normal() {
            lowering.assembler_mut().mark(exit);
        }

        Ok(completion)
    }

    fn lower_outlined<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        key: NodeKey,
        body: &[Stmt],
    ) -> Result<CompletionType, TreeError> {
        let may_suspend = body.iter().any(Stmt::contains_suspension);

        if may_suspend && !lowering.is_resumable() {
            return Err(TreeError::UnexpectedSuspension);
        }

        let visible = self.visible();
        let params = visible
            .iter()
            .map(|(_, variable)| variable.ty)
            .collect::<Vec<_>>();

        let name = format_compact!("unit{key}");

        let request = OutlineRequest {
            name: &name,
            params: &params,
            may_suspend,
        };

        let call = lowering.outline_cached(key, None, request, |unit| {
            let mut compiler = TreeCompiler::default();

            for ((name, variable), slot) in visible.iter().zip(unit.params()) {
                compiler.bind(
                    name,
                    Variable {
                        slot: *slot,
                        ty: variable.ty,
                    },
                );
            }

            let _ = compiler.lower_stmts(unit, body)?;

            Ok::<_, TreeError>(())
        })?;

        let want_value = call.produces_value();

        let completion = lowering.invoke(
            &call,
            |lowering| {
                for (_, variable) in &visible {
                    lowering.assembler_mut().load(variable.slot);
                }

                Ok::<_, TreeError>(())
            },
            want_value,
        )?;

        if want_value && completion.is_normal() {
            lowering.store_completion(SlotType::Object);
        }

        Ok(completion)
    }

    fn lower_expr<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        expr: &Expr,
    ) -> Result<SlotType, TreeError> {
        match expr {
            Expr::Int(value) => {
                lowering.assembler_mut().push_int(*value);

                Ok(SlotType::Int)
            }

            Expr::Bool(value) => {
                lowering.assembler_mut().push_bool(*value);

                Ok(SlotType::Bool)
            }

            Expr::Null => {
                lowering.assembler_mut().push_null();

                Ok(SlotType::Object)
            }

            Expr::Var(name) => {
                let variable = self.lookup(name)?;

                lowering.assembler_mut().load(variable.slot);

                Ok(variable.ty)
            }

            Expr::Assign { name, value } => {
                let variable = self.lookup(name)?;
                let ty = self.lower_expr(lowering, value)?;

                coerce(lowering, ty, variable.ty)?;

                lowering.assembler_mut().dup();
                lowering.assembler_mut().store(variable.slot);

                Ok(variable.ty)
            }

            Expr::Add(lhs, rhs) => self.lower_op(lowering, OpCmd::Add, lhs, rhs),
            Expr::Sub(lhs, rhs) => self.lower_op(lowering, OpCmd::Sub, lhs, rhs),
            Expr::Less(lhs, rhs) => self.lower_op(lowering, OpCmd::Lesser, lhs, rhs),

            Expr::Yield(value) | Expr::Await(value) => {
                if !lowering.is_resumable() {
                    return Err(TreeError::UnexpectedSuspension);
                }

                self.lower_object(lowering, value)?;

                lowering
                    .assembler_mut()
                    .invoke(Callee::Runtime(RuntimeFn::Deliver));

                lowering.suspend();

                lowering
                    .assembler_mut()
                    .invoke(Callee::Runtime(RuntimeFn::Receive));

                Ok(SlotType::Object)
            }
        }
    }

    fn lower_op<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        op: OpCmd,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<SlotType, TreeError> {
        let ty = self.lower_expr(lowering, lhs)?;
        coerce(lowering, ty, SlotType::Int)?;

        let ty = self.lower_expr(lowering, rhs)?;
        coerce(lowering, ty, SlotType::Int)?;

        lowering.assembler_mut().op(op);

        Ok(op.result())
    }

    // Stack: () -> (bool)
    fn lower_test<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        test: &Expr,
    ) -> Result<(), TreeError> {
        let ty = self.lower_expr(lowering, test)?;

        coerce(lowering, ty, SlotType::Bool)
    }

    // Stack: () -> (object)
    fn lower_object<A: Assembler>(
        &mut self,
        lowering: &mut Lowering<A>,
        value: &Expr,
    ) -> Result<(), TreeError> {
        let ty = self.lower_expr(lowering, value)?;

        coerce(lowering, ty, SlotType::Object)
    }

    fn bind(&mut self, name: &str, variable: Variable) {
        if let Some(scope) = self.env.last_mut() {
            let _ = scope.insert(CompactString::from(name), variable);
        }
    }

    fn lookup(&self, name: &str) -> Result<Variable, TreeError> {
        self.env
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
            .ok_or_else(|| TreeError::UnknownVariable(CompactString::from(name)))
    }

    // The innermost definitions of the visible variables ordered by name.
    fn visible(&self) -> Vec<(CompactString, Variable)> {
        let mut visible = AHashMap::new();

        for scope in &self.env {
            for (name, variable) in scope {
                let _ = visible.insert(name.clone(), *variable);
            }
        }

        let mut visible = visible.into_iter().collect::<Vec<_>>();

        visible.sort_by(|(a, _), (b, _)| a.cmp(b));

        visible
    }
}

// Stack: (from) -> (to)
fn coerce<A: Assembler>(
    lowering: &mut Lowering<A>,
    from: SlotType,
    to: SlotType,
) -> Result<(), TreeError> {
    if from == to {
        return Ok(());
    }

    match (from, to) {
        (SlotType::Object, to) => lowering.assembler_mut().unbox_value(to),
        (from, SlotType::Object) => lowering.assembler_mut().box_value(from),

        _ => {
            return Err(TreeError::TypeMismatch {
                expected: to,
                found: from,
            })
        }
    }

    Ok(())
}

#[inline(always)]
fn constant(test: &Expr) -> Option<bool> {
    match test {
        Expr::Bool(value) => Some(*value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use compact_str::CompactString;

    use crate::{
        assembly::{Assembler, Assembly, Cmd, SlotType},
        config::LoweringConfig,
        interpret::{Machine, Outcome, RuntimeError, Value},
        lowering::{
            CompletionType,
            Escape,
            Lowered,
            Lowering,
            RoutineKind,
            RoutineOptions,
            RETURN_SIGNAL,
        },
        tree::{
            compile::{compile_routine, TreeCompiler},
            Expr,
            Stmt,
            TreeError,
        },
    };

    fn options(kind: RoutineKind, track_completion: bool) -> RoutineOptions {
        RoutineOptions {
            kind,
            track_completion,
        }
    }

    fn compile_with(
        config: LoweringConfig,
        options: RoutineOptions,
        params: &[(&str, SlotType)],
        body: &[Stmt],
    ) -> Result<Lowered<Assembly>, TreeError> {
        let types = params.iter().map(|(_, ty)| *ty).collect::<Vec<_>>();

        let lowered = compile_routine(
            Assembly::new(options.kind.signature("test", &types)),
            config,
            options,
            params,
            body,
        )?;

        lowered.assembler.finish();

        Ok(lowered)
    }

    fn compile(kind: RoutineKind, body: &[Stmt]) -> Lowered<Assembly> {
        compile_with(LoweringConfig::new(), options(kind, false), &[], body).unwrap()
    }

    fn lowering(kind: RoutineKind) -> Lowering<Assembly> {
        Lowering::new(
            Assembly::new(kind.signature("test", &[])),
            LoweringConfig::new(),
            options(kind, false),
        )
    }

    fn let_stmt(name: &str, value: Expr) -> Stmt {
        Stmt::Let {
            name: CompactString::from(name),
            value,
        }
    }

    fn assign_stmt(name: &str, value: Expr) -> Stmt {
        Stmt::Expr(Expr::assign(name, value))
    }

    fn ret(value: Expr) -> Stmt {
        Stmt::Return(Some(value))
    }

    fn returned(outcome: Outcome) -> Value {
        let Outcome::Returned(value) = outcome else {
            panic!("Returned value expected, found {outcome:?}.");
        };

        value
    }

    // Runs the resumable routine to the end sending null on each resumption.
    fn drive(assembly: &Assembly) -> (Value, Vec<Value>, usize) {
        let mut machine = Machine::new(assembly);
        let mut suspensions = 0;

        let mut outcome = machine.start(vec![Value::Null]).unwrap();

        while let Outcome::Suspended(handle) = outcome {
            suspensions += 1;
            outcome = machine.resume(handle, Value::Null).unwrap();
        }

        (returned(outcome), machine.take_delivered(), suspensions)
    }

    #[test]
    fn test_infinite_loop_is_abrupt() {
        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let completion = compiler
            .lower_stmt(
                &mut lowering,
                &Stmt::While {
                    labels: Vec::new(),
                    test: Expr::Bool(true),
                    body: Vec::new(),
                },
            )
            .unwrap();

        assert_eq!(completion, CompletionType::Abrupt);
        assert!(!lowering.assembler().is_reachable());

        let assembly = lowering.finish().assembler;

        assembly.finish();

        let result = Machine::new(&assembly).with_step_limit(1000).start(Vec::new());

        assert!(matches!(result, Err(RuntimeError::StepLimit { limit: 1000 })));
    }

    #[test]
    fn test_broken_loop_is_normal() {
        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let completion = compiler
            .lower_stmt(
                &mut lowering,
                &Stmt::While {
                    labels: Vec::new(),
                    test: Expr::Bool(true),
                    body: vec![Stmt::Break(None)],
                },
            )
            .unwrap();

        assert_eq!(completion, CompletionType::Normal);
        assert!(lowering.assembler().is_reachable());
    }

    #[test]
    fn test_shared_snapshot() {
        let lowered = compile(
            RoutineKind::Resumable,
            &[
                Stmt::Expr(Expr::yielded(Expr::Int(1))),
                Stmt::Expr(Expr::yielded(Expr::Int(2))),
                ret(Expr::Int(3)),
            ],
        );

        let dispatch = lowered.dispatch.as_ref().unwrap();

        assert_eq!(dispatch.len(), 1);
        assert_eq!(dispatch.offsets(), vec![0, 1]);
        assert_eq!(dispatch.entries()[0].occurrences.len(), 2);
        assert_ne!(dispatch.continuation_of(0), dispatch.continuation_of(1));

        let mut machine = Machine::new(&lowered.assembler);

        let Outcome::Suspended(first) = machine.start(vec![Value::Null]).unwrap() else {
            panic!("Suspension expected.");
        };

        assert_eq!(first.offset, 0);

        let Outcome::Suspended(second) = machine.resume(first, Value::Null).unwrap() else {
            panic!("Suspension expected.");
        };

        assert_eq!(second.offset, 1);

        let value = returned(machine.resume(second, Value::Null).unwrap());

        assert_eq!(value, Value::Int(3));
        assert_eq!(machine.delivered(), &[Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_dispatch_completeness() {
        let lowered = compile(
            RoutineKind::Resumable,
            &[
                Stmt::Expr(Expr::yielded(Expr::Int(1))),
                Stmt::Expr(Expr::yielded(Expr::Int(2))),
                Stmt::Expr(Expr::yielded(Expr::Int(3))),
                ret(Expr::add(Expr::Int(1), Expr::yielded(Expr::Int(4)))),
            ],
        );

        let dispatch = lowered.dispatch.as_ref().unwrap();

        assert_eq!(dispatch.len(), 2);
        assert_eq!(dispatch.offsets(), vec![0, 1, 2, 3]);
        assert_eq!(dispatch.entries()[0].occurrences.len(), 3);
        assert_eq!(dispatch.entry_of(2), Some(&dispatch.entries()[0]));
        assert_eq!(dispatch.entry_of(3), Some(&dispatch.entries()[1]));
        assert_eq!(
            dispatch.entry_of(3).unwrap().snapshot.stack.types(),
            &[SlotType::Int],
        );
        assert_eq!(dispatch.entry_of(4), None);

        let mut machine = Machine::new(&lowered.assembler);

        let mut outcome = machine.start(vec![Value::Null]).unwrap();
        let mut offsets = Vec::new();

        while let Outcome::Suspended(handle) = outcome {
            offsets.push(handle.offset);

            let sent = match handle.offset {
                3 => Value::Int(10),
                _ => Value::Null,
            };

            outcome = machine.resume(handle, sent).unwrap();
        }

        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert_eq!(returned(outcome), Value::Int(11));
        assert_eq!(
            machine.delivered(),
            &[Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
        );
    }

    #[test]
    fn test_distinct_snapshots_without_deduplication() {
        let mut config = LoweringConfig::new();

        config.deduplicate_snapshots = false;

        let lowered = compile_with(
            config,
            options(RoutineKind::Resumable, false),
            &[],
            &[
                Stmt::Expr(Expr::yielded(Expr::Int(1))),
                Stmt::Expr(Expr::yielded(Expr::Int(2))),
            ],
        )
        .unwrap();

        let dispatch = lowered.dispatch.as_ref().unwrap();

        assert_eq!(dispatch.len(), 2);
        assert_eq!(dispatch.offsets(), vec![0, 1]);

        let (value, delivered, suspensions) = drive(&lowered.assembler);

        assert_eq!(value, Value::Null);
        assert_eq!(delivered, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(suspensions, 2);
    }

    #[test]
    fn test_generator_loop() {
        let lowered = compile(
            RoutineKind::Resumable,
            &[
                let_stmt("i", Expr::Int(0)),
                Stmt::While {
                    labels: Vec::new(),
                    test: Expr::less(Expr::var("i"), Expr::Int(3)),
                    body: vec![
                        Stmt::Expr(Expr::yielded(Expr::var("i"))),
                        assign_stmt("i", Expr::add(Expr::var("i"), Expr::Int(1))),
                    ],
                },
                ret(Expr::var("i")),
            ],
        );

        let (value, delivered, suspensions) = drive(&lowered.assembler);

        assert_eq!(value, Value::Int(3));
        assert_eq!(delivered, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert_eq!(suspensions, 3);
    }

    #[test]
    fn test_stack_capture() {
        let body = [ret(Expr::add(
            Expr::Int(1),
            Expr::add(Expr::Int(10), Expr::yielded(Expr::Int(5))),
        ))];

        for inline_singleton_stack in [true, false] {
            let mut config = LoweringConfig::new();

            config.inline_singleton_stack = inline_singleton_stack;

            let lowered = compile_with(
                config,
                options(RoutineKind::Resumable, false),
                &[],
                &body,
            )
            .unwrap();

            let dispatch = lowered.dispatch.as_ref().unwrap();

            assert_eq!(
                dispatch.entries()[0].snapshot.stack.types(),
                &[SlotType::Int, SlotType::Int],
            );

            let mut machine = Machine::new(&lowered.assembler);

            let Outcome::Suspended(handle) = machine.start(vec![Value::Null]).unwrap() else {
                panic!("Suspension expected.");
            };

            let value = returned(machine.resume(handle, Value::Int(7)).unwrap());

            assert_eq!(value, Value::Int(18));
            assert_eq!(machine.delivered(), &[Value::Int(5)]);
        }

        let lowered = compile(
            RoutineKind::Resumable,
            &[ret(Expr::add(Expr::Int(10), Expr::yielded(Expr::Int(5))))],
        );

        let mut machine = Machine::new(&lowered.assembler);

        let Outcome::Suspended(handle) = machine.start(vec![Value::Null]).unwrap() else {
            panic!("Suspension expected.");
        };

        let value = returned(machine.resume(handle, Value::Int(-3)).unwrap());

        assert_eq!(value, Value::Int(7));
    }

    #[test]
    fn test_params_survive_suspension() {
        let lowered = compile_with(
            LoweringConfig::new(),
            options(RoutineKind::Resumable, false),
            &[("n", SlotType::Int)],
            &[
                Stmt::Expr(Expr::yielded(Expr::Null)),
                ret(Expr::add(Expr::var("n"), Expr::Int(1))),
            ],
        )
        .unwrap();

        let mut machine = Machine::new(&lowered.assembler);

        let Outcome::Suspended(handle) = machine.start(vec![Value::Null, Value::Int(41)]).unwrap()
        else {
            panic!("Suspension expected.");
        };

        let value = returned(machine.resume(handle, Value::Null).unwrap());

        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn test_break_through_finally() {
        let lowered = compile(
            RoutineKind::Plain,
            &[
                let_stmt("n", Expr::Int(0)),
                Stmt::While {
                    labels: Vec::new(),
                    test: Expr::Bool(true),
                    body: vec![Stmt::TryFinally {
                        body: vec![
                            assign_stmt("n", Expr::add(Expr::var("n"), Expr::Int(1))),
                            Stmt::Break(None),
                        ],
                        finalizer: vec![assign_stmt(
                            "n",
                            Expr::add(Expr::var("n"), Expr::Int(10)),
                        )],
                    }],
                },
                ret(Expr::var("n")),
            ],
        );

        assert_eq!(lowered.assembler.handlers().len(), 1);

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(11));
    }

    #[test]
    fn test_break_through_nested_finally() {
        let lowered = compile(
            RoutineKind::Plain,
            &[
                let_stmt("n", Expr::Int(0)),
                Stmt::While {
                    labels: Vec::new(),
                    test: Expr::Bool(true),
                    body: vec![Stmt::TryFinally {
                        body: vec![Stmt::TryFinally {
                            body: vec![
                                assign_stmt("n", Expr::add(Expr::var("n"), Expr::Int(1))),
                                Stmt::Break(None),
                            ],
                            finalizer: vec![assign_stmt(
                                "n",
                                Expr::add(Expr::var("n"), Expr::Int(10)),
                            )],
                        }],
                        finalizer: vec![assign_stmt(
                            "n",
                            Expr::add(Expr::var("n"), Expr::Int(100)),
                        )],
                    }],
                },
                ret(Expr::var("n")),
            ],
        );

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(111));
    }

    #[test]
    fn test_return_through_finally() {
        let lowered = compile(
            RoutineKind::Plain,
            &[
                let_stmt("x", Expr::Int(0)),
                Stmt::TryFinally {
                    body: vec![ret(Expr::var("x"))],
                    finalizer: vec![assign_stmt("x", Expr::Int(5))],
                },
            ],
        );

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(0));
    }

    #[test]
    fn test_exception_through_finally() {
        let lowered = compile(
            RoutineKind::Resumable,
            &[Stmt::TryFinally {
                body: vec![Stmt::Throw(Expr::Int(42))],
                finalizer: vec![Stmt::Expr(Expr::yielded(Expr::Int(1)))],
            }],
        );

        let mut machine = Machine::new(&lowered.assembler);

        let Outcome::Suspended(handle) = machine.start(vec![Value::Null]).unwrap() else {
            panic!("Suspension expected.");
        };

        let outcome = machine.resume(handle, Value::Null).unwrap();

        assert!(matches!(outcome, Outcome::Threw(Value::Int(42))));
        assert_eq!(machine.delivered(), &[Value::Int(1)]);
    }

    #[test]
    fn test_labeled_block() {
        let lowered = compile(
            RoutineKind::Plain,
            &[
                let_stmt("x", Expr::Int(1)),
                Stmt::Labeled {
                    label: CompactString::from("block"),
                    body: Box::new(Stmt::Block(vec![
                        assign_stmt("x", Expr::Int(2)),
                        Stmt::If {
                            test: Expr::less(Expr::var("x"), Expr::Int(5)),
                            then: vec![Stmt::Break(Some(CompactString::from("block")))],
                            otherwise: Vec::new(),
                        },
                        assign_stmt("x", Expr::Int(3)),
                    ])),
                },
                ret(Expr::var("x")),
            ],
        );

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(2));
    }

    #[test]
    fn test_outlined_signals() {
        let body = [
            let_stmt("i", Expr::Int(0)),
            Stmt::Labeled {
                label: CompactString::from("outer"),
                body: Box::new(Stmt::While {
                    labels: Vec::new(),
                    test: Expr::Bool(true),
                    body: vec![
                        assign_stmt("i", Expr::add(Expr::var("i"), Expr::Int(1))),
                        Stmt::Outlined {
                            key: 1,
                            body: vec![
                                Stmt::If {
                                    test: Expr::less(Expr::var("i"), Expr::Int(3)),
                                    then: vec![Stmt::Continue(Some(CompactString::from("outer")))],
                                    otherwise: Vec::new(),
                                },
                                Stmt::Break(None),
                            ],
                        },
                    ],
                }),
            },
            ret(Expr::var("i")),
        ];

        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let _ = compiler.lower_stmts(&mut lowering, &body).unwrap();

        let call = lowering.outlined(1, None).unwrap();
        let state = call.state();

        assert_eq!(state.len(), 2);
        assert_eq!(state.signal_of(&Escape::continue_to(Some("outer"))), Some(1));
        assert_eq!(state.signal_of(&Escape::break_to(None)), Some(2));
        assert_eq!(state.signal_of(&Escape::ret()), None);
        assert!(!state.suspends());
        assert_eq!(call.completion(), CompletionType::Abrupt);

        let assembly = lowering.finish().assembler;

        assembly.finish();

        assert_eq!(assembly.subroutines().len(), 1);

        let value = returned(Machine::new(&assembly).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_outlined_switch_signals() {
        let body = [
            let_stmt("i", Expr::Int(0)),
            Stmt::While {
                labels: Vec::new(),
                test: Expr::Bool(true),
                body: vec![
                    assign_stmt("i", Expr::add(Expr::var("i"), Expr::Int(1))),
                    Stmt::Outlined {
                        key: 8,
                        body: vec![
                            Stmt::If {
                                test: Expr::less(Expr::var("i"), Expr::Int(2)),
                                then: vec![Stmt::Continue(None)],
                                otherwise: Vec::new(),
                            },
                            Stmt::If {
                                test: Expr::less(Expr::var("i"), Expr::Int(3)),
                                then: vec![ret(Expr::add(Expr::var("i"), Expr::Int(1)))],
                                otherwise: Vec::new(),
                            },
                            Stmt::Break(None),
                        ],
                    },
                ],
            },
            ret(Expr::Int(0)),
        ];

        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let _ = compiler.lower_stmts(&mut lowering, &body).unwrap();

        let call = lowering.outlined(8, None).unwrap();
        let state = call.state();

        assert!(state.len() > lowering.config().equality_dispatch_limit);
        assert_eq!(state.signal_of(&Escape::ret()), Some(RETURN_SIGNAL));
        assert_eq!(state.signal_of(&Escape::continue_to(None)), Some(2));
        assert_eq!(state.signal_of(&Escape::break_to(None)), Some(3));

        let assembly = lowering.finish().assembler;

        assembly.finish();

        assert!(assembly
            .commands()
            .iter()
            .any(|cmd| matches!(cmd, Cmd::TableSwitch(..))));

        let value = returned(Machine::new(&assembly).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_outlined_return() {
        let body = [
            let_stmt("x", Expr::Int(4)),
            Stmt::Outlined {
                key: 2,
                body: vec![
                    Stmt::If {
                        test: Expr::less(Expr::var("x"), Expr::Int(5)),
                        then: vec![ret(Expr::add(Expr::var("x"), Expr::Int(1)))],
                        otherwise: Vec::new(),
                    },
                ],
            },
            ret(Expr::Int(0)),
        ];

        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let _ = compiler.lower_stmts(&mut lowering, &body).unwrap();

        let call = lowering.outlined(2, None).unwrap();

        assert_eq!(call.state().signal_of(&Escape::ret()), Some(RETURN_SIGNAL));
        assert_eq!(call.completion(), CompletionType::Normal);

        let assembly = lowering.finish().assembler;

        assembly.finish();

        let value = returned(Machine::new(&assembly).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(5));
    }

    #[test]
    fn test_outlined_completion_value() {
        let track = options(RoutineKind::Plain, true);

        let lowered = compile_with(
            LoweringConfig::new(),
            track,
            &[],
            &[
                Stmt::Expr(Expr::Int(4)),
                Stmt::Outlined {
                    key: 3,
                    body: vec![Stmt::Expr(Expr::Int(6))],
                },
            ],
        )
        .unwrap();

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(6));

        let lowered = compile_with(
            LoweringConfig::new(),
            track,
            &[],
            &[
                Stmt::Expr(Expr::Int(4)),
                Stmt::Outlined {
                    key: 4,
                    body: vec![let_stmt("unused", Expr::Bool(true))],
                },
            ],
        )
        .unwrap();

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(4));
    }

    #[test]
    fn test_outlined_suspension() {
        let lowered = compile(
            RoutineKind::Resumable,
            &[
                let_stmt("base", Expr::Int(10)),
                Stmt::Outlined {
                    key: 5,
                    body: vec![
                        Stmt::Expr(Expr::yielded(Expr::var("base"))),
                        Stmt::Expr(Expr::yielded(Expr::add(Expr::var("base"), Expr::Int(1)))),
                    ],
                },
                ret(Expr::Int(9)),
            ],
        );

        let mut machine = Machine::new(&lowered.assembler);

        let Outcome::Suspended(handle) = machine.start(vec![Value::Null]).unwrap() else {
            panic!("Suspension expected.");
        };

        assert_eq!(handle.depth(), 2);

        let mut outcome = machine.resume(handle, Value::Null).unwrap();

        while let Outcome::Suspended(handle) = outcome {
            outcome = machine.resume(handle, Value::Null).unwrap();
        }

        assert_eq!(returned(outcome), Value::Int(9));
        assert_eq!(machine.delivered(), &[Value::Int(10), Value::Int(11)]);
    }

    #[test]
    fn test_outlined_cache() {
        let lowered = compile(
            RoutineKind::Plain,
            &[
                let_stmt("x", Expr::Int(1)),
                Stmt::TryFinally {
                    body: vec![assign_stmt("x", Expr::Int(2))],
                    finalizer: vec![Stmt::Outlined {
                        key: 6,
                        body: vec![Stmt::Expr(Expr::var("x"))],
                    }],
                },
                ret(Expr::var("x")),
            ],
        );

        assert_eq!(lowered.assembler.subroutines().len(), 1);

        let value = returned(Machine::new(&lowered.assembler).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(2));
    }

    #[test]
    fn test_outlined_cache_in_nested_unit() {
        let guarded = Stmt::Outlined {
            key: 9,
            body: vec![Stmt::If {
                test: Expr::less(Expr::var("x"), Expr::Int(5)),
                then: vec![ret(Expr::add(Expr::var("x"), Expr::Int(1)))],
                otherwise: Vec::new(),
            }],
        };

        let body = [
            let_stmt("x", Expr::Int(10)),
            guarded.clone(),
            assign_stmt("x", Expr::Int(3)),
            Stmt::Outlined {
                key: 10,
                body: vec![guarded],
            },
            ret(Expr::Int(0)),
        ];

        let mut lowering = lowering(RoutineKind::Plain);
        let mut compiler = TreeCompiler::default();

        let _ = compiler.lower_stmts(&mut lowering, &body).unwrap();

        assert_eq!(lowering.outlined(9, None).unwrap().subroutine(), 0);
        assert_eq!(lowering.outlined(10, None).unwrap().subroutine(), 1);
        assert_eq!(lowering.helpers().len(), 3);

        let assembly = lowering.finish().assembler;

        assembly.finish();

        assert_eq!(assembly.subroutines().len(), 2);
        assert_eq!(assembly.subroutines()[1].subroutines().len(), 1);

        let value = returned(Machine::new(&assembly).start(Vec::new()).unwrap());

        assert_eq!(value, Value::Int(4));
    }

    #[test]
    fn test_outlined_cache_across_routines() {
        let body = [Stmt::Outlined {
            key: 11,
            body: vec![ret(Expr::Int(7))],
        }];

        let mut first = lowering(RoutineKind::Plain);

        let _ = TreeCompiler::default()
            .lower_stmts(&mut first, &body)
            .unwrap();

        let mut second = Lowering::with_helpers(
            Assembly::new(RoutineKind::Plain.signature("sibling", &[])),
            LoweringConfig::new(),
            options(RoutineKind::Plain, false),
            first.helpers().clone(),
        );

        let _ = TreeCompiler::default()
            .lower_stmts(&mut second, &body)
            .unwrap();

        assert!(second.helpers().is_shared_with(first.helpers()));
        assert!(!lowering(RoutineKind::Plain)
            .helpers()
            .is_shared_with(first.helpers()));
        assert_eq!(first.helpers().len(), 2);
        assert_eq!(first.outlined(11, None).unwrap().subroutine(), 0);
        assert_eq!(second.outlined(11, None).unwrap().subroutine(), 0);

        for lowering in [first, second] {
            let assembly = lowering.finish().assembler;

            assembly.finish();

            assert_eq!(assembly.subroutines().len(), 1);

            let value = returned(Machine::new(&assembly).start(Vec::new()).unwrap());

            assert_eq!(value, Value::Int(7));
        }
    }

    #[test]
    fn test_errors() {
        let unknown = compile_with(
            LoweringConfig::new(),
            options(RoutineKind::Plain, false),
            &[],
            &[ret(Expr::var("missing"))],
        );

        assert_eq!(
            unknown.err(),
            Some(TreeError::UnknownVariable(CompactString::from("missing"))),
        );

        let suspension = compile_with(
            LoweringConfig::new(),
            options(RoutineKind::Plain, false),
            &[],
            &[Stmt::Outlined {
                key: 7,
                body: vec![Stmt::Expr(Expr::yielded(Expr::Null))],
            }],
        );

        assert_eq!(suspension.err(), Some(TreeError::UnexpectedSuspension));

        let mismatch = compile_with(
            LoweringConfig::new(),
            options(RoutineKind::Plain, false),
            &[],
            &[Stmt::If {
                test: Expr::Int(1),
                then: Vec::new(),
                otherwise: Vec::new(),
            }],
        );

        assert_eq!(
            mismatch.err(),
            Some(TreeError::TypeMismatch {
                expected: SlotType::Bool,
                found: SlotType::Int,
            }),
        );
    }
}
