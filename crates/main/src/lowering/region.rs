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

use log::trace;

use crate::{
    assembly::{Assembler, Slot, SlotType},
    lowering::{scope::ScopeKind, CompletionType, Lowering, TemporaryLabel},
    report::{system_panic, LOWERING_LOG},
};

/// The escapes that left a finally region.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FinallyExits {
    /// The local that carries the returned value through the region.
    pub carrier: Slot,

    /// The temporary labels of the escapes in the order of their first use.
    pub temporaries: Vec<TemporaryLabel>,
}

impl<A: Assembler> Lowering<A> {
    /// Opens a region whose escapes must run extra code before they reach
    /// their targets.
    ///
    /// Every `break`, `continue`, or `return` inside the region that targets
    /// a label outside of it resolves to a temporary label of the region.
    /// Returns the local that carries the returned value.
    pub fn enter_finally(&mut self) -> Slot {
        let carrier = self.assembler.define_local(SlotType::Object);

        self.assembler.push_null();
        self.assembler.store(carrier);

        self.scopes.push_finally(carrier);

        carrier
    }

    /// Closes the region opened by [enter_finally](Lowering::enter_finally).
    ///
    /// The caller is responsible for marking each returned temporary label,
    /// emitting the extra code, continuing the escape, and releasing the
    /// carrier local.
    pub fn exit_finally(&mut self) -> FinallyExits {
        let mut scope = self.scopes.pop(ScopeKind::Finally);

        let Some(carrier) = scope.completion_slot else {
            system_panic!("Finally region without the value carrier.");
        };

        FinallyExits {
            carrier,
            temporaries: scope.take_temporaries(),
        }
    }

    /// Lowers `try { body } finally { finalizer }`.
    ///
    /// The `finalizer` function is called once per exit path of the body:
    /// the normal completion, each distinct escape, and the exception
    /// handler. Each call must emit a separate copy of the finalizer code.
    /// The exception handler rethrows the caught exception after the
    /// finalizer.
    ///
    /// The operand stack must be empty at the beginning of the statement.
    pub fn lower_try_finally<E>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<CompletionType, E>,
        mut finalizer: impl FnMut(&mut Self) -> Result<CompletionType, E>,
    ) -> Result<CompletionType, E> {
        if !self.assembler.stack_snapshot().is_empty() {
            system_panic!("Try-finally statement with a non-empty operand stack.");
        }

        let start = self.assembler.new_label();
        let end = self.assembler.new_label();
        let handler = self.assembler.new_label();
        let after = self.assembler.new_label();

        let carrier = self.enter_finally();

        self.assembler.mark(start);

        let body_completion = match body(self) {
            Ok(completion) => completion,

            Err(error) => {
                let _ = self.exit_finally();
                self.assembler.release_local(carrier);

                return Err(error);
            }
        };

        if body_completion.is_normal() != self.assembler.is_reachable() {
            system_panic!("Completion of the protected block disagrees with its reachability.");
        }

        let exits = self.exit_finally();

        trace!(
            target: LOWERING_LOG,
            "Finally region {start}..{end}: {} escapes.",
            exits.temporaries.len(),
        );

        // The end of the protected range is marked together with the first
        // label of the code that follows the body.
        let mut pending_end = Some(end);

        let mut completion = CompletionType::Abrupt;

        if body_completion.is_normal() {
            self.assembler.mark(end);
            pending_end = None;

            if finalizer(self)?.is_normal() {
                self.assembler.jump(after);
                completion = CompletionType::Normal;
            }
        }

        for temporary in &exits.temporaries {
            self.assembler.mark(temporary.label);

            if let Some(end) = pending_end.take() {
                self.assembler.mark(end);
            }

            if finalizer(self)?.is_normal() {
                self.emit_escape(&temporary.escape, Some(exits.carrier));
            }
        }

        self.assembler.protect(start, end, handler);
        self.assembler.mark(handler);

        if let Some(end) = pending_end.take() {
            self.assembler.mark(end);
        }

        let exception = self.assembler.define_local(SlotType::Object);

        self.assembler.store(exception);

        if finalizer(self)?.is_normal() {
            self.assembler.load(exception);
            self.assembler.throw();
        }

        self.assembler.release_local(exception);
        self.assembler.release_local(exits.carrier);

        if completion.is_normal() {
            self.assembler.mark(after);
        }

        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Assembler, Assembly},
        config::LoweringConfig,
        lowering::{CompletionType, Lowering, RoutineKind, RoutineOptions},
    };

    fn plain() -> Lowering<Assembly> {
        Lowering::new(
            Assembly::new(RoutineKind::Plain.signature("test", &[])),
            LoweringConfig::new(),
            RoutineOptions {
                kind: RoutineKind::Plain,
                track_completion: false,
            },
        )
    }

    #[test]
    fn test_break_through_finally() {
        let mut lowering = plain();

        let exit = lowering.assembler_mut().new_label();
        let next = lowering.assembler_mut().new_label();

        lowering.assembler_mut().mark(next);

        let mut copies = 0;

        let ((), usage) = lowering
            .within_loop::<_, ()>(exit, next, &[], |lowering| {
                let completion = lowering.lower_try_finally::<()>(
                    |lowering| {
                        lowering.emit_break(None);
                        lowering.emit_break(None);

                        Ok(CompletionType::Abrupt)
                    },
                    |_| {
                        copies += 1;

                        Ok(CompletionType::Normal)
                    },
                )?;

                assert_eq!(completion, CompletionType::Abrupt);

                Ok(())
            })
            .unwrap();

        assert!(usage.break_used);

        // The break stub and the exception handler.
        assert_eq!(copies, 2);

        lowering.assembler_mut().mark(exit);

        let assembly = lowering.finish().assembler;

        assembly.finish();

        let handler = assembly.handlers()[0];
        let start = assembly.position(handler.start).unwrap();
        let end = assembly.position(handler.end).unwrap();

        for index in assembly.jumps_to(exit) {
            assert!(index < start || index >= end);
        }
    }

    #[test]
    fn test_return_carrier() {
        let mut lowering = plain();

        let completion = lowering
            .lower_try_finally::<()>(
                |lowering| {
                    lowering.assembler_mut().push_null();
                    lowering.emit_return();

                    Ok(CompletionType::Abrupt)
                },
                |_| Ok(CompletionType::Normal),
            )
            .unwrap();

        assert!(completion.is_abrupt());
        assert!(!lowering.assembler().is_reachable());

        let assembly = lowering.finish().assembler;

        assembly.finish();
    }

    #[test]
    fn test_normal_completion() {
        let mut lowering = plain();

        let carrier = lowering.enter_finally();

        lowering.assembler_mut().push_int(1);
        lowering.assembler_mut().pop();

        let exits = lowering.exit_finally();

        assert_eq!(exits.carrier, carrier);
        assert!(exits.temporaries.is_empty());

        lowering.assembler_mut().release_local(carrier);

        let completion = lowering
            .lower_try_finally::<()>(
                |lowering| {
                    lowering.assembler_mut().push_bool(true);
                    lowering.assembler_mut().pop();

                    Ok(CompletionType::Normal)
                },
                |lowering| {
                    lowering.assembler_mut().push_null();
                    lowering.assembler_mut().pop();

                    Ok(CompletionType::Normal)
                },
            )
            .unwrap();

        assert!(completion.is_normal());
        assert!(lowering.assembler().is_reachable());
        assert_eq!(lowering.assembler().handlers().len(), 1);

        let _ = lowering.finish();
    }
}
