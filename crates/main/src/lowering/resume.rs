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

use ahash::AHashMap;
use log::debug;

use crate::{
    assembly::{
        Assembler,
        Callee,
        Condition,
        Label,
        LocalsSnapshot,
        RuntimeFn,
        Slot,
        SlotType,
        StackSnapshot,
    },
    lowering::{switch::emit_switch, Lowering, UnitKind, SUSPEND_SIGNAL},
    report::{system_panic, LOWERING_LOG},
};

/// The live state of a routine at a suspension point.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionSnapshot {
    /// The live local slots, excluding the resume handle and the out cell
    /// parameters.
    pub locals: LocalsSnapshot,

    /// The operand stack.
    pub stack: StackSnapshot,
}

/// A suspension point that restores a particular [ExecutionSnapshot].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Occurrence {
    /// The resume offset stored in the resume handle of this point.
    pub offset: i32,

    /// The position right after the suspension point.
    pub continuation: Label,
}

/// A distinct captured state together with the suspension points sharing it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DispatchEntry {
    pub snapshot: ExecutionSnapshot,

    /// The start of the restore sequence of this snapshot.
    pub restore: Label,

    /// The suspension points in the capture order.
    pub occurrences: Vec<Occurrence>,
}

/// The resume dispatch table of a resumable routine.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct DispatchTable {
    entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    #[inline(always)]
    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    /// The number of distinct snapshots.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All resume offsets in ascending order.
    pub fn offsets(&self) -> Vec<i32> {
        let mut offsets = self
            .entries
            .iter()
            .flat_map(|entry| entry.occurrences.iter().map(|occurrence| occurrence.offset))
            .collect::<Vec<_>>();

        offsets.sort_unstable();

        offsets
    }

    /// The entry that restores the state of the specified offset.
    pub fn entry_of(&self, offset: i32) -> Option<&DispatchEntry> {
        self.entries.iter().find(|entry| {
            entry
                .occurrences
                .iter()
                .any(|occurrence| occurrence.offset == offset)
        })
    }

    pub fn continuation_of(&self, offset: i32) -> Option<Label> {
        self.entries
            .iter()
            .flat_map(|entry| entry.occurrences.iter())
            .find(|occurrence| occurrence.offset == offset)
            .map(|occurrence| occurrence.continuation)
    }
}

pub(super) struct ResumeState {
    pub(super) handle: Slot,
    dispatcher: Label,
    entry: Label,
    table: DispatchTable,
    index: AHashMap<ExecutionSnapshot, usize>,
    next_offset: i32,
}

impl ResumeState {
    #[inline(always)]
    pub(super) fn new(handle: Slot, dispatcher: Label, entry: Label) -> Self {
        Self {
            handle,
            dispatcher,
            entry,
            table: DispatchTable::default(),
            index: AHashMap::new(),
            next_offset: 0,
        }
    }

    #[inline(always)]
    pub(super) fn suspends(&self) -> bool {
        !self.table.is_empty()
    }

    fn register(
        &mut self,
        assembler: &mut impl Assembler,
        snapshot: ExecutionSnapshot,
        continuation: Label,
        deduplicate: bool,
    ) -> i32 {
        let offset = self.next_offset;

        let Some(next_offset) = offset.checked_add(1) else {
            system_panic!("Resume offsets overflow.");
        };

        self.next_offset = next_offset;

        let occurrence = Occurrence {
            offset,
            continuation,
        };

        if deduplicate {
            if let Some(index) = self.index.get(&snapshot) {
                let entry = &mut self.table.entries[*index];

                entry.occurrences.push(occurrence);

                debug!(
                    target: LOWERING_LOG,
                    "Suspension point #{offset} shares the snapshot of {}.",
                    entry.restore,
                );

                return offset;
            }
        }

        let restore = assembler.new_label();

        debug!(
            target: LOWERING_LOG,
            "Suspension point #{offset} captures {} locals and stack {}.",
            snapshot.locals.len(),
            snapshot.stack,
        );

        if deduplicate {
            let _ = self
                .index
                .insert(snapshot.clone(), self.table.entries.len());
        }

        self.table.entries.push(DispatchEntry {
            snapshot,
            restore,
            occurrences: vec![occurrence],
        });

        offset
    }
}

impl<A: Assembler> Lowering<A> {
    /// Marks a suspension point at the current position.
    ///
    /// The function captures the operand stack and the live locals into a
    /// resume handle and hands the handle to the caller. When the routine is
    /// resumed with this handle, the dispatcher restores the captured state
    /// and continues execution right after this point with the same operand
    /// stack layout.
    pub fn suspend(&mut self) {
        self.capture(None);
    }

    // Suspends chaining the handle of a suspended callee.
    pub(super) fn suspend_chained(&mut self, next: Slot) {
        self.capture(Some(next));
    }

    fn capture(&mut self, next: Option<Slot>) {
        let reserved = self.reserved_slots();

        let Some(resume) = &mut self.resume else {
            system_panic!(
                "Suspension point in non-resumable routine {:?}.",
                self.assembler.signature().name,
            );
        };

        if !self.assembler.is_reachable() {
            system_panic!("Suspension point in unreachable code.");
        }

        let snapshot = ExecutionSnapshot {
            locals: self.assembler.locals_snapshot().without(&reserved),
            stack: self.assembler.stack_snapshot(),
        };

        let continuation = self.assembler.new_label();

        let offset = resume.register(
            &mut self.assembler,
            snapshot.clone(),
            continuation,
            self.config.deduplicate_snapshots,
        );

        self.serialize_stack(&snapshot.stack);
        self.serialize_locals(&snapshot.locals);

        // Stack: (stack buffer, locals buffer)
        self.assembler.swap();
        self.assembler.push_int(offset);

        match next {
            Some(next) => self.assembler.load(next),
            None => self.assembler.push_null(),
        }

        self.assembler
            .invoke(Callee::Runtime(RuntimeFn::NewResumeHandle));

        match self.kind {
            UnitKind::Routine(..) => self.assembler.ret(),

            UnitKind::Outlined { .. } => {
                let Some(out) = self.out else {
                    system_panic!("Outlined unit without the out cell.");
                };

                self.assembler.load(out);
                self.assembler.swap();
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::OutCellSet));
                self.assembler.push_int(SUSPEND_SIGNAL);
                self.assembler.ret();
            }
        }

        self.assembler.reset_stack(&snapshot.stack);
        self.assembler.mark(continuation);
    }

    // Stack: (values..) -> (buffer | null)
    fn serialize_stack(&mut self, stack: &StackSnapshot) {
        let Some((top, rest)) = stack.types().split_last() else {
            self.assembler.push_null();
            return;
        };

        self.box_primitive(*top);
        self.assembler.new_buffer(stack.depth());
        self.assembler.swap();
        self.assembler.buffer_store(rest.len());

        for (index, ty) in rest.iter().enumerate().rev() {
            self.assembler.swap();
            self.box_primitive(*ty);
            self.assembler.buffer_store(index);
        }
    }

    // Stack: () -> (buffer | null)
    fn serialize_locals(&mut self, locals: &LocalsSnapshot) {
        if locals.is_empty() {
            self.assembler.push_null();
            return;
        }

        self.assembler.new_buffer(locals.len());

        for (index, (slot, ty)) in locals.entries().iter().enumerate() {
            self.assembler.load(*slot);
            self.box_primitive(*ty);
            self.assembler.buffer_store(index);
        }
    }

    pub(super) fn emit_dispatcher(&mut self) -> Option<DispatchTable> {
        let resume = self.resume.take()?;

        self.assembler.mark(resume.dispatcher);
        self.assembler
            .reset_frame(&LocalsSnapshot::default(), &StackSnapshot::default());

        let entries = resume.table.entries();

        match entries.len() {
            0 => self.assembler.jump(resume.entry),

            1 => (),

            _ => {
                let mut cases = entries
                    .iter()
                    .flat_map(|entry| {
                        entry
                            .occurrences
                            .iter()
                            .map(|occurrence| (occurrence.offset, entry.restore))
                    })
                    .collect::<Vec<_>>();

                self.assembler.load(resume.handle);
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::ResumeOffset));

                emit_switch(&mut self.assembler, &self.config, &mut cases, resume.entry);
            }
        }

        for entry in entries {
            self.emit_restore(resume.handle, entry);
        }

        debug!(
            target: LOWERING_LOG,
            "Dispatcher of {:?}: {} snapshots, {} resume offsets.",
            self.assembler.signature().name,
            entries.len(),
            resume.table.offsets().len(),
        );

        Some(resume.table)
    }

    fn emit_restore(&mut self, handle: Slot, entry: &DispatchEntry) {
        let DispatchEntry {
            snapshot,
            restore,
            occurrences,
        } = entry;

        self.assembler.mark(*restore);
        self.assembler
            .reset_frame(&snapshot.locals, &StackSnapshot::default());

        if !snapshot.locals.is_empty() {
            self.assembler.load(handle);
            self.assembler
                .invoke(Callee::Runtime(RuntimeFn::ResumeLocals));

            for (index, (slot, ty)) in snapshot.locals.entries().iter().enumerate() {
                self.assembler.dup();
                self.assembler.buffer_load(index);
                self.unbox_primitive(*ty);
                self.assembler.store(*slot);
            }

            self.assembler.pop();
        }

        let types = snapshot.stack.types();

        match types.len() {
            0 => (),

            1 if self.config.inline_singleton_stack => {
                self.assembler.load(handle);
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::ResumeStack));
                self.assembler.buffer_load(0);
                self.unbox_primitive(types[0]);
            }

            _ => {
                let buffer = self.assembler.define_local(SlotType::Object);

                self.assembler.load(handle);
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::ResumeStack));
                self.assembler.store(buffer);

                for (index, ty) in types.iter().enumerate() {
                    self.assembler.load(buffer);
                    self.assembler.buffer_load(index);
                    self.unbox_primitive(*ty);
                }

                self.assembler.push_null();
                self.assembler.store(buffer);
                self.assembler.release_local(buffer);
            }
        }

        if self.assembler.stack_snapshot() != snapshot.stack {
            system_panic!(
                "Restored stack {} differs from the captured stack {}.",
                self.assembler.stack_snapshot(),
                snapshot.stack,
            );
        }

        match occurrences.as_slice() {
            [] => system_panic!("Snapshot without suspension points."),

            [single] => self.assembler.jump(single.continuation),

            [first, sharer] => {
                self.assembler.load(handle);
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::ResumeOffset));
                self.assembler
                    .branch(Condition::Equal(sharer.offset), sharer.continuation);
                self.assembler.jump(first.continuation);
            }

            [first, sharers @ ..] => {
                let mut cases = sharers
                    .iter()
                    .map(|occurrence| (occurrence.offset, occurrence.continuation))
                    .collect::<Vec<_>>();

                self.assembler.load(handle);
                self.assembler
                    .invoke(Callee::Runtime(RuntimeFn::ResumeOffset));

                emit_switch(
                    &mut self.assembler,
                    &self.config,
                    &mut cases,
                    first.continuation,
                );
            }
        }
    }

    #[inline(always)]
    fn box_primitive(&mut self, ty: SlotType) {
        if ty.is_primitive() {
            self.assembler.box_value(ty);
        }
    }

    #[inline(always)]
    fn unbox_primitive(&mut self, ty: SlotType) {
        if ty.is_primitive() {
            self.assembler.unbox_value(ty);
        }
    }
}
