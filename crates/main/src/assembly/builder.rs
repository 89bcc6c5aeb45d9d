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

use std::fmt::{Debug, Formatter};

use crate::{
    assembly::{
        cmd::println,
        label::LabelEntry,
        Assembler,
        BoxCmd,
        BranchCmd,
        BufferLoadCmd,
        BufferStoreCmd,
        Callee,
        Cmd,
        CmdIndex,
        Condition,
        DupCmd,
        InvokeCmd,
        JumpCmd,
        Label,
        LabelStatus,
        LoadCmd,
        LocalsSnapshot,
        LookupSwitchCmd,
        NewBufferCmd,
        OpCmd,
        PopCmd,
        PushBoolCmd,
        PushIntCmd,
        PushNullCmd,
        ReturnCmd,
        Signature,
        Slot,
        SlotType,
        StackSnapshot,
        StoreCmd,
        SubroutineIndex,
        SwapCmd,
        TableSwitchCmd,
        ThrowCmd,
        UnboxCmd,
    },
    report::system_panic,
};

/// An exception table entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
}

/// A recording implementation of the [Assembler].
///
/// The object stores the emitted command stream together with the label
/// table, the exception table, and the committed subroutines. While
/// recording, it tracks the operand stack types and the live local slots,
/// and panics on any inconsistency: stack underflows, operand type
/// mismatches, different stack layouts reaching the same label, loads of
/// undefined locals, etc.
///
/// The [Debug] implementation renders a human-readable listing.
#[derive(Clone, PartialEq, Eq)]
pub struct Assembly {
    signature: Signature,
    commands: Vec<Cmd>,
    labels: Vec<LabelEntry>,
    handlers: Vec<Handler>,
    subroutines: Vec<Assembly>,
    stack: Vec<SlotType>,
    locals: Vec<Option<SlotType>>,
    frame: usize,
    reachable: bool,
}

impl Debug for Assembly {
    #[inline(always)]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        self.debug(formatter, 0)
    }
}

impl Assembler for Assembly {
    fn new_label(&mut self) -> Label {
        let Ok(index) = u32::try_from(self.labels.len()) else {
            system_panic!("Too many labels in {:?}.", self.signature.name);
        };

        self.labels.push(LabelEntry::default());

        Label(index)
    }

    fn mark(&mut self, label: Label) {
        let position = self.commands.len();
        let current = self.stack_snapshot();
        let reachable = self.reachable;
        let name = self.signature.name.clone();

        let entry = self.entry_mut(label);

        if let Some(previous) = entry.position {
            system_panic!("Label {label} of {name:?} marked twice ({previous} and {position}).");
        }

        entry.position = Some(position);

        let recorded = entry.stack.get_or_insert_with(|| current.clone()).clone();

        match reachable {
            true => {
                if recorded != current {
                    system_panic!(
                        "Stack layout mismatch at {label} of {name:?}. Expected {recorded}, \
                        found {current}.",
                    );
                }
            }

            false => self.stack = recorded.types().to_vec(),
        }

        self.reachable = true;
    }

    #[inline(always)]
    fn is_reachable(&self) -> bool {
        self.reachable
    }

    fn jump(&mut self, target: Label) {
        self.record_target(target);

        self.commands.push(Cmd::Jump(JumpCmd { target }));

        self.reachable = false;
    }

    fn branch(&mut self, condition: Condition, target: Label) {
        self.pop_expected("branch", condition.operand());

        self.record_target(target);

        self.commands
            .push(Cmd::Branch(BranchCmd { condition, target }));
    }

    fn table_switch(&mut self, low: i32, targets: &[Label], default: Label) {
        let Some(_) = cast::i32(targets.len())
            .ok()
            .and_then(|len| low.checked_add(len))
        else {
            system_panic!("Table switch range overflow.");
        };

        self.pop_expected("table-switch", SlotType::Int);

        for target in targets {
            self.record_target(*target);
        }

        self.record_target(default);

        self.commands.push(Cmd::TableSwitch(TableSwitchCmd {
            low,
            targets: targets.to_vec(),
            default,
        }));

        self.reachable = false;
    }

    fn lookup_switch(&mut self, keys: &[i32], targets: &[Label], default: Label) {
        if keys.len() != targets.len() {
            system_panic!(
                "Lookup switch with {} keys and {} targets.",
                keys.len(),
                targets.len(),
            );
        }

        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            system_panic!("Lookup switch keys {keys:?} are not strictly ascending.");
        }

        self.pop_expected("lookup-switch", SlotType::Int);

        for target in targets {
            self.record_target(*target);
        }

        self.record_target(default);

        self.commands.push(Cmd::LookupSwitch(LookupSwitchCmd {
            keys: keys.to_vec(),
            targets: targets.to_vec(),
            default,
        }));

        self.reachable = false;
    }

    fn push_int(&mut self, value: i32) {
        self.stack.push(SlotType::Int);
        self.commands.push(Cmd::PushInt(PushIntCmd { value }));
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(SlotType::Bool);
        self.commands.push(Cmd::PushBool(PushBoolCmd { value }));
    }

    fn push_null(&mut self) {
        self.stack.push(SlotType::Object);
        self.commands.push(Cmd::PushNull(PushNullCmd));
    }

    fn pop(&mut self) {
        let _ = self.pop_any("pop");
        self.commands.push(Cmd::Pop(PopCmd));
    }

    fn dup(&mut self) {
        let ty = self.pop_any("dup");

        self.stack.push(ty);
        self.stack.push(ty);

        self.commands.push(Cmd::Dup(DupCmd));
    }

    fn swap(&mut self) {
        let top = self.pop_any("swap");
        let below = self.pop_any("swap");

        self.stack.push(top);
        self.stack.push(below);

        self.commands.push(Cmd::Swap(SwapCmd));
    }

    fn op(&mut self, op: OpCmd) {
        self.pop_expected("op", SlotType::Int);
        self.pop_expected("op", SlotType::Int);

        self.stack.push(op.result());
        self.commands.push(Cmd::Op(op));
    }

    fn box_value(&mut self, ty: SlotType) {
        if !ty.is_primitive() {
            system_panic!("Boxing of an object value.");
        }

        self.pop_expected("box", ty);

        self.stack.push(SlotType::Object);
        self.commands.push(Cmd::Box(BoxCmd { ty }));
    }

    fn unbox_value(&mut self, ty: SlotType) {
        if !ty.is_primitive() {
            system_panic!("Unboxing into an object value.");
        }

        self.pop_expected("unbox", SlotType::Object);

        self.stack.push(ty);
        self.commands.push(Cmd::Unbox(UnboxCmd { ty }));
    }

    fn new_buffer(&mut self, len: usize) {
        self.stack.push(SlotType::Object);
        self.commands.push(Cmd::NewBuffer(NewBufferCmd { len }));
    }

    fn buffer_store(&mut self, index: usize) {
        self.pop_expected("buffer-store", SlotType::Object);
        self.pop_expected("buffer-store", SlotType::Object);

        self.stack.push(SlotType::Object);
        self.commands
            .push(Cmd::BufferStore(BufferStoreCmd { index }));
    }

    fn buffer_load(&mut self, index: usize) {
        self.pop_expected("buffer-load", SlotType::Object);

        self.stack.push(SlotType::Object);
        self.commands.push(Cmd::BufferLoad(BufferLoadCmd { index }));
    }

    fn define_local(&mut self, ty: SlotType) -> Slot {
        let index = match self.locals.iter().position(Option::is_none) {
            Some(index) => index,

            None => {
                self.locals.push(None);
                self.locals.len() - 1
            }
        };

        let Ok(slot) = u16::try_from(index) else {
            system_panic!("Too many locals in {:?}.", self.signature.name);
        };

        self.locals[index] = Some(ty);
        self.frame = self.frame.max(self.locals.len());

        Slot(slot)
    }

    fn release_local(&mut self, slot: Slot) {
        if slot.index() < self.signature.params.len() {
            system_panic!("Parameter {slot} of {:?} released.", self.signature.name);
        }

        match self.locals.get_mut(slot.index()) {
            Some(local @ Some(..)) => *local = None,

            _ => system_panic!(
                "Local {slot} of {:?} released while not defined.",
                self.signature.name,
            ),
        }
    }

    fn load(&mut self, slot: Slot) {
        let ty = self.local_type(slot);

        self.stack.push(ty);
        self.commands.push(Cmd::Load(LoadCmd { slot }));
    }

    fn store(&mut self, slot: Slot) {
        let ty = self.local_type(slot);

        self.pop_expected("store", ty);
        self.commands.push(Cmd::Store(StoreCmd { slot }));
    }

    fn invoke(&mut self, callee: Callee) {
        let (params, result) = match callee {
            Callee::Runtime(function) => (function.params().to_vec(), function.result()),

            Callee::Subroutine(index) => {
                let Some(subroutine) = self.subroutines.get(index) else {
                    system_panic!(
                        "Unknown subroutine fn{index} in {:?}.",
                        self.signature.name,
                    );
                };

                (
                    subroutine.signature.params.clone(),
                    subroutine.signature.result,
                )
            }
        };

        for ty in params.iter().rev() {
            self.pop_expected("invoke", *ty);
        }

        if let Some(ty) = result {
            self.stack.push(ty);
        }

        self.commands.push(Cmd::Invoke(InvokeCmd { callee }));
    }

    fn ret(&mut self) {
        if let Some(ty) = self.signature.result {
            self.pop_expected("ret", ty);
        }

        self.commands.push(Cmd::Return(ReturnCmd));

        self.reachable = false;
    }

    fn throw(&mut self) {
        self.pop_expected("throw", SlotType::Object);

        self.commands.push(Cmd::Throw(ThrowCmd));

        self.reachable = false;
    }

    fn protect(&mut self, start: Label, end: Label, handler: Label) {
        self.entry_mut(start).references += 1;
        self.entry_mut(end).references += 1;

        let name = self.signature.name.clone();
        let expected = StackSnapshot::from(vec![SlotType::Object]);
        let entry = self.entry_mut(handler);

        entry.references += 1;

        let recorded = entry.stack.get_or_insert_with(|| expected.clone());

        if *recorded != expected {
            system_panic!("Exception handler {handler} of {name:?} expects {recorded}.");
        }

        self.handlers.push(Handler {
            start,
            end,
            handler,
        });
    }

    #[inline(always)]
    fn stack_snapshot(&self) -> StackSnapshot {
        StackSnapshot::from(self.stack.clone())
    }

    fn locals_snapshot(&self) -> LocalsSnapshot {
        self.locals
            .iter()
            .enumerate()
            .filter_map(|(index, ty)| Some((Slot(u16::try_from(index).ok()?), (*ty)?)))
            .collect()
    }

    #[inline(always)]
    fn reset_stack(&mut self, stack: &StackSnapshot) {
        self.stack = stack.types().to_vec();
    }

    fn reset_frame(&mut self, locals: &LocalsSnapshot, stack: &StackSnapshot) {
        self.locals = self
            .signature
            .params
            .iter()
            .map(|ty| Some(*ty))
            .collect();

        for (slot, ty) in locals.entries() {
            let index = slot.index();

            if index >= self.locals.len() {
                self.locals.resize(index + 1, None);
            }

            self.locals[index] = Some(*ty);
        }

        self.frame = self.frame.max(self.locals.len());

        self.reset_stack(stack);
    }

    #[inline(always)]
    fn signature(&self) -> &Signature {
        &self.signature
    }

    #[inline(always)]
    fn subroutine(&mut self, signature: Signature) -> Self {
        Self::new(signature)
    }

    fn commit(&mut self, subroutine: Self) -> SubroutineIndex {
        subroutine.finish();

        let index = self.subroutines.len();

        self.subroutines.push(subroutine);

        index
    }
}

impl Assembly {
    /// Creates an empty assembly of a routine with the specified signature.
    ///
    /// The routine parameters are live from the beginning.
    pub fn new(signature: Signature) -> Self {
        let locals = signature
            .params
            .iter()
            .map(|ty| Some(*ty))
            .collect::<Vec<_>>();

        let frame = locals.len();

        Self {
            signature,
            commands: Vec::new(),
            labels: Vec::new(),
            handlers: Vec::new(),
            subroutines: Vec::new(),
            stack: Vec::new(),
            locals,
            frame,
            reachable: true,
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.signature.name.as_str()
    }

    #[inline(always)]
    pub fn commands(&self) -> &[Cmd] {
        &self.commands
    }

    #[inline(always)]
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    #[inline(always)]
    pub fn subroutines(&self) -> &[Assembly] {
        &self.subroutines
    }

    /// The number of local slots the routine's frame requires.
    #[inline(always)]
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn status(&self, label: Label) -> LabelStatus {
        match self.labels.get(label.index()) {
            Some(entry) => entry.status(),
            None => LabelStatus::Unresolved,
        }
    }

    #[inline(always)]
    pub fn position(&self, label: Label) -> Option<CmdIndex> {
        self.labels.get(label.index())?.position
    }

    /// Returns the indices of the commands that may transfer control to the
    /// label.
    pub fn jumps_to(&self, label: Label) -> Vec<CmdIndex> {
        self.commands
            .iter()
            .enumerate()
            .filter(|(_, cmd)| cmd.targets().contains(&label))
            .map(|(index, _)| index)
            .collect()
    }

    /// Checks that every referenced label has been marked.
    pub fn finish(&self) {
        for (index, entry) in self.labels.iter().enumerate() {
            if entry.references > 0 && entry.position.is_none() {
                system_panic!(
                    "Label L{index} of {:?} is referenced {} times but never marked.",
                    self.signature.name,
                    entry.references,
                );
            }
        }
    }

    fn entry_mut(&mut self, label: Label) -> &mut LabelEntry {
        let Some(entry) = self.labels.get_mut(label.index()) else {
            system_panic!("Unknown label {label}.");
        };

        entry
    }

    fn record_target(&mut self, label: Label) {
        let current = self.stack_snapshot();
        let name = self.signature.name.clone();
        let entry = self.entry_mut(label);

        entry.references += 1;

        let recorded = entry.stack.get_or_insert_with(|| current.clone());

        if *recorded != current {
            system_panic!(
                "Stack layout mismatch at the jump to {label} of {name:?}. \
                Expected {recorded}, found {current}.",
            );
        }
    }

    fn local_type(&self, slot: Slot) -> SlotType {
        let Some(Some(ty)) = self.locals.get(slot.index()) else {
            system_panic!(
                "Access to undefined local {slot} of {:?}.",
                self.signature.name,
            );
        };

        *ty
    }

    fn pop_any(&mut self, cmd: &str) -> SlotType {
        let Some(ty) = self.stack.pop() else {
            system_panic!("Stack underflow in {cmd} of {:?}.", self.signature.name);
        };

        ty
    }

    fn pop_expected(&mut self, cmd: &str, expected: SlotType) {
        let ty = self.pop_any(cmd);

        if ty != expected {
            system_panic!(
                "Operand type mismatch in {cmd} of {:?}. Expected {expected}, found {ty}.",
                self.signature.name,
            );
        }
    }

    fn debug(&self, formatter: &mut Formatter<'_>, mut indent: usize) -> std::fmt::Result {
        let params = self
            .signature
            .params
            .iter()
            .map(|ty| ty.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let result = match self.signature.result {
            Some(ty) => ty.to_string(),
            None => String::from("()"),
        };

        formatter.write_fmt(format_args!(
            "fn {}({params}) -> {result} {{\n",
            self.signature.name,
        ))?;

        indent += 1;

        println(formatter, indent, format_args!("frame: {}", self.frame))?;

        if !self.commands.is_empty() {
            println(formatter, indent, format_args!("commands:"))?;

            let mut marks = vec![Vec::new(); self.commands.len() + 1];

            for (index, entry) in self.labels.iter().enumerate() {
                if let Some(position) = entry.position {
                    marks[position].push(index);
                }
            }

            for (index, cmd) in self.commands.iter().enumerate() {
                for label in &marks[index] {
                    println(formatter, indent, format_args!("L{label}:"))?;
                }

                cmd.debug(formatter, indent + 1, index)?;
            }

            for label in &marks[self.commands.len()] {
                println(formatter, indent, format_args!("L{label}:"))?;
            }
        }

        if !self.handlers.is_empty() {
            println(formatter, indent, format_args!("handlers:"))?;

            for Handler {
                start,
                end,
                handler,
            } in &self.handlers
            {
                println(
                    formatter,
                    indent + 1,
                    format_args!("{start}..{end} => {handler}"),
                )?;
            }
        }

        if !self.subroutines.is_empty() {
            println(formatter, indent, format_args!("fns:"))?;

            indent += 1;

            for (index, subroutine) in self.subroutines.iter().enumerate() {
                formatter.write_str(&"    ".repeat(indent))?;
                formatter.write_fmt(format_args!("fn{index}: "))?;

                subroutine.debug(formatter, indent)?;
            }

            indent -= 1;
        }

        indent -= 1;

        println(formatter, indent, format_args!("}}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::assembly::{
        Assembler,
        Assembly,
        Callee,
        Cmd,
        Condition,
        LabelStatus,
        RuntimeFn,
        Signature,
        Slot,
        SlotType,
        StackSnapshot,
    };

    fn plain() -> Assembly {
        Assembly::new(Signature::new("test", [SlotType::Int], Some(SlotType::Int)))
    }

    #[test]
    fn test_forward_and_backward_labels() {
        let mut assembly = plain();

        let start = assembly.new_label();
        let exit = assembly.new_label();

        assembly.mark(start);
        assembly.load(Slot(0));
        assembly.branch(Condition::Negative, exit);
        assembly.jump(start);

        assert!(!assembly.is_reachable());

        assembly.mark(exit);

        assert!(assembly.is_reachable());

        assembly.push_int(1);
        assembly.ret();
        assembly.finish();

        assert_eq!(assembly.status(start), LabelStatus::Marked(0));
        assert_eq!(assembly.status(exit), LabelStatus::Marked(3));
        assert_eq!(assembly.jumps_to(start), vec![2]);
        assert_eq!(assembly.jumps_to(exit), vec![1]);
    }

    #[test]
    fn test_mark_adopts_recorded_stack() {
        let mut assembly = plain();

        let target = assembly.new_label();

        assembly.push_int(3);
        assembly.jump(target);
        assembly.reset_stack(&StackSnapshot::default());
        assembly.mark(target);

        assert_eq!(assembly.stack_snapshot().types(), &[SlotType::Int]);

        assembly.ret();
        assembly.finish();
    }

    #[test]
    #[should_panic(expected = "Stack layout mismatch")]
    fn test_stack_mismatch() {
        let mut assembly = plain();

        let target = assembly.new_label();

        assembly.push_int(3);
        assembly.load(Slot(0));
        assembly.branch(Condition::Negative, target);
        assembly.pop();
        assembly.mark(target);
    }

    #[test]
    #[should_panic(expected = "Table switch range overflow")]
    fn test_table_switch_overflow() {
        let mut assembly = plain();

        let first = assembly.new_label();
        let second = assembly.new_label();

        assembly.load(Slot(0));
        assembly.table_switch(i32::MAX, &[first, second], first);
    }

    #[test]
    #[should_panic(expected = "never marked")]
    fn test_unmarked_label() {
        let mut assembly = plain();

        let target = assembly.new_label();

        assembly.jump(target);
        assembly.finish();
    }

    #[test]
    #[should_panic(expected = "marked twice")]
    fn test_double_mark() {
        let mut assembly = plain();

        let target = assembly.new_label();

        assembly.mark(target);
        assembly.mark(target);
    }

    #[test]
    fn test_locals_reuse() {
        let mut assembly = plain();

        let first = assembly.define_local(SlotType::Object);
        let second = assembly.define_local(SlotType::Bool);

        assert_eq!(first, Slot(1));
        assert_eq!(second, Slot(2));

        assembly.release_local(first);

        let third = assembly.define_local(SlotType::Int);

        assert_eq!(third, Slot(1));
        assert_eq!(assembly.frame(), 3);

        let snapshot = assembly.locals_snapshot();

        assert_eq!(
            snapshot.entries(),
            &[
                (Slot(0), SlotType::Int),
                (Slot(1), SlotType::Int),
                (Slot(2), SlotType::Bool),
            ],
        );
    }

    #[test]
    #[should_panic(expected = "Operand type mismatch")]
    fn test_store_type_check() {
        let mut assembly = plain();

        let slot = assembly.define_local(SlotType::Bool);

        assembly.push_int(1);
        assembly.store(slot);
    }

    #[test]
    fn test_subroutine_invoke() {
        let mut assembly = plain();

        let mut subroutine = assembly.subroutine(Signature::new(
            "inner",
            [SlotType::Object],
            Some(SlotType::Int),
        ));

        subroutine.push_int(0);
        subroutine.ret();

        let index = assembly.commit(subroutine);

        assembly.invoke(Callee::Runtime(RuntimeFn::NewOutCell));
        assembly.invoke(Callee::Subroutine(index));

        assert_eq!(assembly.stack_snapshot().types(), &[SlotType::Int]);

        assembly.ret();

        let listing = format!("{assembly:?}");

        assert!(listing.contains("invoke new-out-cell"));
        assert!(listing.contains("fn0: fn inner(object) -> int {"));
        assert!(matches!(assembly.commands()[1], Cmd::Invoke(..)));
    }

    #[test]
    fn test_reset_frame() {
        let mut assembly = plain();

        let _ = assembly.define_local(SlotType::Bool);

        assembly.reset_frame(
            &[(Slot(3), SlotType::Object)].into_iter().collect(),
            &StackSnapshot::from(vec![SlotType::Int]),
        );

        assert_eq!(
            assembly.locals_snapshot().entries(),
            &[(Slot(0), SlotType::Int), (Slot(3), SlotType::Object)],
        );

        assert_eq!(assembly.frame(), 4);
        assert_eq!(assembly.define_local(SlotType::Int), Slot(1));
    }
}
