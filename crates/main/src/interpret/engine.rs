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

use compact_str::CompactString;

use crate::{
    assembly::{
        Assembler,
        Assembly,
        BoxCmd,
        BranchCmd,
        BufferLoadCmd,
        BufferStoreCmd,
        Callee,
        Cmd,
        CmdIndex,
        Condition,
        InvokeCmd,
        JumpCmd,
        Label,
        LoadCmd,
        LookupSwitchCmd,
        NewBufferCmd,
        OpCmd,
        PushBoolCmd,
        PushIntCmd,
        RuntimeFn,
        StoreCmd,
        TableSwitchCmd,
        UnboxCmd,
    },
    interpret::{ResumeHandle, RuntimeError, RuntimeResult, Value},
};

/// The result of a [Machine] run.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The routine returned a final value.
    Returned(Value),

    /// The routine has been suspended. Pass the handle to
    /// [Machine::resume] to continue the execution.
    Suspended(Rc<ResumeHandle>),

    /// The routine threw an exception that has not been caught.
    Threw(Value),
}

/// A reference virtual machine that executes [Assembly] routines.
///
/// The machine exists to verify the lowered code: it checks the operand
/// kinds of every command and interrupts the execution with a
/// [RuntimeError] on any inconsistency.
///
/// The values handed out by the [Deliver](RuntimeFn::Deliver) runtime
/// function are collected into the [delivered](Machine::delivered) list.
pub struct Machine<'a> {
    assembly: &'a Assembly,
    delivered: Vec<Value>,
    sent: Value,
    step_limit: usize,
    steps: usize,
}

impl<'a> Machine<'a> {
    /// The default number of commands a single run may execute.
    pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

    #[inline(always)]
    pub fn new(assembly: &'a Assembly) -> Self {
        Self {
            assembly,
            delivered: Vec::new(),
            sent: Value::Null,
            step_limit: Self::DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    #[inline(always)]
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;

        self
    }

    /// Calls the routine with the specified arguments.
    ///
    /// A resumable routine expects null as the first argument.
    pub fn start(&mut self, args: Vec<Value>) -> RuntimeResult<Outcome> {
        self.sent = Value::Null;

        self.run(args)
    }

    /// Resumes a suspended resumable routine.
    ///
    /// The `sent` value is available to the resumed code through the
    /// [Receive](RuntimeFn::Receive) runtime function. The user parameters
    /// of the routine are restored from the handle.
    pub fn resume(&mut self, handle: Rc<ResumeHandle>, sent: Value) -> RuntimeResult<Outcome> {
        let params = &self.assembly.signature().params;

        let mut args = Vec::with_capacity(params.len());

        args.push(Value::Handle(handle));
        args.extend(params.iter().skip(1).copied().map(Value::zero));

        self.sent = sent;

        self.run(args)
    }

    /// The values delivered by the routine since the creation of the
    /// machine.
    #[inline(always)]
    pub fn delivered(&self) -> &[Value] {
        &self.delivered
    }

    #[inline(always)]
    pub fn take_delivered(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.delivered)
    }

    fn run(&mut self, args: Vec<Value>) -> RuntimeResult<Outcome> {
        self.steps = 0;

        let assembly = self.assembly;

        match self.call(assembly, args)? {
            Exit::Return(Some(Value::Handle(handle))) => Ok(Outcome::Suspended(handle)),
            Exit::Return(Some(value)) => Ok(Outcome::Returned(value)),
            Exit::Return(None) => Ok(Outcome::Returned(Value::Null)),
            Exit::Throw(value) => Ok(Outcome::Threw(value)),
        }
    }

    fn call(&mut self, assembly: &'a Assembly, mut args: Vec<Value>) -> RuntimeResult<Exit> {
        let signature = assembly.signature();

        if args.len() != signature.params.len() {
            return Err(RuntimeError::Arity {
                routine: signature.name.clone(),
                expected: signature.params.len(),
                found: args.len(),
            });
        }

        for (index, (arg, ty)) in args.iter().zip(signature.params.iter()).enumerate() {
            if !arg.fits(*ty) {
                return Err(RuntimeError::TypeMismatch {
                    routine: signature.name.clone(),
                    cmd: index,
                    expected: ty.name(),
                    found: arg.kind(),
                });
            }
        }

        args.resize(assembly.frame().max(args.len()), Value::Null);

        let mut engine = Engine {
            machine: self,
            assembly,
            locals: args,
            stack: Vec::new(),
            cmd_index: 0,
            exit: None,
        };

        engine.run()
    }

    #[inline(always)]
    fn tick(&mut self) -> RuntimeResult<()> {
        self.steps += 1;

        if self.steps > self.step_limit {
            return Err(RuntimeError::StepLimit {
                limit: self.step_limit,
            });
        }

        Ok(())
    }
}

enum Exit {
    Return(Option<Value>),
    Throw(Value),
}

struct Engine<'m, 'a> {
    machine: &'m mut Machine<'a>,
    assembly: &'a Assembly,
    locals: Vec<Value>,
    stack: Vec<Value>,
    cmd_index: CmdIndex,
    exit: Option<Exit>,
}

impl<'m, 'a> Engine<'m, 'a> {
    fn run(&mut self) -> RuntimeResult<Exit> {
        loop {
            self.machine.tick()?;

            let assembly = self.assembly;

            let Some(cmd) = assembly.commands().get(self.cmd_index) else {
                return Err(RuntimeError::FallThrough {
                    routine: self.routine(),
                });
            };

            match cmd {
                Cmd::Jump(cmd) => self.execute_jump(cmd)?,
                Cmd::Branch(cmd) => self.execute_branch(cmd)?,
                Cmd::TableSwitch(cmd) => self.execute_table_switch(cmd)?,
                Cmd::LookupSwitch(cmd) => self.execute_lookup_switch(cmd)?,
                Cmd::PushInt(cmd) => self.execute_push_int(cmd),
                Cmd::PushBool(cmd) => self.execute_push_bool(cmd),
                Cmd::PushNull(..) => self.execute_push_null(),
                Cmd::Pop(..) => self.execute_pop()?,
                Cmd::Dup(..) => self.execute_dup()?,
                Cmd::Swap(..) => self.execute_swap()?,
                Cmd::Load(cmd) => self.execute_load(cmd)?,
                Cmd::Store(cmd) => self.execute_store(cmd)?,
                Cmd::Op(cmd) => self.execute_op(*cmd)?,
                Cmd::Box(cmd) => self.execute_box(cmd)?,
                Cmd::Unbox(cmd) => self.execute_unbox(cmd)?,
                Cmd::NewBuffer(cmd) => self.execute_new_buffer(cmd),
                Cmd::BufferStore(cmd) => self.execute_buffer_store(cmd)?,
                Cmd::BufferLoad(cmd) => self.execute_buffer_load(cmd)?,
                Cmd::Invoke(cmd) => self.execute_invoke(cmd)?,
                Cmd::Return(..) => self.execute_return()?,
                Cmd::Throw(..) => self.execute_throw()?,
            }

            if let Some(exit) = self.exit.take() {
                return Ok(exit);
            }
        }
    }

    fn execute_jump(&mut self, cmd: &JumpCmd) -> RuntimeResult<()> {
        let JumpCmd { target } = cmd;

        self.jump_to(*target)
    }

    fn execute_branch(&mut self, cmd: &BranchCmd) -> RuntimeResult<()> {
        let BranchCmd { condition, target } = cmd;

        let taken = match condition {
            Condition::True => self.pop_bool()?,
            Condition::False => !self.pop_bool()?,
            Condition::Null => self.pop()?.is_null(),
            Condition::NonNull => !self.pop()?.is_null(),
            Condition::Negative => self.pop_int()? < 0,
            Condition::Equal(value) => self.pop_int()? == *value,
            Condition::NotEqual(value) => self.pop_int()? != *value,
        };

        match taken {
            true => self.jump_to(*target),

            false => {
                self.cmd_index += 1;

                Ok(())
            }
        }
    }

    fn execute_table_switch(&mut self, cmd: &TableSwitchCmd) -> RuntimeResult<()> {
        let TableSwitchCmd {
            low,
            targets,
            default,
        } = cmd;

        let key = self.pop_int()?;

        let target = usize::try_from(i64::from(key) - i64::from(*low))
            .ok()
            .and_then(|index| targets.get(index))
            .unwrap_or(default);

        self.jump_to(*target)
    }

    fn execute_lookup_switch(&mut self, cmd: &LookupSwitchCmd) -> RuntimeResult<()> {
        let LookupSwitchCmd {
            keys,
            targets,
            default,
        } = cmd;

        let key = self.pop_int()?;

        let target = match keys.binary_search(&key) {
            Ok(index) => targets.get(index).unwrap_or(default),
            Err(..) => default,
        };

        self.jump_to(*target)
    }

    fn execute_push_int(&mut self, cmd: &PushIntCmd) {
        let PushIntCmd { value } = cmd;

        self.stack.push(Value::Int(*value));

        self.cmd_index += 1;
    }

    fn execute_push_bool(&mut self, cmd: &PushBoolCmd) {
        let PushBoolCmd { value } = cmd;

        self.stack.push(Value::Bool(*value));

        self.cmd_index += 1;
    }

    fn execute_push_null(&mut self) {
        self.stack.push(Value::Null);

        self.cmd_index += 1;
    }

    fn execute_pop(&mut self) -> RuntimeResult<()> {
        let _ = self.pop()?;

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_dup(&mut self) -> RuntimeResult<()> {
        let value = self.pop()?;

        self.stack.push(value.clone());
        self.stack.push(value);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_swap(&mut self) -> RuntimeResult<()> {
        let top = self.pop()?;
        let below = self.pop()?;

        self.stack.push(top);
        self.stack.push(below);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_load(&mut self, cmd: &LoadCmd) -> RuntimeResult<()> {
        let LoadCmd { slot } = cmd;

        let Some(value) = self.locals.get(slot.index()) else {
            return Err(self.unknown_slot());
        };

        self.stack.push(value.clone());

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_store(&mut self, cmd: &StoreCmd) -> RuntimeResult<()> {
        let StoreCmd { slot } = cmd;

        let value = self.pop()?;

        let Some(local) = self.locals.get_mut(slot.index()) else {
            return Err(self.unknown_slot());
        };

        *local = value;

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_op(&mut self, op: OpCmd) -> RuntimeResult<()> {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;

        let result = match op {
            OpCmd::Add => Value::Int(lhs.checked_add(rhs).ok_or_else(|| self.overflow())?),
            OpCmd::Sub => Value::Int(lhs.checked_sub(rhs).ok_or_else(|| self.overflow())?),
            OpCmd::Lesser => Value::Bool(lhs < rhs),
            OpCmd::Equal => Value::Bool(lhs == rhs),
        };

        self.stack.push(result);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_box(&mut self, cmd: &BoxCmd) -> RuntimeResult<()> {
        let BoxCmd { ty } = cmd;

        let value = self.pop()?;

        if value.is_null() || !value.fits(*ty) {
            return Err(self.mismatch(ty.name(), &value));
        }

        self.stack.push(value);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_unbox(&mut self, cmd: &UnboxCmd) -> RuntimeResult<()> {
        let UnboxCmd { ty } = cmd;

        let value = self.pop()?;

        if value.is_null() || !value.fits(*ty) {
            return Err(self.mismatch(ty.name(), &value));
        }

        self.stack.push(value);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_new_buffer(&mut self, cmd: &NewBufferCmd) {
        let NewBufferCmd { len } = cmd;

        self.stack.push(Value::buffer(*len));

        self.cmd_index += 1;
    }

    fn execute_buffer_store(&mut self, cmd: &BufferStoreCmd) -> RuntimeResult<()> {
        let BufferStoreCmd { index } = cmd;

        let value = self.pop()?;
        let buffer = self.pop_buffer()?;

        {
            let mut items = buffer.borrow_mut();
            let len = items.len();

            let Some(item) = items.get_mut(*index) else {
                return Err(self.buffer_index(*index, len));
            };

            *item = value;
        }

        self.stack.push(Value::Buffer(buffer));

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_buffer_load(&mut self, cmd: &BufferLoadCmd) -> RuntimeResult<()> {
        let BufferLoadCmd { index } = cmd;

        let buffer = self.pop_buffer()?;

        let item = {
            let items = buffer.borrow();

            match items.get(*index) {
                Some(item) => item.clone(),
                None => return Err(self.buffer_index(*index, items.len())),
            }
        };

        self.stack.push(item);

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_invoke(&mut self, cmd: &InvokeCmd) -> RuntimeResult<()> {
        let InvokeCmd { callee } = cmd;

        match callee {
            Callee::Runtime(function) => self.execute_runtime_fn(*function)?,

            Callee::Subroutine(index) => {
                let assembly = self.assembly;

                let Some(subroutine) = assembly.subroutines().get(*index) else {
                    return Err(RuntimeError::UnknownSubroutine {
                        routine: self.routine(),
                        index: *index,
                    });
                };

                let arity = subroutine.signature().params.len();

                let Some(split) = self.stack.len().checked_sub(arity) else {
                    return Err(self.underflow());
                };

                let args = self.stack.split_off(split);

                match self.machine.call(subroutine, args)? {
                    Exit::Return(Some(value)) => self.stack.push(value),
                    Exit::Return(None) => (),
                    Exit::Throw(exception) => return self.raise(exception),
                }
            }
        }

        self.cmd_index += 1;

        Ok(())
    }

    fn execute_runtime_fn(&mut self, function: RuntimeFn) -> RuntimeResult<()> {
        match function {
            RuntimeFn::ResumeOffset => {
                let handle = self.pop_handle()?;

                self.stack.push(Value::Int(handle.offset));
            }

            RuntimeFn::ResumeLocals => {
                let handle = self.pop_handle()?;

                self.stack.push(handle.locals.clone());
            }

            RuntimeFn::ResumeStack => {
                let handle = self.pop_handle()?;

                self.stack.push(handle.stack.clone());
            }

            RuntimeFn::ResumeNext => {
                let handle = self.pop_handle()?;

                self.stack.push(handle.next.clone());
            }

            RuntimeFn::NewResumeHandle => {
                let next = self.pop()?;
                let offset = self.pop_int()?;
                let stack = self.pop()?;
                let locals = self.pop()?;

                self.stack.push(Value::Handle(Rc::new(ResumeHandle {
                    locals,
                    stack,
                    offset,
                    next,
                })));
            }

            RuntimeFn::NewOutCell => self.stack.push(Value::cell()),

            RuntimeFn::OutCellGet => {
                let cell = self.pop_cell()?;

                let value = cell.borrow().clone();

                self.stack.push(value);
            }

            RuntimeFn::OutCellSet => {
                let value = self.pop()?;
                let cell = self.pop_cell()?;

                *cell.borrow_mut() = value;
            }

            RuntimeFn::Deliver => {
                let value = self.pop()?;

                self.machine.delivered.push(value);
            }

            RuntimeFn::Receive => self.stack.push(self.machine.sent.clone()),
        }

        Ok(())
    }

    fn execute_return(&mut self) -> RuntimeResult<()> {
        let value = match self.assembly.signature().result {
            Some(..) => Some(self.pop()?),
            None => None,
        };

        self.exit = Some(Exit::Return(value));

        Ok(())
    }

    fn execute_throw(&mut self) -> RuntimeResult<()> {
        let exception = self.pop()?;

        self.raise(exception)
    }

    // Transfers control to the first handler that protects the current
    // command, or leaves the routine.
    fn raise(&mut self, exception: Value) -> RuntimeResult<()> {
        let assembly = self.assembly;

        for handler in assembly.handlers() {
            let start = self.position(handler.start)?;
            let end = self.position(handler.end)?;

            if (start..end).contains(&self.cmd_index) {
                self.stack.clear();
                self.stack.push(exception);

                return self.jump_to(handler.handler);
            }
        }

        self.exit = Some(Exit::Throw(exception));

        Ok(())
    }

    #[inline(always)]
    fn jump_to(&mut self, label: Label) -> RuntimeResult<()> {
        self.cmd_index = self.position(label)?;

        Ok(())
    }

    #[inline(always)]
    fn position(&self, label: Label) -> RuntimeResult<CmdIndex> {
        self.assembly
            .position(label)
            .ok_or_else(|| RuntimeError::UnmarkedLabel {
                routine: self.routine(),
                label,
            })
    }

    #[inline(always)]
    fn pop(&mut self) -> RuntimeResult<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.underflow()),
        }
    }

    fn pop_int(&mut self) -> RuntimeResult<i32> {
        match self.pop()? {
            Value::Int(value) => Ok(value),
            other => Err(self.mismatch("int", &other)),
        }
    }

    fn pop_bool(&mut self) -> RuntimeResult<bool> {
        match self.pop()? {
            Value::Bool(value) => Ok(value),
            other => Err(self.mismatch("bool", &other)),
        }
    }

    fn pop_buffer(&mut self) -> RuntimeResult<Rc<RefCell<Vec<Value>>>> {
        match self.pop()? {
            Value::Buffer(buffer) => Ok(buffer),
            other => Err(self.mismatch("buffer", &other)),
        }
    }

    fn pop_handle(&mut self) -> RuntimeResult<Rc<ResumeHandle>> {
        match self.pop()? {
            Value::Handle(handle) => Ok(handle),
            other => Err(self.mismatch("handle", &other)),
        }
    }

    fn pop_cell(&mut self) -> RuntimeResult<Rc<RefCell<Value>>> {
        match self.pop()? {
            Value::Cell(cell) => Ok(cell),
            other => Err(self.mismatch("cell", &other)),
        }
    }

    #[inline(always)]
    fn routine(&self) -> CompactString {
        CompactString::from(self.assembly.name())
    }

    fn mismatch(&self, expected: &'static str, found: &Value) -> RuntimeError {
        RuntimeError::TypeMismatch {
            routine: self.routine(),
            cmd: self.cmd_index,
            expected,
            found: found.kind(),
        }
    }

    fn underflow(&self) -> RuntimeError {
        RuntimeError::StackUnderflow {
            routine: self.routine(),
            cmd: self.cmd_index,
        }
    }

    fn unknown_slot(&self) -> RuntimeError {
        RuntimeError::UnknownSlot {
            routine: self.routine(),
            cmd: self.cmd_index,
        }
    }

    fn overflow(&self) -> RuntimeError {
        RuntimeError::Overflow {
            routine: self.routine(),
            cmd: self.cmd_index,
        }
    }

    fn buffer_index(&self, index: usize, len: usize) -> RuntimeError {
        RuntimeError::BufferIndex {
            routine: self.routine(),
            cmd: self.cmd_index,
            index,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Assembler, Assembly, Callee, Condition, OpCmd, Signature, Slot, SlotType},
        interpret::{Machine, Outcome, RuntimeError, Value},
    };

    #[test]
    fn test_loop() {
        let mut assembly = Assembly::new(Signature::new(
            "sum",
            [SlotType::Int],
            Some(SlotType::Object),
        ));

        let acc = assembly.define_local(SlotType::Int);
        let head = assembly.new_label();
        let exit = assembly.new_label();

        assembly.push_int(0);
        assembly.store(acc);
        assembly.mark(head);
        assembly.load(Slot(0));
        assembly.branch(Condition::Equal(0), exit);
        assembly.load(acc);
        assembly.load(Slot(0));
        assembly.op(OpCmd::Add);
        assembly.store(acc);
        assembly.load(Slot(0));
        assembly.push_int(1);
        assembly.op(OpCmd::Sub);
        assembly.store(Slot(0));
        assembly.jump(head);
        assembly.mark(exit);
        assembly.load(acc);
        assembly.box_value(SlotType::Int);
        assembly.ret();
        assembly.finish();

        let outcome = Machine::new(&assembly).start(vec![Value::Int(4)]).unwrap();

        let Outcome::Returned(value) = outcome else {
            panic!("Returned value expected.");
        };

        assert_eq!(value, Value::Int(10));
    }

    #[test]
    fn test_exception_handler() {
        let mut assembly = Assembly::new(Signature::new("catch", [], Some(SlotType::Object)));

        let start = assembly.new_label();
        let end = assembly.new_label();
        let handler = assembly.new_label();

        assembly.protect(start, end, handler);
        assembly.mark(start);
        assembly.push_int(7);
        assembly.box_value(SlotType::Int);
        assembly.throw();
        assembly.mark(end);
        assembly.push_null();
        assembly.ret();
        assembly.mark(handler);
        assembly.ret();
        assembly.finish();

        let outcome = Machine::new(&assembly).start(Vec::new()).unwrap();

        assert!(matches!(outcome, Outcome::Returned(Value::Int(7))));
    }

    #[test]
    fn test_uncaught_exception() {
        let mut assembly = Assembly::new(Signature::new("outer", [], Some(SlotType::Object)));

        let mut inner = assembly.subroutine(Signature::new("inner", [], Some(SlotType::Int)));

        inner.push_bool(true);
        inner.box_value(SlotType::Bool);
        inner.throw();

        let index = assembly.commit(inner);

        assembly.invoke(Callee::Subroutine(index));
        assembly.pop();
        assembly.push_null();
        assembly.ret();
        assembly.finish();

        let outcome = Machine::new(&assembly).start(Vec::new()).unwrap();

        assert!(matches!(outcome, Outcome::Threw(Value::Bool(true))));
    }

    #[test]
    fn test_step_limit() {
        let mut assembly = Assembly::new(Signature::new("spin", [], Some(SlotType::Object)));

        let head = assembly.new_label();

        assembly.mark(head);
        assembly.jump(head);
        assembly.finish();

        let result = Machine::new(&assembly)
            .with_step_limit(100)
            .start(Vec::new());

        assert_eq!(result.unwrap_err(), RuntimeError::StepLimit { limit: 100 });
    }

    #[test]
    fn test_arity() {
        let mut assembly = Assembly::new(Signature::new("unit", [], Some(SlotType::Object)));

        assembly.push_null();
        assembly.ret();

        let result = Machine::new(&assembly).start(vec![Value::Null]);

        assert!(matches!(result, Err(RuntimeError::Arity { expected: 0, found: 1, .. })));
    }
}
