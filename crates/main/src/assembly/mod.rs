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

//! The instruction-emission capability consumed by the lowering core.
//!
//! The [Assembler] trait describes a stack machine with an operand stack,
//! indexed local slots, labels, and calls. The lowering core never emits
//! anything else, so any backend able to implement this trait (a JVM class
//! writer, a register machine translator, etc.) can host the lowered code.
//!
//! The [Assembly] object is the recording implementation of the trait. It
//! tracks the operand stack types and the live locals of every emitted
//! command, checks their consistency at labels and branches, and can be
//! executed by the [Machine](crate::interpret::Machine).

mod builder;
mod cmd;
mod label;
mod types;

use compact_str::CompactString;

pub use crate::assembly::{
    builder::{Assembly, Handler},
    cmd::{
        BoxCmd,
        BranchCmd,
        BufferLoadCmd,
        BufferStoreCmd,
        Cmd,
        DupCmd,
        InvokeCmd,
        JumpCmd,
        LoadCmd,
        LookupSwitchCmd,
        NewBufferCmd,
        OpCmd,
        PopCmd,
        PushBoolCmd,
        PushIntCmd,
        PushNullCmd,
        ReturnCmd,
        StoreCmd,
        SwapCmd,
        TableSwitchCmd,
        ThrowCmd,
        UnboxCmd,
    },
    label::{Label, LabelStatus},
    types::{LocalsSnapshot, Slot, SlotType, StackSnapshot},
};

pub type CmdIndex = usize;
pub type SubroutineIndex = usize;

/// A stack machine that receives the lowered code.
///
/// Unless stated otherwise, each function describes its effect on the
/// operand stack in the `(before) -> (after)` notation, where the rightmost
/// value is the top of the stack.
pub trait Assembler: Sized {
    /// Creates a new unresolved label.
    fn new_label(&mut self) -> Label;

    /// Binds the label to the current position.
    ///
    /// Each label must be marked exactly once.
    fn mark(&mut self, label: Label);

    /// Returns false if the current position follows an unconditional
    /// transfer of control and no label has been marked since.
    fn is_reachable(&self) -> bool;

    /// `() -> ()`: unconditional jump.
    fn jump(&mut self, target: Label);

    /// `(operand) -> ()`: jumps to the target if the condition holds.
    fn branch(&mut self, condition: Condition, target: Label);

    /// `(int) -> ()`: jumps to `targets[key - low]`, or to the default target
    /// if the key is out of range.
    fn table_switch(&mut self, low: i32, targets: &[Label], default: Label);

    /// `(int) -> ()`: jumps to the target of the matching key, or to the
    /// default target. The keys must be strictly ascending.
    fn lookup_switch(&mut self, keys: &[i32], targets: &[Label], default: Label);

    /// `() -> (int)`
    fn push_int(&mut self, value: i32);

    /// `() -> (bool)`
    fn push_bool(&mut self, value: bool);

    /// `() -> (object)`
    fn push_null(&mut self);

    /// `(any) -> ()`
    fn pop(&mut self);

    /// `(a) -> (a, a)`
    fn dup(&mut self);

    /// `(a, b) -> (b, a)`
    fn swap(&mut self);

    /// `(lhs, rhs) -> (result)`
    fn op(&mut self, op: OpCmd);

    /// `(primitive) -> (object)`
    fn box_value(&mut self, ty: SlotType);

    /// `(object) -> (primitive)`
    fn unbox_value(&mut self, ty: SlotType);

    /// `() -> (buffer)`: creates an object buffer of the specified length.
    fn new_buffer(&mut self, len: usize);

    /// `(buffer, object) -> (buffer)`
    fn buffer_store(&mut self, index: usize);

    /// `(buffer) -> (object)`
    fn buffer_load(&mut self, index: usize);

    /// Allocates a free local slot of the specified type.
    fn define_local(&mut self, ty: SlotType) -> Slot;

    /// Returns the local slot back to the pool of free slots.
    fn release_local(&mut self, slot: Slot);

    /// `() -> (value)`
    fn load(&mut self, slot: Slot);

    /// `(value) -> ()`
    fn store(&mut self, slot: Slot);

    /// `(args..) -> (result?)`: calls the callee, consuming the arguments
    /// according to its signature.
    fn invoke(&mut self, callee: Callee);

    /// `(result?) -> ()`: returns from the routine.
    fn ret(&mut self);

    /// `(object) -> ()`: throws the object as an exception.
    fn throw(&mut self);

    /// Registers an exception table entry: an exception thrown between the
    /// `start` (inclusive) and `end` (exclusive) positions transfers control
    /// to the `handler` label with the exception object on the stack.
    ///
    /// The handler label must not be marked yet. Entries registered earlier
    /// take precedence over the entries registered later.
    fn protect(&mut self, start: Label, end: Label, handler: Label);

    /// Returns the operand stack types at the current position.
    fn stack_snapshot(&self) -> StackSnapshot;

    /// Returns the live local slots at the current position, including the
    /// parameters.
    fn locals_snapshot(&self) -> LocalsSnapshot;

    /// Overrides the tracked operand stack types of the current position.
    fn reset_stack(&mut self, stack: &StackSnapshot);

    /// Overrides both the tracked operand stack and the tracked live locals
    /// of the current position. The parameters always remain live.
    fn reset_frame(&mut self, locals: &LocalsSnapshot, stack: &StackSnapshot);

    /// Returns the signature of the routine under construction.
    fn signature(&self) -> &Signature;

    /// Creates an assembler for a separate routine that this routine will be
    /// able to call once the subroutine is [committed](Self::commit).
    fn subroutine(&mut self, signature: Signature) -> Self;

    /// Finishes the subroutine and registers it in this routine.
    fn commit(&mut self, subroutine: Self) -> SubroutineIndex;
}

/// A branching condition. Each condition consumes one operand.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Condition {
    /// The bool operand is true.
    True,

    /// The bool operand is false.
    False,

    /// The object operand is null.
    Null,

    /// The object operand is not null.
    NonNull,

    /// The int operand is less than zero.
    Negative,

    /// The int operand equals the value.
    Equal(i32),

    /// The int operand does not equal the value.
    NotEqual(i32),
}

impl Condition {
    /// The expected type of the operand.
    #[inline(always)]
    pub const fn operand(self) -> SlotType {
        match self {
            Self::True | Self::False => SlotType::Bool,
            Self::Null | Self::NonNull => SlotType::Object,
            Self::Negative | Self::Equal(..) | Self::NotEqual(..) => SlotType::Int,
        }
    }
}

/// A target of the [invoke](Assembler::invoke) operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Callee {
    Runtime(RuntimeFn),
    Subroutine(SubroutineIndex),
}

/// A runtime function required by the lowered code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RuntimeFn {
    /// `(handle) -> (int)`: the resume offset stored in the handle.
    ResumeOffset,

    /// `(handle) -> (buffer)`: the captured locals.
    ResumeLocals,

    /// `(handle) -> (buffer)`: the captured operand stack.
    ResumeStack,

    /// `(handle) -> (handle)`: the chained handle of the suspended callee.
    ResumeNext,

    /// `(locals, stack, offset, next) -> (handle)`
    NewResumeHandle,

    /// `() -> (cell)`
    NewOutCell,

    /// `(cell) -> (object)`
    OutCellGet,

    /// `(cell, object) -> ()`
    OutCellSet,

    /// `(object) -> ()`: hands a yielded or awaited value to the driver.
    Deliver,

    /// `() -> (object)`: fetches the value sent to the resumed routine.
    Receive,
}

impl RuntimeFn {
    /// The parameter types of the function.
    pub const fn params(self) -> &'static [SlotType] {
        match self {
            Self::ResumeOffset | Self::ResumeLocals | Self::ResumeStack | Self::ResumeNext => {
                &[SlotType::Object]
            }

            Self::NewResumeHandle => &[
                SlotType::Object,
                SlotType::Object,
                SlotType::Int,
                SlotType::Object,
            ],

            Self::NewOutCell | Self::Receive => &[],
            Self::OutCellGet | Self::Deliver => &[SlotType::Object],
            Self::OutCellSet => &[SlotType::Object, SlotType::Object],
        }
    }

    /// The result type of the function.
    pub const fn result(self) -> Option<SlotType> {
        match self {
            Self::ResumeOffset => Some(SlotType::Int),
            Self::OutCellSet | Self::Deliver => None,
            _ => Some(SlotType::Object),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::ResumeOffset => "resume-offset",
            Self::ResumeLocals => "resume-locals",
            Self::ResumeStack => "resume-stack",
            Self::ResumeNext => "resume-next",
            Self::NewResumeHandle => "new-resume-handle",
            Self::NewOutCell => "new-out-cell",
            Self::OutCellGet => "out-cell-get",
            Self::OutCellSet => "out-cell-set",
            Self::Deliver => "deliver",
            Self::Receive => "receive",
        }
    }
}

/// A signature of a routine.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Signature {
    pub name: CompactString,
    pub params: Vec<SlotType>,
    pub result: Option<SlotType>,
}

impl Signature {
    #[inline(always)]
    pub fn new(
        name: impl Into<CompactString>,
        params: impl Into<Vec<SlotType>>,
        result: Option<SlotType>,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
            result,
        }
    }

    /// Returns the local slot of the parameter with the specified index.
    #[inline(always)]
    pub fn param_slot(&self, index: usize) -> Slot {
        match u16::try_from(index) {
            Ok(index) if usize::from(index) < self.params.len() => Slot(index),
            _ => crate::report::system_panic!(
                "Parameter {index} is out of bounds of {:?}.",
                self.name,
            ),
        }
    }
}
