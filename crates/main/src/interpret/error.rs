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
    result::Result as StdResult,
};

use compact_str::CompactString;

use crate::assembly::{CmdIndex, Label, SubroutineIndex};

/// A result of the virtual machine execution, which can either be a normal
/// value or a [RuntimeError].
pub type RuntimeResult<T> = StdResult<T, RuntimeError>;

/// An error that interrupts the execution of the virtual machine.
///
/// The generated code of a well-formed routine never produces these errors.
/// They indicate broken code or a misuse of the machine.
#[derive(Clone, PartialEq, Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The operand has an unexpected kind.
    TypeMismatch {
        routine: CompactString,
        cmd: CmdIndex,
        expected: &'static str,
        found: &'static str,
    },

    /// The operand stack is empty.
    StackUnderflow { routine: CompactString, cmd: CmdIndex },

    /// The command accesses a local slot outside of the routine's frame.
    UnknownSlot { routine: CompactString, cmd: CmdIndex },

    /// The command jumps to a label that has never been marked.
    UnmarkedLabel { routine: CompactString, label: Label },

    /// The command calls a subroutine that does not exist.
    UnknownSubroutine {
        routine: CompactString,
        index: SubroutineIndex,
    },

    /// The buffer access is out of bounds.
    BufferIndex {
        routine: CompactString,
        cmd: CmdIndex,
        index: usize,
        len: usize,
    },

    /// The integer operation overflows.
    Overflow { routine: CompactString, cmd: CmdIndex },

    /// The control reaches the end of the routine without a return.
    FallThrough { routine: CompactString },

    /// The routine receives a wrong number of arguments.
    Arity {
        routine: CompactString,
        expected: usize,
        found: usize,
    },

    /// The execution exceeds the configured number of steps.
    StepLimit { limit: usize },
}

impl Display for RuntimeError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch {
                routine,
                cmd,
                expected,
                found,
            } => formatter.write_fmt(format_args!(
                "{routine:?} #{cmd}: expected {expected} operand, found {found}",
            )),

            Self::StackUnderflow { routine, cmd } => {
                formatter.write_fmt(format_args!("{routine:?} #{cmd}: operand stack underflow"))
            }

            Self::UnknownSlot { routine, cmd } => {
                formatter.write_fmt(format_args!("{routine:?} #{cmd}: unknown local slot"))
            }

            Self::UnmarkedLabel { routine, label } => {
                formatter.write_fmt(format_args!("{routine:?}: jump to unmarked label {label}"))
            }

            Self::UnknownSubroutine { routine, index } => {
                formatter.write_fmt(format_args!("{routine:?}: unknown subroutine fn{index}"))
            }

            Self::BufferIndex {
                routine,
                cmd,
                index,
                len,
            } => formatter.write_fmt(format_args!(
                "{routine:?} #{cmd}: buffer index {index} is out of bounds 0..{len}",
            )),

            Self::Overflow { routine, cmd } => {
                formatter.write_fmt(format_args!("{routine:?} #{cmd}: integer overflow"))
            }

            Self::FallThrough { routine } => {
                formatter.write_fmt(format_args!("{routine:?}: missing return at the end"))
            }

            Self::Arity {
                routine,
                expected,
                found,
            } => formatter.write_fmt(format_args!(
                "{routine:?}: expected {expected} arguments, found {found}",
            )),

            Self::StepLimit { limit } => {
                formatter.write_fmt(format_args!("execution exceeds {limit} steps"))
            }
        }
    }
}

impl StdError for RuntimeError {}
