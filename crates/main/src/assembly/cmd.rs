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

use std::fmt::{Arguments, Display, Formatter};

use crate::assembly::{Callee, Condition, Label, Slot, SlotType};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Cmd {
    Jump(JumpCmd),
    Branch(BranchCmd),
    TableSwitch(TableSwitchCmd),
    LookupSwitch(LookupSwitchCmd),
    PushInt(PushIntCmd),
    PushBool(PushBoolCmd),
    PushNull(PushNullCmd),
    Pop(PopCmd),
    Dup(DupCmd),
    Swap(SwapCmd),
    Load(LoadCmd),
    Store(StoreCmd),
    Op(OpCmd),
    Box(BoxCmd),
    Unbox(UnboxCmd),
    NewBuffer(NewBufferCmd),
    BufferStore(BufferStoreCmd),
    BufferLoad(BufferLoadCmd),
    Invoke(InvokeCmd),
    Return(ReturnCmd),
    Throw(ThrowCmd),
}

impl Cmd {
    /// Returns true if the command never passes control to the next command.
    #[inline(always)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Jump(..)
                | Self::TableSwitch(..)
                | Self::LookupSwitch(..)
                | Self::Return(..)
                | Self::Throw(..),
        )
    }

    /// Returns all labels this command may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Self::Jump(JumpCmd { target }) => vec![*target],
            Self::Branch(BranchCmd { target, .. }) => vec![*target],

            Self::TableSwitch(TableSwitchCmd {
                targets, default, ..
            }) => {
                let mut result = targets.clone();
                result.push(*default);
                result
            }

            Self::LookupSwitch(LookupSwitchCmd {
                targets, default, ..
            }) => {
                let mut result = targets.clone();
                result.push(*default);
                result
            }

            _ => Vec::new(),
        }
    }

    pub(super) fn debug(
        &self,
        formatter: &mut Formatter<'_>,
        indent: usize,
        cmd: usize,
    ) -> std::fmt::Result {
        match self {
            Self::Jump(JumpCmd { target }) => {
                println(formatter, indent, format_args!("{cmd}: jump {target}"))
            }

            Self::Branch(BranchCmd { condition, target }) => {
                let condition = match condition {
                    Condition::True => String::from("if-true"),
                    Condition::False => String::from("if-false"),
                    Condition::Null => String::from("if-null"),
                    Condition::NonNull => String::from("if-non-null"),
                    Condition::Negative => String::from("if-negative"),
                    Condition::Equal(value) => format!("if-equal {value}"),
                    Condition::NotEqual(value) => format!("if-not-equal {value}"),
                };

                println(formatter, indent, format_args!("{cmd}: {condition} {target}"))
            }

            Self::TableSwitch(TableSwitchCmd {
                low,
                targets,
                default,
            }) => {
                println(formatter, indent, format_args!("{cmd}: table-switch"))?;

                for (key, target) in (i64::from(*low)..).zip(targets) {
                    println(formatter, indent + 1, format_args!("{key} => {target}"))?;
                }

                println(formatter, indent + 1, format_args!("_ => {default}"))
            }

            Self::LookupSwitch(LookupSwitchCmd {
                keys,
                targets,
                default,
            }) => {
                println(formatter, indent, format_args!("{cmd}: lookup-switch"))?;

                for (key, target) in keys.iter().zip(targets.iter()) {
                    println(formatter, indent + 1, format_args!("{key} => {target}"))?;
                }

                println(formatter, indent + 1, format_args!("_ => {default}"))
            }

            Self::PushInt(PushIntCmd { value }) => {
                println(formatter, indent, format_args!("{cmd}: push int {value}"))
            }

            Self::PushBool(PushBoolCmd { value }) => {
                println(formatter, indent, format_args!("{cmd}: push bool {value}"))
            }

            Self::PushNull(..) => println(formatter, indent, format_args!("{cmd}: push null")),

            Self::Pop(..) => println(formatter, indent, format_args!("{cmd}: pop")),

            Self::Dup(..) => println(formatter, indent, format_args!("{cmd}: dup")),

            Self::Swap(..) => println(formatter, indent, format_args!("{cmd}: swap")),

            Self::Load(LoadCmd { slot }) => {
                println(formatter, indent, format_args!("{cmd}: load {slot}"))
            }

            Self::Store(StoreCmd { slot }) => {
                println(formatter, indent, format_args!("{cmd}: store {slot}"))
            }

            Self::Op(op) => println(formatter, indent, format_args!("{cmd}: {op}")),

            Self::Box(BoxCmd { ty }) => {
                println(formatter, indent, format_args!("{cmd}: box {ty}"))
            }

            Self::Unbox(UnboxCmd { ty }) => {
                println(formatter, indent, format_args!("{cmd}: unbox {ty}"))
            }

            Self::NewBuffer(NewBufferCmd { len }) => {
                println(formatter, indent, format_args!("{cmd}: new-buffer {len}"))
            }

            Self::BufferStore(BufferStoreCmd { index }) => {
                println(formatter, indent, format_args!("{cmd}: buffer-store {index}"))
            }

            Self::BufferLoad(BufferLoadCmd { index }) => {
                println(formatter, indent, format_args!("{cmd}: buffer-load {index}"))
            }

            Self::Invoke(InvokeCmd { callee }) => match callee {
                Callee::Runtime(function) => println(
                    formatter,
                    indent,
                    format_args!("{cmd}: invoke {}", function.name()),
                ),

                Callee::Subroutine(index) => {
                    println(formatter, indent, format_args!("{cmd}: invoke fn{index}"))
                }
            },

            Self::Return(..) => println(formatter, indent, format_args!("{cmd}: ret")),

            Self::Throw(..) => println(formatter, indent, format_args!("{cmd}: throw")),
        }
    }
}

// Stack: () -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct JumpCmd {
    pub target: Label,
}

// Stack: (operand) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BranchCmd {
    pub condition: Condition,
    pub target: Label,
}

// Stack: (int) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TableSwitchCmd {
    pub low: i32,
    pub targets: Vec<Label>,
    pub default: Label,
}

// Stack: (int) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LookupSwitchCmd {
    pub keys: Vec<i32>,
    pub targets: Vec<Label>,
    pub default: Label,
}

// Stack: () -> (int)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PushIntCmd {
    pub value: i32,
}

// Stack: () -> (bool)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PushBoolCmd {
    pub value: bool,
}

// Stack: () -> (object)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PushNullCmd;

// Stack: (value) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PopCmd;

// Stack: (value) -> (value, value)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DupCmd;

// Stack: (a, b) -> (b, a)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SwapCmd;

// Stack: () -> (value)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoadCmd {
    pub slot: Slot,
}

// Stack: (value) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoreCmd {
    pub slot: Slot,
}

// Stack: (lhs, rhs) -> (result)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpCmd {
    Add,
    Sub,
    Lesser,
    Equal,
}

impl Display for OpCmd {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => formatter.write_str("add"),
            Self::Sub => formatter.write_str("sub"),
            Self::Lesser => formatter.write_str("lesser"),
            Self::Equal => formatter.write_str("equal"),
        }
    }
}

impl OpCmd {
    /// The type of the operation result. Both operands are ints.
    #[inline(always)]
    pub const fn result(self) -> SlotType {
        match self {
            Self::Add | Self::Sub => SlotType::Int,
            Self::Lesser | Self::Equal => SlotType::Bool,
        }
    }
}

// Stack: (primitive) -> (object)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BoxCmd {
    pub ty: SlotType,
}

// Stack: (object) -> (primitive)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UnboxCmd {
    pub ty: SlotType,
}

// Stack: () -> (buffer)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NewBufferCmd {
    pub len: usize,
}

// Stack: (buffer, object) -> (buffer)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BufferStoreCmd {
    pub index: usize,
}

// Stack: (buffer) -> (object)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BufferLoadCmd {
    pub index: usize,
}

// Stack: (args..) -> (result?) /* per callee signature */
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InvokeCmd {
    pub callee: Callee,
}

// Stack: (result?) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReturnCmd;

// Stack: (object) -> ()
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ThrowCmd;

#[inline(always)]
pub(super) fn println(
    formatter: &mut Formatter<'_>,
    indent: usize,
    fmt: Arguments,
) -> std::fmt::Result {
    formatter.write_str(&"    ".repeat(indent))?;
    formatter.write_fmt(fmt)?;
    formatter.write_str("\n")?;

    Ok(())
}
