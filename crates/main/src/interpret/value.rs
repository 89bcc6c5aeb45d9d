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
    cell::RefCell,
    fmt::{Display, Formatter},
    rc::Rc,
};

use crate::assembly::SlotType;

/// A value of the virtual machine.
///
/// The primitive values keep their type when boxed: the boxing commands
/// only check the value type.
#[derive(Clone, Default, Debug)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Buffer(Rc<RefCell<Vec<Value>>>),
    Handle(Rc<ResumeHandle>),
    Cell(Rc<RefCell<Value>>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(this), Self::Int(other)) => this == other,
            (Self::Long(this), Self::Long(other)) => this == other,
            (Self::Double(this), Self::Double(other)) => this == other,
            (Self::Bool(this), Self::Bool(other)) => this == other,
            (Self::Buffer(this), Self::Buffer(other)) => Rc::ptr_eq(this, other),
            (Self::Handle(this), Self::Handle(other)) => Rc::ptr_eq(this, other),
            (Self::Cell(this), Self::Cell(other)) => Rc::ptr_eq(this, other),
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => formatter.write_str("null"),
            Self::Int(value) => Display::fmt(value, formatter),
            Self::Long(value) => formatter.write_fmt(format_args!("{value}L")),
            Self::Double(value) => Display::fmt(value, formatter),
            Self::Bool(value) => Display::fmt(value, formatter),
            Self::Buffer(buffer) => {
                formatter.write_fmt(format_args!("buffer[{}]", buffer.borrow().len()))
            }

            Self::Handle(handle) => formatter.write_fmt(format_args!("handle#{}", handle.offset)),
            Self::Cell(..) => formatter.write_str("cell"),
        }
    }
}

impl From<i32> for Value {
    #[inline(always)]
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    #[inline(always)]
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl Value {
    #[inline(always)]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[inline(always)]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_handle(&self) -> Option<&Rc<ResumeHandle>> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    /// The initial value of a slot of the specified type.
    #[inline(always)]
    pub fn zero(ty: SlotType) -> Self {
        match ty {
            SlotType::Int => Self::Int(0),
            SlotType::Long => Self::Long(0),
            SlotType::Double => Self::Double(0.0),
            SlotType::Bool => Self::Bool(false),
            SlotType::Object => Self::Null,
        }
    }

    /// Returns true if the value may be stored in a slot of the specified
    /// type.
    pub fn fits(&self, ty: SlotType) -> bool {
        match (ty, self) {
            (SlotType::Int, Self::Int(..)) => true,
            (SlotType::Long, Self::Long(..)) => true,
            (SlotType::Double, Self::Double(..)) => true,
            (SlotType::Bool, Self::Bool(..)) => true,
            (SlotType::Object, _) => true,
            _ => false,
        }
    }

    /// The name of the value kind used in the error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(..) => "int",
            Self::Long(..) => "long",
            Self::Double(..) => "double",
            Self::Bool(..) => "bool",
            Self::Buffer(..) => "buffer",
            Self::Handle(..) => "handle",
            Self::Cell(..) => "cell",
        }
    }

    pub(super) fn buffer(len: usize) -> Self {
        Self::Buffer(Rc::new(RefCell::new(vec![Self::Null; len])))
    }

    pub(super) fn cell() -> Self {
        Self::Cell(Rc::new(RefCell::new(Self::Null)))
    }
}

/// The captured state of a suspended routine.
#[derive(Debug)]
pub struct ResumeHandle {
    /// The buffer of the captured locals, or null.
    pub locals: Value,

    /// The buffer of the captured operand stack, or null.
    pub stack: Value,

    /// The resume offset of the suspension point.
    pub offset: i32,

    /// The handle of the suspended callee, or null.
    pub next: Value,
}

impl ResumeHandle {
    /// The number of handles in the chain, including this one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut next = &self.next;

        while let Value::Handle(handle) = next {
            depth += 1;
            next = &handle.next;
        }

        depth
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::{
        assembly::SlotType,
        interpret::{ResumeHandle, Value},
    };

    #[test]
    fn test_reference_equality() {
        let first = Value::buffer(2);
        let second = Value::buffer(2);

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
        assert_eq!(Value::from(3), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Long(3));
    }

    #[test]
    fn test_fits() {
        assert!(Value::Int(1).fits(SlotType::Int));
        assert!(Value::Int(1).fits(SlotType::Object));
        assert!(!Value::Null.fits(SlotType::Bool));
        assert!(Value::cell().fits(SlotType::Object));
    }

    #[test]
    fn test_handle_chain() {
        let inner = Rc::new(ResumeHandle {
            locals: Value::Null,
            stack: Value::Null,
            offset: 0,
            next: Value::Null,
        });

        let outer = ResumeHandle {
            locals: Value::Null,
            stack: Value::buffer(1),
            offset: 3,
            next: Value::Handle(inner),
        };

        assert_eq!(outer.depth(), 2);
        assert_eq!(Value::Handle(Rc::new(outer)).to_string(), "handle#3");
    }
}
