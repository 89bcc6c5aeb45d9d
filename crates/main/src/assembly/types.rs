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

use std::fmt::{Display, Formatter};

/// A type of the operand stack value or a local slot value.
///
/// The primitive types are boxed into [Object](SlotType::Object) values
/// whenever they are stored in a buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SlotType {
    /// A 32-bit signed integer.
    Int,

    /// A 64-bit signed integer.
    Long,

    /// A 64-bit floating-point number.
    Double,

    /// A boolean value.
    Bool,

    /// A reference to an object, including the boxed primitives and null.
    Object,
}

impl Display for SlotType {
    #[inline(always)]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.name())
    }
}

impl SlotType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Object => "object",
        }
    }

    /// Returns true if values of this type need boxing to be stored in a
    /// buffer.
    #[inline(always)]
    pub const fn is_primitive(self) -> bool {
        !matches!(self, Self::Object)
    }
}

/// An index of the local slot in the routine's frame.
///
/// The routine parameters occupy the first slots of the frame in the order
/// of the routine signature.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Slot(pub(crate) u16);

impl Display for Slot {
    #[inline(always)]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_fmt(format_args!("l{}", self.0))
    }
}

impl Slot {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordered list of the live local slots with their types.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalsSnapshot {
    entries: Vec<(Slot, SlotType)>,
}

impl FromIterator<(Slot, SlotType)> for LocalsSnapshot {
    fn from_iter<T: IntoIterator<Item = (Slot, SlotType)>>(iter: T) -> Self {
        let mut entries = iter.into_iter().collect::<Vec<_>>();

        entries.sort_by_key(|(slot, _)| *slot);
        entries.dedup_by_key(|(slot, _)| *slot);

        Self { entries }
    }
}

impl LocalsSnapshot {
    #[inline(always)]
    pub fn entries(&self) -> &[(Slot, SlotType)] {
        &self.entries
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, slot: Slot) -> Option<SlotType> {
        let index = self
            .entries
            .binary_search_by_key(&slot, |(slot, _)| *slot)
            .ok()?;

        Some(self.entries[index].1)
    }

    /// Returns a copy of this snapshot without the specified slots.
    pub fn without(&self, excluded: &[Slot]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(slot, _)| !excluded.contains(slot))
                .copied()
                .collect(),
        }
    }
}

/// An ordered list of the operand stack value types, from the bottom of the
/// stack to the top.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackSnapshot {
    types: Vec<SlotType>,
}

impl From<Vec<SlotType>> for StackSnapshot {
    #[inline(always)]
    fn from(types: Vec<SlotType>) -> Self {
        Self { types }
    }
}

impl Display for StackSnapshot {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("(")?;

        let mut first = true;

        for ty in &self.types {
            match first {
                true => first = false,
                false => formatter.write_str(", ")?,
            }

            Display::fmt(ty, formatter)?;
        }

        formatter.write_str(")")
    }
}

impl StackSnapshot {
    #[inline(always)]
    pub fn types(&self) -> &[SlotType] {
        &self.types
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.types.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    #[inline(always)]
    pub fn top(&self) -> Option<SlotType> {
        self.types.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use crate::assembly::{LocalsSnapshot, Slot, SlotType, StackSnapshot};

    #[test]
    fn test_locals_snapshot_order() {
        let snapshot = LocalsSnapshot::from_iter([
            (Slot(3), SlotType::Bool),
            (Slot(1), SlotType::Int),
            (Slot(2), SlotType::Object),
        ]);

        assert_eq!(
            snapshot.entries(),
            &[
                (Slot(1), SlotType::Int),
                (Slot(2), SlotType::Object),
                (Slot(3), SlotType::Bool),
            ],
        );

        assert_eq!(snapshot.get(Slot(2)), Some(SlotType::Object));
        assert_eq!(snapshot.get(Slot(0)), None);

        let reduced = snapshot.without(&[Slot(2)]);

        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced.get(Slot(2)), None);
    }

    #[test]
    fn test_stack_snapshot_display() {
        let snapshot = StackSnapshot::from(vec![SlotType::Int, SlotType::Object]);

        assert_eq!(snapshot.to_string(), "(int, object)");
        assert_eq!(snapshot.top(), Some(SlotType::Object));
        assert_eq!(StackSnapshot::default().to_string(), "()");
    }
}
