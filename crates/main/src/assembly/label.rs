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

use crate::assembly::{CmdIndex, StackSnapshot};

/// An opaque branch target.
///
/// A label is created unresolved, then it is marked (bound to exactly one
/// position of the command stream) and referenced by any number of jumps,
/// branches, switches, and exception table entries. The references may
/// precede the mark (forward jumps) or follow it (backward jumps).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Label(pub(crate) u32);

impl Display for Label {
    #[inline(always)]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

impl Label {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The resolution state of a [Label].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LabelStatus {
    /// The label is not bound to a position yet.
    Unresolved,

    /// The label is bound to the command with the specified index.
    Marked(CmdIndex),
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub(super) struct LabelEntry {
    pub(super) position: Option<CmdIndex>,
    pub(super) references: usize,
    pub(super) stack: Option<StackSnapshot>,
}

impl LabelEntry {
    #[inline(always)]
    pub(super) fn status(&self) -> LabelStatus {
        match self.position {
            Some(position) => LabelStatus::Marked(position),
            None => LabelStatus::Unresolved,
        }
    }
}
