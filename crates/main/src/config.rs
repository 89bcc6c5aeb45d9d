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

/// A general configuration object for the routine lowering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct LoweringConfig {
    /// If set to true, suspension points that capture structurally equal
    /// execution states share a single restore sequence. Each suspension
    /// point still receives its own resume offset.
    ///
    /// If set to false, every suspension point gets a dedicated restore
    /// sequence, which increases the generated code size but keeps the
    /// resume paths independent from each other.
    ///
    /// The default value is true.
    pub deduplicate_snapshots: bool,

    /// If set to true, a captured operand stack that consists of a single
    /// value is restored directly from the stack buffer without an
    /// intermediate local slot.
    ///
    /// The default value is true.
    pub inline_singleton_stack: bool,

    /// The maximum number of non-normal signals of an outlined call that the
    /// call site decodes with a chain of equality tests. Above this number,
    /// the call site uses a switch.
    ///
    /// The default value is 2.
    pub equality_dispatch_limit: usize,

    /// Controls the choice between the table switch and the lookup switch.
    ///
    /// A set of keys is lowered into a table switch if the key range is at
    /// most `keys * sparse_switch_ratio` wide (the holes of the table lead to
    /// the default target). Otherwise, the lookup switch is used.
    ///
    /// The default value is 1, meaning that only the fully dense key sets
    /// produce table switches.
    pub sparse_switch_ratio: usize,
}

impl Default for LoweringConfig {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl LoweringConfig {
    /// The default constructor for this configuration object.
    ///
    /// Unlike the [Default] implementation, this function is const.
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            deduplicate_snapshots: true,
            inline_singleton_stack: true,
            equality_dispatch_limit: 2,
            sparse_switch_ratio: 1,
        }
    }
}
