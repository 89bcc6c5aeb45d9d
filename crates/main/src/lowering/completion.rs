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

/// A static classification of how a construct completes.
///
/// A construct completes normally if the control may fall through to the
/// code that follows the construct. Otherwise, the construct completes
/// abruptly: every path ends with a jump, a return, a throw, or an endless
/// loop.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompletionType {
    Normal,
    Abrupt,
}

impl Default for CompletionType {
    #[inline(always)]
    fn default() -> Self {
        Self::Normal
    }
}

impl CompletionType {
    /// Sequential composition: the completion of `self` followed by `next`.
    ///
    /// The code after an abrupt construct is unreachable, so the sequence is
    /// abrupt if any of its parts is abrupt.
    #[inline(always)]
    pub const fn then(self, next: Self) -> Self {
        match (self, next) {
            (Self::Normal, Self::Normal) => Self::Normal,
            _ => Self::Abrupt,
        }
    }

    /// Alternative composition: the completion of a construct that executes
    /// either `self` or `other` (e.g. the branches of a conditional).
    #[inline(always)]
    pub const fn select(self, other: Self) -> Self {
        match (self, other) {
            (Self::Abrupt, Self::Abrupt) => Self::Abrupt,
            _ => Self::Normal,
        }
    }

    /// Turns an abrupt completion into a normal one if the construct's own
    /// exit label is targeted by a jump.
    ///
    /// For example, `while (true) { .. }` is abrupt unless the body breaks
    /// out of the loop.
    #[inline(always)]
    pub const fn normal(self, used: bool) -> Self {
        match used {
            true => Self::Normal,
            false => self,
        }
    }

    #[inline(always)]
    pub const fn is_normal(self) -> bool {
        matches!(self, Self::Normal)
    }

    #[inline(always)]
    pub const fn is_abrupt(self) -> bool {
        matches!(self, Self::Abrupt)
    }
}

#[cfg(test)]
mod tests {
    use crate::lowering::CompletionType::{self, Abrupt, Normal};

    const DOMAIN: [CompletionType; 2] = [Normal, Abrupt];

    #[test]
    fn test_then_laws() {
        for a in DOMAIN {
            assert_eq!(Normal.then(a), a);
            assert_eq!(a.then(Normal), a);
            assert_eq!(Abrupt.then(a), Abrupt);

            for b in DOMAIN {
                for c in DOMAIN {
                    assert_eq!(a.then(b).then(c), a.then(b.then(c)));
                }
            }
        }
    }

    #[test]
    fn test_select_laws() {
        for a in DOMAIN {
            assert_eq!(a.select(a), a);
            assert_eq!(Normal.select(a), Normal);

            for b in DOMAIN {
                assert_eq!(a.select(b), b.select(a));

                for c in DOMAIN {
                    assert_eq!(a.select(b).select(c), a.select(b.select(c)));
                }
            }
        }
    }

    #[test]
    fn test_normal() {
        assert_eq!(Abrupt.normal(true), Normal);
        assert_eq!(Abrupt.normal(false), Abrupt);
        assert_eq!(Normal.normal(false), Normal);
        assert_eq!(Normal.normal(true), Normal);
    }

    #[test]
    fn test_endless_loop() {
        let body = Normal;
        let test_is_constant_true = true;
        let break_used = false;

        let completion = match test_is_constant_true {
            true => Abrupt.normal(break_used),
            false => body,
        };

        assert!(completion.is_abrupt());
    }
}
