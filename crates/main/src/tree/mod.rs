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

//! A structured statement language lowered through the [Lowering] core.
//!
//! The language is intentionally small: int and bool values, variables,
//! `if`, `while` with labels, labeled blocks, `break`, `continue`, `return`,
//! `throw`, `try`/`finally`, the `yield` and `await` suspension points, and
//! the outlined blocks that are compiled into separately callable units.
//!
//! The [compile_routine] function lowers a statement list into a routine of
//! the specified [RoutineKind](crate::lowering::RoutineKind).
//!
//! [Lowering]: crate::lowering::Lowering

mod compile;

use compact_str::CompactString;

pub use crate::tree::compile::{compile_routine, TreeError};
use crate::lowering::NodeKey;

/// A statement.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Stmt {
    /// `expr;`
    Expr(Expr),

    /// `let name = value;`
    Let { name: CompactString, value: Expr },

    /// `{ statements }`
    Block(Vec<Stmt>),

    /// `if (test) { then } else { otherwise }`
    If {
        test: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },

    /// `labels: while (test) { body }`
    While {
        labels: Vec<CompactString>,
        test: Expr,
        body: Vec<Stmt>,
    },

    /// `label: body`
    ///
    /// A labeled loop statement receives the label as one of its own loop
    /// labels.
    Labeled {
        label: CompactString,
        body: Box<Stmt>,
    },

    /// `break;` or `break label;`
    Break(Option<CompactString>),

    /// `continue;` or `continue label;`
    Continue(Option<CompactString>),

    /// `return;` or `return value;`
    Return(Option<Expr>),

    /// `throw value;`
    Throw(Expr),

    /// `try { body } finally { finalizer }`
    TryFinally {
        body: Vec<Stmt>,
        finalizer: Vec<Stmt>,
    },

    /// A block compiled into a separately callable unit.
    ///
    /// The unit receives copies of the visible variables: assignments
    /// inside the unit do not affect the variables of the enclosing code.
    /// The unit is compiled once per `key` and routine.
    Outlined { key: NodeKey, body: Vec<Stmt> },
}

impl Stmt {
    /// Returns true if the statement contains a `yield` or an `await`
    /// expression.
    pub fn contains_suspension(&self) -> bool {
        match self {
            Self::Expr(expr) | Self::Let { value: expr, .. } | Self::Throw(expr) => {
                expr.contains_suspension()
            }

            Self::Block(body) | Self::Outlined { body, .. } => {
                body.iter().any(Self::contains_suspension)
            }

            Self::If {
                test,
                then,
                otherwise,
            } => {
                test.contains_suspension()
                    || then.iter().any(Self::contains_suspension)
                    || otherwise.iter().any(Self::contains_suspension)
            }

            Self::While { test, body, .. } => {
                test.contains_suspension() || body.iter().any(Self::contains_suspension)
            }

            Self::Labeled { body, .. } => body.contains_suspension(),

            Self::Break(..) | Self::Continue(..) => false,

            Self::Return(value) => value.as_ref().map_or(false, Expr::contains_suspension),

            Self::TryFinally { body, finalizer } => {
                body.iter().any(Self::contains_suspension)
                    || finalizer.iter().any(Self::contains_suspension)
            }
        }
    }
}

/// An expression.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Expr {
    Int(i32),
    Bool(bool),
    Null,
    Var(CompactString),

    /// `name = value`. The value of the expression is the assigned value.
    Assign {
        name: CompactString,
        value: Box<Expr>,
    },

    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Less(Box<Expr>, Box<Expr>),

    /// Hands the value to the driver and suspends. The value of the
    /// expression is the value sent on resumption.
    Yield(Box<Expr>),

    /// Same as [Yield](Expr::Yield) for the async routines.
    Await(Box<Expr>),
}

impl Expr {
    #[inline(always)]
    pub fn var(name: &str) -> Self {
        Self::Var(CompactString::from(name))
    }

    #[inline(always)]
    pub fn assign(name: &str, value: Self) -> Self {
        Self::Assign {
            name: CompactString::from(name),
            value: Box::new(value),
        }
    }

    #[inline(always)]
    pub fn add(lhs: Self, rhs: Self) -> Self {
        Self::Add(Box::new(lhs), Box::new(rhs))
    }

    #[inline(always)]
    pub fn less(lhs: Self, rhs: Self) -> Self {
        Self::Less(Box::new(lhs), Box::new(rhs))
    }

    #[inline(always)]
    pub fn yielded(value: Self) -> Self {
        Self::Yield(Box::new(value))
    }

    pub fn contains_suspension(&self) -> bool {
        match self {
            Self::Int(..) | Self::Bool(..) | Self::Null | Self::Var(..) => false,
            Self::Assign { value, .. } => value.contains_suspension(),

            Self::Add(lhs, rhs) | Self::Sub(lhs, rhs) | Self::Less(lhs, rhs) => {
                lhs.contains_suspension() || rhs.contains_suspension()
            }

            Self::Yield(..) | Self::Await(..) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tree::{Expr, Stmt};

    #[test]
    fn test_contains_suspension() {
        let plain = Stmt::While {
            labels: Vec::new(),
            test: Expr::less(Expr::var("i"), Expr::Int(3)),
            body: vec![Stmt::Expr(Expr::assign("i", Expr::add(Expr::var("i"), Expr::Int(1))))],
        };

        assert!(!plain.contains_suspension());

        let nested = Stmt::TryFinally {
            body: Vec::new(),
            finalizer: vec![Stmt::Return(Some(Expr::add(
                Expr::Int(1),
                Expr::Await(Box::new(Expr::Null)),
            )))],
        };

        assert!(nested.contains_suspension());
    }
}
