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

//! # Ad Astra Lowering
//!
//! The control-flow lowering and resumable execution core of a stack-machine
//! code generator.
//!
//! The crate turns structured control flow into the flat code of a typed
//! stack machine:
//!
//!  - The [assembly] module defines the target machine interface: labels,
//!    jumps, typed local slots, the operand stack model, exception handler
//!    ranges, and the [Assembler](assembly::Assembler) trait together with
//!    its recording implementation, [Assembly](assembly::Assembly).
//!  - The [lowering] module is the core. It resolves the `break`,
//!    `continue`, and `return` targets across the loop, switch, labeled,
//!    try-finally, and outlined unit scopes, lowers the finally regions,
//!    captures and restores the execution state at the suspension points of
//!    generators and async functions, and compiles parts of a routine into
//!    separately callable units.
//!  - The [tree] module is a small statement language lowered through the
//!    core.
//!  - The [interpret] module is a reference virtual machine that executes
//!    the recorded code, including suspension and resumption.
//!
//! ```ignore
//! let lowered = compile_routine(
//!     Assembly::new(RoutineKind::Resumable.signature("gen", &[])),
//!     LoweringConfig::new(),
//!     RoutineOptions {
//!         kind: RoutineKind::Resumable,
//!         track_completion: false,
//!     },
//!     &[],
//!     &body,
//! )?;
//!
//! let mut machine = Machine::new(&lowered.assembler);
//!
//! let mut outcome = machine.start(vec![Value::Null])?;
//!
//! while let Outcome::Suspended(handle) = outcome {
//!     outcome = machine.resume(handle, Value::Null)?;
//! }
//! ```
//!
//! The crate logs the lowering decisions through the [log] facade under the
//! `ad-astra::$lowering` target.

mod config;
mod report;

pub mod assembly;
pub mod interpret;
pub mod lowering;
pub mod tree;

pub use crate::config::LoweringConfig;
