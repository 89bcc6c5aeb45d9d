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

//! A reference virtual machine for the lowered code.
//!
//! The [Machine] executes the routines recorded by the
//! [Assembly](crate::assembly::Assembly) together with their subroutines,
//! exception handlers, and the runtime functions that the lowered code
//! relies on: resume handles, out cells, and the delivery of the yielded
//! values.
//!
//! ```ignore
//! let mut machine = Machine::new(&assembly);
//!
//! let mut outcome = machine.start(vec![Value::Null])?;
//!
//! while let Outcome::Suspended(handle) = outcome {
//!     outcome = machine.resume(handle, Value::Null)?;
//! }
//!
//! println!("{:?}", machine.delivered());
//! ```

mod engine;
mod error;
mod value;

pub use crate::interpret::{
    engine::{Machine, Outcome},
    error::{RuntimeError, RuntimeResult},
    value::{ResumeHandle, Value},
};
