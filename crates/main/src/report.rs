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

use strsim::normalized_damerau_levenshtein;

/// The log target of the records emitted by this crate.
pub(crate) static LOWERING_LOG: &str = "ad-astra::$lowering";

macro_rules! system_panic {
    ($($arg:tt)*) => {
        panic!(
            "{} internal error. {}\nThis is a bug in the code generator. Please report it.",
            env!("CARGO_PKG_NAME"),
            format_args!($($arg)*),
        )
    };
}

pub(crate) use system_panic;

const SUGGESTION_THRESHOLD: f64 = 0.5;

// Returns the candidate that is most likely a misspelling of `name`.
pub(crate) fn closest_name<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best = None;
    let mut best_score = SUGGESTION_THRESHOLD;

    for candidate in candidates {
        let score = normalized_damerau_levenshtein(name, candidate);

        if score > best_score {
            best = Some(candidate);
            best_score = score;
        }
    }

    best
}

// Formats the " Did you mean ..?" tail of a diagnostic, or an empty string.
pub(crate) fn suggestion<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> String {
    match closest_name(name, candidates) {
        Some(candidate) => format!(" Did you mean \"{candidate}\"?"),
        None => String::new(),
    }
}
