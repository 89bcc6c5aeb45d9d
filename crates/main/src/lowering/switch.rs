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

use crate::{
    assembly::{Assembler, Label},
    config::LoweringConfig,
    report::system_panic,
};

// Stack: (int) -> ()
//
// Chooses between the table switch and the lookup switch depending on the
// density of the keys.
pub(super) fn emit_switch(
    assembler: &mut impl Assembler,
    config: &LoweringConfig,
    cases: &mut [(i32, Label)],
    default: Label,
) {
    cases.sort_unstable_by_key(|(key, _)| *key);

    if let Some(pair) = cases.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        system_panic!("Duplicate switch key {}.", pair[0].0);
    }

    let (Some((low, _)), Some((high, _))) = (cases.first(), cases.last()) else {
        assembler.pop();
        assembler.jump(default);
        return;
    };

    let width = i64::from(*high) - i64::from(*low) + 1;

    let ratio = cast::i64(config.sparse_switch_ratio.max(1)).unwrap_or(i64::MAX);
    let limit = cast::i64(cases.len())
        .unwrap_or(i64::MAX)
        .saturating_mul(ratio);

    if width > limit {
        let keys = cases.iter().map(|(key, _)| *key).collect::<Vec<_>>();
        let targets = cases.iter().map(|(_, target)| *target).collect::<Vec<_>>();

        assembler.lookup_switch(&keys, &targets, default);

        return;
    }

    let low = *low;

    let Ok(width) = cast::usize(width) else {
        system_panic!("Table switch width {width} overflow.");
    };

    let mut targets = vec![default; width];

    for (key, target) in cases.iter() {
        let Ok(index) = cast::usize(i64::from(*key) - i64::from(low)) else {
            system_panic!("Switch key {key} is out of the table range.");
        };

        targets[index] = *target;
    }

    assembler.table_switch(low, &targets, default);
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Assembler, Assembly, Cmd, LookupSwitchCmd, Signature, SlotType, TableSwitchCmd},
        config::LoweringConfig,
        lowering::switch::emit_switch,
    };

    fn assembly() -> Assembly {
        Assembly::new(Signature::new("switch", [SlotType::Int], None))
    }

    #[test]
    fn test_dense_keys() {
        let mut assembly = assembly();

        let first = assembly.new_label();
        let second = assembly.new_label();
        let default = assembly.new_label();

        assembly.push_int(0);

        emit_switch(
            &mut assembly,
            &LoweringConfig::new(),
            &mut [(2, second), (1, first)],
            default,
        );

        let Some(Cmd::TableSwitch(TableSwitchCmd { low, targets, .. })) = assembly.commands().last()
        else {
            panic!("Table switch expected.");
        };

        assert_eq!(*low, 1);
        assert_eq!(targets, &vec![first, second]);
    }

    #[test]
    fn test_sparse_keys() {
        let mut assembly = assembly();

        let first = assembly.new_label();
        let second = assembly.new_label();
        let default = assembly.new_label();

        assembly.push_int(0);

        emit_switch(
            &mut assembly,
            &LoweringConfig::new(),
            &mut [(10, second), (1, first)],
            default,
        );

        let Some(Cmd::LookupSwitch(LookupSwitchCmd { keys, .. })) = assembly.commands().last()
        else {
            panic!("Lookup switch expected.");
        };

        assert_eq!(keys, &vec![1, 10]);
    }

    #[test]
    fn test_table_with_holes() {
        let mut assembly = assembly();

        let first = assembly.new_label();
        let second = assembly.new_label();
        let default = assembly.new_label();

        let mut config = LoweringConfig::new();

        config.sparse_switch_ratio = 2;

        assembly.push_int(0);

        emit_switch(&mut assembly, &config, &mut [(1, first), (3, second)], default);

        let Some(Cmd::TableSwitch(TableSwitchCmd { targets, .. })) = assembly.commands().last()
        else {
            panic!("Table switch expected.");
        };

        assert_eq!(targets, &vec![first, default, second]);
    }

    #[test]
    fn test_extreme_keys() {
        let mut assembly = assembly();

        let first = assembly.new_label();
        let second = assembly.new_label();
        let default = assembly.new_label();

        assembly.push_int(0);

        emit_switch(
            &mut assembly,
            &LoweringConfig::new(),
            &mut [(i32::MAX, second), (i32::MIN, first)],
            default,
        );

        let Some(Cmd::LookupSwitch(LookupSwitchCmd { keys, targets, .. })) =
            assembly.commands().last()
        else {
            panic!("Lookup switch expected.");
        };

        assert_eq!(keys, &vec![i32::MIN, i32::MAX]);
        assert_eq!(targets, &vec![first, second]);
    }
}
