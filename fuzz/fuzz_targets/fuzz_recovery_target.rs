//! Fuzz target for recovery target parsing.
//!
//! Parsing must never panic, and anything that parses must survive a
//! display/parse round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use volume_replication::RecoveryTarget;

fuzz_target!(|input: &str| {
    if let Ok(target) = input.parse::<RecoveryTarget>() {
        let again: RecoveryTarget = target.to_string().parse().expect("displayed target parses");
        assert_eq!(again, target);
    }
});
