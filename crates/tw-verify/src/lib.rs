//! # tw-verify — The "Law" of TRACKWELL
//!
//! Kani proofs for the latest-value merge.
//!
//! # Proof: Order Independence
//!
//! The stored latest value of a metric series is the greatest sample under
//! the `(step, timestamp, value)` order. If that order is total, folding a
//! batch with [`tw_core::latest_of`] yields the same key fields whatever the
//! arrival order, so concurrent or shuffled batches cannot disagree about
//! which sample is latest.

extern crate tw_core;

#[cfg(kani)]
use tw_core::{latest_of, MetricPoint, WireValue};

#[cfg(kani)]
mod proofs {
    use super::*;

    /// A symbolic point with fully unconstrained fields, NaN flag included.
    fn any_point() -> MetricPoint {
        MetricPoint {
            value: kani::any(),
            is_nan: kani::any(),
            step: kani::any(),
            timestamp: kani::any(),
        }
    }

    fn same_key(a: &MetricPoint, b: &MetricPoint) -> bool {
        a.step == b.step && a.timestamp == b.timestamp && a.value.to_bits() == b.value.to_bits()
    }

    /// **Proof: Transitivity of Ordering**
    #[kani::proof]
    fn verify_transitivity() {
        let a = any_point();
        let b = any_point();
        let c = any_point();

        if a <= b && b <= c {
            assert!(a <= c, "Transitivity violation in MetricPoint ordering");
        }
    }

    /// **Proof: Antisymmetry of Ordering**
    ///
    /// If A <= B and B <= A, the two points agree on every key field.
    #[kani::proof]
    fn verify_antisymmetry() {
        let a = any_point();
        let b = any_point();

        if a <= b && b <= a {
            assert!(same_key(&a, &b), "Antisymmetry violation in MetricPoint ordering");
        }
    }

    /// **Proof: Supersedes is strict**
    #[kani::proof]
    fn verify_supersedes_irreflexive() {
        let a = any_point();
        let b = any_point();

        assert!(!a.supersedes(&a));
        assert!(!(a.supersedes(&b) && b.supersedes(&a)));
    }

    /// **Proof: Merge order independence**
    ///
    /// All 6 permutations of 3 symbolic points fold to the same winner.
    #[kani::proof]
    #[kani::unwind(4)]
    fn verify_latest_of_order_independent() {
        let p = [any_point(), any_point(), any_point()];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let expected = latest_of(p);
        for order in orders {
            let winner = latest_of(order.map(|i| p[i]));
            match (expected, winner) {
                (Some(e), Some(w)) => assert!(same_key(&e, &w), "Merge depends on arrival order"),
                _ => panic!("non-empty batch must have a winner"),
            }
        }
    }

    /// **Proof: Stored values are finite**
    #[kani::proof]
    fn verify_wire_values_finite() {
        let raw: f64 = kani::any();
        let wire = WireValue::from_f64(raw);

        assert!(wire.value.is_finite());
        assert_eq!(wire.is_nan, raw.is_nan());
    }
}

// Compile-time assertion that the proof module exists when building with Kani.
#[cfg(not(kani))]
pub fn _proof_placeholder() {
    // Kani proofs are compiled only under cfg(kani).
    // Run `cargo kani --package tw-verify` to execute proofs.
}
