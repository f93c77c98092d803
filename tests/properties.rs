//! Property-based tests: combinator semantics against a plain `Result`
//! model, rollback invariants and exact counting under concurrency.

use proptest::prelude::*;
use txcell::{atomically, atomically_or_err, Stm, TVar};

proptest! {
    /// `from_result` + `fold` agree with plain `Result` handling.
    #[test]
    fn fold_matches_result_model(result in any::<Result<i32, i32>>()) {
        let stm = Stm::from_result(result.clone());
        let folded = atomically(&stm.fold(|e| e.wrapping_sub(1), |a| a.wrapping_add(1)));

        let expected = match result {
            Ok(a) => a.wrapping_add(1),
            Err(e) => e.wrapping_sub(1),
        };
        prop_assert_eq!(folded, expected);
    }

    /// `either` and `option` are plain projections of the outcome.
    #[test]
    fn either_matches_result_model(result in any::<Result<i32, i32>>()) {
        let stm = Stm::from_result(result.clone());
        prop_assert_eq!(atomically(&stm.clone().either()), result.clone());
        prop_assert_eq!(atomically(&stm.option()), result.ok());
    }

    /// A failing transaction leaves the var untouched, whatever it wrote.
    #[test]
    fn failed_transaction_rolls_back(initial in any::<i32>(), delta in any::<i32>()) {
        let var = TVar::new(initial);
        let stm: Stm<(), &str> = var
            .update(move |x| x.wrapping_add(delta))
            .zip_right(Stm::fail("nope"));

        prop_assert_eq!(atomically_or_err(&stm), Err("nope"));
        prop_assert_eq!(var.read_atomic(), initial);
    }

    /// The abandoned branch of `or_else` cannot be observed.
    #[test]
    fn or_else_abandons_left_writes(initial in any::<i32>(), junk in any::<i32>()) {
        let var = TVar::new(initial);
        let left: Stm<i32> = var.write(junk).and_then(|_| Stm::retry());
        let stm = left.or_else(var.read());

        prop_assert_eq!(atomically(&stm), initial);
        prop_assert_eq!(var.read_atomic(), initial);
    }

    /// `collect_all` equals running the pieces sequentially.
    #[test]
    fn collect_all_matches_model(values in proptest::collection::vec(any::<i32>(), 0..20)) {
        let stms = values.iter().copied().map(Stm::succeed).collect::<Vec<Stm<i32>>>();
        prop_assert_eq!(atomically(&Stm::collect_all(stms)), values);
    }

    /// Concurrent increments sum exactly.
    #[test]
    fn concurrent_updates_sum(threads in 1usize..4, per_thread in 1u64..50) {
        let counter = TVar::new(0u64);

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        atomically(&counter.update(|x| x + 1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(counter.read_atomic(), threads as u64 * per_thread);
    }
}
