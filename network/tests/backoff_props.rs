use std::time::Duration;

use proptest::prelude::*;

use skald_network::generate_exp_durations;

proptest! {
    /// A schedule of length n with positive increase is strictly
    /// increasing and has exactly n entries.
    #[test]
    fn schedule_is_strictly_increasing(
        initial_secs in 1u64..60,
        inc in 0.01f64..1.0,
        count in 1usize..30,
    ) {
        let schedule = generate_exp_durations(Duration::from_secs(initial_secs), inc, count);
        prop_assert_eq!(schedule.len(), count);
        for pair in schedule.windows(2) {
            prop_assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    /// The first entry is the configured initial duration.
    #[test]
    fn schedule_starts_at_initial(
        initial_secs in 1u64..60,
        inc in 0.01f64..1.0,
        count in 1usize..30,
    ) {
        let schedule = generate_exp_durations(Duration::from_secs(initial_secs), inc, count);
        prop_assert_eq!(schedule[0], Duration::from_secs(initial_secs));
    }

    /// Consecutive entries grow by exactly the configured factor.
    #[test]
    fn schedule_growth_factor_is_constant(
        initial_secs in 1u64..60,
        inc in 0.01f64..1.0,
        count in 2usize..30,
    ) {
        let schedule = generate_exp_durations(Duration::from_secs(initial_secs), inc, count);
        for pair in schedule.windows(2) {
            let ratio = pair[1].as_secs_f64() / pair[0].as_secs_f64();
            prop_assert!((ratio - (1.0 + inc)).abs() < 1e-6);
        }
    }
}
