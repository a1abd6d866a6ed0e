//! Property-based tests for configuration module
//!
//! These tests use proptest to generate random configurations and verify
//! validation rules and the TOML round trip.

use super::*;
use proptest::prelude::*;

// Strategy for generating ordered watermarks
prop_compose! {
    fn valid_queue_config()(
        high_watermark in 1usize..64,
    )(
        low_watermark in 0..=high_watermark,
        high_watermark in Just(high_watermark),
        outbox_limit in 1usize..4096,
    ) -> QueueConfig {
        QueueConfig {
            low_watermark,
            high_watermark,
            outbox_limit,
        }
    }
}

prop_compose! {
    fn valid_vsync_config()(
        period_us in 1u64..100_000,
        paced in any::<bool>(),
    )(
        tolerance_us in 0..=period_us,
        period_us in Just(period_us),
        paced in Just(paced),
    ) -> VsyncConfig {
        VsyncConfig {
            paced,
            period_us,
            tolerance_us,
        }
    }
}

prop_compose! {
    fn valid_cpu_config()(
        enabled in any::<bool>(),
        little_cpus in prop::collection::vec(0usize..16, 0..8),
        big_cpus in prop::collection::vec(0usize..16, 0..8),
        default_nice in -20i32..=19,
        little_nice in -20i32..=19,
        big_nice in -20i32..=19,
    ) -> CpuConfig {
        CpuConfig {
            enabled,
            little_cpus,
            big_cpus,
            default_nice,
            little_nice,
            big_nice,
        }
    }
}

prop_compose! {
    fn valid_config()(
        queue in valid_queue_config(),
        size in 1usize..32,
        vsync in valid_vsync_config(),
        cpu in valid_cpu_config(),
        detailed_query in any::<bool>(),
        level in prop_oneof![
            Just("error".to_string()),
            Just("warn".to_string()),
            Just("info".to_string()),
            Just("debug".to_string()),
            Just("trace".to_string()),
        ],
        json in any::<bool>(),
    ) -> DispatchConfig {
        DispatchConfig {
            queue,
            pool: PoolConfig { size },
            vsync,
            cpu,
            hrt: HrtConfig { detailed_query },
            logging: LogConfig { level, json },
        }
    }
}

proptest! {
    #[test]
    fn prop_valid_configs_validate(config in valid_config()) {
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn prop_toml_roundtrip(config in valid_config()) {
        let text = toml::to_string(&config).unwrap();
        let parsed: DispatchConfig = toml::from_str(&text).unwrap();
        prop_assert_eq!(parsed, config);
    }

    #[test]
    fn prop_inverted_watermarks_rejected(high in 1usize..64, extra in 1usize..64) {
        let mut config = DispatchConfig::default();
        config.queue.high_watermark = high;
        config.queue.low_watermark = high + extra;
        prop_assert!(config.validate().is_err());
    }

    #[test]
    fn prop_mirror_wait_covers_one_period(vsync in valid_vsync_config()) {
        prop_assert!(vsync.mirror_wait() >= vsync.period());
    }
}
