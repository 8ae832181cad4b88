/// Strength decay.
///
/// strength -= decay_rate * days * exp(-access_count * access_boost)
///             / (importance * importance_multiplier)
///
/// `days` is measured from the record's decay anchor, so a record that is
/// decayed twice is never charged for the same window again. Strength
/// never goes below `min_strength`; a record at the floor is archived.

use crate::core::config::DecayConfig;
use crate::memory::record::MemoryRecord;

const MS_PER_DAY: f64 = 24.0 * 3_600_000.0;
const MIN_IMPORTANCE: f32 = 0.01;

/// Strength the record would have at `now`, without mutating it.
pub fn decayed_strength(record: &MemoryRecord, now: u64, config: &DecayConfig) -> f32 {
    if record.strength <= config.min_strength {
        return record.strength;
    }
    let days = now.saturating_sub(record.decay_anchor()) as f64 / MS_PER_DAY;
    let damping = (-(record.access_count as f64) * config.access_boost as f64).exp();
    let weight = record.importance.max(MIN_IMPORTANCE) as f64
        * config.importance_multiplier.max(MIN_IMPORTANCE) as f64;

    let delta = record.decay_rate as f64 * days * damping / weight;
    (record.strength as f64 - delta).max(config.min_strength as f64) as f32
}

/// Apply decay up to `now`. Returns true if the record is at the floor.
pub fn apply_decay(record: &mut MemoryRecord, now: u64, config: &DecayConfig) -> bool {
    record.strength = decayed_strength(record, now, config);
    record.last_decayed = Some(record.last_decayed.map_or(now, |prev| prev.max(now)));
    record.strength <= config.min_strength
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RecordDefaults;
    use crate::memory::record::NewMemory;

    const DAY: u64 = 86_400_000;

    fn record(importance: f32) -> MemoryRecord {
        NewMemory::new("episodic", vec![1.0])
            .with_timestamp(0)
            .with_importance(importance)
            .with_decay_rate(0.1)
            .into_record(&RecordDefaults::default())
    }

    #[test]
    fn test_one_day_decay() {
        let config = DecayConfig { min_strength: 0.1, access_boost: 0.1, importance_multiplier: 1.0 };
        let mut r = record(1.0);
        assert!(!apply_decay(&mut r, DAY, &config));
        assert!((r.strength - 0.9).abs() < 1e-5);
        assert_eq!(r.last_decayed, Some(DAY));
    }

    #[test]
    fn test_access_and_importance_slow_decay() {
        let config = DecayConfig::default();
        let plain = decayed_strength(&record(0.5), DAY, &config);
        let important = decayed_strength(&record(1.0), DAY, &config);
        let mut accessed = record(0.5);
        accessed.access_count = 10;
        let accessed = decayed_strength(&accessed, DAY, &config);

        assert!(important > plain);
        assert!(accessed > plain);
    }

    #[test]
    fn test_repeated_decay_does_not_double_count() {
        let config = DecayConfig::default();
        let mut once = record(1.0);
        apply_decay(&mut once, 2 * DAY, &config);

        let mut twice = record(1.0);
        apply_decay(&mut twice, DAY, &config);
        apply_decay(&mut twice, 2 * DAY, &config);

        assert!((once.strength - twice.strength).abs() < 1e-5);
    }

    #[test]
    fn test_floor_and_monotonic() {
        let config = DecayConfig::default();
        let mut r = record(0.0);
        let mut previous = r.strength;
        for day in 1..=30 {
            apply_decay(&mut r, day * DAY, &config);
            assert!(r.strength <= previous);
            assert!(r.strength >= config.min_strength);
            previous = r.strength;
        }
        assert!(apply_decay(&mut r, 31 * DAY, &config));
    }

    #[test]
    fn test_weak_record_is_not_raised() {
        let config = DecayConfig::default();
        let mut r = record(1.0);
        r.strength = 0.05;
        apply_decay(&mut r, DAY, &config);
        assert_eq!(r.strength, 0.05);
    }
}
