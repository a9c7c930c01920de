//! This module implements the resource limit resolution applied to every
//! sandboxed task.
//!

use sandbox::ResourceLimit;

use crate::languages::LanguageSpec;

/// Resolve the effective limits of one task: the override wins field by field
/// when positive, the defaults fill the rest, and the language's time and
/// memory multipliers scale the merged result.
pub fn apply_limits(
    override_limits: &ResourceLimit,
    defaults: &ResourceLimit,
    language: &LanguageSpec) -> ResourceLimit {
    override_limits
        .merge(defaults)
        .scale(language.time_multiplier, language.memory_multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn language(time_multiplier: f64, memory_multiplier: f64) -> LanguageSpec {
        let mut spec = LanguageSpec::plain("cpp", "main.cpp", "main");
        spec.time_multiplier = time_multiplier;
        spec.memory_multiplier = memory_multiplier;
        spec
    }

    #[test]
    fn override_wins_then_scales() {
        let defaults = ResourceLimit {
            cpu_time_ms: 1000,
            wall_time_ms: 3000,
            memory_mb: 256,
            stack_mb: 64,
            output_mb: 16,
            pids: 16,
        };
        let over = ResourceLimit { cpu_time_ms: 2000, ..Default::default() };

        let resolved = apply_limits(&over, &defaults, &language(2.0, 1.5));

        assert_eq!(4000, resolved.cpu_time_ms);
        assert_eq!(6000, resolved.wall_time_ms);
        assert_eq!(384, resolved.memory_mb);
        assert_eq!(64, resolved.stack_mb);
        assert_eq!(16, resolved.output_mb);
        assert_eq!(16, resolved.pids);
    }

    #[test]
    fn zero_fields_stay_zero() {
        let resolved = apply_limits(
            &ResourceLimit::default(), &ResourceLimit::default(), &language(3.0, 3.0));
        assert_eq!(ResourceLimit::default(), resolved);
    }
}
