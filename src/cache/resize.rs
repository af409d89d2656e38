// Adaptive cache-size control.
//
// Once per epoch (a fixed number of cache accesses) the controller looks at
// the epoch's hit rate and grows or shrinks the cache ceiling. A flash
// increment reacts immediately to a single insertion large relative to the
// ceiling, without waiting for the epoch boundary.

use crate::error::{ErrorKind, Result};
use std::fmt;
use std::sync::Arc;

/// Hard ceiling on the cache ceiling itself.
pub const MAX_CACHE_SIZE: usize = 128 * 1024 * 1024;
/// Hard floor.
pub const MIN_CACHE_SIZE: usize = 1024;

pub const MIN_EPOCH_LENGTH: u64 = 100;
pub const MAX_EPOCH_LENGTH: u64 = 80_000;
pub const MAX_EPOCH_MARKERS: usize = 10;

/// Hit-rate-driven resize modes, shared by the increment and decrement
/// sides. The age-out variants only have extra meaning for decrements,
/// where survival past epoch markers drives the shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Off,
    Threshold,
    AgeOut,
    AgeOutWithThreshold,
}

impl ResizeMode {
    pub fn is_active(self) -> bool {
        self != ResizeMode::Off
    }

    fn uses_age_out(self) -> bool {
        matches!(self, ResizeMode::AgeOut | ResizeMode::AgeOutWithThreshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    Off,
    AddSpace,
}

/// Per-epoch report callback: (epoch number, hit rate, size before, after).
pub type ReportFn = Arc<dyn Fn(u64, f64, usize, usize) + Send + Sync>;

#[derive(Clone)]
pub struct AutoResizeConfig {
    pub report_fn: Option<ReportFn>,

    pub set_initial_size: bool,
    pub initial_size: usize,
    pub min_clean_fraction: f64,
    pub max_size: usize,
    pub min_size: usize,
    pub epoch_length: u64,

    pub incr_mode: ResizeMode,
    pub lower_hr_threshold: f64,
    pub increment: f64,
    pub apply_max_increment: bool,
    pub max_increment: usize,

    pub flash_incr_mode: FlashMode,
    pub flash_multiple: f64,
    pub flash_threshold: f64,

    pub decr_mode: ResizeMode,
    pub upper_hr_threshold: f64,
    pub decrement: f64,
    pub apply_max_decrement: bool,
    pub max_decrement: usize,
    pub epochs_before_eviction: usize,
    pub apply_empty_reserve: bool,
    pub empty_reserve: f64,
}

impl fmt::Debug for AutoResizeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoResizeConfig")
            .field("report_fn", &self.report_fn.is_some())
            .field("initial_size", &self.initial_size)
            .field("min_clean_fraction", &self.min_clean_fraction)
            .field("max_size", &self.max_size)
            .field("min_size", &self.min_size)
            .field("epoch_length", &self.epoch_length)
            .field("incr_mode", &self.incr_mode)
            .field("lower_hr_threshold", &self.lower_hr_threshold)
            .field("increment", &self.increment)
            .field("flash_incr_mode", &self.flash_incr_mode)
            .field("decr_mode", &self.decr_mode)
            .field("upper_hr_threshold", &self.upper_hr_threshold)
            .field("decrement", &self.decrement)
            .field("epochs_before_eviction", &self.epochs_before_eviction)
            .finish()
    }
}

impl Default for AutoResizeConfig {
    fn default() -> Self {
        Self {
            report_fn: None,
            set_initial_size: true,
            initial_size: 2 * 1024 * 1024,
            min_clean_fraction: 0.01,
            max_size: 32 * 1024 * 1024,
            min_size: MIN_CACHE_SIZE,
            epoch_length: 50_000,
            incr_mode: ResizeMode::Threshold,
            lower_hr_threshold: 0.9,
            increment: 2.0,
            apply_max_increment: true,
            max_increment: 4 * 1024 * 1024,
            flash_incr_mode: FlashMode::Off,
            flash_multiple: 1.0,
            flash_threshold: 0.25,
            decr_mode: ResizeMode::AgeOutWithThreshold,
            upper_hr_threshold: 0.999,
            decrement: 0.9,
            apply_max_decrement: true,
            max_decrement: 1024 * 1024,
            epochs_before_eviction: 3,
            apply_empty_reserve: true,
            empty_reserve: 0.1,
        }
    }
}

impl AutoResizeConfig {
    /// Validate before installation. `evictions_enabled` comes from the
    /// cache: disabling evictions while any resize mode is active is
    /// rejected here.
    pub fn validate(&self, evictions_enabled: bool) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ErrorKind::InvalidArgument(msg).into()) };

        if self.max_size > MAX_CACHE_SIZE || self.min_size < MIN_CACHE_SIZE {
            return fail(format!(
                "cache size bounds must lie within [{MIN_CACHE_SIZE}, {MAX_CACHE_SIZE}]"
            ));
        }
        if self.min_size > self.max_size {
            return fail("min_size exceeds max_size".into());
        }
        if self.set_initial_size
            && (self.initial_size < self.min_size || self.initial_size > self.max_size)
        {
            return fail("initial_size outside [min_size, max_size]".into());
        }
        if !(0.0..=1.0).contains(&self.min_clean_fraction) {
            return fail("min_clean_fraction outside [0, 1]".into());
        }
        if !(MIN_EPOCH_LENGTH..=MAX_EPOCH_LENGTH).contains(&self.epoch_length) {
            return fail(format!(
                "epoch_length outside [{MIN_EPOCH_LENGTH}, {MAX_EPOCH_LENGTH}]"
            ));
        }

        if self.incr_mode.is_active() {
            if !(0.0..1.0).contains(&self.lower_hr_threshold) {
                return fail("lower_hr_threshold outside [0, 1)".into());
            }
            if self.increment <= 1.0 {
                return fail("increment must exceed 1.0".into());
            }
        }

        if self.flash_incr_mode != FlashMode::Off {
            if self.flash_multiple <= 0.0 || self.flash_multiple > 10.0 {
                return fail("flash_multiple outside (0, 10]".into());
            }
            if self.flash_threshold <= 0.0 || self.flash_threshold > 1.0 {
                return fail("flash_threshold outside (0, 1]".into());
            }
        }

        if self.decr_mode.is_active() {
            if !(0.0..=1.0).contains(&self.upper_hr_threshold) {
                return fail("upper_hr_threshold outside [0, 1]".into());
            }
            if !(0.0..1.0).contains(&self.decrement) {
                return fail("decrement outside [0, 1)".into());
            }
            if self.decr_mode.uses_age_out() {
                if self.epochs_before_eviction == 0
                    || self.epochs_before_eviction > MAX_EPOCH_MARKERS
                {
                    return fail(format!(
                        "epochs_before_eviction outside [1, {MAX_EPOCH_MARKERS}]"
                    ));
                }
                if self.apply_empty_reserve && !(0.0..=0.5).contains(&self.empty_reserve) {
                    return fail("empty_reserve outside [0, 0.5]".into());
                }
            }
        }

        if self.incr_mode.is_active() && self.decr_mode.is_active() {
            if self.lower_hr_threshold >= self.upper_hr_threshold {
                return fail("lower_hr_threshold must stay below upper_hr_threshold".into());
            }
        }

        if !evictions_enabled
            && (self.incr_mode.is_active()
                || self.decr_mode.is_active()
                || self.flash_incr_mode != FlashMode::Off)
        {
            return fail("auto-resize requires evictions to stay enabled".into());
        }

        Ok(())
    }
}

/// What the controller decided at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochDecision {
    pub old_max: usize,
    pub new_max: usize,
    /// Push a fresh epoch marker onto the LRU (age-out decrement active).
    pub insert_marker: bool,
    /// Evict entries older than `epochs_before_eviction` markers.
    pub evict_aged: bool,
}

#[derive(Debug)]
pub struct ResizeController {
    config: AutoResizeConfig,
    current_max: usize,
    epoch: u64,
    ops_in_epoch: u64,
    hits_in_epoch: u64,
}

impl ResizeController {
    pub fn new(config: AutoResizeConfig) -> Self {
        let current_max = if config.set_initial_size {
            config.initial_size
        } else {
            config.max_size
        };
        Self {
            config,
            current_max,
            epoch: 0,
            ops_in_epoch: 0,
            hits_in_epoch: 0,
        }
    }

    pub fn config(&self) -> &AutoResizeConfig {
        &self.config
    }

    /// Replace the configuration, clamping the current ceiling into the new
    /// bounds.
    pub fn set_config(&mut self, config: AutoResizeConfig) {
        if config.set_initial_size {
            self.current_max = config.initial_size;
        }
        self.current_max = self.current_max.clamp(config.min_size, config.max_size);
        self.config = config;
    }

    pub fn current_max_size(&self) -> usize {
        self.current_max
    }

    pub fn min_clean_size(&self) -> usize {
        (self.current_max as f64 * self.config.min_clean_fraction) as usize
    }

    pub fn epochs_before_eviction(&self) -> usize {
        self.config.epochs_before_eviction
    }

    pub fn age_out_active(&self) -> bool {
        self.config.decr_mode.uses_age_out()
    }

    /// Record one cache access; true when this access closed an epoch.
    pub fn record_access(&mut self, hit: bool) -> bool {
        self.ops_in_epoch += 1;
        if hit {
            self.hits_in_epoch += 1;
        }
        self.ops_in_epoch >= self.config.epoch_length
    }

    /// Immediate ceiling bump for one large insertion. Returns the new
    /// ceiling when triggered.
    pub fn maybe_flash_increment(&mut self, entry_size: usize) -> Option<usize> {
        if self.config.flash_incr_mode == FlashMode::Off {
            return None;
        }
        let threshold = (self.config.flash_threshold * self.current_max as f64) as usize;
        if entry_size <= threshold {
            return None;
        }
        let add = (self.config.flash_multiple * entry_size as f64) as usize;
        let new_max = self
            .current_max
            .saturating_add(add)
            .min(MAX_CACHE_SIZE);
        if new_max > self.current_max {
            tracing::debug!(
                old = self.current_max,
                new = new_max,
                entry_size,
                "flash increment"
            );
            self.current_max = new_max;
            return Some(new_max);
        }
        None
    }

    /// Close the epoch and decide the new ceiling. `in_use` is the cache's
    /// current accounted size, used by the age-out target.
    pub fn end_epoch(&mut self, in_use: usize) -> EpochDecision {
        let hit_rate = if self.ops_in_epoch == 0 {
            0.0
        } else {
            self.hits_in_epoch as f64 / self.ops_in_epoch as f64
        };
        let old_max = self.current_max;
        let cfg = &self.config;
        let mut new_max = old_max;

        // Grow first: a low hit rate takes precedence over shrink modes.
        if cfg.incr_mode.is_active() && hit_rate < cfg.lower_hr_threshold {
            let mut grown = (old_max as f64 * cfg.increment) as usize;
            if cfg.apply_max_increment {
                grown = grown.min(old_max + cfg.max_increment);
            }
            new_max = grown.min(cfg.max_size).min(MAX_CACHE_SIZE);
        } else if cfg.decr_mode.is_active() {
            let threshold_ok = match cfg.decr_mode {
                ResizeMode::Threshold | ResizeMode::AgeOutWithThreshold => {
                    hit_rate > cfg.upper_hr_threshold
                }
                ResizeMode::AgeOut => true,
                ResizeMode::Off => false,
            };
            if threshold_ok {
                let target = if cfg.decr_mode.uses_age_out() {
                    let reserve = if cfg.apply_empty_reserve {
                        (old_max as f64 * cfg.empty_reserve) as usize
                    } else {
                        0
                    };
                    in_use.saturating_add(reserve)
                } else {
                    (old_max as f64 * cfg.decrement) as usize
                };
                let mut shrunk = target;
                if cfg.apply_max_decrement {
                    shrunk = shrunk.max(old_max.saturating_sub(cfg.max_decrement));
                }
                new_max = shrunk.max(cfg.min_size).max(MIN_CACHE_SIZE).min(old_max);
            }
        }

        self.current_max = new_max;
        self.epoch += 1;
        let decision = EpochDecision {
            old_max,
            new_max,
            insert_marker: cfg.decr_mode.uses_age_out(),
            evict_aged: cfg.decr_mode.uses_age_out(),
        };

        if let Some(report) = &cfg.report_fn {
            report(self.epoch, hit_rate, old_max, new_max);
        }
        tracing::debug!(
            epoch = self.epoch,
            hit_rate,
            old_max,
            new_max,
            "cache epoch closed"
        );

        self.ops_in_epoch = 0;
        self.hits_in_epoch = 0;
        decision
    }

    pub fn reset_epoch_stats(&mut self) {
        self.ops_in_epoch = 0;
        self.hits_in_epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base_config() -> AutoResizeConfig {
        AutoResizeConfig {
            epoch_length: 100,
            initial_size: 1024 * 1024,
            min_size: MIN_CACHE_SIZE,
            max_size: 16 * 1024 * 1024,
            ..AutoResizeConfig::default()
        }
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let mut cfg = base_config();
        cfg.min_size = cfg.max_size + 1;
        assert!(cfg.validate(true).is_err());

        let mut cfg = base_config();
        cfg.min_clean_fraction = 1.5;
        assert!(cfg.validate(true).is_err());

        let mut cfg = base_config();
        cfg.increment = 0.5;
        assert!(cfg.validate(true).is_err());

        let mut cfg = base_config();
        cfg.lower_hr_threshold = 0.9995;
        // collides with default upper threshold 0.999
        assert!(cfg.validate(true).is_err());

        assert!(base_config().validate(true).is_ok());
    }

    #[test]
    fn test_validation_requires_evictions() {
        let cfg = base_config();
        assert!(cfg.validate(false).is_err());

        let off = AutoResizeConfig {
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::Off,
            flash_incr_mode: FlashMode::Off,
            ..base_config()
        };
        assert!(off.validate(false).is_ok());
    }

    #[test]
    fn test_threshold_increment_doubles_on_low_hit_rate() {
        let mut ctl = ResizeController::new(AutoResizeConfig {
            incr_mode: ResizeMode::Threshold,
            decr_mode: ResizeMode::Off,
            increment: 2.0,
            apply_max_increment: false,
            ..base_config()
        });
        for _ in 0..100 {
            ctl.record_access(false);
        }
        let decision = ctl.end_epoch(0);
        assert_eq!(decision.new_max, 2 * 1024 * 1024);
        assert!(!decision.insert_marker);
    }

    #[test]
    fn test_threshold_decrement_on_high_hit_rate() {
        let mut ctl = ResizeController::new(AutoResizeConfig {
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::Threshold,
            decrement: 0.5,
            apply_max_decrement: false,
            upper_hr_threshold: 0.9,
            ..base_config()
        });
        for _ in 0..100 {
            ctl.record_access(true);
        }
        let decision = ctl.end_epoch(0);
        assert_eq!(decision.new_max, 512 * 1024);
    }

    #[test]
    fn test_age_out_targets_in_use_plus_reserve() {
        let mut ctl = ResizeController::new(AutoResizeConfig {
            incr_mode: ResizeMode::Off,
            decr_mode: ResizeMode::AgeOut,
            apply_max_decrement: false,
            apply_empty_reserve: true,
            empty_reserve: 0.1,
            ..base_config()
        });
        for _ in 0..100 {
            ctl.record_access(true);
        }
        let in_use = 300 * 1024;
        let decision = ctl.end_epoch(in_use);
        assert!(decision.insert_marker);
        assert!(decision.evict_aged);
        let reserve = (1024.0 * 1024.0 * 0.1) as usize;
        assert_eq!(decision.new_max, in_use + reserve);
    }

    #[test]
    fn test_flash_increment_math() {
        let mut ctl = ResizeController::new(AutoResizeConfig {
            flash_incr_mode: FlashMode::AddSpace,
            flash_threshold: 0.5,
            flash_multiple: 2.0,
            ..base_config()
        });
        // 600 KiB > 0.5 * 1 MiB, so ceiling grows by 2 * 600 KiB.
        let new = ctl.maybe_flash_increment(600 * 1024).unwrap();
        assert_eq!(new, 1024 * 1024 + 2 * 600 * 1024);
        // A small insert does not trigger.
        assert!(ctl.maybe_flash_increment(1024).is_none());
    }

    #[test]
    fn test_ceiling_only_moves_at_epoch_boundaries() {
        let mut ctl = ResizeController::new(AutoResizeConfig {
            incr_mode: ResizeMode::Threshold,
            decr_mode: ResizeMode::Off,
            flash_incr_mode: FlashMode::Off,
            ..base_config()
        });
        let before = ctl.current_max_size();
        for _ in 0..99 {
            assert!(!ctl.record_access(false));
            assert_eq!(ctl.current_max_size(), before);
        }
        assert!(ctl.record_access(false));
    }

    #[test]
    fn test_report_fn_called_each_epoch() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut ctl = ResizeController::new(AutoResizeConfig {
            report_fn: Some(Arc::new(|_, _, _, _| {
                CALLS.fetch_add(1, Ordering::Relaxed);
            })),
            ..base_config()
        });
        for _ in 0..100 {
            ctl.record_access(true);
        }
        ctl.end_epoch(0);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}
