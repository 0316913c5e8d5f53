use std::sync::atomic::{AtomicU8, Ordering};

pub const FULL_WEIGHT: u8 = 100;

/// Admission signal for active/passive cluster setups.
///
/// A weight of zero means this cluster is shedding traffic and must not own
/// resources: acquisitions are skipped and owned resources are released.
/// Any non-zero weight allows ownership.
pub trait ClusterWeight: Send + Sync {
    fn weight(&self) -> u8;
}

/// Constant weight. The default is fully active.
#[derive(Debug, Clone, Copy)]
pub struct FixedWeight(pub u8);

impl Default for FixedWeight {
    fn default() -> Self {
        Self(FULL_WEIGHT)
    }
}

impl ClusterWeight for FixedWeight {
    fn weight(&self) -> u8 {
        self.0
    }
}

/// Weight that can be changed at runtime, e.g. by a failover controller.
#[derive(Debug)]
pub struct AdjustableWeight(AtomicU8);

impl AdjustableWeight {
    pub fn new(weight: u8) -> Self {
        Self(AtomicU8::new(weight))
    }

    pub fn set(&self, weight: u8) {
        let old = self.0.swap(weight, Ordering::AcqRel);
        if old != weight {
            tracing::info!(old, new = weight, "Cluster weight changed");
        }
    }
}

impl Default for AdjustableWeight {
    fn default() -> Self {
        Self::new(FULL_WEIGHT)
    }
}

impl ClusterWeight for AdjustableWeight {
    fn weight(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_weight_defaults_to_active() {
        assert_eq!(FixedWeight::default().weight(), FULL_WEIGHT);
    }

    #[test]
    fn test_adjustable_weight() {
        let weight = AdjustableWeight::default();
        weight.set(0);
        assert_eq!(weight.weight(), 0);
        weight.set(100);
        assert_eq!(weight.weight(), 100);
    }
}
