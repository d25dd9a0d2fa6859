//! Resource pool: total capacity and what running tasks currently hold.

use pipex_core::Resources;

/// Capacity owned by one scheduler.
///
/// Not thread-safe on its own; the scheduler keeps it under the same lock
/// that serializes admission decisions.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    total: Resources,
    used: Resources,
}

impl ResourcePool {
    /// Pool offering `total`.
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            used: Resources::default(),
        }
    }

    /// Total capacity.
    pub fn total(&self) -> &Resources {
        &self.total
    }

    /// Sum of reserved requests.
    pub fn used(&self) -> &Resources {
        &self.used
    }

    /// Capacity not reserved yet.
    pub fn free(&self) -> Resources {
        self.total.saturating_sub(&self.used)
    }

    /// Could `request` ever run here, with every other task gone?
    pub fn can_ever_fit(&self, request: &Resources) -> bool {
        request.fits_within(&self.total)
    }

    /// Reserve `request` if it fits in the free capacity.
    pub fn try_reserve(&mut self, request: &Resources) -> bool {
        if !request.fits_within(&self.free()) {
            return false;
        }
        self.used = self.used.add(request);
        true
    }

    /// Reserve without checking. Used when re-attaching tasks that were
    /// already running before a restart.
    pub fn force_reserve(&mut self, request: &Resources) {
        self.used = self.used.add(request);
    }

    /// Give back a reservation.
    pub fn release(&mut self, request: &Resources) {
        self.used = self.used.saturating_sub(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let mut pool = ResourcePool::new(Resources::new().with_cpus(4).with_mem_mb(1000));
        let half = Resources::new().with_cpus(2).with_mem_mb(500);

        assert!(pool.try_reserve(&half));
        assert!(pool.try_reserve(&half));
        assert!(!pool.try_reserve(&Resources::new().with_cpus(1)));
        assert_eq!(pool.free().cpus, 0);

        pool.release(&half);
        assert_eq!(pool.free().cpus, 2);
        assert!(pool.try_reserve(&Resources::new().with_cpus(1)));
        assert_eq!(pool.used().cpus, 3);
    }

    #[test]
    fn test_can_ever_fit_uses_total() {
        let mut pool = ResourcePool::new(Resources::new().with_cpus(2));
        pool.force_reserve(&Resources::new().with_cpus(2));
        assert!(pool.can_ever_fit(&Resources::new().with_cpus(2)));
        assert!(!pool.can_ever_fit(&Resources::new().with_cpus(3)));
        assert!(!pool.can_ever_fit(&Resources::new().with_custom("gpu", 1)));
    }
}
