//! Counted resource permits governing job concurrency

use weir_core::Config;

/// The resource classes a job can require
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// Local build processes
    Process,
    /// Network downloads (fetch, pull)
    Download,
    /// Network uploads (push)
    Upload,
    /// Exclusive access to mutate the local cache
    Cache,
}

const RESOURCE_COUNT: usize = 4;

fn index(resource: ResourceType) -> usize {
    match resource {
        ResourceType::Process => 0,
        ResourceType::Download => 1,
        ResourceType::Upload => 2,
        ResourceType::Cache => 3,
    }
}

/// All-or-nothing reservation over the configured resource limits
#[derive(Debug)]
pub struct Resources {
    limits: [usize; RESOURCE_COUNT],
    used: [usize; RESOURCE_COUNT],
}

impl Resources {
    /// Build the permit table from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            limits: [
                config.builders.max(1),
                config.fetchers.max(1),
                config.pushers.max(1),
                1, // the cache is a single exclusive permit
            ],
            used: [0; RESOURCE_COUNT],
        }
    }

    /// Try to reserve every listed resource; either all are taken or none.
    pub fn reserve(&mut self, resources: &[ResourceType]) -> bool {
        if resources
            .iter()
            .any(|r| self.used[index(*r)] >= self.limits[index(*r)])
        {
            return false;
        }
        for resource in resources {
            self.used[index(*resource)] += 1;
        }
        true
    }

    /// Release previously reserved resources.
    pub fn release(&mut self, resources: &[ResourceType]) {
        for resource in resources {
            let i = index(*resource);
            debug_assert!(self.used[i] > 0, "release without reserve");
            self.used[i] = self.used[i].saturating_sub(1);
        }
    }

    /// Currently held permits of one class.
    #[must_use]
    pub fn in_use(&self, resource: ResourceType) -> usize {
        self.used[index(resource)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(builders: usize) -> Resources {
        Resources::new(&Config {
            builders,
            fetchers: 2,
            pushers: 1,
            ..Config::default()
        })
    }

    #[test]
    fn all_or_nothing_reservation() {
        let mut r = resources(1);

        assert!(r.reserve(&[ResourceType::Process, ResourceType::Cache]));
        // Process is exhausted, so the whole reservation fails and the
        // cache permit is not leaked
        assert!(!r.reserve(&[ResourceType::Process, ResourceType::Download]));
        assert_eq!(r.in_use(ResourceType::Download), 0);

        r.release(&[ResourceType::Process, ResourceType::Cache]);
        assert!(r.reserve(&[ResourceType::Process, ResourceType::Download]));
    }

    #[test]
    fn cache_is_exclusive() {
        let mut r = resources(4);
        assert!(r.reserve(&[ResourceType::Cache]));
        assert!(!r.reserve(&[ResourceType::Cache]));
        r.release(&[ResourceType::Cache]);
        assert!(r.reserve(&[ResourceType::Cache]));
    }

    #[test]
    fn respects_configured_limits() {
        let mut r = resources(2);
        assert!(r.reserve(&[ResourceType::Process]));
        assert!(r.reserve(&[ResourceType::Process]));
        assert!(!r.reserve(&[ResourceType::Process]));
    }
}
