// src/utils/system.rs: System functions

use std::time::Duration;
use log::{debug, warn};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;

/// Determines number of cores available and the current load
///
/// # Returns
///
/// (physical cores, current cpu usage in percent)
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    (physical_cores, cpu_load)
}

/// Threads the sample pool can occupy at once.
pub fn sample_thread_demand(max_parallel_samples: usize, threads_per_sample: usize) -> usize {
    max_parallel_samples.saturating_mul(threads_per_sample)
}

/// Warns when the sample pool would oversubscribe the machine.
///
/// # Returns
///
/// true if demand fits within the physical cores
pub async fn check_thread_budget(max_parallel_samples: usize, threads_per_sample: usize) -> bool {
    let (cores, load) = detect_cores_and_load().await;
    let demand = sample_thread_demand(max_parallel_samples, threads_per_sample);
    debug!("Detected {} physical cores; CPU load {:.1}%; sample pool wants {} threads", cores, load, demand);
    if demand > cores {
        warn!(
            "{} parallel samples x {} threads = {} threads exceeds {} physical cores",
            max_parallel_samples, threads_per_sample, demand, cores
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_demand() {
        assert_eq!(sample_thread_demand(4, 2), 8);
        assert_eq!(sample_thread_demand(usize::MAX, 2), usize::MAX);
    }

    #[tokio::test]
    async fn test_single_thread_fits() {
        assert!(check_thread_budget(1, 1).await);
    }
}
