//! Process-wide CPU affinity and NUMA memory-policy placement.
//!
//! Grounded on `original_source/src/lib/idet/platform/cross_topology.h`.
//! Topology discovery and affinity application are Linux-first, matching
//! the original; other platforms get a best-effort degraded (but `Ok`)
//! implementation, exactly as `cross_topology.h`'s own doc comments
//! describe for non-Linux builds.

use crate::config::{NumaMemPolicy, RuntimePolicy};
use crate::error::{Result, Status};

#[derive(Debug, Clone, Default)]
pub struct SocketInfo {
    pub socket_id: i32,
    pub logical_cores: u32,
    pub physical_cores: u32,
    pub logical_cpu_ids: Vec<i32>,
    pub available_cpu_ids: Vec<i32>,
    pub core_siblings: Vec<Vec<i32>>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub total_logical: u32,
    pub total_physical: u32,
    pub socket_count: u32,
    pub all_cpu_ids: Vec<i32>,
    pub available_cpu_ids: Vec<i32>,
    pub sockets: Vec<SocketInfo>,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    fn read_u32(path: &str) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn online_cpu_ids() -> Vec<i32> {
        let Ok(raw) = fs::read_to_string("/sys/devices/system/cpu/online") else {
            return Vec::new();
        };
        parse_cpu_list(raw.trim())
    }

    pub(super) fn parse_cpu_list(s: &str) -> Vec<i32> {
        let mut out = Vec::new();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            if let Some((a, b)) = part.split_once('-') {
                if let (Ok(a), Ok(b)) = (a.parse::<i32>(), b.parse::<i32>()) {
                    out.extend(a..=b);
                }
            } else if let Ok(v) = part.parse::<i32>() {
                out.push(v);
            }
        }
        out
    }

    fn current_affinity_cpus(all: &[i32]) -> Vec<i32> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return all.to_vec();
            }
            all.iter().copied().filter(|&cpu| libc::CPU_ISSET(cpu as usize, &set)).collect()
        }
    }

    /// Best-effort process-wide topology discovery via sysfs.
    pub fn detect_topology() -> Topology {
        let all = online_cpu_ids();
        let available = current_affinity_cpus(&all);

        let mut by_socket: BTreeMap<i32, SocketInfo> = BTreeMap::new();
        let mut physical_ids_seen: BTreeMap<(i32, u32), ()> = BTreeMap::new();

        for &cpu in &all {
            let base = format!("/sys/devices/system/cpu/cpu{cpu}/topology");
            let socket_id = read_u32(&format!("{base}/physical_package_id")).map(|v| v as i32).unwrap_or(-1);
            let core_id = read_u32(&format!("{base}/core_id")).unwrap_or(cpu as u32);

            let entry = by_socket.entry(socket_id).or_insert_with(|| SocketInfo { socket_id, ..Default::default() });
            entry.logical_cpu_ids.push(cpu);
            if available.contains(&cpu) {
                entry.available_cpu_ids.push(cpu);
            }

            if physical_ids_seen.insert((socket_id, core_id), ()).is_none() {
                entry.physical_cores += 1;
            }

            let siblings = fs::read_to_string(format!("{base}/thread_siblings_list"))
                .ok()
                .map(|s| parse_cpu_list(s.trim()))
                .unwrap_or_else(|| vec![cpu]);
            if !entry.core_siblings.iter().any(|g| g == &siblings) {
                entry.core_siblings.push(siblings);
            }
        }

        for s in by_socket.values_mut() {
            s.logical_cores = s.logical_cpu_ids.len() as u32;
        }

        let sockets: Vec<SocketInfo> = by_socket.into_values().collect();
        let total_physical = sockets.iter().map(|s| s.physical_cores).sum();

        Topology {
            total_logical: all.len() as u32,
            total_physical,
            socket_count: sockets.len() as u32,
            all_cpu_ids: all,
            available_cpu_ids: available,
            sockets,
        }
    }

    /// Chooses `desired_threads` CPUs: single-socket-first, then
    /// physical-core-first within each chosen socket (one CPU per
    /// `core_siblings` group before reusing SMT siblings).
    pub fn select_cpus(topo: &Topology, desired_threads: usize) -> Vec<i32> {
        if desired_threads == 0 || topo.sockets.is_empty() {
            return topo.available_cpu_ids.clone();
        }

        let mut sockets: Vec<&SocketInfo> = topo.sockets.iter().collect();
        sockets.sort_by_key(|s| std::cmp::Reverse(s.available_cpu_ids.len()));

        if let Some(single) = sockets.iter().find(|s| s.available_cpu_ids.len() >= desired_threads) {
            return physical_first(single, desired_threads);
        }

        let mut chosen = Vec::with_capacity(desired_threads);
        for s in sockets {
            if chosen.len() >= desired_threads {
                break;
            }
            let need = desired_threads - chosen.len();
            chosen.extend(physical_first(s, need));
        }
        chosen
    }

    fn physical_first(socket: &SocketInfo, n: usize) -> Vec<i32> {
        let mut out = Vec::with_capacity(n);
        if socket.core_siblings.is_empty() {
            out.extend(socket.available_cpu_ids.iter().take(n));
            return out;
        }
        // Pass 1: one CPU per physical core.
        for group in &socket.core_siblings {
            if out.len() >= n {
                break;
            }
            if let Some(&cpu) = group.iter().find(|c| socket.available_cpu_ids.contains(c)) {
                out.push(cpu);
            }
        }
        // Pass 2: fill remaining with SMT siblings.
        'outer: for group in &socket.core_siblings {
            for &cpu in group {
                if out.len() >= n {
                    break 'outer;
                }
                if socket.available_cpu_ids.contains(&cpu) && !out.contains(&cpu) {
                    out.push(cpu);
                }
            }
        }
        out
    }

    fn set_affinity_for_tid(tid: i32, cpus: &[i32]) -> std::io::Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu as usize, &mut set);
            }
            if libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Applies `cpus` to every thread currently in this process, per
    /// `/proc/self/task`.
    pub fn apply_affinity_all_threads(cpus: &[i32]) -> Result<()> {
        if cpus.is_empty() {
            return Ok(());
        }
        let entries = fs::read_dir("/proc/self/task")
            .map_err(|e| Status::internal(format!("apply_affinity_all_threads: /proc/self/task: {e}")))?;
        let mut last_err = None;
        for entry in entries.flatten() {
            let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if let Err(e) = set_affinity_for_tid(tid, cpus) {
                last_err = Some(e);
            }
        }
        if let Some(e) = last_err {
            tracing::warn!("apply_affinity_all_threads: some threads could not be pinned: {e}");
        }
        Ok(())
    }

    const MPOL_DEFAULT: i32 = 0;
    const MPOL_PREFERRED: i32 = 1;
    const MPOL_BIND: i32 = 2;
    const MPOL_INTERLEAVE: i32 = 3;

    #[cfg(target_arch = "x86_64")]
    const SYS_SET_MEMPOLICY: i64 = 238;
    #[cfg(target_arch = "aarch64")]
    const SYS_SET_MEMPOLICY: i64 = 237;

    fn nodemask_for(nodes: &[i32]) -> Vec<u64> {
        let max_node = nodes.iter().copied().max().unwrap_or(0).max(0) as usize;
        let words = max_node / 64 + 1;
        let mut mask = vec![0u64; words];
        for &n in nodes {
            if n >= 0 {
                mask[(n as usize) / 64] |= 1u64 << ((n as usize) % 64);
            }
        }
        mask
    }

    fn node_of_cpu(cpu: i32) -> Option<i32> {
        let base = format!("/sys/devices/system/cpu/cpu{cpu}");
        for entry in fs::read_dir(format!("{base}/../../node")).ok()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(node) = rest.parse::<i32>() {
                    if entry.path().join(format!("cpu{cpu}")).exists() {
                        return Some(node);
                    }
                }
            }
        }
        None
    }

    /// Best-effort `set_mempolicy(2)` call; absence of libnuma support or an
    /// unsupported kernel is not a hard failure since the policy is advisory.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub fn apply_numa_policy(policy: &RuntimePolicy, cpus: &[i32]) -> Result<()> {
        if !policy.soft_mem_bind {
            return Ok(());
        }
        let nodes: Vec<i32> = {
            let mut v: Vec<i32> = cpus.iter().filter_map(|&c| node_of_cpu(c)).collect();
            v.sort_unstable();
            v.dedup();
            v
        };
        if nodes.is_empty() {
            return Ok(());
        }

        let (mode, target_nodes): (i32, Vec<i32>) = match policy.numa_mem_policy {
            NumaMemPolicy::Latency => (MPOL_PREFERRED, vec![nodes[0]]),
            NumaMemPolicy::Throughput => (MPOL_INTERLEAVE, nodes.clone()),
            NumaMemPolicy::Strict => (MPOL_BIND, nodes.clone()),
        };

        let mask = nodemask_for(&target_nodes);
        let ret = unsafe {
            libc::syscall(
                SYS_SET_MEMPOLICY,
                mode,
                mask.as_ptr(),
                (mask.len() * 64) as libc::c_ulong,
            )
        };
        if ret != 0 && policy.numa_mem_policy == NumaMemPolicy::Strict {
            return Err(Status::unsupported(format!(
                "apply_numa_policy: set_mempolicy failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if ret != 0 {
            tracing::warn!("apply_numa_policy: set_mempolicy failed (non-strict, ignoring): {}", std::io::Error::last_os_error());
            let _ = MPOL_DEFAULT;
        }
        Ok(())
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn apply_numa_policy(_policy: &RuntimePolicy, _cpus: &[i32]) -> Result<()> {
        Ok(())
    }

    fn cpus_allowed_list(tid: i32) -> Option<Vec<i32>> {
        let status = fs::read_to_string(format!("/proc/self/task/{tid}/status")).ok()?;
        let line = status.lines().find(|l| l.starts_with("Cpus_allowed_list:"))?;
        let list = line.split_once(':')?.1.trim();
        Some(parse_cpu_list(list))
    }

    pub fn verify_all_threads_affinity_subset(allowed: &[i32]) -> Result<()> {
        let entries = fs::read_dir("/proc/self/task")
            .map_err(|e| Status::internal(format!("verify_all_threads_affinity_subset: {e}")))?;
        for entry in entries.flatten() {
            let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            if let Some(cpus) = cpus_allowed_list(tid) {
                if !cpus.iter().all(|c| allowed.contains(c)) {
                    return Err(Status::internal(format!(
                        "verify_all_threads_affinity_subset: thread {tid} affinity {cpus:?} exceeds allowed {allowed:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn mems_allowed_list() -> Vec<i32> {
        let Ok(status) = fs::read_to_string("/proc/self/status") else {
            return Vec::new();
        };
        status
            .lines()
            .find(|l| l.starts_with("Mems_allowed_list:"))
            .and_then(|l| l.split_once(':'))
            .map(|(_, v)| parse_cpu_list(v.trim()))
            .unwrap_or_default()
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
    }

    #[cfg(target_arch = "x86_64")]
    const SYS_MOVE_PAGES: i64 = 279;
    #[cfg(target_arch = "aarch64")]
    const SYS_MOVE_PAGES: i64 = 239;

    /// Samples page residency of `[base, base+bytes)` via `move_pages(2)`
    /// with a null `nodes` array (query mode) and checks the fraction
    /// resident on `allowed_nodes` meets `min_ratio`.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub fn verify_buffer_pages_on_nodes(base: *const u8, bytes: usize, allowed_nodes: &[i32], min_ratio: f64) -> Result<()> {
        if bytes == 0 || allowed_nodes.is_empty() {
            return Ok(());
        }
        let psz = page_size();
        // spec.md §4.8: sample at most 4,096 pages rather than the whole
        // buffer.
        let npages = bytes.div_ceil(psz).min(4096);
        let mut addrs: Vec<*mut libc::c_void> = Vec::with_capacity(npages);
        for i in 0..npages {
            addrs.push(unsafe { base.add(i * psz) } as *mut libc::c_void);
        }
        let mut status = vec![0i32; npages];

        let ret = unsafe {
            libc::syscall(
                SYS_MOVE_PAGES,
                0,
                npages as libc::c_ulong,
                addrs.as_ptr(),
                std::ptr::null::<i32>(),
                status.as_mut_ptr(),
                0,
            )
        };
        if ret != 0 {
            return Err(Status::unsupported(format!(
                "verify_buffer_pages_on_nodes: move_pages query failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let on_allowed = status.iter().filter(|&&n| n >= 0 && allowed_nodes.contains(&n)).count();
        let ratio = on_allowed as f64 / npages as f64;
        if ratio + 1e-9 < min_ratio {
            return Err(Status::internal(format!(
                "verify_buffer_pages_on_nodes: only {ratio:.3} of pages on allowed nodes (need {min_ratio:.3})"
            )));
        }
        Ok(())
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn verify_buffer_pages_on_nodes(_base: *const u8, _bytes: usize, _allowed_nodes: &[i32], _min_ratio: f64) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub fn detect_topology() -> Topology {
    linux::detect_topology()
}

#[cfg(not(target_os = "linux"))]
pub fn detect_topology() -> Topology {
    let n = core_affinity::get_core_ids().map(|v| v.len()).unwrap_or(1).max(1) as u32;
    let ids: Vec<i32> = (0..n as i32).collect();
    Topology {
        total_logical: n,
        total_physical: n,
        socket_count: 1,
        all_cpu_ids: ids.clone(),
        available_cpu_ids: ids.clone(),
        sockets: vec![SocketInfo {
            socket_id: 0,
            logical_cores: n,
            physical_cores: n,
            logical_cpu_ids: ids.clone(),
            available_cpu_ids: ids,
            core_siblings: Vec::new(),
        }],
    }
}

/// Conservative upper bound on concurrent hardware threads this process
/// wants, per spec.md §4.8 "Desired concurrency": `max(intra, inter)` when
/// both exceed 1, else `intra + inter`, then the tile-parallel threads are
/// added on top either way.
pub fn desired_concurrency(policy: &RuntimePolicy) -> usize {
    let intra = policy.ort_intra_threads.max(0);
    let inter = policy.ort_inter_threads.max(0);
    let tile = policy.tile_omp_threads.max(0);
    let base = if intra > 1 && inter > 1 { intra.max(inter) } else { intra + inter };
    (base + tile).max(1) as usize
}

/// Process-wide placement entry point (spec.md §6's `apply_runtime_policy`).
/// Derives the desired concurrency from `policy`, refuses a configuration
/// that would oversubscribe the CPUs available to this process, then
/// applies CPU affinity and NUMA memory policy.
pub fn apply_runtime_policy(policy: &RuntimePolicy, verbose: bool) -> Result<()> {
    let desired = desired_concurrency(policy);
    let topo = detect_topology();
    let available = topo.available_cpu_ids.len();
    if desired > available {
        return Err(Status::invalid(format!(
            "apply_runtime_policy: desired concurrency {desired} exceeds {available} available CPUs"
        )));
    }
    if verbose {
        tracing::info!("apply_runtime_policy: pinning {desired} of {available} available CPUs");
    }
    apply_process_placement_policy(policy, desired)
}

/// Applies deterministic CPU placement for `desired_threads`, then a
/// best-effort NUMA memory policy. No-op (returns `Ok`) on non-Linux.
pub fn apply_process_placement_policy(runtime_policy: &RuntimePolicy, desired_threads: usize) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let topo = linux::detect_topology();
        let cpus = linux::select_cpus(&topo, desired_threads.max(1));
        linux::apply_affinity_all_threads(&cpus)?;
        linux::apply_numa_policy(runtime_policy, &cpus)?;
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (runtime_policy, desired_threads);
        Ok(())
    }
}

/// Diagnostic: verifies all current threads' affinity is a subset of
/// `allowed_cpus`. No-op on non-Linux.
pub fn verify_all_threads_affinity_subset(allowed_cpus: &[i32]) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::verify_all_threads_affinity_subset(allowed_cpus)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = allowed_cpus;
        Ok(())
    }
}

/// Diagnostic: verifies sampled pages of `[base, base+bytes)` reside on
/// `allowed_nodes`. No-op on non-Linux.
pub fn verify_buffer_pages_on_nodes(base: *const u8, bytes: usize, allowed_nodes: &[i32], min_ratio: f64) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::verify_buffer_pages_on_nodes(base, bytes, allowed_nodes, min_ratio)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (base, bytes, allowed_nodes, min_ratio);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_topology_reports_at_least_one_cpu() {
        let topo = detect_topology();
        assert!(topo.total_logical >= 1);
        assert!(!topo.available_cpu_ids.is_empty());
    }

    #[test]
    fn placement_policy_is_ok_for_single_thread() {
        let policy = RuntimePolicy::default();
        assert!(apply_process_placement_policy(&policy, 1).is_ok());
    }

    #[test]
    fn desired_concurrency_sums_intra_inter_when_not_both_parallel() {
        let mut policy = RuntimePolicy { ort_intra_threads: 1, ort_inter_threads: 1, tile_omp_threads: 2, ..RuntimePolicy::default() };
        assert_eq!(desired_concurrency(&policy), 4);
        policy.ort_intra_threads = 4;
        policy.ort_inter_threads = 1;
        assert_eq!(desired_concurrency(&policy), 7);
    }

    #[test]
    fn desired_concurrency_takes_max_when_both_parallel() {
        let policy = RuntimePolicy { ort_intra_threads: 4, ort_inter_threads: 2, tile_omp_threads: 3, ..RuntimePolicy::default() };
        assert_eq!(desired_concurrency(&policy), 4 + 3);
    }

    #[test]
    fn apply_runtime_policy_refuses_oversubscription() {
        let topo = detect_topology();
        let policy = RuntimePolicy { ort_intra_threads: (topo.available_cpu_ids.len() + 10) as i32, ort_inter_threads: 1, tile_omp_threads: 0, ..RuntimePolicy::default() };
        assert!(apply_runtime_policy(&policy, false).is_err());
    }

    #[test]
    fn apply_runtime_policy_ok_for_modest_request() {
        let policy = RuntimePolicy { ort_intra_threads: 1, ort_inter_threads: 1, tile_omp_threads: 0, ..RuntimePolicy::default() };
        assert!(apply_runtime_policy(&policy, false).is_ok());
    }

    #[test]
    fn affinity_subset_check_passes_for_full_allowed_set() {
        let topo = detect_topology();
        assert!(verify_all_threads_affinity_subset(&topo.available_cpu_ids).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_cpu_list_handles_ranges_and_singletons() {
        assert_eq!(linux::parse_cpu_list("0-2,4"), vec![0, 1, 2, 4]);
        assert_eq!(linux::parse_cpu_list(""), Vec::<i32>::new());
    }
}
