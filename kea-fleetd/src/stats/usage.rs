//! Subnet utilization and fleet-wide counter sums.

use std::collections::BTreeMap;
use num_bigint::BigUint;
use shared::protocol::{
    STAT_ASSIGNED_ADDRESSES, STAT_ASSIGNED_NAS, STAT_ASSIGNED_PDS, STAT_OOP_ADDRESSES,
    STAT_OOP_NAS, STAT_OOP_PDS, STAT_TOTAL_ADDRESSES, STAT_TOTAL_NAS, STAT_TOTAL_PDS,
};
use shared::types::Subnet;

/// Counters of a subnet as seen across its local subnets. HA partners
/// report the same leases, so the first local subnet (by daemon id)
/// carrying a counter provides it.
pub fn merged_counters(subnet: &Subnet) -> BTreeMap<String, u64> {
    let mut locals: Vec<_> = subnet.local_subnets.iter().collect();
    locals.sort_by_key(|ls| ls.daemon_id);

    let mut merged = BTreeMap::new();
    for local in locals {
        let Some(stats) = &local.stats else { continue };
        for (name, value) in stats {
            merged.entry(name.clone()).or_insert(*value);
        }
    }
    merged
}

/// Reservations outside the pools, same across HA partners.
pub fn out_of_pool(subnet: &Subnet) -> (u64, u64) {
    let addresses = subnet.local_subnets.iter().map(|ls| ls.out_of_pool_addresses).max().unwrap_or(0);
    let prefixes = subnet.local_subnets.iter().map(|ls| ls.out_of_pool_prefixes).max().unwrap_or(0);
    (addresses, prefixes)
}

/// `assigned / total` in per-mille, truncated. Zero when nothing can be
/// assigned.
pub fn per_mille(assigned: u64, total: u128) -> i32 {
    if total == 0 {
        return 0;
    }
    (1000.0 * assigned as f64 / total as f64) as i32
}

/// Address and prefix delegation utilization of a subnet, in per-mille.
/// Out-of-pool reservations add to the capacity Kea reports.
pub fn subnet_utilization(subnet: &Subnet) -> (i32, i32) {
    let counters = merged_counters(subnet);
    let get = |name: &str| counters.get(name).copied().unwrap_or(0);
    let (oop_addresses, oop_prefixes) = out_of_pool(subnet);

    if subnet.is_ipv6() {
        let addr = per_mille(get(STAT_ASSIGNED_NAS), get(STAT_TOTAL_NAS) as u128 + oop_addresses as u128);
        let pd = per_mille(get(STAT_ASSIGNED_PDS), get(STAT_TOTAL_PDS) as u128 + oop_prefixes as u128);
        (addr, pd)
    } else {
        let addr = per_mille(
            get(STAT_ASSIGNED_ADDRESSES),
            get(STAT_TOTAL_ADDRESSES) as u128 + oop_addresses as u128,
        );
        (addr, 0)
    }
}

/// Distinct global (subnet-less) reservations across the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalReservations {
    pub v4_addresses: u64,
    pub v6_addresses: u64,
    pub prefixes: u64,
}

/// Sums the merged counters of every subnet, plus the out-of-pool
/// totals. A subnet served by HA partners counts once. Sums can exceed
/// 64 bits.
pub fn global_counters(subnets: &[Subnet], global: GlobalReservations) -> BTreeMap<String, BigUint> {
    let mut sums: BTreeMap<String, BigUint> = BTreeMap::new();
    let mut oop_addresses = BigUint::from(global.v4_addresses);
    let mut oop_nas = BigUint::from(global.v6_addresses);
    let mut oop_pds = BigUint::from(global.prefixes);

    for subnet in subnets {
        for (name, value) in merged_counters(subnet) {
            *sums.entry(name).or_default() += value;
        }
        let (addresses, prefixes) = out_of_pool(subnet);
        if subnet.is_ipv6() {
            oop_nas += addresses;
            oop_pds += prefixes;
        } else {
            oop_addresses += addresses;
        }
    }

    sums.insert(STAT_OOP_ADDRESSES.to_string(), oop_addresses);
    sums.insert(STAT_OOP_NAS.to_string(), oop_nas);
    sums.insert(STAT_OOP_PDS.to_string(), oop_pds);
    sums
}
