/// Name of the Kea Control Agent daemon.
pub const DAEMON_CA: &str = "ca";
pub const DAEMON_DHCP4: &str = "dhcp4";
pub const DAEMON_DHCP6: &str = "dhcp6";
pub const DAEMON_D2: &str = "d2";

/// Control commands issued to the monitored daemons
pub const CMD_VERSION_GET: &str = "version-get";
pub const CMD_STATUS_GET: &str = "status-get";
pub const CMD_CONFIG_GET: &str = "config-get";
pub const CMD_STAT_LEASE4_GET: &str = "stat-lease4-get";
pub const CMD_STAT_LEASE6_GET: &str = "stat-lease6-get";
pub const CMD_STATISTIC_GET: &str = "statistic-get";

/// Packet counters sampled for RPS
pub const RPS_COUNTER_DHCP4: &str = "pkt4-ack-sent";
pub const RPS_COUNTER_DHCP6: &str = "pkt6-reply-sent";

/// Kea result codes
pub const RESULT_SUCCESS: i64 = 0;
pub const RESULT_EMPTY: i64 = 3;

/// Hook libraries, matched by file name fragment
pub const HOOK_STAT_CMDS: &str = "libdhcp_stat_cmds";
pub const HOOK_HA: &str = "libdhcp_ha";

/// Canonical lease counter names
pub const STAT_TOTAL_ADDRESSES: &str = "total-addresses";
pub const STAT_ASSIGNED_ADDRESSES: &str = "assigned-addresses";
pub const STAT_DECLINED_ADDRESSES: &str = "declined-addresses";
pub const STAT_TOTAL_NAS: &str = "total-nas";
pub const STAT_ASSIGNED_NAS: &str = "assigned-nas";
pub const STAT_DECLINED_NAS: &str = "declined-nas";
pub const STAT_TOTAL_PDS: &str = "total-pds";
pub const STAT_ASSIGNED_PDS: &str = "assigned-pds";

/// Global counters holding out-of-pool reservation corrections
pub const STAT_OOP_ADDRESSES: &str = "total-out-of-pool-addresses";
pub const STAT_OOP_NAS: &str = "total-out-of-pool-nas";
pub const STAT_OOP_PDS: &str = "total-out-of-pool-pds";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Returns true for daemons that answer status-get and serve leases.
pub fn is_dhcp_daemon(name: &str) -> bool {
    name == DAEMON_DHCP4 || name == DAEMON_DHCP6
}
