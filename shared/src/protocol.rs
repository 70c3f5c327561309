/// mDNS meta-query used to enumerate every advertised service type
pub const META_QUERY_TYPE: &str = "_services._dns-sd._udp.local.";

/// Suffix mDNS appends to link-local host and type names
pub const MDNS_LOCAL_SUFFIX: &str = ".local.";

/// TXT value published when a service carries no metadata.
/// Update servers reject empty TXT RDATA.
pub const EMPTY_TXT: &str = "\0";

/// Hostname wildcard accepted in static service names
pub const HOSTNAME_WILDCARD: &str = "%h";

/// EDNS0 option code of the DNS Update Lease option
pub const UPDATE_LEASE_OPTION: u16 = 2;

/// Defaults for published records
pub const DEFAULT_TTL: u32 = 7200;
pub const DEFAULT_SRV_PRIORITY: u16 = 1;
pub const DEFAULT_SRV_WEIGHT: u16 = 5;
pub const DEFAULT_DNS_PORT: u16 = 53;
