//! System-wide limits and well-known identifiers.

/// Maximum size of a message payload, in bytes.
pub const MAX_DATA_SIZE: usize = 15_000;

/// Maximum number of demands a processing module may declare.
pub const MAX_DEMANDS: usize = 10;

/// Maximum size of a `source_stream` string, in bytes.
pub const MAX_LINE_SIZE: usize = 300;

/// Polling backoff when no message is pending on any channel.
pub const SLEEP_TIME: std::time::Duration = std::time::Duration::from_micros(20);

/// Total credit budget a consumer advertises across all instances of one producer.
pub const SHARED_CREDIT: i64 = 100;

/// Sentinel `instances` value meaning "one instance per eligible host".
pub const PROCESSING_MODULE_AUTOMATIC_NUMBER_INSTANCES: i64 = -1;

/// Matches any sender rank in a probe/receive.
pub const COMM_ANY_SOURCE: i32 = -1;

/// Rank of the root process within a group.
pub const COMM_ROOT_PROCESS: i32 = 0;

pub const FILE_LOCK: &str = "watershed.lock";
pub const FILE_INFO: &str = "watershed.info";
pub const FILE_LOG: &str = "watershed.log";

pub const POLICY_BROADCAST: &str = "broadcast";
pub const POLICY_ROUND_ROBIN: &str = "round_robin";
pub const POLICY_LABELED: &str = "labeled";

/// How long admission waits for a spawned instance to dial back into the
/// module-accepting port before treating the spawn as failed.
pub const ADMISSION_ACCEPT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How long admission waits, after every instance has dialed back in, for
/// each one to report its listening port (or an init failure) before giving
/// up on the module as a whole.
pub const ADMISSION_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How long a runtime waits for peer runtimes to answer a cluster-wide query
/// (running-module check, ports discovery forwarding) before proceeding with
/// whatever replies arrived.
pub const PEER_QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
