//! Consensus, script and network constants

/// Satoshis per coin
pub const COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Number of halvings after which the subsidy is zero
pub const MAX_HALVINGS: u64 = 64;

/// Difficulty adjustment interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Target time per block: 10 minutes
pub const TARGET_TIME_PER_BLOCK: u64 = 600;

/// Target timespan of one retarget window: two weeks
pub const TARGET_TIMESPAN: u64 = DIFFICULTY_ADJUSTMENT_INTERVAL * TARGET_TIME_PER_BLOCK;

/// Number of blocks considered for median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum seconds a block timestamp may run ahead of local time
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Coinbase input script length bounds (inclusive)
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum block weight
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Witness scale factor for weight computation
pub const WITNESS_SCALE_FACTOR: usize = 4;

// ============================================================================
// Script limits
// ============================================================================

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum combined size of main and alt stacks during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum public keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Maximum byte length of a numeric stack operand
pub const MAX_SCRIPT_NUM_SIZE: usize = 4;

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: i32 = 70015;

/// Oldest protocol version a peer may announce
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;

/// Version from which the relay flag is part of the version payload
pub const RELAY_FLAG_VERSION: i32 = 70001;

/// Services bit: full node serving blocks
pub const NODE_NETWORK: u64 = 1;

/// Services bit: node serving witness data
pub const NODE_WITNESS: u64 = 1 << 3;

/// Message header size: magic + command + length + checksum
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field
pub const COMMAND_SIZE: usize = 12;

/// Maximum payload accepted from the wire (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 0x0200_0000;

/// Upper bound on any CompactSize-declared length or count
pub const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

/// Maximum inventory entries per inv/getdata/notfound message
pub const MAX_INV_SIZE: usize = 50_000;

/// Maximum headers in a headers message
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Maximum addresses in an addr message
pub const MAX_ADDR_SIZE: usize = 1000;

/// Maximum locator hashes in getheaders/getblocks
pub const MAX_LOCATOR_SIZE: usize = 101;

// ============================================================================
// Connection timing
// ============================================================================

/// Seconds a connection may stay unacknowledged before being closed
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Seconds between keep-alive pings
pub const PING_INTERVAL_SECS: u64 = 60;

/// Milliseconds between connection housekeeping ticks
pub const LOOP_TICK_MILLIS: u64 = 1000;

/// Seconds a single socket write may block before the connection is dropped
pub const WRITE_TIMEOUT_SECS: u64 = 20;

/// Messages buffered per connection in each direction
pub const PEER_QUEUE_CAPACITY: usize = 1000;

/// Consecutive work-queue drops tolerated from one peer
pub const MAX_DISPATCH_DROPS: u32 = 64;

/// Dial attempts before an outbound connection is given up
pub const DEFAULT_DIAL_RETRIES: u32 = 3;
