//! Network parameters and node configuration

use crate::constants::*;
use crate::types::{BlockHeader, HashId};
use crate::uint256::Uint256;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Base58 and bech32 prefixes for address encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPrefixes {
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub secret_key: u8,
    pub bech32_hrp: String,
}

/// Consensus and wire parameters of one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub name: String,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: Vec<String>,
    pub pow_limit: Uint256,
    pub pow_target_timespan: u64,
    pub pow_target_spacing: u64,
    pub allow_min_difficulty_blocks: bool,
    pub no_retargeting: bool,
    pub subsidy_halving_interval: u64,
    pub genesis: BlockHeader,
    pub prefixes: AddressPrefixes,
}

fn genesis_merkle_root() -> HashId {
    HashId([
        0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
        0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
    ])
}

fn genesis(timestamp: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block_hash: HashId::ZERO,
        merkle_root: genesis_merkle_root(),
        timestamp,
        bits,
        nonce,
    }
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        NetworkParams {
            name: "main".to_string(),
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            dns_seeds: vec![
                "seed.bitcoin.sipa.be".to_string(),
                "dnsseed.bluematt.me".to_string(),
                "dnsseed.bitcoin.dashjr.org".to_string(),
                "seed.bitcoinstats.com".to_string(),
                "seed.btc.petertodd.org".to_string(),
            ],
            pow_limit: Uint256::MAX >> 32,
            pow_target_timespan: TARGET_TIMESPAN,
            pow_target_spacing: TARGET_TIME_PER_BLOCK,
            allow_min_difficulty_blocks: false,
            no_retargeting: false,
            subsidy_halving_interval: HALVING_INTERVAL,
            genesis: genesis(1231006505, 0x1d00ffff, 2083236893),
            prefixes: AddressPrefixes {
                pubkey_hash: 0,
                script_hash: 5,
                secret_key: 128,
                bech32_hrp: "bc".to_string(),
            },
        }
    }

    pub fn testnet() -> Self {
        NetworkParams {
            name: "test".to_string(),
            magic: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            dns_seeds: vec![
                "testnet-seed.bitcoin.jonasschnelli.ch".to_string(),
                "seed.tbtc.petertodd.org".to_string(),
                "testnet-seed.bluematt.me".to_string(),
            ],
            allow_min_difficulty_blocks: true,
            genesis: genesis(1296688602, 0x1d00ffff, 414098458),
            prefixes: AddressPrefixes {
                pubkey_hash: 111,
                script_hash: 196,
                secret_key: 239,
                bech32_hrp: "tb".to_string(),
            },
            ..NetworkParams::mainnet()
        }
    }

    pub fn regtest() -> Self {
        NetworkParams {
            name: "regtest".to_string(),
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            dns_seeds: Vec::new(),
            pow_limit: Uint256::MAX >> 1,
            allow_min_difficulty_blocks: true,
            no_retargeting: true,
            subsidy_halving_interval: 150,
            genesis: genesis(1296688602, 0x207fffff, 2),
            prefixes: AddressPrefixes {
                pubkey_hash: 111,
                script_hash: 196,
                secret_key: 239,
                bech32_hrp: "bcrt".to_string(),
            },
            ..NetworkParams::mainnet()
        }
    }

    /// Look up a built-in network by name
    pub fn by_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "main" | "mainnet" | "bitcoin" => Ok(NetworkParams::mainnet()),
            "test" | "testnet" | "testnet3" => Ok(NetworkParams::testnet()),
            "regtest" => Ok(NetworkParams::regtest()),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }

    /// Blocks per retarget window
    pub fn difficulty_adjustment_interval(&self) -> u64 {
        (self.pow_target_timespan / self.pow_target_spacing.max(1)).max(1)
    }

    pub fn genesis_hash(&self) -> HashId {
        self.genesis.block_hash()
    }
}

/// Runtime configuration of the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: String,
    /// Listen address; the network's default port on all interfaces when unset
    pub listen: Option<String>,
    /// Address advertised to peers in version messages
    pub external_address: Option<String>,
    pub max_inbound: usize,
    pub max_outbound: usize,
    /// Static peers dialed in addition to DNS seed results
    pub connect: Vec<String>,
    pub use_dns_seeds: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Per-connection send and receive buffer, in messages
    pub peer_queue_capacity: usize,
    pub write_timeout_secs: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub user_agent: String,
    pub dial_retries: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: "main".to_string(),
            listen: None,
            external_address: None,
            max_inbound: 32,
            max_outbound: 8,
            connect: Vec::new(),
            use_dns_seeds: true,
            workers: 4,
            queue_capacity: 1024,
            peer_queue_capacity: PEER_QUEUE_CAPACITY,
            write_timeout_secs: WRITE_TIMEOUT_SECS,
            cache_capacity: 5000,
            cache_ttl_secs: 600,
            user_agent: format!("/consensus-node:{}/", env!("CARGO_PKG_VERSION")),
            dial_retries: DEFAULT_DIAL_RETRIES,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn params(&self) -> Result<NetworkParams, ConfigError> {
        NetworkParams::by_name(&self.network)
    }

    /// Resolved listen address
    pub fn listen_addr(&self, params: &NetworkParams) -> Result<SocketAddr, ConfigError> {
        let text = self
            .listen
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", params.default_port));
        text.parse().map_err(|_| ConfigError::InvalidAddress(text))
    }

    pub fn external_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match &self.external_address {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidAddress(text.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::check_proof_of_work;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            NetworkParams::mainnet().genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            NetworkParams::testnet().genesis_hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            NetworkParams::regtest().genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_genesis_meets_own_pow() {
        for params in [NetworkParams::mainnet(), NetworkParams::testnet(), NetworkParams::regtest()] {
            let g = params.genesis;
            assert!(check_proof_of_work(&g.block_hash(), g.bits, &params.pow_limit), "{}", params.name);
        }
    }

    #[test]
    fn test_pow_limit_compact() {
        assert_eq!(NetworkParams::mainnet().pow_limit.compact(false), 0x1d00ffff);
        assert_eq!(NetworkParams::regtest().pow_limit.compact(false), 0x207fffff);
        assert_eq!(NetworkParams::mainnet().difficulty_adjustment_interval(), 2016);
    }

    #[test]
    fn test_by_name() {
        assert_eq!(NetworkParams::by_name("testnet").unwrap().default_port, 18333);
        assert!(matches!(NetworkParams::by_name("nope"), Err(ConfigError::UnknownNetwork(_))));
    }

    #[test]
    fn test_params_serde_round_trip() {
        let params = NetworkParams::regtest();
        let json = serde_json::to_string(&params).unwrap();
        let back: NetworkParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_node_config_partial_json() {
        let cfg = NodeConfig::from_json(r#"{"network": "regtest", "workers": 2, "connect": ["127.0.0.1:18444"]}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.max_outbound, NodeConfig::default().max_outbound);
        let params = cfg.params().unwrap();
        assert_eq!(cfg.listen_addr(&params).unwrap().port(), 18444);
        assert_eq!(cfg.external_addr().unwrap(), None);
    }
}
