//! P2P message payloads
//!
//! Typed payloads for every command the node speaks, the `NetworkMessage`
//! sum type, and the command registry used to decode a framed message.

use crate::constants::*;
use crate::encode::{deserialize, CodecError, Decodable, Encodable, Reader, Writer};
use crate::hashes::sha256;
use crate::merkle::PartialMerkleTree;
use crate::message::RawMessage;
use crate::types::*;
use siphasher::sip::SipHasher24;
use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;

// ============================================================================
// Inventory
// ============================================================================

pub const MSG_ERROR: u32 = 0;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;
pub const MSG_WITNESS_FLAG: u32 = 1 << 30;
pub const MSG_WITNESS_TX: u32 = MSG_TX | MSG_WITNESS_FLAG;
pub const MSG_WITNESS_BLOCK: u32 = MSG_BLOCK | MSG_WITNESS_FLAG;

/// Inventory vector identifying objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: HashId,
}

impl InventoryVector {
    pub fn tx(hash: HashId) -> Self {
        InventoryVector { inv_type: MSG_TX, hash }
    }

    pub fn block(hash: HashId) -> Self {
        InventoryVector { inv_type: MSG_BLOCK, hash }
    }

    /// Type with the witness flag cleared
    pub fn base_type(&self) -> u32 {
        self.inv_type & !MSG_WITNESS_FLAG
    }

    pub fn is_tx(&self) -> bool {
        self.base_type() == MSG_TX
    }

    pub fn is_block(&self) -> bool {
        matches!(self.base_type(), MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_CMPCT_BLOCK)
    }
}

impl Encodable for InventoryVector {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.inv_type);
        w.write_hash(&self.hash);
    }
}

impl Decodable for InventoryVector {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(InventoryVector { inv_type: r.read_u32()?, hash: r.read_hash()? })
    }
}

/// Read a CompactSize count and reject it above `limit`
fn read_bounded_count(r: &mut Reader<'_>, limit: usize) -> Result<usize, CodecError> {
    let count = r.read_length()?;
    if count > limit {
        return Err(CodecError::OversizedLength(count as u64));
    }
    Ok(count)
}

fn read_inventory(r: &mut Reader<'_>) -> Result<Vec<InventoryVector>, CodecError> {
    let count = read_bounded_count(r, MAX_INV_SIZE)?;
    r.read_vec(count)
}

// ============================================================================
// Addresses
// ============================================================================

/// Network address without timestamp, as carried in `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub services: u64,
    /// IPv6, or IPv4-mapped IPv6
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(addr: &SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetworkAddress { services, ip, port: addr.port() }
    }

    pub fn unroutable() -> Self {
        NetworkAddress { services: 0, ip: [0; 16], port: 0 }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Encodable for NetworkAddress {
    fn encode(&self, w: &mut Writer) {
        w.write_u64(self.services);
        w.write_bytes(&self.ip);
        // Port is big endian on the wire
        w.write_u16_be(self.port);
    }
}

impl Decodable for NetworkAddress {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(NetworkAddress { services: r.read_u64()?, ip: r.read_array()?, port: r.read_u16_be()? })
    }
}

/// Address entry of an `addr` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedAddress {
    pub time: u32,
    pub address: NetworkAddress,
}

impl Encodable for TimedAddress {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.time);
        self.address.encode(w);
    }
}

impl Decodable for TimedAddress {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TimedAddress { time: r.read_u32()?, address: NetworkAddress::decode(r)? })
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Version message for initial handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_i32(self.version);
        w.write_u64(self.services);
        w.write_i64(self.timestamp);
        self.addr_recv.encode(w);
        self.addr_from.encode(w);
        w.write_u64(self.nonce);
        w.write_var_str(&self.user_agent);
        w.write_i32(self.start_height);
        if self.version >= RELAY_FLAG_VERSION {
            w.write_bool(self.relay);
        }
    }
}

impl Decodable for VersionMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let services = r.read_u64()?;
        let timestamp = r.read_i64()?;
        let addr_recv = NetworkAddress::decode(r)?;
        let addr_from = NetworkAddress::decode(r)?;
        let nonce = r.read_u64()?;
        let user_agent = r.read_var_str()?;
        let start_height = r.read_i32()?;
        // Relay flag is optional; absent means relay
        let relay = if r.is_empty() { true } else { r.read_bool()? };
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// getheaders / getblocks request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub block_locator_hashes: Vec<HashId>,
    pub hash_stop: HashId,
}

impl Encodable for GetHeadersMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.version);
        w.write_list(&self.block_locator_hashes);
        w.write_hash(&self.hash_stop);
    }
}

impl Decodable for GetHeadersMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_u32()?;
        let count = read_bounded_count(r, MAX_LOCATOR_SIZE)?;
        let block_locator_hashes = r.read_vec(count)?;
        Ok(GetHeadersMessage { version, block_locator_hashes, hash_stop: r.read_hash()? })
    }
}

/// Headers, each followed by a zero transaction count
fn encode_headers(headers: &[BlockHeader], w: &mut Writer) {
    w.write_compact_size(headers.len() as u64);
    for header in headers {
        header.encode(w);
        w.write_compact_size(0);
    }
}

fn decode_headers(r: &mut Reader<'_>) -> Result<Vec<BlockHeader>, CodecError> {
    let count = read_bounded_count(r, MAX_HEADERS_RESULTS)?;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::decode(r)?);
        if r.read_compact_size()? != 0 {
            return Err(CodecError::Invalid("headers entry carries transactions".to_string()));
        }
    }
    Ok(headers)
}

/// Reject message describing why a message was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the rejected block or transaction, when given
    pub data: Option<HashId>,
}

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;

impl Encodable for RejectMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_var_str(&self.message);
        w.write_u8(self.code);
        w.write_var_str(&self.reason);
        if let Some(hash) = &self.data {
            w.write_hash(hash);
        }
    }
}

impl Decodable for RejectMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let message = r.read_var_str()?;
        let code = r.read_u8()?;
        let reason = r.read_var_str()?;
        let data = if r.remaining() >= 32 { Some(r.read_hash()?) } else { None };
        Ok(RejectMessage { message, code, reason, data })
    }
}

/// sendcmpct: compact block announcement preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpctMessage {
    pub announce: bool,
    pub version: u64,
}

/// 6-byte compact block short transaction id
pub type ShortId = [u8; 6];

/// Transaction sent in full inside a compact block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefilledTransaction {
    /// Absolute position in the block
    pub index: u64,
    pub tx: Transaction,
}

/// cmpctblock (BIP152)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlockMessage {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<ShortId>,
    pub prefilled: Vec<PrefilledTransaction>,
}

impl Encodable for CompactBlockMessage {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.write_u64(self.nonce);
        w.write_compact_size(self.short_ids.len() as u64);
        for id in &self.short_ids {
            w.write_bytes(id);
        }
        // Indexes are differentially encoded
        w.write_compact_size(self.prefilled.len() as u64);
        let mut next = 0u64;
        for p in &self.prefilled {
            w.write_compact_size(p.index - next);
            p.tx.encode(w);
            next = p.index + 1;
        }
    }
}

impl Decodable for CompactBlockMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let nonce = r.read_u64()?;
        let count = r.read_length()?;
        let mut short_ids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            short_ids.push(r.read_array()?);
        }
        let count = r.read_length()?;
        let mut prefilled = Vec::with_capacity(count.min(1024));
        let mut next = 0u64;
        for _ in 0..count {
            let index = next
                .checked_add(r.read_compact_size()?)
                .filter(|i| *i <= u16::MAX as u64)
                .ok_or_else(|| CodecError::Invalid("prefilled index overflow".to_string()))?;
            prefilled.push(PrefilledTransaction { index, tx: Transaction::decode(r)? });
            next = index + 1;
        }
        Ok(CompactBlockMessage { header, nonce, short_ids, prefilled })
    }
}

/// getblocktxn: request transactions of a compact block by position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockTxnMessage {
    pub block_hash: HashId,
    pub indexes: Vec<u64>,
}

impl Encodable for GetBlockTxnMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_hash(&self.block_hash);
        w.write_compact_size(self.indexes.len() as u64);
        let mut next = 0u64;
        for index in &self.indexes {
            w.write_compact_size(index - next);
            next = index + 1;
        }
    }
}

impl Decodable for GetBlockTxnMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let block_hash = r.read_hash()?;
        let count = r.read_length()?;
        let mut indexes = Vec::with_capacity(count.min(1024));
        let mut next = 0u64;
        for _ in 0..count {
            let index = next
                .checked_add(r.read_compact_size()?)
                .filter(|i| *i <= u16::MAX as u64)
                .ok_or_else(|| CodecError::Invalid("blocktxn index overflow".to_string()))?;
            indexes.push(index);
            next = index + 1;
        }
        Ok(GetBlockTxnMessage { block_hash, indexes })
    }
}

/// blocktxn: transactions answering a getblocktxn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTxnMessage {
    pub block_hash: HashId,
    pub transactions: Vec<Transaction>,
}

/// merkleblock: header plus partial merkle tree of matched transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub tree: PartialMerkleTree,
}

/// BIP152 SipHash keys for a compact block
pub fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut data = header.to_bytes().to_vec();
    data.extend_from_slice(&nonce.to_le_bytes());
    let digest = sha256(&data);
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&digest[0..8]);
    k1.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

/// ShortId: lower 6 bytes of SipHash-2-4 over the (w)txid
pub fn short_id(keys: (u64, u64), txid: &HashId) -> ShortId {
    let mut hasher = SipHasher24::new_with_keys(keys.0, keys.1);
    hasher.write(txid.as_bytes());
    let full = hasher.finish().to_le_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&full[..6]);
    out
}

// ============================================================================
// Messages
// ============================================================================

/// Every message the node sends or understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimedAddress>),
    GetAddr,
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    NotFound(Vec<InventoryVector>),
    GetHeaders(GetHeadersMessage),
    GetBlocks(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Reject(RejectMessage),
    SendHeaders,
    FeeFilter(i64),
    SendCmpct(SendCmpctMessage),
    CmpctBlock(CompactBlockMessage),
    GetBlockTxn(GetBlockTxnMessage),
    BlockTxn(BlockTxnMessage),
    MerkleBlock(MerkleBlockMessage),
    MemPool,
}

impl NetworkMessage {
    /// Wire command name
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::VerAck => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::FeeFilter(_) => "feefilter",
            NetworkMessage::SendCmpct(_) => "sendcmpct",
            NetworkMessage::CmpctBlock(_) => "cmpctblock",
            NetworkMessage::GetBlockTxn(_) => "getblocktxn",
            NetworkMessage::BlockTxn(_) => "blocktxn",
            NetworkMessage::MerkleBlock(_) => "merkleblock",
            NetworkMessage::MemPool => "mempool",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            NetworkMessage::Version(v) => v.encode(&mut w),
            NetworkMessage::VerAck
            | NetworkMessage::GetAddr
            | NetworkMessage::SendHeaders
            | NetworkMessage::MemPool => {}
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => w.write_u64(*nonce),
            NetworkMessage::Addr(addrs) => w.write_list(addrs),
            NetworkMessage::Inv(inv) | NetworkMessage::GetData(inv) | NetworkMessage::NotFound(inv) => {
                w.write_list(inv)
            }
            NetworkMessage::GetHeaders(m) | NetworkMessage::GetBlocks(m) => m.encode(&mut w),
            NetworkMessage::Headers(headers) => encode_headers(headers, &mut w),
            NetworkMessage::Block(block) => block.encode(&mut w),
            NetworkMessage::Tx(tx) => tx.encode(&mut w),
            NetworkMessage::Reject(m) => m.encode(&mut w),
            NetworkMessage::FeeFilter(rate) => w.write_i64(*rate),
            NetworkMessage::SendCmpct(m) => {
                w.write_bool(m.announce);
                w.write_u64(m.version);
            }
            NetworkMessage::CmpctBlock(m) => m.encode(&mut w),
            NetworkMessage::GetBlockTxn(m) => m.encode(&mut w),
            NetworkMessage::BlockTxn(m) => {
                w.write_hash(&m.block_hash);
                w.write_list(&m.transactions);
            }
            NetworkMessage::MerkleBlock(m) => {
                m.header.encode(&mut w);
                m.tree.encode(&mut w);
            }
        }
        w.into_inner()
    }

    pub fn to_raw(&self) -> RawMessage {
        RawMessage::new(self.command(), self.encode_payload())
    }

    /// Decode a framed message through the command registry
    pub fn from_raw(raw: &RawMessage) -> Result<Self, CodecError> {
        let decoder = registry()
            .get(raw.command.as_str())
            .ok_or_else(|| CodecError::UnknownCommand(raw.command.clone()))?;
        decoder(&raw.payload)
    }

    /// Messages consumed by the connection itself rather than the workers
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NetworkMessage::Version(_)
                | NetworkMessage::VerAck
                | NetworkMessage::Ping(_)
                | NetworkMessage::Pong(_)
                | NetworkMessage::GetAddr
                | NetworkMessage::SendHeaders
                | NetworkMessage::FeeFilter(_)
                | NetworkMessage::SendCmpct(_)
                | NetworkMessage::Reject(_)
        )
    }
}

type PayloadDecoder = fn(&[u8]) -> Result<NetworkMessage, CodecError>;

fn empty(payload: &[u8], message: NetworkMessage) -> Result<NetworkMessage, CodecError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(CodecError::TrailingBytes(payload.len()))
    }
}

/// Decode `payload` with `f`, requiring every byte to be consumed
fn full<T>(payload: &[u8], f: impl FnOnce(&mut Reader<'_>) -> Result<T, CodecError>) -> Result<T, CodecError> {
    let mut r = Reader::new(payload);
    let value = f(&mut r)?;
    r.finish()?;
    Ok(value)
}

/// Command name → payload decoder
pub fn registry() -> &'static HashMap<&'static str, PayloadDecoder> {
    static REGISTRY: OnceLock<HashMap<&'static str, PayloadDecoder>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<&'static str, PayloadDecoder> = HashMap::new();
        m.insert("version", |p| Ok(NetworkMessage::Version(deserialize(p)?)));
        m.insert("verack", |p| empty(p, NetworkMessage::VerAck));
        m.insert("ping", |p| Ok(NetworkMessage::Ping(deserialize(p)?)));
        m.insert("pong", |p| Ok(NetworkMessage::Pong(deserialize(p)?)));
        m.insert("addr", |p| {
            full(p, |r| {
                let count = read_bounded_count(r, MAX_ADDR_SIZE)?;
                Ok(NetworkMessage::Addr(r.read_vec(count)?))
            })
        });
        m.insert("getaddr", |p| empty(p, NetworkMessage::GetAddr));
        m.insert("inv", |p| full(p, |r| Ok(NetworkMessage::Inv(read_inventory(r)?))));
        m.insert("getdata", |p| full(p, |r| Ok(NetworkMessage::GetData(read_inventory(r)?))));
        m.insert("notfound", |p| full(p, |r| Ok(NetworkMessage::NotFound(read_inventory(r)?))));
        m.insert("getheaders", |p| Ok(NetworkMessage::GetHeaders(deserialize(p)?)));
        m.insert("getblocks", |p| Ok(NetworkMessage::GetBlocks(deserialize(p)?)));
        m.insert("headers", |p| full(p, |r| Ok(NetworkMessage::Headers(decode_headers(r)?))));
        m.insert("block", |p| Ok(NetworkMessage::Block(deserialize(p)?)));
        m.insert("tx", |p| Ok(NetworkMessage::Tx(deserialize(p)?)));
        m.insert("reject", |p| Ok(NetworkMessage::Reject(deserialize(p)?)));
        m.insert("sendheaders", |p| empty(p, NetworkMessage::SendHeaders));
        m.insert("feefilter", |p| Ok(NetworkMessage::FeeFilter(deserialize(p)?)));
        m.insert("sendcmpct", |p| {
            full(p, |r| {
                let announce = r.read_bool()?;
                let version = r.read_u64()?;
                Ok(NetworkMessage::SendCmpct(SendCmpctMessage { announce, version }))
            })
        });
        m.insert("cmpctblock", |p| Ok(NetworkMessage::CmpctBlock(deserialize(p)?)));
        m.insert("getblocktxn", |p| Ok(NetworkMessage::GetBlockTxn(deserialize(p)?)));
        m.insert("blocktxn", |p| {
            full(p, |r| {
                let block_hash = r.read_hash()?;
                let transactions = Vec::decode(r)?;
                Ok(NetworkMessage::BlockTxn(BlockTxnMessage { block_hash, transactions }))
            })
        });
        m.insert("merkleblock", |p| {
            full(p, |r| {
                let header = BlockHeader::decode(r)?;
                let tree = PartialMerkleTree::decode(r)?;
                Ok(NetworkMessage::MerkleBlock(MerkleBlockMessage { header, tree }))
            })
        });
        m.insert("mempool", |p| empty(p, NetworkMessage::MemPool));
        m
    })
}
