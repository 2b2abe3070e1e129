//! Signature verification against real mainnet spends, fixed vectors
//! and locally signed templates

use consensus_node::encode::deserialize;
use consensus_node::hashes::{hash160, sha256};
use consensus_node::script::{self, multisig_script, p2pkh_script, p2sh_script, p2wpkh_script, p2wsh_script};
use consensus_node::sighash::{legacy_sighash, witness_v0_sighash, SighashCache, SIGHASH_ALL};
use consensus_node::verify::{verify_tx, verify_tx_with};
use consensus_node::*;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;

const SPENDING_TX: &str = concat!(
    "020000000001031cfbc8f54fbfa4a33a30068841371f80dbfe166211242213188428f437445c91000000006a47304402",
    "206fbcec8d2d2e740d824d3d36cc345b37d9f65d665a99f5bd5c9e8d42270a03a8022013959632492332200c29084595",
    "47bf8dbf97c65ab1a28dec377d6f1d41d3d63e012103d7279dfb90ce17fe139ba60a7c41ddf605b25e1c07a4ddcb9dfe",
    "f4e7d6710f48feffffff476222484f5e35b3f0e43f65fc76e21d8be7818dd6a989c160b1e5039b7835fc000000001716",
    "00140914414d3c94af70ac7e25407b0689e0baa10c77feffffffa83d954a62568bbc99cc644c62eb7383d7c2a2563041",
    "a0aeb891a6a4055895570000000017160014795d04cc2d4f31480d9a3710993fbd80d04301dffeffffff06fef72f0000",
    "00000017a91476fd7035cd26f1a32a5ab979e056713aac25796887a5000f00000000001976a914b8332d502a529571c6",
    "af4be66399cd33379071c588ac3fda0500000000001976a914fc1d692f8de10ae33295f090bea5fe49527d975c88ac52",
    "2e1b00000000001976a914808406b54d1044c429ac54c0e189b0d8061667e088ac6eb68501000000001976a914dfab60",
    "85f3a8fb3e6710206a5a959313c5618f4d88acbba20000000000001976a914eb3026552d7e3f3073457d0bee5d4757de",
    "48160d88ac0002483045022100bee24b63212939d33d513e767bc79300051f7a0d433c3fcf1e0e3bf03b9eb1d7022058",
    "8dc45a9ce3a939103b4459ce47500b64e23ab118dfc03c9caa7d6bfc32b9c601210354fd80328da0f9ae6eef2b3a81f7",
    "4f9a6f66761fadf96f1d1d22b1fd6845876402483045022100e29c7e3a5efc10da6269e5fc20b6a1cb8beb92130cc52c",
    "67e46ef40aaa5cac5f0220644dd1b049727d991aece98a105563416e10a5ac4221abac7d16931842d5c322012103960b",
    "87412d6e169f30e12106bdf70122aabb9eb61f455518322a18b920a4dfa887d30700",
);

const SPENT_1: &str = concat!(
    "020000000001040aacd2c49f5f3c0968cfa8caf9d5761436d95385252e3abb4de8f5dcf8a582f20000000017160014bc",
    "adb2baea98af0d9a902e53a7e9adff43b191e9feffffff96cd3c93cac3db114aafe753122bd7d1afa5aa4155ae04b325",
    "6344ecca69d72001000000171600141d9984579ceb5c67ebfbfb47124f056662fe7adbfeffffffc878dd74d3a44072ea",
    "e6178bb94b9253177db1a5aaa6d068eb0e4db7631762e20000000017160014df2a48cdc53dae1aba7aa71cb1f9de089d",
    "75aac3feffffffe49f99275bc8363f5f593f4eec371c51f62c34ff11cc6d8d778787d340d6896c010000001716001422",
    "9b3b297a0587e03375ab4174ef56eeb0968735feffffff03360d0f00000000001976a9149f44b06f6ee92ddbc4686f71",
    "afe528c09727a5c788ac24281b00000000001976a9140277b4f68ff20307a2a9f9b4487a38b501eb955888ac227c0000",
    "000000001976a9148020cd422f55eef8747a9d418f5441030f7c9c7788ac0247304402204aa3bd9682f9a8e101505f63",
    "58aacd1749ecf53a62b8370b97d59243b3d6984f02200384ad449870b0e6e89c92505880411285ecd41cf11e7439b973",
    "f13bad97e53901210205b392ffcb83124b1c7ce6dd594688198ef600d34500a7f3552d67947bbe392802473044022033",
    "dfd8d190a4ae36b9f60999b217c775b96eb10dee3a1ff50fb6a75325719106022005872e4e36d194e49ced2ebcf8bb9d",
    "843d842e7b7e0eb042f4028396088d292f012103c9d7cbf369410b090480de2aa15c6c73d91b9ffa7d88b90724614b70",
    "be41e98e0247304402207d952de9e59e4684efed069797e3e2d993e9f98ec8a9ccd599de43005fe3f713022076d190cc",
    "93d9513fc061b1ba565afac574e02027c9efbfa1d7b71ab8dbb21e0501210313ad44bc030cc6cb111798c2bf3d213941",
    "8d751c1e79ec4e837ce360cc03b97a024730440220029e75edb5e9413eb98d684d62a077b17fa5b7cc19349c1e8cc6c4",
    "733b7b7452022048d4b9cae594f03741029ff841e35996ef233701c1ea9aa55c301362ea2e2f68012103590657108a72",
    "feb8dc1dec022cf6a230bb23dc7aaa52f4032384853b9f8388baf9d20700",
);

const SPENT_2: &str = concat!(
    "0200000000010166c3d39490dc827a2594c7b17b7d37445e1f4b372179649cd2ce4475e3641bbb0100000017160014e6",
    "9aa750e9bff1aca1e32e57328b641b611fc817fdffffff01e87c5d010000000017a914f3890da1b99e44cd3d52f7bcea",
    "6a1351658ea7be87024830450221009eb97597953dc288de30060ba02d4e91b2bde1af2ecf679c7f5ab5989549aa8002",
    "202a98f8c3bd1a5a31c0d72950dd6e2e3870c6c5819a6c3db740e91ebbbc5ef4800121023f3d3b8e74b807e32217dea2",
    "c75c8d0bd46b8665b3a2d9b3cb310959de52a09bc9d20700",
);

const SPENT_3: &str = concat!(
    "01000000027a1120a30cef95422638e8dab9dedf720ec614b1b21e451a4957a5969afb869d000000006a47304402200e",
    "cc318a829a6cad4aa9db152adbf09b0cd2de36f47b53f5dade3bc7ef086ca702205722cda7404edd6012eedd79b2d6f2",
    "4c0a0c657df1a442d0a2166614fb164a4701210372f4b97b34e9c408741cd1fc97bcc7ffdda6941213ccfde1cb4075c0",
    "f17aab06ffffffffc23b43e5a18e5a66087c0d5e64d58e8e21fcf83ce3f5e4f7ecb902b0e80a7fb6010000006b483045",
    "022100f10076a0ea4b4cf8816ed27a1065883efca230933bf2ff81d5db6258691ff75202206b001ef87624e76244377f",
    "57f0c84bc5127d0dd3f6e0ef28b276f176badb223a01210309a3a61776afd39de4ed29b622cd399d99ecd942909c36a8",
    "696cfd22fc5b5a1affffffff0200127a000000000017a914f895e1dd9b29cb228e9b06a15204e3b57feaf7cc8769311d",
    "09000000001976a9144d00da12aaa51849d2583ae64525d4a06cd70fde88ac00000000",
);

fn decode(text: &str) -> Transaction {
    deserialize(&hex::decode(text).unwrap()).unwrap()
}

fn spent_outputs() -> HashMap<HashId, Transaction> {
    [SPENT_1, SPENT_2, SPENT_3].iter().map(|text| {
        let tx = decode(text);
        (tx.txid(), tx)
    }).collect()
}

fn lookup(spent: &HashMap<HashId, Transaction>) -> impl FnMut(&OutPoint) -> Option<TransactionOutput> + '_ {
    move |point| spent.get(&point.hash)?.outputs.get(point.index as usize).cloned()
}

// ============================================================================
// MAINNET SPEND (P2PKH + 2 × P2SH-P2WPKH)
// ============================================================================

#[test]
fn test_mainnet_spend_verifies() {
    let spending = decode(SPENDING_TX);
    let spent = spent_outputs();
    verify_tx_with(&spending, lookup(&spent)).unwrap();
}

#[test]
fn test_mainnet_spend_templates_and_values() {
    let spending = decode(SPENDING_TX);
    let spent = spent_outputs();
    let prevouts: Vec<TransactionOutput> = spending.inputs.iter().map(|i| lookup(&spent)(&i.prevout).unwrap()).collect();
    assert_eq!(prevouts.iter().map(|o| o.value).collect::<Vec<_>>(), vec![986422, 22904040, 8000000]);

    let names: Vec<&str> = spending
        .inputs
        .iter()
        .zip(&prevouts)
        .map(|(input, prevout)| consensus_node::verify::classify(input, &prevout.script_pubkey).name())
        .collect();
    assert_eq!(names, vec!["p2pkh", "p2sh-p2wpkh", "p2sh-p2wpkh"]);
}

#[test]
fn test_mainnet_spend_mutated_legacy_signature_fails() {
    let mut spending = decode(SPENDING_TX);
    let spent = spent_outputs();
    // Inside r of the first input's DER signature
    spending.inputs[0].script_sig[10] ^= 0x01;
    let err = verify_tx_with(&spending, lookup(&spent)).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);
}

#[test]
fn test_mainnet_spend_mutated_witness_signature_fails() {
    let mut spending = decode(SPENDING_TX);
    let spent = spent_outputs();
    spending.inputs[1].witness[0][10] ^= 0x01;
    let err = verify_tx_with(&spending, lookup(&spent)).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 1, .. }), "{:?}", err);
}

#[test]
fn test_mainnet_spend_wrong_amount_fails_witness_input() {
    let spending = decode(SPENDING_TX);
    let spent = spent_outputs();
    let mut prevouts: Vec<TransactionOutput> = spending.inputs.iter().map(|i| lookup(&spent)(&i.prevout).unwrap()).collect();
    // BIP143 commits to the spent amount; the legacy input does not
    prevouts[2].value += 1;
    let err = verify_tx(&spending, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 2, .. }), "{:?}", err);
}

#[test]
fn test_mainnet_spend_missing_prevout() {
    let spending = decode(SPENDING_TX);
    let mut spent = spent_outputs();
    let first = spending.inputs[0].prevout.hash;
    spent.remove(&first);
    let err = verify_tx_with(&spending, lookup(&spent)).unwrap_err();
    assert!(matches!(err, ConsensusError::MissingPrevout(0)));
}

// ============================================================================
// FIXED VECTORS (BIP143 P2WPKH, BIP143 P2SH-P2WSH 6-of-6, P2SH 2-of-3)
// ============================================================================

const BIP143_P2WPKH_TX: &str = concat!(
    "01000000000102fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f000000004948304502",
    "21008b9d1dc26ba6a9cb62127b02742fa9d754cd3bebf337f7a55d114c8e5cdd30be022040529b194ba3f9281a99f2b1",
    "c0a19c0489bc22ede944ccf4ecbab4cc618ef3ed01eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287",
    "d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac",
    "7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac000247304402203609",
    "e17b84f6a7d30c80bfa610b5b4542f32a8a0d5447a12fb1366d7f01cc44a0220573a954c4518331561406f90300e8f33",
    "58f51928d43c212a8caed02de67eebee0121025476c2e83188368da1ff3e292e7acafcdb3566bb0ad253f62fc70f07ae",
    "ee635711000000",
);

const BIP143_P2SH_P2WSH_TX: &str = concat!(
    "0100000000010136641869ca081e70f394c6948e8af409e18b619df2ed74aa106c1ca29787b96e0100000023220020a1",
    "6b5755f7f6f96dbd65f5f0d6ab9418b89af4b1f14a1bb8a09062c35f0dcb54ffffffff0200e9a435000000001976a914",
    "389ffce9cd9ae88dcc0631e88a821ffdbe9bfe2688acc0832f05000000001976a9147480a33f950689af511e6e84c138",
    "dbbd3c3ee41588ac080047304402206ac44d672dac41f9b00e28f4df20c52eeb087207e8d758d76d92c6fab3b73e2b02",
    "20367750dbbe19290069cba53d096f44530e4f98acaa594810388cf7409a1870ce01473044022068c7946a43232757cb",
    "df9176f009a928e1cd9a1a8c212f15c1e11ac9f2925d9002205b75f937ff2f9f3c1246e547e54f62e027f64eefa26955",
    "78cc6432cdabce271502473044022059ebf56d98010a932cf8ecfec54c48e6139ed6adb0728c09cbe1e4fa0915302e02",
    "2007cd986c8fa870ff5d2b3a89139c9fe7e499259875357e20fcbb15571c76795403483045022100fbefd94bd0a488d5",
    "0b79102b5dad4ab6ced30c4069f1eaa69a4b5a763414067e02203156c6a5c9cf88f91265f5a942e96213afae16d83321",
    "c8b31bb342142a14d16381483045022100a5263ea0553ba89221984bd7f0b13613db16e7a70c549a86de0cc0444141a4",
    "07022005c360ef0ae5a5d4f9f2f87a56c1546cc8268cab08c73501d6b3be2e1e1a8a08824730440220525406a1482936",
    "d5a21888260dc165497a90a15669636d8edca6b9fe490d309c022032af0c646a34a44d1f4576bf6a4a74b67940f8faa8",
    "4c7df9abe12a01a11e2b4783cf56210307b8ae49ac90a048e9b53357a2354b3334e9c8bee813ecb98e99a7e07e8c3ba3",
    "2103b28f0c28bfab54554ae8c658ac5c3e0ce6e79ad336331f78c428dd43eea8449b21034b8113d703413d57761b8b97",
    "81957b8c0ac1dfe69f492580ca4195f50376ba4a21033400f6afecb833092a9a21cfdf1ed1376e58c5d1f47de7468312",
    "3987e967a8f42103a6d48b1131e94ba04d9737d61acdaa1322008af9602b3b14862c07a1789aac162102d8b661b0b330",
    "2ee2f162b09e07a55ad5dfbe673a9f01d9f0c19617681024306b56ae00000000",
);

const P2SH_MULTISIG_TX: &str = concat!(
    "010000000146a6abfc9a010d8942320717f8d4407d8b0f656458ae3ef3adbdbe5b31b9df4601000000fdfd0000473044",
    "022017bf6adbff51008cae88365fb8195ea7172bf91b8a870c4e4b5c1865d1c93dcc02200488ed9334b63fe9dea874e1",
    "e18617a0032747409fcd4f5a22679ecb8ce8559a01483045022100969b7b83b0eefbb6d9e4cca8bbdedd742b55da60d1",
    "7bb78c8c2ce1b38321f0e202201a769f26f2a831e933e7fb737c075886e7a9def304676f13ef1aeeb3d4c5b0e2014c69",
    "522103dca57f219ade8df31643ebdf869963805168283325348aa0fab2fd34c1a482df210320a3133883b1d1817f0c9e",
    "bea69c78628bb6f6038317b59664a2b2015809f1c721038129b23bde011db4977f5da1ef2a662450117a5434718accf8",
    "26fcb902c4cf7753aeffffffff0230244c00000000001976a9145b252c492484e1471da4f92cfa6d49ff1953521888ac",
    "8813000000000000160014e42dda6a93a1fac49810b3a2f29530fa6552e2c600000000",
);

fn output(value: Amount, script_hex: &str) -> TransactionOutput {
    TransactionOutput { value, script_pubkey: hex::decode(script_hex).unwrap() }
}

fn bip143_p2wpkh_prevouts() -> Vec<TransactionOutput> {
    vec![
        output(625_000_000, "2103c9f4836b9a4f77fc0d81f7bcb01b7f1b35916864b9476c241ce9fc198bd25432ac"),
        output(600_000_000, "00141d0f172a0ecb48aee1be1f2687d2963ae33f71a1"),
    ]
}

fn bip143_p2sh_p2wsh_prevouts() -> Vec<TransactionOutput> {
    vec![output(987_654_321, "a9149993a429037b5d912407a71c252019287b8d27a587")]
}

fn p2sh_multisig_prevouts() -> Vec<TransactionOutput> {
    vec![output(5_000_000, "a914496fd5f666798ece7dc62e80a18b6676ba09b49a87")]
}

fn template_names(tx: &Transaction, prevouts: &[TransactionOutput]) -> Vec<&'static str> {
    tx.inputs
        .iter()
        .zip(prevouts)
        .map(|(input, prevout)| consensus_node::verify::classify(input, &prevout.script_pubkey).name())
        .collect()
}

#[test]
fn test_bip143_p2wpkh_vector() {
    let tx = decode(BIP143_P2WPKH_TX);
    let prevouts = bip143_p2wpkh_prevouts();
    assert_eq!(tx.txid().to_string(), "e8151a2af31c368a35053ddd4bdb285a8595c769a3ad83e0fa02314a602d4609");
    assert_eq!(template_names(&tx, &prevouts), vec!["p2pk", "p2wpkh"]);
    verify_tx(&tx, &prevouts).unwrap();
}

#[test]
fn test_bip143_p2wpkh_vector_mutations_fail() {
    let prevouts = bip143_p2wpkh_prevouts();

    let mut tx = decode(BIP143_P2WPKH_TX);
    tx.inputs[0].script_sig[10] ^= 0x01;
    let err = verify_tx(&tx, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);

    let mut tx = decode(BIP143_P2WPKH_TX);
    tx.inputs[1].witness[0][10] ^= 0x01;
    let err = verify_tx(&tx, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 1, .. }), "{:?}", err);

    let tx = decode(BIP143_P2WPKH_TX);
    let mut wrong_amount = prevouts.clone();
    wrong_amount[1].value += 1;
    let err = verify_tx(&tx, &wrong_amount).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 1, .. }), "{:?}", err);
}

#[test]
fn test_bip143_p2sh_p2wsh_six_of_six_vector() {
    let tx = decode(BIP143_P2SH_P2WSH_TX);
    let prevouts = bip143_p2sh_p2wsh_prevouts();
    assert_eq!(tx.txid().to_string(), "27eae69aff1dd4388c0fa05cbbfe9a3983d1b0b5811ebcd4199b86f299370aac");
    assert_eq!(template_names(&tx, &prevouts), vec!["p2sh-p2wsh"]);

    // One signature per hash type: ALL, NONE, SINGLE, then each with ANYONECANPAY
    let hash_types: Vec<u8> = tx.inputs[0].witness[1..7].iter().map(|sig| sig[sig.len() - 1]).collect();
    assert_eq!(hash_types, vec![0x01, 0x02, 0x03, 0x81, 0x82, 0x83]);
    verify_tx(&tx, &prevouts).unwrap();
}

#[test]
fn test_bip143_p2sh_p2wsh_vector_mutations_fail() {
    let prevouts = bip143_p2sh_p2wsh_prevouts();

    let mut tx = decode(BIP143_P2SH_P2WSH_TX);
    // Inside r of the SIGHASH_NONE signature
    tx.inputs[0].witness[2][10] ^= 0x01;
    let err = verify_tx(&tx, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);

    // Witness script no longer matches the committed program
    let mut tx = decode(BIP143_P2SH_P2WSH_TX);
    let last = tx.inputs[0].witness.len() - 1;
    tx.inputs[0].witness[last][1] ^= 0x01;
    assert!(verify_tx(&tx, &prevouts).is_err());

    let tx = decode(BIP143_P2SH_P2WSH_TX);
    let mut wrong_amount = prevouts.clone();
    wrong_amount[0].value -= 1;
    let err = verify_tx(&tx, &wrong_amount).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);
}

#[test]
fn test_p2sh_two_of_three_vector() {
    let tx = decode(P2SH_MULTISIG_TX);
    let prevouts = p2sh_multisig_prevouts();
    assert_eq!(tx.txid().to_string(), "ea21339861c588279e8e066f1e0dc39350645c881c2f6e75540fe892edd38d60");
    // 253-byte script sig takes the three-byte length prefix
    assert_eq!(tx.inputs[0].script_sig.len(), 253);
    assert_eq!(template_names(&tx, &prevouts), vec!["p2sh-multisig"]);
    verify_tx(&tx, &prevouts).unwrap();
}

#[test]
fn test_p2sh_two_of_three_vector_mutations_fail() {
    let prevouts = p2sh_multisig_prevouts();

    let mut tx = decode(P2SH_MULTISIG_TX);
    // Dummy, then the first signature's push; byte 10 falls inside its r
    tx.inputs[0].script_sig[10] ^= 0x01;
    let err = verify_tx(&tx, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);

    let mut tx = decode(P2SH_MULTISIG_TX);
    tx.outputs[1].value += 1;
    let err = verify_tx(&tx, &prevouts).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);
}

// ============================================================================
// LOCALLY SIGNED TEMPLATES
// ============================================================================

struct Key {
    secret: SecretKey,
    public: Vec<u8>,
}

fn key(byte: u8) -> Key {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    let public = PublicKey::from_secret_key(&secp, &secret).serialize().to_vec();
    Key { secret, public }
}

fn sign(key: &Key, digest: HashId) -> Vec<u8> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(digest.as_bytes()).unwrap();
    let mut sig = secp.sign_ecdsa(&message, &key.secret).serialize_der().to_vec();
    sig.push(SIGHASH_ALL as u8);
    sig
}

fn spend(script_sig: Vec<u8>) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TransactionInput {
            prevout: OutPoint::new(HashId([0x42; 32]), 1),
            script_sig,
            sequence: 0xfffffffe,
            witness: Vec::new(),
        }],
        outputs: vec![TransactionOutput { value: 90_000, script_pubkey: p2wpkh_script(&[7; 20]) }],
        lock_time: 0,
    }
}

fn push(items: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        script::push_data(&mut out, item);
    }
    out
}

#[test]
fn test_signed_p2pkh() {
    let k = key(1);
    let prevout = TransactionOutput { value: 100_000, script_pubkey: p2pkh_script(&hash160(&k.public)) };
    let mut tx = spend(Vec::new());
    let sig = sign(&k, legacy_sighash(&tx, 0, &prevout.script_pubkey, SIGHASH_ALL));
    tx.inputs[0].script_sig = push(&[&sig, &k.public]);
    verify_tx(&tx, &[prevout.clone()]).unwrap();

    // A different key's hash
    let other = TransactionOutput { value: 100_000, script_pubkey: p2pkh_script(&hash160(&key(2).public)) };
    assert!(verify_tx(&tx, &[other]).is_err());
}

#[test]
fn test_signed_p2wpkh() {
    let k = key(3);
    let pubkey_hash = hash160(&k.public);
    let prevout = TransactionOutput { value: 100_000, script_pubkey: p2wpkh_script(&pubkey_hash) };
    let mut tx = spend(Vec::new());
    let cache = SighashCache::new(&tx);
    let digest = witness_v0_sighash(&tx, &cache, 0, &p2pkh_script(&pubkey_hash), prevout.value, SIGHASH_ALL);
    tx.inputs[0].witness = vec![sign(&k, digest), k.public.clone()];
    verify_tx(&tx, &[prevout.clone()]).unwrap();

    // Changing an output invalidates the signature
    tx.outputs[0].value -= 1;
    let err = verify_tx(&tx, &[prevout]).unwrap_err();
    assert!(matches!(err, ConsensusError::SigVerify { input: 0, .. }), "{:?}", err);
}

#[test]
fn test_signed_p2wsh_multisig() {
    let (a, b, c) = (key(4), key(5), key(6));
    let witness_script = multisig_script(2, &[&a.public, &b.public, &c.public]);
    let prevout = TransactionOutput { value: 250_000, script_pubkey: p2wsh_script(&sha256(&witness_script)) };
    let mut tx = spend(Vec::new());
    let cache = SighashCache::new(&tx);
    let digest = witness_v0_sighash(&tx, &cache, 0, &witness_script, prevout.value, SIGHASH_ALL);

    // Signatures in key order, with the dummy element first
    tx.inputs[0].witness = vec![Vec::new(), sign(&a, digest), sign(&c, digest), witness_script.clone()];
    verify_tx(&tx, &[prevout.clone()]).unwrap();

    // Out of order fails
    tx.inputs[0].witness = vec![Vec::new(), sign(&c, digest), sign(&a, digest), witness_script];
    assert!(verify_tx(&tx, &[prevout]).is_err());
}

#[test]
fn test_signed_p2sh_multisig() {
    let (a, b) = (key(7), key(8));
    let redeem = multisig_script(2, &[&a.public, &b.public]);
    let prevout = TransactionOutput { value: 500_000, script_pubkey: p2sh_script(&hash160(&redeem)) };
    let mut tx = spend(Vec::new());
    let digest = legacy_sighash(&tx, 0, &redeem, SIGHASH_ALL);
    tx.inputs[0].script_sig = push(&[&[], &sign(&a, digest), &sign(&b, digest), &redeem]);
    verify_tx(&tx, &[prevout.clone()]).unwrap();

    // Only one signature of two
    tx.inputs[0].script_sig = push(&[&[], &sign(&a, digest), &sign(&a, digest), &redeem]);
    assert!(verify_tx(&tx, &[prevout]).is_err());
}

#[test]
fn test_null_data_prevout_needs_no_signature() {
    let tx = spend(Vec::new());
    let prevout = TransactionOutput { value: 0, script_pubkey: vec![0x6a, 0x02, 0xbe, 0xef] };
    verify_tx(&tx, &[prevout]).unwrap();
}
