//! Per-input signature verification
//!
//! Each input is classified once against the output it spends, then checked
//! with the evaluation path of its template.

use crate::error::{ConsensusError, Result};
use crate::hashes::{hash160, sha256};
use crate::interpreter::{
    cast_to_bool, eval_script, eval_witness_script, SigVersion, SignatureChecker, Stack,
    STANDARD_VERIFY_FLAGS, VERIFY_P2SH,
};
use crate::script::{self, ScriptError};
use crate::sighash::{legacy_sighash, witness_v0_sighash, SighashCache};
use crate::types::*;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use std::sync::OnceLock;

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// Verification template of one input, with the data its check needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTemplate {
    P2pk,
    P2pkh,
    /// Native witness pubkey hash; `pubkey_hash` is the 20-byte program
    P2wpkh { pubkey_hash: Vec<u8> },
    NullData,
    P2shP2wpkh { redeem_script: Vec<u8>, pubkey_hash: Vec<u8> },
    P2shP2wsh { redeem_script: Vec<u8>, witness_script: Vec<u8> },
    P2wshMultisig { witness_script: Vec<u8> },
    P2shMultisig { redeem_script: Vec<u8> },
    NonStandard,
    /// A recognised output form spent in a way no template covers
    Unsupported(&'static str),
}

impl ScriptTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptTemplate::P2pk => "p2pk",
            ScriptTemplate::P2pkh => "p2pkh",
            ScriptTemplate::P2wpkh { .. } => "p2wpkh",
            ScriptTemplate::NullData => "nulldata",
            ScriptTemplate::P2shP2wpkh { .. } => "p2sh-p2wpkh",
            ScriptTemplate::P2shP2wsh { .. } => "p2sh-p2wsh",
            ScriptTemplate::P2wshMultisig { .. } => "p2wsh-multisig",
            ScriptTemplate::P2shMultisig { .. } => "p2sh-multisig",
            ScriptTemplate::NonStandard => "nonstandard",
            ScriptTemplate::Unsupported(_) => "unsupported",
        }
    }

    /// Templates accepted without any signature check
    pub fn is_skipped(&self) -> bool {
        matches!(self, ScriptTemplate::NullData | ScriptTemplate::NonStandard)
    }
}

/// Last push of a push-only script sig, the P2SH redeem script
fn redeem_script(script_sig: &[u8]) -> Option<Vec<u8>> {
    script::push_items(script_sig)?.pop()
}

/// Classify: 𝒮𝒞 × 𝒮𝒞 × 𝒲 → 𝒯
///
/// First match wins:
/// 1. P2PK, P2PKH
/// 2. P2WPKH spent with an empty script sig and a two-item witness
/// 3. Null data
/// 4. P2SH wrapping a P2WPKH or a multisig P2WSH program
/// 5. P2WSH whose witness script is multisig
/// 6. P2SH whose redeem script is multisig
/// 7. Otherwise unsupported for recognised outputs, else nonstandard
pub fn classify(input: &TransactionInput, script_pubkey: &[u8]) -> ScriptTemplate {
    // 1. Bare key templates
    if script::is_p2pk(script_pubkey) {
        return ScriptTemplate::P2pk;
    }
    if script::is_p2pkh(script_pubkey) {
        return ScriptTemplate::P2pkh;
    }

    // 2. Native P2WPKH
    if let Some(hash) = script::p2wpkh_hash(script_pubkey) {
        if input.script_sig.is_empty() && input.witness.len() == 2 {
            return ScriptTemplate::P2wpkh { pubkey_hash: hash.to_vec() };
        }
    }

    // 3. Data carrier
    if script::is_null_data(script_pubkey) {
        return ScriptTemplate::NullData;
    }

    let witness_script = input.witness.last().filter(|s| script::is_multisig(s));

    // 4. Nested witness programs
    if script::is_p2sh(script_pubkey) {
        if let Some(redeem) = redeem_script(&input.script_sig) {
            if let Some(hash) = script::p2wpkh_hash(&redeem) {
                if input.witness.len() == 2 {
                    let pubkey_hash = hash.to_vec();
                    return ScriptTemplate::P2shP2wpkh { redeem_script: redeem, pubkey_hash };
                }
            } else if script::is_p2wsh(&redeem) {
                if let Some(ws) = witness_script {
                    return ScriptTemplate::P2shP2wsh { redeem_script: redeem, witness_script: ws.clone() };
                }
            }
        }
    }

    // 5. Native P2WSH multisig
    if script::is_p2wsh(script_pubkey) && input.script_sig.is_empty() {
        if let Some(ws) = witness_script {
            return ScriptTemplate::P2wshMultisig { witness_script: ws.clone() };
        }
    }

    // 6. Legacy P2SH multisig
    if script::is_p2sh(script_pubkey) && input.witness.is_empty() {
        if let Some(redeem) = redeem_script(&input.script_sig) {
            if script::is_multisig(&redeem) {
                return ScriptTemplate::P2shMultisig { redeem_script: redeem };
            }
        }
    }

    // 7. Fallback
    if script::is_p2sh(script_pubkey) {
        ScriptTemplate::Unsupported("p2sh spend with unrecognised redeem script")
    } else if script::is_p2wsh(script_pubkey) {
        ScriptTemplate::Unsupported("p2wsh spend with unrecognised witness script")
    } else if script::is_p2wpkh(script_pubkey) {
        ScriptTemplate::Unsupported("p2wpkh spend with malformed witness")
    } else {
        ScriptTemplate::NonStandard
    }
}

/// Signature checker bound to one input of one transaction
pub struct InputVerifier<'a> {
    tx: &'a Transaction,
    input_index: usize,
    amount: Amount,
    cache: &'a SighashCache,
}

impl<'a> InputVerifier<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Amount, cache: &'a SighashCache) -> Self {
        InputVerifier { tx, input_index, amount, cache }
    }
}

impl SignatureChecker for InputVerifier<'_> {
    /// CheckSig: decode pubkey and DER signature, hash the preimage for
    /// `sig_version`, verify with ECDSA. Any decode failure is a failed check.
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8], sig_version: SigVersion) -> bool {
        let Some((hash_type, der)) = sig.split_last() else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(mut signature) = Signature::from_der_lax(der) else {
            return false;
        };
        signature.normalize_s();

        let hash_type = *hash_type as u32;
        let digest = match sig_version {
            SigVersion::Base => legacy_sighash(self.tx, self.input_index, script_code, hash_type),
            SigVersion::WitnessV0 => {
                witness_v0_sighash(self.tx, self.cache, self.input_index, script_code, self.amount, hash_type)
            }
        };
        let Ok(message) = Message::from_digest_slice(digest.as_bytes()) else {
            return false;
        };
        secp().verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }
}

/// Map an evaluator failure onto the input-level error
fn script_failure(input: usize, err: ScriptError) -> ConsensusError {
    match err {
        ScriptError::EvalFalse | ScriptError::VerifyFailed(_) | ScriptError::SigNullDummy => {
            ConsensusError::SigVerify { input, reason: err.to_string() }
        }
        other => ConsensusError::ScriptExecution(format!("input {}: {}", input, other)),
    }
}

fn require_true(stack: &Stack) -> std::result::Result<(), ScriptError> {
    match stack.last() {
        Some(top) if cast_to_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

/// Legacy path: script sig, then script pubkey on the resulting stack,
/// then the redeem script when `p2sh` is set
fn eval_legacy(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
    p2sh: bool,
) -> std::result::Result<(), ScriptError> {
    if p2sh && !script::is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    // 1. Script sig
    let mut stack: Stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, SigVersion::Base)?;
    let mut redeem_stack = stack.clone();

    // 2. Script pubkey (for P2SH, the hash-equality phase)
    eval_script(&mut stack, script_pubkey, flags, checker, SigVersion::Base)?;
    require_true(&stack)?;

    // 3. Redeem script against the script sig's stack
    if p2sh && flags & VERIFY_P2SH != 0 {
        let redeem = redeem_stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&mut redeem_stack, &redeem, flags, checker, SigVersion::Base)?;
        require_true(&redeem_stack)?;
    }
    Ok(())
}

/// P2SH phase of a nested witness spend: the script sig must be exactly
/// the redeem script push and match the committed hash
fn check_nested_redeem(script_sig: &[u8], script_pubkey: &[u8], redeem: &[u8]) -> std::result::Result<(), ScriptError> {
    let mut expected = Vec::with_capacity(redeem.len() + 1);
    script::push_data(&mut expected, redeem);
    if script_sig != expected.as_slice() {
        return Err(ScriptError::WitnessMalformed);
    }
    match script::p2sh_hash(script_pubkey) {
        Some(hash) if hash == &hash160(redeem)[..] => Ok(()),
        _ => Err(ScriptError::VerifyFailed(crate::opcodes::OP_EQUAL)),
    }
}

/// Witness script hash must equal the 32-byte program
fn check_witness_script_hash(program: &[u8], witness_script: &[u8]) -> std::result::Result<(), ScriptError> {
    if program == &sha256(witness_script)[..] {
        Ok(())
    } else {
        Err(ScriptError::WitnessProgramMismatch)
    }
}

fn run_template(
    template: &ScriptTemplate,
    input: &TransactionInput,
    script_pubkey: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> std::result::Result<(), ScriptError> {
    match template {
        ScriptTemplate::P2pk | ScriptTemplate::P2pkh => {
            eval_legacy(&input.script_sig, script_pubkey, flags, checker, false)
        }
        ScriptTemplate::P2shMultisig { .. } => eval_legacy(&input.script_sig, script_pubkey, flags, checker, true),
        ScriptTemplate::P2wpkh { pubkey_hash } => {
            let script_code = script::p2pkh_script(pubkey_hash);
            eval_witness_script(&input.witness, &script_code, flags, checker)
        }
        ScriptTemplate::P2shP2wpkh { redeem_script, pubkey_hash } => {
            check_nested_redeem(&input.script_sig, script_pubkey, redeem_script)?;
            let script_code = script::p2pkh_script(pubkey_hash);
            eval_witness_script(&input.witness, &script_code, flags, checker)
        }
        ScriptTemplate::P2shP2wsh { redeem_script, witness_script } => {
            check_nested_redeem(&input.script_sig, script_pubkey, redeem_script)?;
            let program = script::p2wsh_hash(redeem_script).ok_or(ScriptError::WitnessProgramMismatch)?;
            check_witness_script_hash(program, witness_script)?;
            let items = &input.witness[..input.witness.len() - 1];
            eval_witness_script(items, witness_script, flags, checker)
        }
        ScriptTemplate::P2wshMultisig { witness_script } => {
            let program = script::p2wsh_hash(script_pubkey).ok_or(ScriptError::WitnessProgramMismatch)?;
            check_witness_script_hash(program, witness_script)?;
            let items = &input.witness[..input.witness.len() - 1];
            eval_witness_script(items, witness_script, flags, checker)
        }
        ScriptTemplate::NullData | ScriptTemplate::NonStandard | ScriptTemplate::Unsupported(_) => Ok(()),
    }
}

/// VerifyInput: 𝒯𝒳 × ℕ × 𝒯𝒪 → 𝒯 ∪ {error}
///
/// Classify the input against the output it spends and run the template's
/// check. Returns the template on success.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    prevout: &TransactionOutput,
    cache: &SighashCache,
    flags: u32,
) -> Result<ScriptTemplate> {
    let input = tx.inputs.get(input_index).ok_or(ConsensusError::MissingPrevout(input_index))?;
    let template = classify(input, &prevout.script_pubkey);

    if let ScriptTemplate::Unsupported(reason) = &template {
        return Err(ConsensusError::UnsupportedScript { input: input_index, reason: reason.to_string() });
    }
    if template.is_skipped() {
        return Ok(template);
    }

    let checker = InputVerifier::new(tx, input_index, prevout.value, cache);
    run_template(&template, input, &prevout.script_pubkey, flags, &checker)
        .map_err(|e| script_failure(input_index, e))?;
    Ok(template)
}

/// VerifyTX: 𝒯𝒳 × 𝒯𝒪* → {valid, invalid}
///
/// `prevouts[i]` is the output spent by input i. Coinbase transactions have
/// nothing to verify.
pub fn verify_tx(tx: &Transaction, prevouts: &[TransactionOutput]) -> Result<()> {
    if tx.is_coinbase() {
        return Ok(());
    }
    let cache = SighashCache::new(tx);
    for index in 0..tx.inputs.len() {
        let prevout = prevouts.get(index).ok_or(ConsensusError::MissingPrevout(index))?;
        verify_input(tx, index, prevout, &cache, STANDARD_VERIFY_FLAGS)?;
    }
    Ok(())
}

/// Like [`verify_tx`], resolving each spent output through `lookup`
pub fn verify_tx_with<F>(tx: &Transaction, mut lookup: F) -> Result<()>
where
    F: FnMut(&OutPoint) -> Option<TransactionOutput>,
{
    if tx.is_coinbase() {
        return Ok(());
    }
    let prevouts = tx
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| lookup(&input.prevout).ok_or(ConsensusError::MissingPrevout(index)))
        .collect::<Result<Vec<_>>>()?;
    verify_tx(tx, &prevouts)
}
