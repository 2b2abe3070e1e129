//! Restricted script evaluator
//!
//! Covers the push, flow-control, stack, numeric, hashing and signature
//! opcodes used by the standard templates. Anything else fails with
//! [`ScriptError::BadOpcode`] rather than being skipped.

use crate::constants::*;
use crate::hashes::{double_sha256, hash160, ripemd160, sha256};
use crate::opcodes::*;
use crate::script::{find_and_delete, is_minimal_push, push_data, Instruction, Instructions, ScriptError};

/// Evaluate P2SH redeem scripts
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Require CHECKMULTISIG's extra stack element to be empty
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require minimal pushes and minimally encoded numbers
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Evaluate segregated witness programs
pub const VERIFY_WITNESS: u32 = 1 << 11;

/// Flags applied to every input during transaction verification
pub const STANDARD_VERIFY_FLAGS: u32 = VERIFY_P2SH | VERIFY_WITNESS | VERIFY_NULLDUMMY;

/// Which signature hash algorithm a CHECKSIG commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

/// Signature check seam between the evaluator and the transaction context
pub trait SignatureChecker {
    /// `script_code` is the executed script from the last OP_CODESEPARATOR,
    /// with the signature already removed for legacy scripts.
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8], sig_version: SigVersion) -> bool;
}

/// Checker that rejects every signature
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _: &[u8], _: &[u8], _: &[u8], _: SigVersion) -> bool {
        false
    }
}

pub type Stack = Vec<Vec<u8>>;

/// Truthiness of a stack element: any non-zero byte, negative zero excluded
pub fn cast_to_bool(value: &[u8]) -> bool {
    for (i, byte) in value.iter().enumerate() {
        if *byte != 0 {
            return !(i == value.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Little-endian sign-magnitude integer used by numeric opcodes
pub struct ScriptNum;

impl ScriptNum {
    pub fn decode(bytes: &[u8], require_minimal: bool) -> Result<i64, ScriptError> {
        if bytes.len() > MAX_SCRIPT_NUM_SIZE {
            return Err(ScriptError::NumOverflow);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let last = bytes[bytes.len() - 1];
        if require_minimal && last & 0x7f == 0 && (bytes.len() <= 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
            return Err(ScriptError::MinimalData);
        }
        let mut result: i64 = 0;
        for (i, byte) in bytes.iter().enumerate() {
            result |= (*byte as i64) << (8 * i);
        }
        if last & 0x80 != 0 {
            let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
            return Ok(-(result & mask));
        }
        Ok(result)
    }

    pub fn encode(value: i64) -> Vec<u8> {
        if value == 0 {
            return Vec::new();
        }
        let negative = value < 0;
        let mut abs = value.unsigned_abs();
        let mut out = Vec::new();
        while abs > 0 {
            out.push((abs & 0xff) as u8);
            abs >>= 8;
        }
        let last = out.len() - 1;
        if out[last] & 0x80 != 0 {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            out[last] |= 0x80;
        }
        out
    }
}

fn bool_bytes(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

/// Element `depth` positions from the top (1 = top)
fn top(stack: &Stack, depth: usize) -> Result<&Vec<u8>, ScriptError> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Stack) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn need(stack: &Stack, n: usize) -> Result<(), ScriptError> {
    if stack.len() < n {
        Err(ScriptError::InvalidStackOperation)
    } else {
        Ok(())
    }
}

fn swap(stack: &mut Stack, a: usize, b: usize) {
    let len = stack.len();
    stack.swap(len - a, len - b);
}

/// Signature push as it would appear in the script, for FindAndDelete
fn sig_push(sig: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sig.len() + 2);
    push_data(&mut out, sig);
    out
}

/// EvalScript: 𝒮𝒞 × 𝒮𝒯 × ℕ → 𝒮𝒯 ∪ {error}
///
/// Executes `script` against `stack`. Succeeds when no opcode failed and the
/// conditional stack is balanced; the caller inspects the resulting stack.
pub fn eval_script(
    stack: &mut Stack,
    script: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
    sig_version: SigVersion,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize(script.len()));
    }
    let require_minimal = flags & VERIFY_MINIMALDATA != 0;
    let mut alt_stack: Stack = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_separator = 0usize;

    let mut instructions = Instructions::new(script);
    while let Some(item) = instructions.next() {
        let (_, instruction) = item?;
        let executing = exec_stack.iter().all(|b| *b);
        let opcode = instruction.opcode();

        if let Instruction::PushBytes { data, .. } = instruction {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize(data.len()));
            }
        }

        // Note how OP_RESERVED does not count towards the opcode limit.
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }

        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode(opcode));
        }

        if let Instruction::PushBytes { opcode, data } = instruction {
            if executing {
                if require_minimal && !is_minimal_push(opcode, data) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                // OP_1NEGATE, OP_1 .. OP_16 - push small integer
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(ScriptNum::encode(n));
                }

                // NOP family, including the unenforced lock-time slots
                OP_NOP | OP_NOP1 | OP_CHECKLOCKTIMEVERIFY | OP_CHECKSEQUENCEVERIFY | OP_NOP4..=OP_NOP10 => {}

                // OP_IF / OP_NOTIF - open a conditional
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let cond = pop(stack).map_err(|_| ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&cond);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }

                // OP_ELSE - flip the innermost conditional
                OP_ELSE => {
                    let last = exec_stack.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }

                // OP_ENDIF - close the innermost conditional
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }

                // OP_VERIFY - fail unless top is true
                OP_VERIFY => {
                    let value = pop(stack)?;
                    if !cast_to_bool(&value) {
                        return Err(ScriptError::VerifyFailed(OP_VERIFY));
                    }
                }

                OP_RETURN => return Err(ScriptError::OpReturn),

                // Stack operations
                OP_TOALTSTACK => {
                    let value = pop(stack)?;
                    alt_stack.push(value);
                }
                OP_FROMALTSTACK => {
                    let value = alt_stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(value);
                }
                OP_2DROP => {
                    need(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    need(stack, 6)?;
                    let at = stack.len() - 6;
                    let pair: Vec<Vec<u8>> = stack.drain(at..at + 2).collect();
                    stack.extend(pair);
                }
                OP_2SWAP => {
                    need(stack, 4)?;
                    swap(stack, 4, 2);
                    swap(stack, 3, 1);
                }
                OP_IFDUP => {
                    let value = top(stack, 1)?.clone();
                    if cast_to_bool(&value) {
                        stack.push(value);
                    }
                }
                OP_DEPTH => {
                    let depth = stack.len() as i64;
                    stack.push(ScriptNum::encode(depth));
                }
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let value = top(stack, 1)?.clone();
                    stack.push(value);
                }
                OP_NIP => {
                    need(stack, 2)?;
                    let at = stack.len() - 2;
                    stack.remove(at);
                }
                OP_OVER => {
                    let value = top(stack, 2)?.clone();
                    stack.push(value);
                }
                OP_PICK | OP_ROLL => {
                    need(stack, 2)?;
                    let n = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let at = stack.len() - 1 - n as usize;
                    let value = if opcode == OP_ROLL { stack.remove(at) } else { stack[at].clone() };
                    stack.push(value);
                }
                OP_ROT => {
                    need(stack, 3)?;
                    swap(stack, 3, 2);
                    swap(stack, 2, 1);
                }
                OP_SWAP => {
                    need(stack, 2)?;
                    swap(stack, 2, 1);
                }
                OP_TUCK => {
                    let value = top(stack, 1)?.clone();
                    need(stack, 2)?;
                    let at = stack.len() - 2;
                    stack.insert(at, value);
                }

                // OP_SIZE - push length of top element
                OP_SIZE => {
                    let len = top(stack, 1)?.len() as i64;
                    stack.push(ScriptNum::encode(len));
                }

                // OP_EQUAL / OP_EQUALVERIFY - byte-wise equality
                OP_EQUAL | OP_EQUALVERIFY => {
                    need(stack, 2)?;
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::VerifyFailed(OP_EQUALVERIFY));
                        }
                    } else {
                        stack.push(bool_bytes(equal));
                    }
                }

                // Unary numeric operations
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(ScriptNum::encode(result));
                }

                // Binary numeric operations
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    need(stack, 2)?;
                    let b = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    let a = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::VerifyFailed(OP_NUMEQUALVERIFY));
                        }
                    } else {
                        stack.push(ScriptNum::encode(result));
                    }
                }

                // OP_WITHIN - min <= x < max
                OP_WITHIN => {
                    need(stack, 3)?;
                    let max = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    let min = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    let x = ScriptNum::decode(&pop(stack)?, require_minimal)?;
                    stack.push(bool_bytes(min <= x && x < max));
                }

                // Hashing
                OP_RIPEMD160 => {
                    let value = pop(stack)?;
                    stack.push(ripemd160(&value).to_vec());
                }
                OP_SHA256 => {
                    let value = pop(stack)?;
                    stack.push(sha256(&value).to_vec());
                }
                OP_HASH160 => {
                    let value = pop(stack)?;
                    stack.push(hash160(&value).to_vec());
                }
                OP_HASH256 => {
                    let value = pop(stack)?;
                    stack.push(double_sha256(&value).0.to_vec());
                }

                // OP_CODESEPARATOR - signatures commit to the script after this point
                OP_CODESEPARATOR => {
                    code_separator = instructions.position();
                }

                // OP_CHECKSIG / OP_CHECKSIGVERIFY
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    need(stack, 2)?;
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let mut script_code = script[code_separator..].to_vec();
                    if sig_version == SigVersion::Base {
                        script_code = find_and_delete(&script_code, &sig_push(&sig));
                    }
                    let ok = !sig.is_empty() && checker.check_sig(&sig, &pubkey, &script_code, sig_version);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::VerifyFailed(OP_CHECKSIGVERIFY));
                        }
                    } else {
                        stack.push(bool_bytes(ok));
                    }
                }

                // OP_CHECKMULTISIG / OP_CHECKMULTISIGVERIFY
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = check_multisig(
                        stack,
                        &script[code_separator..],
                        flags,
                        checker,
                        sig_version,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::VerifyFailed(OP_CHECKMULTISIGVERIFY));
                        }
                    } else {
                        stack.push(bool_bytes(ok));
                    }
                }

                _ => return Err(ScriptError::BadOpcode(opcode)),
            }
        }

        // Size limits
        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Stack layout: <dummy> <sig>... <m> <pubkey>... <n>
fn check_multisig(
    stack: &mut Stack,
    subscript: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
    sig_version: SigVersion,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let require_minimal = flags & VERIFY_MINIMALDATA != 0;

    let mut i = 1;
    let mut keys_count = ScriptNum::decode(top(stack, i)?, require_minimal)?;
    if keys_count < 0 || keys_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    *op_count += keys_count as usize;
    if *op_count > MAX_SCRIPT_OPS {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut ikey = i;
    i += keys_count as usize;

    let mut sigs_count = ScriptNum::decode(top(stack, i)?, require_minimal)?;
    if sigs_count < 0 || sigs_count > keys_count {
        return Err(ScriptError::SigCount);
    }
    i += 1;
    let mut isig = i;
    i += sigs_count as usize;
    need(stack, i)?;

    // Legacy signatures cannot sign themselves
    let mut script_code = subscript.to_vec();
    if sig_version == SigVersion::Base {
        for k in 0..sigs_count as usize {
            let sig = top(stack, isig + k)?;
            script_code = find_and_delete(&script_code, &sig_push(sig));
        }
    }

    let mut success = true;
    while success && sigs_count > 0 {
        let sig = top(stack, isig)?;
        let pubkey = top(stack, ikey)?;
        if !sig.is_empty() && checker.check_sig(sig, pubkey, &script_code, sig_version) {
            isig += 1;
            sigs_count -= 1;
        }
        ikey += 1;
        keys_count -= 1;
        // More signatures left than keys means failure
        if sigs_count > keys_count {
            success = false;
        }
    }

    // Clean up the counts, keys and signatures, then the dummy element
    stack.truncate(stack.len() - (i - 1));
    let dummy = pop(stack)?;
    if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

/// Run a version 0 witness script over its initial stack.
///
/// The script must leave exactly one true element behind.
pub fn eval_witness_script(
    initial: &[Vec<u8>],
    script: &[u8],
    flags: u32,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if let Some(item) = initial.iter().find(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
        return Err(ScriptError::PushSize(item.len()));
    }
    let mut stack: Stack = initial.to_vec();
    eval_script(&mut stack, script, flags, checker, SigVersion::WitnessV0)?;
    if stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    if !cast_to_bool(&stack[0]) {
        return Err(ScriptError::EvalFalse);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Builder;

    fn run(script: &[u8]) -> Result<Stack, ScriptError> {
        let mut stack = Vec::new();
        eval_script(&mut stack, script, VERIFY_MINIMALDATA, &NoSignatureChecker, SigVersion::Base)?;
        Ok(stack)
    }

    /// Accepts a signature equal to the pubkey with a trailing 0x01
    struct EchoChecker;

    impl SignatureChecker for EchoChecker {
        fn check_sig(&self, sig: &[u8], pubkey: &[u8], _: &[u8], _: SigVersion) -> bool {
            sig.len() == pubkey.len() + 1 && &sig[..pubkey.len()] == pubkey
        }
    }

    #[test]
    fn test_script_num_encoding() {
        assert_eq!(ScriptNum::encode(0), Vec::<u8>::new());
        assert_eq!(ScriptNum::encode(1), vec![1]);
        assert_eq!(ScriptNum::encode(-1), vec![0x81]);
        assert_eq!(ScriptNum::encode(127), vec![0x7f]);
        assert_eq!(ScriptNum::encode(128), vec![0x80, 0x00]);
        assert_eq!(ScriptNum::encode(-128), vec![0x80, 0x80]);
        assert_eq!(ScriptNum::encode(256), vec![0x00, 0x01]);
        for n in [0i64, 1, -1, 127, 128, -255, 65535, -2147483647] {
            assert_eq!(ScriptNum::decode(&ScriptNum::encode(n), true).unwrap(), n);
        }
    }

    #[test]
    fn test_script_num_minimal_and_overflow() {
        assert_eq!(ScriptNum::decode(&[0x01, 0x00], true), Err(ScriptError::MinimalData));
        assert_eq!(ScriptNum::decode(&[0x01, 0x00], false), Ok(1));
        assert_eq!(ScriptNum::decode(&[0x80, 0x00], true), Ok(128));
        assert_eq!(ScriptNum::decode(&[1, 2, 3, 4, 5], false), Err(ScriptError::NumOverflow));
    }

    #[test]
    fn test_cast_to_bool() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0, 0]));
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[0x80, 0]));
        assert!(cast_to_bool(&[1]));
    }

    #[test]
    fn test_arithmetic() {
        let stack = run(&[OP_2, OP_3, OP_ADD, 0x01, 0x05, OP_NUMEQUAL]);
        assert_eq!(stack, Err(ScriptError::MinimalData));

        let stack = run(&[OP_2, OP_1, OP_ADD, OP_3, OP_NUMEQUAL]).unwrap();
        assert_eq!(stack, vec![vec![1]]);

        let stack = run(&[OP_1, OP_0, OP_3, OP_WITHIN]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn test_conditionals() {
        let stack = run(&[OP_1, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]).unwrap();
        assert_eq!(stack, vec![vec![2]]);
        let stack = run(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]).unwrap();
        assert_eq!(stack, vec![vec![3]]);
        let stack = run(&[OP_0, OP_NOTIF, OP_2, OP_ENDIF]).unwrap();
        assert_eq!(stack, vec![vec![2]]);
    }

    #[test]
    fn test_unbalanced_conditionals() {
        assert_eq!(run(&[OP_1, OP_IF, OP_2]), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF]), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ELSE]), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_IF, OP_ENDIF]), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn test_disabled_opcode_fails_even_unexecuted() {
        assert_eq!(
            run(&[OP_0, OP_IF, OP_CAT, OP_ENDIF]),
            Err(ScriptError::DisabledOpcode(OP_CAT))
        );
        // Unknown opcodes in an unexecuted branch are skipped
        assert!(run(&[OP_0, OP_IF, 0xba, OP_ENDIF]).is_ok());
        assert_eq!(run(&[0xba]), Err(ScriptError::BadOpcode(0xba)));
        assert_eq!(run(&[OP_0, OP_IF, OP_VERIF, OP_ENDIF]), Err(ScriptError::BadOpcode(OP_VERIF)));
    }

    #[test]
    fn test_op_count_limit() {
        let mut script = vec![OP_NOP; MAX_SCRIPT_OPS];
        assert!(run(&script).is_ok());
        script.push(OP_NOP);
        assert_eq!(run(&script), Err(ScriptError::OpCount));
    }

    #[test]
    fn test_stack_size_limit() {
        let script = vec![OP_1; MAX_STACK_SIZE];
        assert!(run(&script).is_ok());
        let script = vec![OP_1; MAX_STACK_SIZE + 1];
        assert_eq!(run(&script), Err(ScriptError::StackSize));

        let mut script = vec![OP_1; MAX_STACK_SIZE];
        script.push(OP_TOALTSTACK);
        script.push(OP_DUP);
        script.push(OP_DUP);
        assert_eq!(run(&script), Err(ScriptError::StackSize));
    }

    #[test]
    fn test_minimal_push_enforced_only_with_flag() {
        let script = [0x01, 0x05];
        assert_eq!(run(&script), Err(ScriptError::MinimalData));
        let mut stack = Vec::new();
        assert!(eval_script(&mut stack, &script, 0, &NoSignatureChecker, SigVersion::Base).is_ok());
        assert_eq!(stack, vec![vec![5]]);
    }

    #[test]
    fn test_stack_ops() {
        let stack = run(&[OP_1, OP_2, OP_3, OP_ROT]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_SWAP, OP_OVER]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_TUCK, OP_DEPTH]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1], vec![2], vec![3]]);
        assert_eq!(run(&[OP_DROP]), Err(ScriptError::InvalidStackOperation));
    }

    #[test]
    fn test_hash_and_equal() {
        let data = b"abc";
        let script = Builder::new()
            .push_slice(data)
            .push_opcode(OP_SHA256)
            .push_slice(&sha256(data))
            .push_opcode(OP_EQUAL)
            .into_bytes();
        assert_eq!(run(&script).unwrap(), vec![vec![1]]);
        assert_eq!(run(&[OP_1, OP_2, OP_EQUALVERIFY]), Err(ScriptError::VerifyFailed(OP_EQUALVERIFY)));
    }

    #[test]
    fn test_op_return() {
        assert_eq!(run(&[OP_RETURN]), Err(ScriptError::OpReturn));
    }

    #[test]
    fn test_checksig_with_checker() {
        let key = vec![0x02; 33];
        let mut sig = key.clone();
        sig.push(0x01);
        let script = Builder::new().push_slice(&sig).push_slice(&key).push_opcode(OP_CHECKSIG).into_bytes();
        let mut stack = Vec::new();
        eval_script(&mut stack, &script, 0, &EchoChecker, SigVersion::Base).unwrap();
        assert_eq!(stack, vec![vec![1]]);

        let mut stack = Vec::new();
        eval_script(&mut stack, &script, 0, &NoSignatureChecker, SigVersion::Base).unwrap();
        assert_eq!(stack, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_checkmultisig_ordering() {
        let k1 = vec![0x02; 33];
        let k2 = vec![0x03; 33];
        let k3 = vec![0x04; 33];
        let sig = |k: &Vec<u8>| {
            let mut s = k.clone();
            s.push(0x01);
            s
        };
        let redeem = crate::script::multisig_script(2, &[&k1[..], &k2[..], &k3[..]]);

        // Signatures in key order succeed
        let mut stack = vec![vec![], sig(&k1), sig(&k3)];
        eval_script(&mut stack, &redeem, VERIFY_NULLDUMMY, &EchoChecker, SigVersion::Base).unwrap();
        assert_eq!(stack, vec![vec![1]]);

        // Out of order fails
        let mut stack = vec![vec![], sig(&k3), sig(&k1)];
        eval_script(&mut stack, &redeem, VERIFY_NULLDUMMY, &EchoChecker, SigVersion::Base).unwrap();
        assert_eq!(stack, vec![Vec::<u8>::new()]);

        // Non-empty dummy is rejected under NULLDUMMY
        let mut stack = vec![vec![1], sig(&k1), sig(&k2)];
        assert_eq!(
            eval_script(&mut stack, &redeem, VERIFY_NULLDUMMY, &EchoChecker, SigVersion::Base),
            Err(ScriptError::SigNullDummy)
        );
    }

    #[test]
    fn test_witness_script_clean_stack() {
        let init = vec![vec![1], vec![1]];
        assert_eq!(
            eval_witness_script(&init, &[OP_DROP, OP_DROP, OP_1, OP_1], 0, &NoSignatureChecker),
            Err(ScriptError::CleanStack)
        );
        assert!(eval_witness_script(&init, &[OP_EQUAL], 0, &NoSignatureChecker).is_ok());
        assert_eq!(
            eval_witness_script(&[vec![1], vec![2]], &[OP_EQUAL], 0, &NoSignatureChecker),
            Err(ScriptError::EvalFalse)
        );
    }
}
