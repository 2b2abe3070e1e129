//! Script parsing, standard template predicates and script construction
//!
//! All predicates are pure functions over the byte pattern of a script.

use crate::error::ConsensusError;
use crate::opcodes::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("push past end of script")]
    BadPush,
    #[error("push of {0} bytes exceeds element size limit")]
    PushSize(usize),
    #[error("script of {0} bytes exceeds size limit")]
    ScriptSize(usize),
    #[error("operation count limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("operation on too few stack items")]
    InvalidStackOperation,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("disabled opcode {}", opcode_name(*.0))]
    DisabledOpcode(u8),
    #[error("unsupported opcode {} ({0:#04x})", opcode_name(*.0))]
    BadOpcode(u8),
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("{} failed", opcode_name(*.0))]
    VerifyFailed(u8),
    #[error("non-minimal data push")]
    MinimalData,
    #[error("numeric operand out of range")]
    NumOverflow,
    #[error("public key count out of range")]
    PubkeyCount,
    #[error("signature count out of range")]
    SigCount,
    #[error("CHECKMULTISIG dummy element not empty")]
    SigNullDummy,
    #[error("signature script is not push-only")]
    SigPushOnly,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("witness program hash mismatch")]
    WitnessProgramMismatch,
    #[error("witness stack has the wrong shape")]
    WitnessMalformed,
    #[error("witness left extra stack items")]
    CleanStack,
}

impl From<ScriptError> for ConsensusError {
    fn from(e: ScriptError) -> Self {
        ConsensusError::ScriptExecution(e.to_string())
    }
}

/// One parsed script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// Data push; `opcode` is the push opcode used
    PushBytes { opcode: u8, data: &'a [u8] },
    /// Any other opcode
    Op(u8),
}

impl<'a> Instruction<'a> {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::PushBytes { opcode, .. } => *opcode,
            Instruction::Op(op) => *op,
        }
    }

    pub fn push_data(&self) -> Option<&'a [u8]> {
        match self {
            Instruction::PushBytes { data, .. } => Some(data),
            Instruction::Op(_) => None,
        }
    }
}

/// Iterator over the instructions of a script, yielding each with its offset
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Instructions { script, pos: 0, failed: false }
    }

    /// Offset of the next instruction
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.script.len() {
            return None;
        }
        let start = self.pos;
        match read_instruction(self.script, start) {
            Ok((ins, next)) => {
                self.pos = next;
                Some(Ok((start, ins)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse the instruction at `pos`, returning it and the offset after it
fn read_instruction(script: &[u8], pos: usize) -> Result<(Instruction<'_>, usize), ScriptError> {
    let opcode = script[pos];
    let mut cursor = pos + 1;
    if opcode > OP_PUSHDATA4 {
        return Ok((Instruction::Op(opcode), cursor));
    }
    let len = match opcode {
        OP_PUSHDATA1 => {
            let b = script.get(cursor..cursor + 1).ok_or(ScriptError::BadPush)?;
            cursor += 1;
            b[0] as usize
        }
        OP_PUSHDATA2 => {
            let b = script.get(cursor..cursor + 2).ok_or(ScriptError::BadPush)?;
            cursor += 2;
            u16::from_le_bytes([b[0], b[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let b = script.get(cursor..cursor + 4).ok_or(ScriptError::BadPush)?;
            cursor += 4;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        }
        n => n as usize,
    };
    let end = cursor.checked_add(len).ok_or(ScriptError::BadPush)?;
    let data = script.get(cursor..end).ok_or(ScriptError::BadPush)?;
    Ok((Instruction::PushBytes { opcode, data }, end))
}

/// True if the push uses the shortest possible encoding for its data
pub fn is_minimal_push(opcode: u8, data: &[u8]) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        // Should have used OP_1 .. OP_16
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        // Should have used OP_1NEGATE
        return false;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

// ============================================================================
// Template predicates
// ============================================================================

/// `<33 or 65 byte pubkey> OP_CHECKSIG`, returning the key
pub fn p2pk_pubkey(script: &[u8]) -> Option<&[u8]> {
    match script.len() {
        35 if script[0] == 33 && script[34] == OP_CHECKSIG => Some(&script[1..34]),
        67 if script[0] == 65 && script[66] == OP_CHECKSIG => Some(&script[1..66]),
        _ => None,
    }
}

pub fn is_p2pk(script: &[u8]) -> bool {
    p2pk_pubkey(script).is_some()
}

/// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`, returning the hash
pub fn p2pkh_hash(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        Some(&script[3..23])
    } else {
        None
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    p2pkh_hash(script).is_some()
}

/// `OP_HASH160 <20 bytes> OP_EQUAL`, returning the script hash
pub fn p2sh_hash(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        Some(&script[2..22])
    } else {
        None
    }
}

pub fn is_p2sh(script: &[u8]) -> bool {
    p2sh_hash(script).is_some()
}

/// `<version opcode> <2..40 byte program>`, returning (version, program)
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        OP_0 => 0,
        op @ OP_1..=OP_16 => op - OP_1 + 1,
        _ => return None,
    };
    if script[1] as usize + 2 == script.len() {
        Some((version, &script[2..]))
    } else {
        None
    }
}

/// `OP_0 <20 bytes>`, returning the pubkey hash
pub fn p2wpkh_hash(script: &[u8]) -> Option<&[u8]> {
    match witness_program(script) {
        Some((0, program)) if program.len() == 20 => Some(program),
        _ => None,
    }
}

pub fn is_p2wpkh(script: &[u8]) -> bool {
    p2wpkh_hash(script).is_some()
}

/// `OP_0 <32 bytes>`, returning the script hash
pub fn p2wsh_hash(script: &[u8]) -> Option<&[u8]> {
    match witness_program(script) {
        Some((0, program)) if program.len() == 32 => Some(program),
        _ => None,
    }
}

pub fn is_p2wsh(script: &[u8]) -> bool {
    p2wsh_hash(script).is_some()
}

/// Provably unspendable data carrier output
pub fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

/// True if every instruction is a push (OP_16 and below)
pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|item| match item {
        Ok((_, ins)) => ins.opcode() <= OP_16,
        Err(_) => false,
    })
}

/// Data of each push in a push-only script
pub fn push_items(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    for item in Instructions::new(script) {
        let (_, ins) = item.ok()?;
        match ins {
            Instruction::PushBytes { data, .. } => items.push(data.to_vec()),
            Instruction::Op(OP_1NEGATE) => items.push(vec![0x81]),
            Instruction::Op(op) => items.push(vec![small_int_value(op)?]),
        }
    }
    Some(items)
}

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`, returning m and the keys
pub fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<&[u8]>)> {
    let mut instructions = Vec::new();
    for item in Instructions::new(script) {
        instructions.push(item.ok()?.1);
    }
    if instructions.len() < 4 {
        return None;
    }
    let required = small_int_value(instructions[0].opcode())? as usize;
    let last = instructions.len() - 1;
    if instructions[last].opcode() != OP_CHECKMULTISIG {
        return None;
    }
    let total = small_int_value(instructions[last - 1].opcode())? as usize;
    let keys: Vec<&[u8]> = instructions[1..last - 1]
        .iter()
        .map(|ins| ins.push_data().filter(|d| d.len() == 33 || d.len() == 65))
        .collect::<Option<_>>()?;
    if keys.len() != total || required > total {
        return None;
    }
    Some((required, keys))
}

pub fn is_multisig(script: &[u8]) -> bool {
    parse_multisig(script).is_some()
}

// ============================================================================
// Construction
// ============================================================================

/// Incremental script builder with minimal pushes
#[derive(Debug, Default, Clone)]
pub struct Builder {
    bytes: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Builder { bytes: Vec::new() }
    }

    pub fn push_opcode(mut self, op: u8) -> Self {
        self.bytes.push(op);
        self
    }

    /// Push 0..=16 with its dedicated opcode
    pub fn push_int(self, n: u8) -> Self {
        self.push_opcode(small_int_opcode(n))
    }

    pub fn push_slice(mut self, data: &[u8]) -> Self {
        push_data(&mut self.bytes, data);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Append a push of `data` using the smallest push-data form
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

pub fn p2pkh_script(pubkey_hash: &[u8]) -> Vec<u8> {
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_bytes()
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    Builder::new().push_slice(pubkey).push_opcode(OP_CHECKSIG).into_bytes()
}

pub fn p2sh_script(script_hash: &[u8]) -> Vec<u8> {
    Builder::new().push_opcode(OP_HASH160).push_slice(script_hash).push_opcode(OP_EQUAL).into_bytes()
}

pub fn p2wpkh_script(pubkey_hash: &[u8]) -> Vec<u8> {
    Builder::new().push_opcode(OP_0).push_slice(pubkey_hash).into_bytes()
}

pub fn p2wsh_script(script_hash: &[u8]) -> Vec<u8> {
    Builder::new().push_opcode(OP_0).push_slice(script_hash).into_bytes()
}

/// `OP_m <keys>... OP_n OP_CHECKMULTISIG`
pub fn multisig_script(required: u8, pubkeys: &[&[u8]]) -> Vec<u8> {
    let mut builder = Builder::new().push_int(required);
    for key in pubkeys {
        builder = builder.push_slice(key);
    }
    builder.push_int(pubkeys.len() as u8).push_opcode(OP_CHECKMULTISIG).into_bytes()
}

/// Remove every occurrence of `pattern` that starts on an instruction boundary
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut result = Vec::with_capacity(script.len());
    let mut found = false;
    let mut pc = 0;
    let mut copied_to = 0;
    loop {
        result.extend_from_slice(&script[copied_to..pc]);
        while script.len() - pc >= pattern.len() && &script[pc..pc + pattern.len()] == pattern {
            pc += pattern.len();
            found = true;
        }
        copied_to = pc;
        if pc >= script.len() {
            break;
        }
        match read_instruction(script, pc) {
            Ok((_, next)) => pc = next,
            Err(_) => break,
        }
    }
    if !found {
        return script.to_vec();
    }
    result.extend_from_slice(&script[copied_to..]);
    result
}

/// Drop every OP_CODESEPARATOR, keeping any unparseable tail as is
pub fn remove_codeseparators(script: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(script.len());
    let mut segment_start = 0;
    let mut iter = Instructions::new(script);
    while let Some(Ok((pos, ins))) = iter.next() {
        if ins == Instruction::Op(OP_CODESEPARATOR) {
            result.extend_from_slice(&script[segment_start..pos]);
            segment_start = pos + 1;
        }
    }
    result.extend_from_slice(&script[segment_start..]);
    result
}
