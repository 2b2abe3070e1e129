//! 256-bit unsigned integer for proof-of-work targets
//!
//! Eight 32-bit limbs, least significant first. Arithmetic keeps the full
//! 256-bit width; bits shifted or carried past the top are dropped.

use crate::types::HashId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul, Not, Shl, Shr, Sub};

const WIDTH: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Uint256(pub [u32; WIDTH]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0; WIDTH]);
    pub const ONE: Uint256 = Uint256([1, 0, 0, 0, 0, 0, 0, 0]);
    pub const MAX: Uint256 = Uint256([u32::MAX; WIDTH]);

    pub fn from_u64(value: u64) -> Self {
        let mut limbs = [0u32; WIDTH];
        limbs[0] = value as u32;
        limbs[1] = (value >> 32) as u32;
        Uint256(limbs)
    }

    /// Lowest 64 bits
    pub fn low_u64(&self) -> u64 {
        self.0[0] as u64 | ((self.0[1] as u64) << 32)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    /// Position of the highest set bit, 1-indexed; zero for zero
    pub fn bits(&self) -> u32 {
        for pos in (0..WIDTH).rev() {
            let limb = self.0[pos];
            if limb != 0 {
                return 32 * pos as u32 + (32 - limb.leading_zeros());
            }
        }
        0
    }

    /// Interpret 32 little-endian bytes (wire order of a hash)
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u32; WIDTH];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = i * 4;
            *limb = u32::from_le_bytes([bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]);
        }
        Uint256(limbs)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            bytes[i * 4..(i + 1) * 4].copy_from_slice(&limb.to_le_bytes());
        }
        bytes
    }

    pub fn from_hash(hash: &HashId) -> Self {
        Uint256::from_le_bytes(hash.as_bytes())
    }

    pub fn to_hash(&self) -> HashId {
        HashId(self.to_le_bytes())
    }

    /// Parse 64 hex digits, most significant first
    pub fn from_be_hex(s: &str) -> Result<Self, hex::FromHexError> {
        HashId::from_hex(s).map(|h| Uint256::from_hash(&h))
    }

    pub fn shl_bits(&self, shift: u32) -> Self {
        if shift >= 256 {
            return Uint256::ZERO;
        }
        let mut result = Uint256::ZERO;
        let limb_shift = (shift / 32) as usize;
        let bit_shift = shift % 32;
        for i in 0..WIDTH {
            if i + limb_shift < WIDTH {
                result.0[i + limb_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + limb_shift + 1 < WIDTH {
                    result.0[i + limb_shift + 1] |= self.0[i] >> (32 - bit_shift);
                }
            }
        }
        result
    }

    pub fn shr_bits(&self, shift: u32) -> Self {
        if shift >= 256 {
            return Uint256::ZERO;
        }
        let mut result = Uint256::ZERO;
        let limb_shift = (shift / 32) as usize;
        let bit_shift = shift % 32;
        for i in limb_shift..WIDTH {
            result.0[i - limb_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > limb_shift {
                result.0[i - limb_shift - 1] |= self.0[i] << (32 - bit_shift);
            }
        }
        result
    }

    /// Schoolbook multiplication by a 32-bit factor
    pub fn mul_u32(&self, factor: u32) -> Self {
        let mut result = Uint256::ZERO;
        let mut carry: u64 = 0;
        for i in 0..WIDTH {
            let n = carry + factor as u64 * self.0[i] as u64;
            result.0[i] = n as u32;
            carry = n >> 32;
        }
        result
    }

    /// Schoolbook multiplication, truncated to 256 bits
    pub fn mul_wide(&self, other: &Uint256) -> Self {
        let mut result = Uint256::ZERO;
        for j in 0..WIDTH {
            let mut carry: u64 = 0;
            for i in 0..WIDTH - j {
                let n = carry + result.0[i + j] as u64 + self.0[j] as u64 * other.0[i] as u64;
                result.0[i + j] = n as u32;
                carry = n >> 32;
            }
        }
        result
    }

    /// Floor division; `None` when dividing by zero
    pub fn checked_div(&self, divisor: &Uint256) -> Option<Self> {
        let div_bits = divisor.bits();
        if div_bits == 0 {
            return None;
        }
        let num_bits = self.bits();
        if div_bits > num_bits {
            return Some(Uint256::ZERO);
        }
        let mut num = *self;
        let mut quotient = Uint256::ZERO;
        let mut shift = (num_bits - div_bits) as i32;
        let mut div = divisor.shl_bits(shift as u32);
        while shift >= 0 {
            if num >= div {
                num = num - div;
                quotient.0[(shift / 32) as usize] |= 1 << (shift & 31);
            }
            div = div.shr_bits(1);
            shift -= 1;
        }
        Some(quotient)
    }

    /// Decode the compact "size + mantissa" form.
    ///
    /// Returns the value together with the negative and overflow flags.
    pub fn from_compact(compact: u32) -> (Self, bool, bool) {
        let size = compact >> 24;
        let mut word = compact & 0x007f_ffff;
        let value = if size <= 3 {
            word >>= 8 * (3 - size);
            Uint256::from_u64(word as u64)
        } else {
            Uint256::from_u64(word as u64).shl_bits(8 * (size - 3))
        };
        let negative = word != 0 && (compact & 0x0080_0000) != 0;
        let overflow = word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
        (value, negative, overflow)
    }

    /// In-place form of [`Uint256::from_compact`], returning (negative, overflow)
    pub fn set_compact(&mut self, compact: u32) -> (bool, bool) {
        let (value, negative, overflow) = Uint256::from_compact(compact);
        *self = value;
        (negative, overflow)
    }

    /// Encode into compact form
    pub fn compact(&self, negative: bool) -> u32 {
        let mut size = (self.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.low_u64() << (8 * (3 - size))) as u32
        } else {
            self.shr_bits(8 * (size - 3)).low_u64() as u32
        };
        // The 0x00800000 bit is the sign; move into the next size byte instead.
        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact |= size << 24;
        if negative && (compact & 0x007f_ffff) != 0 {
            compact |= 0x0080_0000;
        }
        compact
    }
}

impl PartialOrd for Uint256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uint256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl Shl<u32> for Uint256 {
    type Output = Uint256;

    fn shl(self, shift: u32) -> Uint256 {
        self.shl_bits(shift)
    }
}

impl Shr<u32> for Uint256 {
    type Output = Uint256;

    fn shr(self, shift: u32) -> Uint256 {
        self.shr_bits(shift)
    }
}

impl Add for Uint256 {
    type Output = Uint256;

    fn add(self, other: Uint256) -> Uint256 {
        let mut result = Uint256::ZERO;
        let mut carry: u64 = 0;
        for i in 0..WIDTH {
            let n = carry + self.0[i] as u64 + other.0[i] as u64;
            result.0[i] = n as u32;
            carry = n >> 32;
        }
        result
    }
}

impl Sub for Uint256 {
    type Output = Uint256;

    /// Wrapping subtraction (two's complement negate then add)
    fn sub(self, other: Uint256) -> Uint256 {
        self + (!other + Uint256::ONE)
    }
}

impl Not for Uint256 {
    type Output = Uint256;

    fn not(self) -> Uint256 {
        let mut result = self;
        for limb in result.0.iter_mut() {
            *limb = !*limb;
        }
        result
    }
}

impl Mul for Uint256 {
    type Output = Uint256;

    fn mul(self, other: Uint256) -> Uint256 {
        self.mul_wide(&other)
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_hash(), f)
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint256({})", self)
    }
}

impl Serialize for Uint256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uint256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uint256::from_be_hex(&s).map_err(serde::de::Error::custom)
    }
}
