//! Shared machinery for the FFX family of format-preserving ciphers:
//! parameter validation, the AES-CBC-based PRF, and conversion between
//! numeral strings and integers over an arbitrary alphabet.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::error::{Error, Result};

pub(crate) const BLOCK_SIZE: usize = 16;

enum AesVariant {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl AesVariant {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(AesVariant::Aes128(Box::new(Aes128::new(
                GenericArray::from_slice(key),
            )))),
            24 => Ok(AesVariant::Aes192(Box::new(Aes192::new(
                GenericArray::from_slice(key),
            )))),
            32 => Ok(AesVariant::Aes256(Box::new(Aes256::new(
                GenericArray::from_slice(key),
            )))),
            n => Err(Error::Crypto(format!("invalid key length {n}"))),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesVariant::Aes128(c) => c.encrypt_block(block),
            AesVariant::Aes192(c) => c.encrypt_block(block),
            AesVariant::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// Validated FFX parameters plus the keyed block cipher.
pub(crate) struct Context {
    cipher: AesVariant,
    pub radix: usize,
    pub alpha: Vec<char>,
    pub min_text_len: u64,
    pub max_text_len: u64,
    pub min_tweak_len: usize,
    /// Zero means unbounded.
    pub max_tweak_len: usize,
    pub tweak: Vec<u8>,
}

impl Context {
    pub fn new(
        key: &[u8],
        tweak: Vec<u8>,
        max_text_len: u64,
        min_tweak_len: usize,
        max_tweak_len: usize,
        radix: usize,
        alpha: Vec<char>,
    ) -> Result<Self> {
        let cipher = AesVariant::new(key)?;

        if radix < 2 || radix > alpha.len() {
            return Err(Error::Crypto(
                "unsupported radix or incompatible alphabet".into(),
            ));
        }

        // for ff1 (and ff3-1): radix**minlen >= 1000000, so
        // minlen = ceil(6 / log10(radix))
        let min_text_len = (6.0 / (radix as f64).log10()).ceil() as u64;
        if min_text_len < 2 || min_text_len > max_text_len {
            return Err(Error::InvalidLength("invalid text length bounds".into()));
        }

        if min_tweak_len > max_tweak_len
            || tweak.len() < min_tweak_len
            || (max_tweak_len > 0 && tweak.len() > max_tweak_len)
        {
            return Err(Error::InvalidLength(
                "invalid tweak length or bounds".into(),
            ));
        }

        Ok(Context {
            cipher,
            radix,
            alpha,
            min_text_len,
            max_text_len,
            min_tweak_len,
            max_tweak_len,
            tweak,
        })
    }

    /// CBC-MAC over `buf` with a zero IV, keeping only the final block.
    pub fn prf(&self, buf: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(Error::Crypto(format!(
                "prf input must be a multiple of {BLOCK_SIZE} bytes"
            )));
        }
        let mut block = [0u8; BLOCK_SIZE];
        for chunk in buf.chunks(BLOCK_SIZE) {
            for (b, c) in block.iter_mut().zip(chunk) {
                *b ^= c;
            }
            self.cipher.encrypt_block(&mut block);
        }
        Ok(block)
    }

    /// Single-block encryption (the PRF over exactly one block).
    pub fn ciph(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut out = *block;
        self.cipher.encrypt_block(&mut out);
        out
    }
}

/// Interpret `s` as a number in the given alphabet, most significant
/// digit first.
pub(crate) fn string_to_number(radix: usize, alpha: &[char], s: &[char]) -> Result<BigInt> {
    let radix = BigInt::from(radix);
    let mut n = BigInt::zero();
    for c in s {
        let digit = alpha
            .iter()
            .position(|a| a == c)
            .ok_or(Error::InvalidInputCharacter)?;
        n = n * &radix + BigInt::from(digit);
    }
    Ok(n)
}

/// Express `n` in the given alphabet, left-padded with the zero digit to
/// `pad` characters.
pub(crate) fn number_to_string(
    radix: usize,
    alpha: &[char],
    n: &BigInt,
    pad: usize,
) -> Result<Vec<char>> {
    let radix_big = BigInt::from(radix);
    let mut digits = Vec::new();
    let mut n = n.clone();
    while !n.is_zero() {
        let digit = (&n % &radix_big)
            .to_usize()
            .ok_or_else(|| Error::Crypto("digit conversion".into()))?;
        digits.push(alpha[digit]);
        n /= &radix_big;
    }
    while digits.len() < pad {
        digits.push(alpha[0]);
    }
    digits.reverse();
    Ok(digits)
}
