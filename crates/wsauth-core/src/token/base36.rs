//! Base-36 integer encoding (`0-9a-z`).
//!
//! Base 36 keeps the timestamp and id fields short: a timestamp a few years
//! after the token epoch fits in five or six characters.  Encoding always
//! produces lowercase; decoding accepts either case, but since verification
//! compares the whole re-derived token, only the canonical lowercase form can
//! ever verify.

use thiserror::Error;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `u64::MAX` is `3w5e11264sgsf`: thirteen digits.
const MAX_DIGITS: usize = 13;

/// Errors produced by [`decode_base36`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Base36Error {
    #[error("empty base36 string")]
    Empty,

    #[error("base36 string longer than {MAX_DIGITS} characters")]
    TooLong,

    #[error("invalid base36 character {0:?}")]
    InvalidChar(char),

    #[error("base36 value does not fit in 64 bits")]
    Overflow,
}

/// Encodes a non-negative integer as lowercase base 36.
///
/// ```rust
/// use wsauth_core::token::encode_base36;
///
/// assert_eq!(encode_base36(0), "0");
/// assert_eq!(encode_base36(35), "z");
/// assert_eq!(encode_base36(36), "10");
/// ```
pub fn encode_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::with_capacity(MAX_DIGITS);
    while value > 0 {
        digits.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    // Every byte comes from ALPHABET, so this is always valid ASCII.
    digits.into_iter().map(char::from).collect()
}

/// Decodes a base-36 string into an integer.
///
/// Unlike `u64::from_str_radix`, a leading `+` is rejected: only `0-9`,
/// `a-z` and `A-Z` are accepted.
///
/// # Errors
///
/// Returns a [`Base36Error`] for empty input, input longer than 13
/// characters, characters outside the alphabet, or values above `u64::MAX`.
pub fn decode_base36(input: &str) -> Result<u64, Base36Error> {
    if input.is_empty() {
        return Err(Base36Error::Empty);
    }
    if input.len() > MAX_DIGITS {
        return Err(Base36Error::TooLong);
    }

    input.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36).ok_or(Base36Error::InvalidChar(c))?;
        acc.checked_mul(36)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or(Base36Error::Overflow)
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
