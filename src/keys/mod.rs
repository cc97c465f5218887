/// Activation key codes
///
/// Wire format is `XXXX-XXXX-XXXX-XXXX`: four groups of four uppercase
/// alphanumerics joined by `-`, 19 characters in total. Generated codes draw
/// from an alphabet without visually ambiguous characters (0/O, 1/I/L).
/// Structural validation here is shared by issuance, redemption and the
/// presentation layer so they agree on the format exactly.

pub mod issuer;

pub use issuer::{IssuedKeys, KeyFilter, KeyIssuer, KeyListing, KeyStats, PlanKeyStats};

use crate::error::EngineError;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Characters used for generated codes
pub const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const GROUP_COUNT: usize = 4;
pub const GROUP_LEN: usize = 4;
pub const DELIMITER: char = '-';
/// Total length including delimiters
pub const CODE_LEN: usize = GROUP_COUNT * GROUP_LEN + GROUP_COUNT - 1;

/// Why a submitted code failed structural validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCode {
    #[error("key must be {expected} characters long, got {0}", expected = CODE_LEN)]
    WrongLength(usize),

    #[error("key must contain {expected} delimiters, got {0}", expected = GROUP_COUNT - 1)]
    WrongDelimiterCount(usize),

    #[error("group {group} must be {expected} characters, got {len}", expected = GROUP_LEN)]
    WrongGroupLength { group: usize, len: usize },

    #[error("key contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl From<MalformedCode> for EngineError {
    fn from(err: MalformedCode) -> Self {
        EngineError::MalformedInput(format!(
            "{}; expected format XXXX-XXXX-XXXX-XXXX",
            err
        ))
    }
}

/// Trim surrounding whitespace and uppercase
pub fn normalize(input: &str) -> String {
    input.trim().to_uppercase()
}

/// Normalize and structurally validate a user-entered code
pub fn parse_code(input: &str) -> Result<String, MalformedCode> {
    let code = normalize(input);

    let len = code.chars().count();
    if len != CODE_LEN {
        return Err(MalformedCode::WrongLength(len));
    }

    let delimiters = code.matches(DELIMITER).count();
    if delimiters != GROUP_COUNT - 1 {
        return Err(MalformedCode::WrongDelimiterCount(delimiters));
    }

    for (i, group) in code.split(DELIMITER).enumerate() {
        let group_len = group.chars().count();
        if group_len != GROUP_LEN {
            return Err(MalformedCode::WrongGroupLength {
                group: i + 1,
                len: group_len,
            });
        }
        if let Some(c) = group.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(MalformedCode::InvalidCharacter(c));
        }
    }

    Ok(code)
}

/// Generate a fresh code from the unambiguous alphabet
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(CODE_LEN);
    for group in 0..GROUP_COUNT {
        if group > 0 {
            code.push(DELIMITER);
        }
        for _ in 0..GROUP_LEN {
            let idx = rng.gen_range(0..KEY_ALPHABET.len());
            code.push(KEY_ALPHABET[idx] as char);
        }
    }
    code
}

/// One-way SHA-256 digest of a normalized code, hex encoded
pub fn digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}
