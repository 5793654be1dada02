//! Secret material for cluster bootstrap
//!
//! Generates the bootstrap token, certificate key, encryption secret and
//! trustd token that end up in the bootstrap bundle. All randomness comes
//! from an [`EntropySource`]; the default is the aws-lc-rs RNG, which is safe
//! to share between threads.
//!
//! # Formats
//!
//! | Secret | Shape |
//! |---|---|
//! | bootstrap / trustd token | `^[0-9a-z]{6}\.[0-9a-z]{16}$` |
//! | certificate key | 64 lowercase hex chars (SHA-256) |
//! | encryption secret | standard base64 of 32 random bytes |

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Characters a bootstrap token can consist of
pub const TOKEN_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random bytes at or above this value are discarded.
///
/// 256 mod 36 = 4, so only the range [0, 252) maps evenly onto the alphabet.
pub const MAX_BYTE_VALUE: u8 = 252;

/// Length of the token id (before the dot)
pub const TOKEN_ID_LEN: usize = 6;

/// Length of the token secret (after the dot)
pub const TOKEN_SECRET_LEN: usize = 16;

/// Number of random bytes behind the certificate key and encryption secret
pub const SECRET_BYTES: usize = 32;

/// Secret generation errors
#[derive(Debug, Error)]
pub enum SecretError {
    /// The secure random source failed. The host is broken; never retried.
    #[error("secure random source failed: {0}")]
    Entropy(String),
}

/// Source of cryptographically secure random bytes
#[cfg_attr(test, automock)]
pub trait EntropySource: Send + Sync {
    /// Fill `dest` entirely with random bytes
    fn fill(&self, dest: &mut [u8]) -> Result<(), SecretError>;
}

/// FIPS-validated RNG from aws-lc-rs
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEntropy;

impl EntropySource for SystemEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), SecretError> {
        aws_lc_rs::rand::fill(dest).map_err(|e| SecretError::Entropy(e.to_string()))
    }
}

/// An opaque secret string
///
/// `Debug` never prints the value, only a short SHA-256 fingerprint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(Zeroizing<String>);

impl Token {
    /// Wrap an existing secret
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The secret value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 bytes of the SHA-256 of the value, hex encoded
    pub fn fingerprint(&self) -> String {
        use aws_lc_rs::digest::{digest, SHA256};
        let hash = digest(&SHA256, self.0.as_bytes());
        hex::encode(&hash.as_ref()[..8])
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generator for every secret in the bootstrap bundle
#[derive(Clone, Debug, Default)]
pub struct SecretGenerator<E = SystemEntropy> {
    entropy: E,
}

impl SecretGenerator<SystemEntropy> {
    /// Generator backed by the system RNG
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: EntropySource> SecretGenerator<E> {
    /// Generator backed by a custom entropy source
    pub fn with_entropy(entropy: E) -> Self {
        Self { entropy }
    }

    /// Random string of `length` characters drawn uniformly from [`TOKEN_ALPHABET`]
    ///
    /// Uses rejection sampling: bytes >= [`MAX_BYTE_VALUE`] are discarded and
    /// redrawn, so every character has probability exactly 1/36.
    pub fn random_token(&self, length: usize) -> Result<String, SecretError> {
        let mut token = String::with_capacity(length);
        if length == 0 {
            return Ok(token);
        }

        // Rejections are rare (4/256), so twice the length is almost always one draw.
        let mut pool = Zeroizing::new(vec![0u8; length * 2]);
        let mut cursor = pool.len();

        while token.len() < length {
            if cursor == pool.len() {
                self.entropy.fill(&mut pool)?;
                cursor = 0;
            }
            let b = pool[cursor];
            cursor += 1;

            if b >= MAX_BYTE_VALUE {
                continue;
            }
            token.push(char::from(TOKEN_ALPHABET[usize::from(b) % TOKEN_ALPHABET.len()]));
        }

        Ok(token)
    }

    /// Token of the form `<first>.<second>` (kubeadm / trustd style)
    pub fn token_pair(&self, first: usize, second: usize) -> Result<Token, SecretError> {
        let id = self.random_token(first)?;
        let secret = Zeroizing::new(self.random_token(second)?);
        Ok(Token::new(format!("{}.{}", id, secret.as_str())))
    }

    /// Kubeadm bootstrap token (`xxxxxx.xxxxxxxxxxxxxxxx`)
    pub fn bootstrap_token(&self) -> Result<Token, SecretError> {
        self.token_pair(TOKEN_ID_LEN, TOKEN_SECRET_LEN)
    }

    /// Kubeadm certificate key: hex SHA-256 over 32 random alphabet bytes
    pub fn certificate_key(&self) -> Result<Token, SecretError> {
        use aws_lc_rs::digest::{digest, SHA256};

        let key = Zeroizing::new(self.random_token(SECRET_BYTES)?);
        let hash = digest(&SHA256, key.as_bytes());
        Ok(Token::new(hex::encode(hash.as_ref())))
    }

    /// AES-CBC encryption secret: standard base64 of 32 raw random bytes
    pub fn encryption_token(&self) -> Result<Token, SecretError> {
        let mut key = Zeroizing::new([0u8; SECRET_BYTES]);
        self.entropy.fill(&mut key[..])?;
        Ok(Token::new(STANDARD.encode(&key[..])))
    }
}

/// Check that `token` has the `^[0-9a-z]{6}\.[0-9a-z]{16}$` shape
pub fn is_valid_token_format(token: &str) -> bool {
    let in_alphabet = |s: &str| s.bytes().all(|b| TOKEN_ALPHABET.contains(&b));

    match token.split_once('.') {
        Some((id, secret)) => {
            id.len() == TOKEN_ID_LEN
                && secret.len() == TOKEN_SECRET_LEN
                && in_alphabet(id)
                && in_alphabet(secret)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Entropy mock that cycles through a fixed byte sequence
    fn cycling_entropy(seq: &'static [u8]) -> MockEntropySource {
        let mut mock = MockEntropySource::new();
        mock.expect_fill().returning(move |buf| {
            for (dst, src) in buf.iter_mut().zip(seq.iter().cycle()) {
                *dst = *src;
            }
            Ok(())
        });
        mock
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(6)]
    #[case(16)]
    #[case(257)]
    fn random_token_has_requested_length_over_alphabet(#[case] length: usize) {
        let token = SecretGenerator::new().random_token(length).unwrap();
        assert_eq!(token.len(), length);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }

    /// Story: bytes in the biased tail are thrown away
    ///
    /// 252..=255 would map onto '0'..'3' a second time and skew the
    /// distribution, so they must be skipped rather than reduced modulo 36.
    #[test]
    fn story_rejection_sampling_discards_biased_bytes() {
        let generator =
            SecretGenerator::with_entropy(cycling_entropy(&[252, 255, 0, 35, 36, 251, 253, 254]));

        let token = generator.random_token(4).unwrap();
        assert_eq!(token, "0z0z");
    }

    #[test]
    fn entropy_failure_is_surfaced() {
        let mut mock = MockEntropySource::new();
        mock.expect_fill()
            .returning(|_| Err(SecretError::Entropy("rng offline".to_string())));
        let generator = SecretGenerator::with_entropy(mock);

        assert!(matches!(
            generator.random_token(6),
            Err(SecretError::Entropy(msg)) if msg == "rng offline"
        ));
        assert!(generator.bootstrap_token().is_err());
        assert!(generator.certificate_key().is_err());
        assert!(generator.encryption_token().is_err());
    }

    /// Story: symbols are uniformly distributed
    ///
    /// Chi-square over 36 buckets (35 degrees of freedom). The 0.001 critical
    /// value is ~66.6; 90 leaves a wide margin against flakes while still
    /// catching a plain `b % 36` implementation on a skewed source.
    #[test]
    fn story_symbols_are_uniform() {
        const PER_SYMBOL: usize = 2000;
        let sample = SecretGenerator::new()
            .random_token(TOKEN_ALPHABET.len() * PER_SYMBOL)
            .unwrap();

        let mut counts = [0usize; 36];
        for b in sample.bytes() {
            let idx = TOKEN_ALPHABET.iter().position(|c| *c == b).unwrap();
            counts[idx] += 1;
        }

        let expected = PER_SYMBOL as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - expected;
                d * d / expected
            })
            .sum();

        assert!(chi_square < 90.0, "chi-square {chi_square} too high");
    }

    #[test]
    fn bootstrap_token_matches_kubeadm_format() {
        let generator = SecretGenerator::new();
        for _ in 0..32 {
            let token = generator.bootstrap_token().unwrap();
            assert!(is_valid_token_format(token.as_str()), "{}", token.as_str());
        }
    }

    #[test]
    fn tokens_are_unique() {
        let generator = SecretGenerator::new();
        let a = generator.bootstrap_token().unwrap();
        let b = generator.bootstrap_token().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn certificate_key_is_sha256_hex() {
        let key = SecretGenerator::new().certificate_key().unwrap();
        assert_eq!(key.as_str().len(), 64);
        assert!(key
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn encryption_token_decodes_to_32_bytes() {
        let token = SecretGenerator::new().encryption_token().unwrap();
        let raw = STANDARD.decode(token.as_str()).unwrap();
        assert_eq!(raw.len(), SECRET_BYTES);
    }

    #[rstest]
    #[case("abcdef.0123456789abcdef", true)]
    #[case("abcde.0123456789abcdef", false)]
    #[case("abcdef.0123456789abcde", false)]
    #[case("ABCDEF.0123456789abcdef", false)]
    #[case("abcdef0123456789abcdef", false)]
    #[case("abcdef.0123456789abcdef.", false)]
    fn token_format_validation(#[case] token: &str, #[case] valid: bool) {
        assert_eq!(is_valid_token_format(token), valid);
    }

    /// Story: secrets never leak through debug output
    #[test]
    fn story_debug_output_hides_secret() {
        let token = SecretGenerator::new().bootstrap_token().unwrap();
        let debug = format!("{:?}", token);

        assert!(!debug.contains(token.as_str()));
        assert!(debug.contains(&token.fingerprint()));
    }
}
