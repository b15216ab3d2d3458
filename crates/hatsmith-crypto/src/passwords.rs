//! Random password and passphrase generation

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bip39::Language;
use rand::{Rng, RngCore};
use secrecy::SecretString;
use zeroize::Zeroizing;

/// Words in a generated passphrase.
pub const PASSPHRASE_WORDS: usize = 6;

/// 32 random bytes as URL-safe base64 (43 characters).
pub fn generate_password() -> SecretString {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(bytes.as_mut_slice());
    SecretString::from(URL_SAFE_NO_PAD.encode(bytes.as_slice()))
}

/// `words` words drawn uniformly from the BIP-39 English list, joined by `-`.
pub fn generate_passphrase(words: usize) -> SecretString {
    let list = Language::English.word_list();
    let mut rng = rand::thread_rng();
    let phrase = (0..words)
        .map(|_| list[rng.gen_range(0..list.len())])
        .collect::<Vec<_>>()
        .join("-");
    SecretString::from(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.expose_secret().len(), 43);
        assert!(pw
            .expose_secret()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_passwords_differ() {
        assert_ne!(
            generate_password().expose_secret(),
            generate_password().expose_secret()
        );
    }

    #[test]
    fn test_passphrase_words() {
        let phrase = generate_passphrase(PASSPHRASE_WORDS);
        let list = Language::English.word_list();
        let words: Vec<&str> = phrase.expose_secret().split('-').collect();
        assert_eq!(words.len(), PASSPHRASE_WORDS);
        assert!(words.iter().all(|w| list.contains(w)));
    }
}
