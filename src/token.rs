//! Opaque tokens for upstream URLs embedded in rewritten manifests.
//!
//! A token is a truncated HMAC-SHA256 tag over the channel id and the URL,
//! followed by the URL XOR-ed with a per-process random key, all URL-safe
//! base64 without padding. The tag binds a token to the channel whose
//! manifest minted it; a token altered or replayed under another channel is
//! rejected. Tokens are only valid for the lifetime of the process that
//! minted them, which matches the lifetime of the manifests they sit in.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 64;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct TokenCodec {
  key: [u8; KEY_LEN],
  mac: HmacSha256,
}

impl TokenCodec {
  pub fn random() -> Self {
    let mut rng = rand::thread_rng();
    let mut key = [0u8; KEY_LEN];
    let mut mac_key = [0u8; KEY_LEN];
    rng.fill(&mut key[..]);
    rng.fill(&mut mac_key[..]);
    Self::from_keys(key, mac_key)
  }

  #[cfg(test)]
  pub fn with_key(key: [u8; KEY_LEN]) -> Self {
    Self::from_keys(key, key)
  }

  fn from_keys(key: [u8; KEY_LEN], mac_key: [u8; KEY_LEN]) -> Self {
    let mac = HmacSha256::new_from_slice(&mac_key).expect("HMAC accepts keys of any length");
    Self { key, mac }
  }

  pub fn encode(&self, channel_id: &str, url: &str) -> String {
    let mut raw = self.tag(channel_id, url.as_bytes()).to_vec();
    raw.extend(self.xor(url.as_bytes()));
    URL_SAFE_NO_PAD.encode(raw)
  }

  /// Recover the URL behind `token`, provided it was minted for `channel_id`.
  pub fn decode(&self, channel_id: &str, token: &str) -> Result<String> {
    // Padded input from older clients is accepted.
    let raw = URL_SAFE_NO_PAD
      .decode(token.trim_end_matches('='))
      .map_err(|_| Error::not_found("invalid proxy token"))?;
    if raw.len() <= TAG_LEN {
      return Err(Error::not_found("invalid proxy token"));
    }
    let (tag, body) = raw.split_at(TAG_LEN);
    let url = self.xor(body);
    self
      .authenticator(channel_id, &url)
      .verify_truncated_left(tag)
      .map_err(|_| Error::not_found("invalid proxy token"))?;
    String::from_utf8(url).map_err(|_| Error::not_found("invalid proxy token"))
  }

  fn authenticator(&self, channel_id: &str, url: &[u8]) -> HmacSha256 {
    let mut mac = self.mac.clone();
    mac.update(channel_id.as_bytes());
    mac.update(&[0]);
    mac.update(url);
    mac
  }

  fn tag(&self, channel_id: &str, url: &[u8]) -> [u8; TAG_LEN] {
    let digest = self.authenticator(channel_id, url).finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
  }

  fn xor(&self, input: &[u8]) -> Vec<u8> {
    input.iter().enumerate().map(|(i, b)| b ^ self.key[i % KEY_LEN]).collect()
  }
}

impl std::fmt::Debug for TokenCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TokenCodec").finish_non_exhaustive()
  }
}

/// Plain URL-safe base64, used for logo URLs which are not secret.
pub fn encode_plain(input: &str) -> String {
  URL_SAFE_NO_PAD.encode(input.as_bytes())
}

pub fn decode_plain(input: &str) -> Result<String> {
  let raw = URL_SAFE_NO_PAD.decode(input.trim_end_matches('=')).map_err(|_| Error::not_found("invalid logo reference"))?;
  String::from_utf8(raw).map_err(|_| Error::not_found("invalid logo reference"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_hides_url_and_decodes() {
    let codec = TokenCodec::random();
    let url = "https://cdn.upstream.example/hls/seg-001.ts?tok=abc";
    let token = codec.encode("A", url);
    assert!(!token.contains("upstream"));
    assert!(!token.contains('='));
    assert_eq!(codec.decode("A", &token).unwrap(), url);
  }

  #[test]
  fn token_from_other_process_is_rejected() {
    let a = TokenCodec::with_key([1; KEY_LEN]);
    let b = TokenCodec::with_key([2; KEY_LEN]);
    let token = a.encode("A", "https://example.com/a");
    assert!(matches!(b.decode("A", &token), Err(Error::NotFound(_))));
  }

  #[test]
  fn token_is_bound_to_its_channel() {
    let codec = TokenCodec::random();
    let token = codec.encode("A", "https://example.com/a");
    assert!(matches!(codec.decode("B", &token), Err(Error::NotFound(_))));
  }

  #[test]
  fn known_plaintext_cannot_retarget_a_token() {
    let codec = TokenCodec::random();
    let known = "https://edge.upstream.test/A/key.bin";
    let wanted = "http://169.254.169.254/latest/xxxxxx";
    assert_eq!(known.len(), wanted.len());

    let mut raw = URL_SAFE_NO_PAD.decode(codec.encode("A", known)).unwrap();
    // Flip the body from the known URL to the wanted one, keeping the tag.
    for (i, (k, w)) in known.bytes().zip(wanted.bytes()).enumerate() {
      raw[TAG_LEN + i] ^= k ^ w;
    }
    let forged = URL_SAFE_NO_PAD.encode(&raw);
    assert!(matches!(codec.decode("A", &forged), Err(Error::NotFound(_))));
  }

  #[test]
  fn rejects_garbage() {
    let codec = TokenCodec::random();
    assert!(matches!(codec.decode("A", "@@@"), Err(Error::NotFound(_))));
    assert!(codec.decode("A", "===").is_err());
    assert!(codec.decode("A", "AAAA").is_err());
  }

  #[test]
  fn plain_helpers() {
    let encoded = encode_plain("https://cdn.example.com/logo.png");
    assert_eq!(decode_plain(&encoded).unwrap(), "https://cdn.example.com/logo.png");
    assert_eq!(decode_plain(&format!("{encoded}==")).unwrap(), "https://cdn.example.com/logo.png");
    assert!(decode_plain("!!").is_err());
  }
}
