//! Handshake digest primitives.
//!
//! Digest-mode handshake packets hide a 32-byte HMAC-SHA256 digest at an
//! offset derived from four bytes of the packet itself. The digest covers
//! the rest of the packet, keyed with the sender's partial key. Responses
//! carry a trailing digest keyed with a value derived from the peer's
//! challenge digest.
//!
//! All offsets in this module are relative to the start of the 1536-byte
//! packet, i.e. just past the one-byte version prefix of C0/S0.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of C1/S1/C2/S2.
pub const PACKET_LEN: usize = 1536;

pub const DIGEST_LEN: usize = 32;

const HMAC_BLOCK: usize = 64;

/// Digest positions are taken modulo this value.
const DIGEST_SPAN: usize = 728;

/// Where a challenge digest may live, in the order they are probed.
pub const DIGEST_BASES: [usize; 2] = [772, 8];

/// Where this side writes its own challenge digest.
pub const WRITE_DIGEST_BASE: usize = 8;

const KEY_TAIL: [u8; 32] = [
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E, 0x57,
    0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

const SERVER_KEY_TEXT: &[u8; 36] = b"Genuine Adobe Flash Media Server 001";
const CLIENT_KEY_TEXT: &[u8; 30] = b"Genuine Adobe Flash Player 001";

const fn join<const A: usize, const N: usize>(text: &[u8; A]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut i = 0;
    while i < A {
        out[i] = text[i];
        i += 1;
    }
    while i < N {
        out[i] = KEY_TAIL[i - A];
        i += 1;
    }
    out
}

static SERVER_KEY: [u8; 68] = join::<36, 68>(SERVER_KEY_TEXT);
static CLIENT_KEY: [u8; 62] = join::<30, 62>(CLIENT_KEY_TEXT);

/// One side's key material.
#[derive(Debug, Clone, Copy)]
pub struct Keys {
    /// Text plus 32-byte tail. Keys response digests.
    pub full: &'static [u8],
    /// Text only. Keys challenge digests.
    pub partial: &'static [u8],
    /// Four bytes following the epoch in a challenge.
    pub version: [u8; 4],
}

pub static SERVER_KEYS: Keys = Keys {
    full: &SERVER_KEY,
    partial: SERVER_KEY_TEXT,
    version: [0x0D, 0x0E, 0x0A, 0x0D],
};

pub static CLIENT_KEYS: Keys = Keys {
    full: &CLIENT_KEY,
    partial: CLIENT_KEY_TEXT,
    version: [0x0C, 0x00, 0x0D, 0x0E],
};

// ── Digests ───────────────────────────────────────────────────────────────────

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn keyed(key: &[u8]) -> HmacSha256 {
    HmacSha256::new(&block_key(key).into())
}

/// Key padded to the SHA-256 block size; longer keys are hashed first.
fn block_key(key: &[u8]) -> [u8; HMAC_BLOCK] {
    let mut block = [0u8; HMAC_BLOCK];
    if key.len() > HMAC_BLOCK {
        block[..DIGEST_LEN].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    block
}

/// Digest of `packet` with the 32 bytes at `hole` left out.
pub fn make_digest(key: &[u8], packet: &[u8], hole: usize) -> [u8; DIGEST_LEN] {
    hmac_sha256(key, &[&packet[..hole], &packet[hole + DIGEST_LEN..]])
}

/// Offset of the digest whose locator bytes start at `base`.
pub fn digest_offset(packet: &[u8], base: usize) -> usize {
    let sum: usize = packet[base..base + 4].iter().map(|&b| b as usize).sum();
    sum % DIGEST_SPAN + base + 4
}

/// Locate a valid challenge digest, probing each base in turn.
pub fn find_digest(packet: &[u8], key: &[u8]) -> Option<usize> {
    if packet.len() < PACKET_LEN {
        return None;
    }
    DIGEST_BASES.iter().find_map(|&base| {
        let offset = digest_offset(packet, base);
        let mut mac = keyed(key);
        mac.update(&packet[..offset]);
        mac.update(&packet[offset + DIGEST_LEN..PACKET_LEN]);
        mac.verify_slice(&packet[offset..offset + DIGEST_LEN])
            .ok()
            .map(|_| offset)
    })
}

/// Embed a challenge digest in `packet`. Returns its offset.
pub fn write_digest(packet: &mut [u8], key: &[u8]) -> usize {
    let offset = digest_offset(packet, WRITE_DIGEST_BASE);
    let digest = make_digest(key, &packet[..PACKET_LEN], offset);
    packet[offset..offset + DIGEST_LEN].copy_from_slice(&digest);
    offset
}

/// Trailing digest of a response packet.
pub fn response_digest(key: &[u8], response: &[u8]) -> [u8; DIGEST_LEN] {
    hmac_sha256(key, &[&response[..PACKET_LEN - DIGEST_LEN]])
}

/// Check a peer's response against the challenge digest we sent.
///
/// `full_key` is the peer's full key; the response key is derived from it
/// and our own challenge digest.
pub fn verify_response(full_key: &[u8], own_digest: &[u8], response: &[u8]) -> bool {
    if response.len() < PACKET_LEN {
        return false;
    }
    let key = hmac_sha256(full_key, &[own_digest]);
    let mut mac = keyed(&key);
    mac.update(&response[..PACKET_LEN - DIGEST_LEN]);
    mac.verify_slice(&response[PACKET_LEN - DIGEST_LEN..PACKET_LEN]).is_ok()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("handshake packet too short: {0} bytes")]
    Truncated(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
