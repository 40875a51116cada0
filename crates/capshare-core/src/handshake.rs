//! Link handshake and encrypted framing.
//!
//! - Each side sends `x25519_pub || nonce || ed25519_pub || sig`, where `sig`
//!   signs `x25519_pub || nonce` with the sender's identity key. The
//!   signature binds the ephemeral key to the identity the peer claims; it
//!   does not decide whether that identity is welcome. Any identity is
//!   accepted, which makes this a trusted-local-network protocol.
//! - The session key is HKDF-SHA256 over the X25519 shared secret with
//!   `nonce_initiator || nonce_responder` as info.
//! - Frames are `u32 BE length || 24-byte random nonce || ciphertext`
//!   sealed with XChaCha20-Poly1305.

use crate::keys::{fingerprint_of, Identity};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use ed25519_dalek::Signature;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};
use zeroize::Zeroizing;

const PUBKEY_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const SIG_LEN: usize = 64;
const HELLO_LEN: usize = PUBKEY_LEN + NONCE_LEN + PUBKEY_LEN + SIG_LEN;
const XNONCE_LEN: usize = 24;

/// Largest encrypted frame accepted from a peer. A resource chunk plus its
/// encoding and AEAD overhead stays far below this.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("peer signature does not verify")]
    BadSignature,
}

/// Encrypted channel state shared by a link's reader and writer.
pub struct SecureChannel {
    aead: XChaCha20Poly1305,
    peer_public_key: [u8; 32],
}

struct Hello {
    x_pub: [u8; PUBKEY_LEN],
    nonce: [u8; NONCE_LEN],
    identity_pub: [u8; PUBKEY_LEN],
}

async fn write_lp<T: AsyncWrite + Unpin + Send>(transport: &mut T, data: &[u8]) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

async fn read_lp<T: AsyncRead + Unpin + Send>(transport: &mut T) -> std::io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

fn build_hello(identity: &Identity, x_pub: &X25519Public, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mut to_sign = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN);
    to_sign.extend_from_slice(x_pub.as_bytes());
    to_sign.extend_from_slice(nonce);
    let sig = identity.sign(&to_sign);

    let mut message = Vec::with_capacity(HELLO_LEN);
    message.extend_from_slice(&to_sign);
    message.extend_from_slice(&identity.public_key_bytes());
    message.extend_from_slice(&sig.to_bytes());
    message
}

fn parse_hello(buf: &[u8]) -> Result<Hello, HandshakeError> {
    if buf.len() != HELLO_LEN {
        return Err(HandshakeError::Crypto(format!(
            "hello is {} bytes, expected {}",
            buf.len(),
            HELLO_LEN
        )));
    }
    let (signed, rest) = buf.split_at(PUBKEY_LEN + NONCE_LEN);
    let (identity_pub, sig) = rest.split_at(PUBKEY_LEN);

    let mut hello = Hello {
        x_pub: [0u8; PUBKEY_LEN],
        nonce: [0u8; NONCE_LEN],
        identity_pub: [0u8; PUBKEY_LEN],
    };
    hello.x_pub.copy_from_slice(&signed[..PUBKEY_LEN]);
    hello.nonce.copy_from_slice(&signed[PUBKEY_LEN..]);
    hello.identity_pub.copy_from_slice(identity_pub);

    let sig = Signature::from_slice(sig).map_err(|_| HandshakeError::BadSignature)?;
    Identity::verify_with_pubkey(&hello.identity_pub, signed, &sig)
        .map_err(|_| HandshakeError::BadSignature)?;
    Ok(hello)
}

fn derive_channel(
    shared: SharedSecret,
    nonce_initiator: &[u8; NONCE_LEN],
    nonce_responder: &[u8; NONCE_LEN],
    peer_public_key: [u8; 32],
) -> Result<SecureChannel, HandshakeError> {
    if !shared.was_contributory() {
        return Err(HandshakeError::Crypto("non-contributory key exchange".into()));
    }

    let info = [&nonce_initiator[..], &nonce_responder[..]].concat();
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut okm[..])
        .map_err(|_| HandshakeError::Crypto("HKDF expand failed".into()))?;

    let aead = XChaCha20Poly1305::new(Key::from_slice(&okm[..]));
    Ok(SecureChannel {
        aead,
        peer_public_key,
    })
}

fn fresh_ephemeral() -> (EphemeralSecret, X25519Public, [u8; NONCE_LEN]) {
    let x_secret = EphemeralSecret::random_from_rng(OsRng);
    let x_pub = X25519Public::from(&x_secret);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    (x_secret, x_pub, nonce)
}

/// Side that opened the connection.
pub async fn initiator_handshake<T>(
    identity: &Identity,
    transport: &mut T,
) -> Result<SecureChannel, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (x_secret, x_pub, nonce_a) = fresh_ephemeral();
    write_lp(transport, &build_hello(identity, &x_pub, &nonce_a)).await?;

    let peer = parse_hello(&read_lp(transport).await?)?;
    let shared = x_secret.diffie_hellman(&X25519Public::from(peer.x_pub));
    derive_channel(shared, &nonce_a, &peer.nonce, peer.identity_pub)
}

/// Side that accepted the connection.
pub async fn responder_handshake<T>(
    identity: &Identity,
    transport: &mut T,
) -> Result<SecureChannel, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer = parse_hello(&read_lp(transport).await?)?;

    let (x_secret, x_pub, nonce_b) = fresh_ephemeral();
    write_lp(transport, &build_hello(identity, &x_pub, &nonce_b)).await?;

    let shared = x_secret.diffie_hellman(&X25519Public::from(peer.x_pub));
    derive_channel(shared, &peer.nonce, &nonce_b, peer.identity_pub)
}

impl SecureChannel {
    /// Hex fingerprint of the identity key the peer proved in the handshake.
    pub fn peer_fingerprint(&self) -> String {
        fingerprint_of(&self.peer_public_key)
    }

    /// Seal `plaintext` with a fresh random nonce and write it as one frame.
    pub async fn send_frame<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        plaintext: &[u8],
    ) -> std::io::Result<()> {
        let mut nonce_bytes = [0u8; XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut frame = Vec::with_capacity(XNONCE_LEN + plaintext.len() + 16);
        frame.extend_from_slice(&nonce_bytes);
        let mut sealed = plaintext.to_vec();
        self.aead
            .encrypt_in_place(&nonce, b"", &mut sealed)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "aead encrypt failed"))?;
        frame.extend_from_slice(&sealed);

        write_lp(transport, &frame).await
    }

    /// Read one frame and return its plaintext.
    pub async fn read_frame<T: AsyncRead + Unpin + Send>(
        &self,
        transport: &mut T,
    ) -> std::io::Result<Vec<u8>> {
        let frame = read_lp(transport).await?;
        if frame.len() < XNONCE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too small",
            ));
        }

        let (nonce_bytes, cipher) = frame.split_at(XNONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let mut plain = cipher.to_vec();
        self.aead
            .decrypt_in_place(nonce, b"", &mut plain)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "aead decrypt failed"))?;
        Ok(plain)
    }
}
