use thiserror::Error;
use conclave_crypt::dh::{DhError, DhPublic, DhSecret, derive_group_key};
use conclave_crypt::ecies::{EciesError, EciesPublic, EciesSecret};
use conclave_crypt::ratchet::{ChainKey, RatchetError};
use conclave_structs::GroupId;

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("group key payload was not 16 bytes")]
    BadGroupKey,
    #[error("no short-term key for this rekey round")]
    NoShortTermKey,
    #[error("no shared key established yet")]
    NoSharedKey,
    #[error(transparent)]
    Ecies(#[from] EciesError),
    #[error(transparent)]
    Dh(#[from] DhError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
}

/// The client's cryptographic state: a session-lifetime long-term keypair, a
/// short-term keypair regenerated on every rekey, and the shared chain key
/// ratcheted on every message transit.
pub(crate) struct SessionKeys {
    long_term: EciesSecret,
    short_term: Option<DhSecret>,
    chain: Option<ChainKey>,
}

impl SessionKeys {
    pub fn new(long_term: EciesSecret) -> Self {
        Self {
            long_term,
            short_term: None,
            chain: None,
        }
    }

    pub fn long_term_public(&self) -> EciesPublic {
        self.long_term.public_key()
    }

    /// Unseal a rotated group access key delivered to our long-term key.
    pub fn handle_new_group_key(&self, sealed: &[u8]) -> Result<GroupId, SessionError> {
        let plain = self.long_term.decrypt(sealed)?;
        let bytes: [u8; 16] = plain
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::BadGroupKey)?;
        Ok(GroupId::from_bytes(bytes))
    }

    /// Start a rekey round: generate a fresh short-term keypair and hand back
    /// the public half for the reply to the server.
    pub fn begin_rekey(&mut self) -> DhPublic {
        let secret = DhSecret::random();
        let public = secret.public_key();
        self.short_term = Some(secret);
        public
    }

    /// Derive and install the shared chain key from the delivered peer roster.
    pub fn install_peer_keys(&mut self, peers: &[DhPublic]) -> Result<(), SessionError> {
        let secret = self.short_term.as_ref().ok_or(SessionError::NoShortTermKey)?;
        let key = derive_group_key(secret, peers)?;
        self.chain = Some(ChainKey::from_bytes(key));
        Ok(())
    }

    /// Ratchet forward and encrypt an outgoing message.
    pub fn seal_text(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let chain = self.chain.as_mut().ok_or(SessionError::NoSharedKey)?;
        chain.advance();
        Ok(chain.seal(plaintext)?)
    }

    /// Ratchet forward and decrypt an incoming message.
    pub fn open_text(&mut self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let chain = self.chain.as_mut().ok_or(SessionError::NoSharedKey)?;
        chain.advance();
        Ok(chain.open(sealed)?)
    }
}
