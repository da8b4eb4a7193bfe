//! This module defines types used to configure the engine and its parts.

use rand::Rng;

use crate::PeerId;

/// The Azureus-style prefix of every peer id this engine generates.
pub const CLIENT_ID_PREFIX: &[u8; 7] = b"-GT001-";

/// The port peers and trackers are told to reach us on, unless overridden.
pub const DEFAULT_PORT: u16 = 6881;

/// The configuration of a torrent session.
///
/// The client id is meant to be stable for the lifetime of the process:
/// create one `Conf` at startup and clone it for each torrent.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The TCP port the seeder listens on and that is reported in announces.
    pub port: u16,
    /// Whether connections are wrapped in the AES-256-CTR obfuscation layer.
    ///
    /// Both ends must agree on this out of band. Standard BitTorrent peers
    /// speak plaintext only, so this must be `false` to interoperate with
    /// them.
    pub cipher_enabled: bool,
}

impl Conf {
    pub fn new() -> Self {
        Self {
            client_id: gen_client_id(),
            port: DEFAULT_PORT,
            cipher_enabled: true,
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a fresh peer id: the client prefix followed by random digits.
pub fn gen_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}
