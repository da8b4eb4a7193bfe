//! The HTTP announce client.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de;
use url::Url;

use super::Announce;
use crate::error::*;

/// How long the whole GET may take. Trackers are often slow, but not this
/// slow.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Percent-encode all non-alphanumeric bytes except `-._~`, as required for
/// the raw binary query params.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Announces to an HTTP tracker and returns the peers it knows about.
pub(crate) async fn announce(url: &Url, params: &Announce) -> Result<Vec<SocketAddr>> {
    // The info hash and peer id are raw bytes and have to be percent-encoded
    // by hand; serializing them through the query builder would re-encode the
    // escapes.
    let sep = if url.query().is_some() { '&' } else { '?' };
    let url = format!(
        "{url}{sep}info_hash={info_hash}&peer_id={peer_id}",
        url = url,
        sep = sep,
        info_hash = percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
        peer_id = percent_encode(&params.peer_id, URL_ENCODE_RESERVED),
    );

    // Some trackers hand out unroutable IPv6 addresses, so the request is
    // pinned to IPv4.
    eprintln!("DEBUG announce building client for {}", url);
    let client = reqwest::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .build()?;
    eprintln!("DEBUG announce client built, sending");
    let body = client
        .get(&url)
        .query(&[
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_string()),
            ("event", params.event.as_str().to_string()),
        ])
        .send()
        .await?;
    eprintln!("DEBUG announce got response, status {}", body.status());
    let body = body
        .error_for_status()?
        .bytes()
        .await?;

    let response: Response = serde_bencode::from_bytes(&body)?;
    if let Some(reason) = response.failure_reason {
        log::warn!("tracker failure: {}", reason);
        return Err(Error::TrackerResponse("tracker reported failure"));
    }
    Ok(response.peers)
}

/// The bencoded announce response.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// Deserializes the `peers` field from either the compact 6-bytes-per-peer
/// blob or the dictionary model list.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            if b.len() % ENTRY_LEN != 0 {
                return Err(de::Error::custom(
                    "compact peer string length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(b.len() / ENTRY_LEN);
            while !b.is_empty() {
                let ip = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            // trackers encode the port as a signed or unsigned integer
            // depending on implementation, so accept anything that fits
            #[derive(Deserialize)]
            struct RawPeer {
                ip: String,
                port: i64,
            }

            let mut peers = Vec::new();
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                if port < 0 || port > u16::MAX as i64 {
                    continue;
                }
                if let Ok(ip) = ip.parse() {
                    peers.push(SocketAddr::new(ip, port as u16));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}
