//! Tracker announces over HTTP and UDP, and the multi tracker policy on top
//! of them.

pub(crate) mod http;
pub(crate) mod udp;

use std::{collections::HashSet, net::SocketAddr};

use url::Url;

use crate::{error::*, PeerId, Sha1Hash};

/// Stop walking the announce list once the cumulative peer set is larger
/// than this.
const ENOUGH_PEERS: usize = 5;

/// The optional event field of an announce.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    None,
    Completed,
    Started,
    Stopped,
}

impl Event {
    /// The event's representation in an HTTP announce.
    pub fn as_str(self) -> &'static str {
        match self {
            Event::None => "",
            Event::Completed => "completed",
            Event::Started => "started",
            Event::Stopped => "stopped",
        }
    }

    /// The event's representation in a UDP announce.
    pub fn code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters of a single announce.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Event,
}

/// Announces to the trackers in the list, in order, until the cumulative
/// peer set is large enough or the list is exhausted.
///
/// Peers are deduplicated by IP address alone: two peers on the same host
/// collapse into one. Individual tracker failures are logged and skipped;
/// only an empty final set is an error.
pub(crate) async fn request_peers(
    announce_list: &[String],
    params: &Announce,
) -> Result<Vec<SocketAddr>> {
    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut seen_ips = HashSet::new();

    for announce in announce_list {
        let url = match Url::parse(announce) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("invalid announce url {}: {}", announce, e);
                continue;
            }
        };
        let result = match url.scheme() {
            "http" | "https" => http::announce(&url, params).await,
            "udp" => udp::announce(&url, params).await,
            scheme => {
                log::warn!("announce url {} has unsupported scheme {}", url, scheme);
                continue;
            }
        };
        match result {
            Ok(found) => {
                log::info!("tracker {} returned {} peers", url, found.len());
                for peer in found {
                    if seen_ips.insert(peer.ip()) {
                        peers.push(peer);
                    }
                }
            }
            Err(e) => log::warn!("tracker {} announce failed: {}", url, e),
        }
        if peers.len() > ENOUGH_PEERS {
            break;
        }
    }

    if peers.is_empty() {
        Err(Error::NoPeers)
    } else {
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn params() -> Announce {
        Announce {
            info_hash: [0xAA; 20],
            peer_id: [0xBB; 20],
            port: 6881,
            downloaded: 0,
            uploaded: 0,
            left: 1000,
            event: Event::Started,
        }
    }

    fn compact_body(peers: &[([u8; 4], u16)]) -> Vec<u8> {
        let mut body = format!("d5:peers{}:", peers.len() * 6).into_bytes();
        for (ip, port) in peers {
            body.extend_from_slice(ip);
            body.extend_from_slice(&port.to_be_bytes());
        }
        body.push(b'e');
        body
    }

    // Unparseable urls and unsupported schemes are skipped, results of the
    // remaining trackers accumulate, and two peers on one host collapse into
    // the first one seen.
    #[tokio::test]
    async fn test_request_peers_accumulates_and_dedups_by_ip() {
        let _mock_a = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/announce-a".to_string()),
        )
        .with_body(compact_body(&[([127, 0, 0, 1], 6881), ([10, 0, 0, 2], 80)]))
        .create();
        let _mock_b = mockito::mock(
            "GET",
            mockito::Matcher::Regex("^/announce-b".to_string()),
        )
        .with_body(compact_body(&[([127, 0, 0, 1], 9999), ([10, 0, 0, 3], 81)]))
        .create();

        let announce_list = vec![
            "not a url at all".to_string(),
            "wss://unsupported.test/announce".to_string(),
            format!("{}/announce-a", mockito::server_url()),
            format!("{}/announce-b", mockito::server_url()),
        ];
        let peers = request_peers(&announce_list, &params()).await.unwrap();

        let ips: Vec<IpAddr> = peers.iter().map(|peer| peer.ip()).collect();
        assert_eq!(
            ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            ]
        );
        // the duplicate kept the port it was first seen with
        assert_eq!(peers[0].port(), 6881);
    }

    #[tokio::test]
    async fn test_request_peers_with_no_result_is_an_error() {
        let announce_list = vec!["wss://unsupported.test/announce".to_string()];
        assert!(matches!(
            request_peers(&announce_list, &params()).await,
            Err(Error::NoPeers)
        ));
    }
}
