//! The UDP announce client, per BEP 15: a connect exchange to obtain a
//! connection id, then the announce exchange proper.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::{Buf, BufMut};
use tokio::{net::UdpSocket, time};
use url::Url;

use super::Announce;
use crate::error::*;

/// The magic constant identifying the UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// The deadline of each request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Responses are read into a buffer of this size, which caps how many peers
/// a tracker can hand us in one announce.
const MAX_RESPONSE_LEN: usize = 1024;

/// The fixed header length of an announce response.
const ANNOUNCE_HEADER_LEN: usize = 20;

/// How many peers to ask for: as many as fit the response buffer.
const NUM_WANT: u32 = ((MAX_RESPONSE_LEN - ANNOUNCE_HEADER_LEN) / 6) as u32;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Announces to a UDP tracker and returns the peers it knows about.
pub(crate) async fn announce(url: &Url, params: &Announce) -> Result<Vec<SocketAddr>> {
    let host = url
        .host_str()
        .ok_or(Error::TrackerResponse("announce url has no host"))?;
    let port = url
        .port()
        .ok_or(Error::TrackerResponse("announce url has no port"))?;
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or(Error::TrackerResponse("announce host does not resolve"))?;

    let mut socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut buf = [0; MAX_RESPONSE_LEN];

    // connect exchange
    let transaction_id = rand::random::<u32>();
    socket
        .send_to(&connect_request(transaction_id), &addr)
        .await?;
    let (len, _) = time::timeout(EXCHANGE_TIMEOUT, socket.recv_from(&mut buf)).await??;
    let connection_id = parse_connect_response(&buf[..len], transaction_id)?;

    // announce exchange
    let transaction_id = rand::random::<u32>();
    socket
        .send_to(
            &announce_request(connection_id, transaction_id, params),
            &addr,
        )
        .await?;
    let (len, _) = time::timeout(EXCHANGE_TIMEOUT, socket.recv_from(&mut buf)).await??;
    parse_announce_response(&buf[..len], transaction_id)
}

/// Builds the 16 byte connect request.
fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

/// Parses the 16 byte connect response into the connection id.
fn parse_connect_response(mut buf: &[u8], transaction_id: u32) -> Result<u64> {
    if buf.len() < 16 {
        return Err(Error::TrackerResponse("connect response too short"));
    }
    let action = buf.get_u32();
    let echoed_transaction_id = buf.get_u32();
    if action != ACTION_CONNECT || echoed_transaction_id != transaction_id {
        return Err(Error::TrackerResponse("connect response mismatch"));
    }
    Ok(buf.get_u64())
}

/// Builds the 98 byte announce request.
fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    params: &Announce,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&params.info_hash);
    buf.put_slice(&params.peer_id);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_u32(params.event.code());
    // zero means the tracker infers our address itself
    buf.put_u32(0);
    buf.put_u32(rand::random::<u32>());
    buf.put_u32(NUM_WANT);
    buf.put_u16(params.port);
    buf
}

/// Parses the announce response header and the 6-byte peer records after it.
fn parse_announce_response(
    mut buf: &[u8],
    transaction_id: u32,
) -> Result<Vec<SocketAddr>> {
    if buf.len() < ANNOUNCE_HEADER_LEN {
        return Err(Error::TrackerResponse("announce response too short"));
    }
    let action = buf.get_u32();
    let echoed_transaction_id = buf.get_u32();
    if action != ACTION_ANNOUNCE || echoed_transaction_id != transaction_id {
        return Err(Error::TrackerResponse("announce response mismatch"));
    }
    let interval = buf.get_u32();
    let leechers = buf.get_u32();
    let seeders = buf.get_u32();
    log::debug!(
        "announce response: interval {} leechers {} seeders {}",
        interval,
        leechers,
        seeders
    );

    let mut peers = Vec::with_capacity(buf.len() / 6);
    while buf.len() >= 6 {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_connect_request_wire_format() {
        let buf = connect_request(0xDEAD_BEEF);
        assert_eq!(buf.len(), 16);
        // the protocol id is 0x41727101980 as 8 big endian bytes
        assert_eq!(
            &buf[..8],
            &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]
        );
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_connect_response_roundtrip() {
        let mut response = Vec::new();
        response.put_u32(ACTION_CONNECT);
        response.put_u32(42);
        response.put_u64(0x1122_3344_5566_7788);
        assert_eq!(
            parse_connect_response(&response, 42).unwrap(),
            0x1122_3344_5566_7788
        );
        // a transaction id mismatch is rejected
        assert!(parse_connect_response(&response, 43).is_err());
    }

    #[test]
    fn test_announce_request_wire_format() {
        let params = Announce {
            info_hash: [0xAA; 20],
            peer_id: [0xBB; 20],
            port: 6881,
            downloaded: 1,
            uploaded: 2,
            left: 3,
            event: super::super::Event::Started,
        };
        let buf = announce_request(0x0102_0304_0506_0708, 99, &params);
        assert_eq!(buf.len(), 98);
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 99]);
        assert_eq!(&buf[16..36], &[0xAA; 20]);
        assert_eq!(&buf[36..56], &[0xBB; 20]);
        // downloaded, left, uploaded
        assert_eq!(&buf[56..64], &1u64.to_be_bytes());
        assert_eq!(&buf[64..72], &3u64.to_be_bytes());
        assert_eq!(&buf[72..80], &2u64.to_be_bytes());
        // event code for started
        assert_eq!(&buf[80..84], &[0, 0, 0, 2]);
        // ip field is zero
        assert_eq!(&buf[84..88], &[0, 0, 0, 0]);
        // num_want asks for a full buffer's worth of peers
        assert_eq!(&buf[92..96], &NUM_WANT.to_be_bytes());
        assert_eq!(NUM_WANT, 167);
        assert_eq!(&buf[96..], &[0x1A, 0xE1]);
    }

    #[test]
    fn test_announce_response_peers() {
        let mut response = Vec::new();
        response.put_u32(ACTION_ANNOUNCE);
        response.put_u32(7);
        response.put_u32(1800);
        response.put_u32(10);
        response.put_u32(3);
        response.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        response.extend_from_slice(&[10, 0, 0, 9, 0x00, 0x50]);

        let peers = parse_announce_response(&response, 7).unwrap();
        assert_eq!(
            peers,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 80),
            ]
        );

        // a header-only response yields no peers
        let peers = parse_announce_response(&response[..20], 7).unwrap();
        assert!(peers.is_empty());
    }
}
