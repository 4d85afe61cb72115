//! Mesh transport: UDP multicast on the LAN, plus an optional unicast backbone relay.
//!
//! Every datagram starts with one kind byte:
//! `0x01` JSON message, `0x02` SessionInit, `0x03` backbone frame.

use std::net::{Ipv4Addr, SocketAddr};

use pneuma_core::Layer;
use tokio::net::UdpSocket;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
const MAX_DATAGRAM: usize = 65536;

const KIND_JSON: u8 = 0x01;
const KIND_SESSION_INIT: u8 = 0x02;
const KIND_FRAME: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Tagged JSON protocol message (mesh layer).
    Json(Vec<u8>),
    /// Binary `SessionInit`.
    SessionInit(Vec<u8>),
    /// Length-prefixed frame (backbone layer).
    Frame(Vec<u8>),
}

impl Datagram {
    pub fn encode(&self) -> Vec<u8> {
        let (kind, body) = match self {
            Datagram::Json(b) => (KIND_JSON, b),
            Datagram::SessionInit(b) => (KIND_SESSION_INIT, b),
            Datagram::Frame(b) => (KIND_FRAME, b),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(kind);
        out.extend_from_slice(body);
        out
    }

    /// `None` for empty datagrams and unknown kinds.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, body) = bytes.split_first()?;
        let body = body.to_vec();
        match kind {
            KIND_JSON => Some(Datagram::Json(body)),
            KIND_SESSION_INIT => Some(Datagram::SessionInit(body)),
            KIND_FRAME => Some(Datagram::Frame(body)),
            _ => None,
        }
    }

    /// Wrap a protocol message already encoded for `layer`.
    pub fn message(layer: Layer, bytes: Vec<u8>) -> Self {
        match layer {
            Layer::Mesh => Datagram::Json(bytes),
            Layer::Backbone => Datagram::Frame(bytes),
        }
    }
}

pub struct Mesh {
    socket: UdpSocket,
    group: SocketAddr,
    backbone: Option<SocketAddr>,
}

impl Mesh {
    pub async fn bind(port: u16, backbone: Option<SocketAddr>) -> std::io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        tracing::info!(group = %MULTICAST_GROUP, port, ?backbone, "mesh socket bound");
        Ok(Self {
            socket,
            group: SocketAddr::from((MULTICAST_GROUP, port)),
            backbone,
        })
    }

    /// Send on `layer`. Backbone traffic goes to the relay when one is configured.
    pub async fn send(&self, layer: Layer, datagram: &Datagram) -> std::io::Result<()> {
        let dest = match layer {
            Layer::Backbone => self.backbone.unwrap_or(self.group),
            Layer::Mesh => self.group,
        };
        self.socket.send_to(&datagram.encode(), dest).await?;
        Ok(())
    }

    /// Next well-formed datagram; unknown kinds are skipped.
    pub async fn recv(&self) -> std::io::Result<(Datagram, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match Datagram::decode(&buf[..n]) {
                Some(d) => return Ok((d, from)),
                None => tracing::debug!(%from, len = n, "dropping unknown datagram"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_byte_prefix() {
        let d = Datagram::Json(br#"{"type":"debate"}"#.to_vec());
        let bytes = d.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(Datagram::decode(&bytes), Some(d));

        let d = Datagram::SessionInit(vec![0u8; 80]);
        assert_eq!(d.encode()[0], 0x02);
        assert_eq!(Datagram::decode(&d.encode()), Some(d));

        let d = Datagram::Frame(vec![3, 0, 0, 0, 1, 2, 3]);
        assert_eq!(d.encode()[0], 0x03);
        assert_eq!(Datagram::decode(&d.encode()), Some(d));
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert_eq!(Datagram::decode(&[]), None);
        assert_eq!(Datagram::decode(&[0x09, 1, 2]), None);
        assert_eq!(Datagram::decode(&[0x01]), Some(Datagram::Json(Vec::new())));
    }

    #[test]
    fn layer_mapping() {
        assert_eq!(Datagram::message(Layer::Mesh, vec![1]), Datagram::Json(vec![1]));
        assert_eq!(Datagram::message(Layer::Backbone, vec![1]), Datagram::Frame(vec![1]));
    }
}
