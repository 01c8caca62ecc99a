//! UDP control-channel packets: command byte, fixed-width fields, little-endian integers.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::identity::{
    NodeId, PublicKey, ShortNodeId, NODE_ID_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, SHORT_NODE_ID_SIZE,
    TAG_SIZE,
};

/// Encrypted body of a ReplyVerifyNode: tick u32, IPv4, port u16.
pub const VERIFY_PLAINTEXT_SIZE: usize = 4 + 4 + 2;

pub const HELLO_MIN_LEN: usize = 1 + NODE_ID_SIZE + 1;
pub const REPLY_HELLO_MIN_LEN: usize = 1 + NODE_ID_SIZE;
pub const FIND_NODE_LEN: usize = 1 + NODE_ID_SIZE;
pub const REPLY_FIND_NODE_LEN: usize = 1 + PUBLIC_KEY_SIZE;
pub const VERIFY_NODE_LEN: usize = 1 + NODE_ID_SIZE + 4 + 4 + 2 + PUBLIC_KEY_SIZE;
pub const REPLY_VERIFY_NODE_LEN: usize =
    1 + NODE_ID_SIZE + NONCE_SIZE + TAG_SIZE + VERIFY_PLAINTEXT_SIZE + PUBLIC_KEY_SIZE;
pub const PING_LEN: usize = 1 + SHORT_NODE_ID_SIZE + 4;
pub const REPLY_PING_LEN: usize = 1 + NODE_ID_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Hello = 0,
    ReplyHello = 1,
    FindNode = 2,
    ReplyFindNode = 3,
    VerifyNode = 4,
    ReplyVerifyNode = 5,
    Ping = 6,
    ReplyPing = 7,
    Broadcast = 8,
    Datagram = 9,
}

impl TryFrom<u8> for Command {
    type Error = PacketError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0 => Command::Hello,
            1 => Command::ReplyHello,
            2 => Command::FindNode,
            3 => Command::ReplyFindNode,
            4 => Command::VerifyNode,
            5 => Command::ReplyVerifyNode,
            6 => Command::Ping,
            7 => Command::ReplyPing,
            8 => Command::Broadcast,
            9 => Command::Datagram,
            other => return Err(PacketError::UnknownCommand(other)),
        })
    }
}

/// Address-verification challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyNode {
    pub target: NodeId,
    pub tick: u32,
    /// Address the challenger saw the target's packets come from.
    pub claimed: SocketAddrV4,
    pub sender_key: PublicKey,
}

/// Encrypted answer to a [`VerifyNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyVerifyNode {
    pub target: NodeId,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: [u8; VERIFY_PLAINTEXT_SIZE],
    pub sender_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello {
        sender: NodeId,
        need_reply: bool,
        message: Vec<u8>,
    },
    ReplyHello {
        sender: NodeId,
        message: Vec<u8>,
    },
    FindNode {
        target: NodeId,
    },
    ReplyFindNode {
        sender_key: PublicKey,
    },
    VerifyNode(VerifyNode),
    ReplyVerifyNode(ReplyVerifyNode),
    Ping {
        target: ShortNodeId,
        tick: u32,
    },
    ReplyPing {
        sender: NodeId,
        tick: u32,
    },
    Broadcast {
        sender: NodeId,
        payload: Vec<u8>,
    },
    Datagram {
        sender: NodeId,
        payload: Vec<u8>,
    },
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Hello { .. } => Command::Hello,
            Packet::ReplyHello { .. } => Command::ReplyHello,
            Packet::FindNode { .. } => Command::FindNode,
            Packet::ReplyFindNode { .. } => Command::ReplyFindNode,
            Packet::VerifyNode(_) => Command::VerifyNode,
            Packet::ReplyVerifyNode(_) => Command::ReplyVerifyNode,
            Packet::Ping { .. } => Command::Ping,
            Packet::ReplyPing { .. } => Command::ReplyPing,
            Packet::Broadcast { .. } => Command::Broadcast,
            Packet::Datagram { .. } => Command::Datagram,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.command() as u8);
        match self {
            Packet::Hello {
                sender,
                need_reply,
                message,
            } => {
                out.extend_from_slice(sender.as_bytes());
                out.push(u8::from(*need_reply));
                out.extend_from_slice(message);
            }
            Packet::ReplyHello { sender, message } => {
                out.extend_from_slice(sender.as_bytes());
                out.extend_from_slice(message);
            }
            Packet::FindNode { target } => out.extend_from_slice(target.as_bytes()),
            Packet::ReplyFindNode { sender_key } => out.extend_from_slice(sender_key.as_bytes()),
            Packet::VerifyNode(v) => {
                out.extend_from_slice(v.target.as_bytes());
                out.extend_from_slice(&v.tick.to_le_bytes());
                out.extend_from_slice(&v.claimed.ip().octets());
                out.extend_from_slice(&v.claimed.port().to_le_bytes());
                out.extend_from_slice(v.sender_key.as_bytes());
            }
            Packet::ReplyVerifyNode(r) => {
                out.extend_from_slice(r.target.as_bytes());
                out.extend_from_slice(&r.nonce);
                out.extend_from_slice(&r.tag);
                out.extend_from_slice(&r.ciphertext);
                out.extend_from_slice(r.sender_key.as_bytes());
            }
            Packet::Ping { target, tick } => {
                out.extend_from_slice(target.as_bytes());
                out.extend_from_slice(&tick.to_le_bytes());
            }
            Packet::ReplyPing { sender, tick } => {
                out.extend_from_slice(sender.as_bytes());
                out.extend_from_slice(&tick.to_le_bytes());
            }
            Packet::Broadcast { sender, payload } | Packet::Datagram { sender, payload } => {
                out.extend_from_slice(sender.as_bytes());
                out.extend_from_slice(payload);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
        let (&first, _) = data.split_first().ok_or(PacketError::Empty)?;
        let command = Command::try_from(first)?;
        let len = data.len();
        let length_ok = match command {
            Command::Hello => len >= HELLO_MIN_LEN,
            Command::ReplyHello => len >= REPLY_HELLO_MIN_LEN,
            Command::FindNode => len == FIND_NODE_LEN,
            Command::ReplyFindNode => len == REPLY_FIND_NODE_LEN,
            Command::VerifyNode => len == VERIFY_NODE_LEN,
            Command::ReplyVerifyNode => len == REPLY_VERIFY_NODE_LEN,
            Command::Ping => len == PING_LEN,
            Command::ReplyPing => len == REPLY_PING_LEN,
            // Empty payloads carry nothing for the handler.
            Command::Broadcast | Command::Datagram => len > 1 + NODE_ID_SIZE,
        };
        if !length_ok {
            return Err(PacketError::Length { command, len });
        }

        let mut r = Reader::new(&data[1..]);
        let packet = match command {
            Command::Hello => Packet::Hello {
                sender: r.node_id(),
                need_reply: r.u8() != 0,
                message: r.rest().to_vec(),
            },
            Command::ReplyHello => Packet::ReplyHello {
                sender: r.node_id(),
                message: r.rest().to_vec(),
            },
            Command::FindNode => Packet::FindNode {
                target: r.node_id(),
            },
            Command::ReplyFindNode => Packet::ReplyFindNode {
                sender_key: r.public_key(),
            },
            Command::VerifyNode => {
                let target = r.node_id();
                let tick = r.u32();
                let ip = r.ipv4();
                let port = r.u16();
                Packet::VerifyNode(VerifyNode {
                    target,
                    tick,
                    claimed: SocketAddrV4::new(ip, port),
                    sender_key: r.public_key(),
                })
            }
            Command::ReplyVerifyNode => Packet::ReplyVerifyNode(ReplyVerifyNode {
                target: r.node_id(),
                nonce: r.array(),
                tag: r.array(),
                ciphertext: r.array(),
                sender_key: r.public_key(),
            }),
            Command::Ping => Packet::Ping {
                target: ShortNodeId::from_bytes(r.array()),
                tick: r.u32(),
            },
            Command::ReplyPing => Packet::ReplyPing {
                sender: r.node_id(),
                tick: r.u32(),
            },
            Command::Broadcast => Packet::Broadcast {
                sender: r.node_id(),
                payload: r.rest().to_vec(),
            },
            Command::Datagram => Packet::Datagram {
                sender: r.node_id(),
                payload: r.rest().to_vec(),
            },
        };
        Ok(packet)
    }
}

/// Plaintext carried inside a ReplyVerifyNode.
pub fn encode_verify_plaintext(tick: u32, addr: SocketAddrV4) -> [u8; VERIFY_PLAINTEXT_SIZE] {
    let mut out = [0u8; VERIFY_PLAINTEXT_SIZE];
    out[..4].copy_from_slice(&tick.to_le_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out[8..].copy_from_slice(&addr.port().to_le_bytes());
    out
}

pub fn decode_verify_plaintext(buf: &[u8; VERIFY_PLAINTEXT_SIZE]) -> (u32, SocketAddrV4) {
    let mut r = Reader::new(buf);
    let tick = r.u32();
    let ip = r.ipv4();
    let port = r.u16();
    (tick, SocketAddrV4::new(ip, port))
}

/// Cursor over a buffer whose length has already been validated.
/// Reads past the end yield zeroes instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        let end = (self.pos + N).min(self.buf.len());
        let avail = &self.buf[self.pos.min(end)..end];
        out[..avail.len()].copy_from_slice(avail);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn ipv4(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.array::<4>())
    }

    fn node_id(&mut self) -> NodeId {
        NodeId::from_bytes(self.array())
    }

    fn public_key(&mut self) -> PublicKey {
        PublicKey::from_bytes(self.array())
    }

    fn rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.buf.len());
        self.pos = self.buf.len();
        &self.buf[start..]
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("bad length {len} for {command:?}")]
    Length { command: Command, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 39001)
    }

    #[test]
    fn encoded_lengths_match_layout() {
        let kp = KeyPair::generate();
        let id = kp.node_id();
        let cases = [
            (
                Packet::Hello {
                    sender: id,
                    need_reply: true,
                    message: Vec::new(),
                },
                HELLO_MIN_LEN,
            ),
            (Packet::FindNode { target: id }, 17),
            (
                Packet::ReplyFindNode {
                    sender_key: *kp.public_key(),
                },
                33,
            ),
            (
                Packet::VerifyNode(VerifyNode {
                    target: id,
                    tick: 5,
                    claimed: addr(),
                    sender_key: *kp.public_key(),
                }),
                59,
            ),
            (
                Packet::ReplyVerifyNode(ReplyVerifyNode {
                    target: id,
                    nonce: [1; NONCE_SIZE],
                    tag: [2; TAG_SIZE],
                    ciphertext: [3; VERIFY_PLAINTEXT_SIZE],
                    sender_key: *kp.public_key(),
                }),
                87,
            ),
            (
                Packet::Ping {
                    target: id.short(),
                    tick: 9,
                },
                9,
            ),
            (Packet::ReplyPing { sender: id, tick: 9 }, 21),
        ];
        for (packet, len) in cases {
            let bytes = packet.encode();
            assert_eq!(bytes.len(), len, "{:?}", packet.command());
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn verify_node_field_order() {
        let kp = KeyPair::generate();
        let bytes = Packet::VerifyNode(VerifyNode {
            target: kp.node_id(),
            tick: 0x0403_0201,
            claimed: addr(),
            sender_key: *kp.public_key(),
        })
        .encode();
        assert_eq!(bytes[0], Command::VerifyNode as u8);
        assert_eq!(&bytes[17..21], &[1, 2, 3, 4]);
        assert_eq!(&bytes[21..25], &[192, 168, 1, 20]);
        assert_eq!(&bytes[25..27], &39001u16.to_le_bytes());
        assert_eq!(&bytes[27..], kp.public_key().as_bytes());
    }

    #[test]
    fn hello_keeps_trailing_message() {
        let id = KeyPair::generate().node_id();
        let bytes = Packet::Hello {
            sender: id,
            need_reply: false,
            message: b"app:v1".to_vec(),
        }
        .encode();
        match Packet::decode(&bytes).unwrap() {
            Packet::Hello {
                sender,
                need_reply,
                message,
            } => {
                assert_eq!(sender, id);
                assert!(!need_reply);
                assert_eq!(message, b"app:v1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::Empty));
        assert_eq!(Packet::decode(&[42]), Err(PacketError::UnknownCommand(42)));
        let mut find = vec![Command::FindNode as u8];
        find.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            Packet::decode(&find),
            Err(PacketError::Length { command: Command::FindNode, len: 18 })
        ));
        let mut ping = vec![Command::Ping as u8];
        ping.extend_from_slice(&[0u8; 7]);
        assert!(Packet::decode(&ping).is_err());
    }

    #[test]
    fn broadcast_requires_payload() {
        let id = KeyPair::generate().node_id();
        let empty = Packet::Broadcast {
            sender: id,
            payload: Vec::new(),
        }
        .encode();
        assert!(Packet::decode(&empty).is_err());
        let one = Packet::Broadcast {
            sender: id,
            payload: vec![0xAB],
        }
        .encode();
        assert_eq!(
            Packet::decode(&one).unwrap(),
            Packet::Broadcast {
                sender: id,
                payload: vec![0xAB]
            }
        );
    }

    #[test]
    fn verify_plaintext_layout() {
        let plain = encode_verify_plaintext(77, addr());
        assert_eq!(decode_verify_plaintext(&plain), (77, addr()));
        assert_eq!(&plain[..4], &77u32.to_le_bytes());
    }
}
