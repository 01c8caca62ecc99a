//! TCP framing: 1-byte command, then either fixed content (InitTcp), nothing
//! (ReplyInitTcp), or a CVLI length plus sealed content (Message, ReplyMessage).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cvli::{self, CvliError};
use crate::identity::{PublicKey, ShortNodeId, PUBLIC_KEY_SIZE, SEAL_OVERHEAD, SHORT_NODE_ID_SIZE};

/// InitTcp content: target short id + client public key.
pub const INIT_TCP_LEN: usize = SHORT_NODE_ID_SIZE + PUBLIC_KEY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpCommand {
    InitTcp = 0,
    ReplyInitTcp = 1,
    Message = 2,
    ReplyMessage = 3,
}

impl TryFrom<u8> for TcpCommand {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0 => TcpCommand::InitTcp,
            1 => TcpCommand::ReplyInitTcp,
            2 => TcpCommand::Message,
            3 => TcpCommand::ReplyMessage,
            other => return Err(FrameError::UnknownCommand(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpFrame {
    InitTcp {
        target: ShortNodeId,
        public_key: PublicKey,
    },
    ReplyInitTcp,
    /// Sealed request (nonce | tag | ciphertext), empty for an empty request.
    Message(Bytes),
    /// Sealed reply, empty when the handler had nothing to say.
    ReplyMessage(Bytes),
}

impl TcpFrame {
    pub fn command(&self) -> TcpCommand {
        match self {
            TcpFrame::InitTcp { .. } => TcpCommand::InitTcp,
            TcpFrame::ReplyInitTcp => TcpCommand::ReplyInitTcp,
            TcpFrame::Message(_) => TcpCommand::Message,
            TcpFrame::ReplyMessage(_) => TcpCommand::ReplyMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Command,
    Header(TcpCommand),
    Content(TcpCommand, usize),
}

/// Incremental frame parser. Keeps its position across reads so a split
/// header or body is resumed rather than re-parsed.
#[derive(Debug)]
pub struct TcpCodec {
    max_content: usize,
    state: DecodeState,
}

impl TcpCodec {
    /// `max_message_size` is the largest plaintext accepted; sealing overhead is added on top.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_content: max_message_size.saturating_add(SEAL_OVERHEAD),
            state: DecodeState::Command,
        }
    }

    fn check_content_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_content {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_content,
            });
        }
        // Non-empty content must hold nonce, tag and at least one ciphertext byte.
        if len != 0 && len <= SEAL_OVERHEAD {
            return Err(FrameError::BadLength(len));
        }
        Ok(())
    }
}

impl Decoder for TcpCodec {
    type Item = TcpFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Command => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let command = TcpCommand::try_from(src.get_u8())?;
                    self.state = match command {
                        TcpCommand::InitTcp => DecodeState::Content(command, INIT_TCP_LEN),
                        TcpCommand::ReplyInitTcp => {
                            return Ok(Some(TcpFrame::ReplyInitTcp));
                        }
                        TcpCommand::Message | TcpCommand::ReplyMessage => {
                            DecodeState::Header(command)
                        }
                    };
                }
                DecodeState::Header(command) => {
                    let (len, used) = match cvli::decode(&src[..]) {
                        Ok(v) => v,
                        Err(CvliError::NeedMore) => return Ok(None),
                        Err(CvliError::TooLong) | Err(CvliError::Overflow) => {
                            return Err(FrameError::BadHeader)
                        }
                    };
                    let len = len as usize;
                    self.check_content_len(len)?;
                    src.advance(used);
                    self.state = DecodeState::Content(command, len);
                }
                DecodeState::Content(command, len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let content = src.split_to(len).freeze();
                    self.state = DecodeState::Command;
                    let frame = match command {
                        TcpCommand::InitTcp => {
                            let mut short = [0u8; SHORT_NODE_ID_SIZE];
                            short.copy_from_slice(&content[..SHORT_NODE_ID_SIZE]);
                            let mut key = [0u8; PUBLIC_KEY_SIZE];
                            key.copy_from_slice(&content[SHORT_NODE_ID_SIZE..]);
                            TcpFrame::InitTcp {
                                target: ShortNodeId::from_bytes(short),
                                public_key: PublicKey::from_bytes(key),
                            }
                        }
                        TcpCommand::Message => TcpFrame::Message(content),
                        TcpCommand::ReplyMessage => TcpFrame::ReplyMessage(content),
                        TcpCommand::ReplyInitTcp => TcpFrame::ReplyInitTcp,
                    };
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<TcpFrame> for TcpCodec {
    type Error = FrameError;

    fn encode(&mut self, item: TcpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command() as u8;
        match item {
            TcpFrame::InitTcp { target, public_key } => {
                dst.put_u8(command);
                dst.put_slice(target.as_bytes());
                dst.put_slice(public_key.as_bytes());
            }
            TcpFrame::ReplyInitTcp => dst.put_u8(command),
            TcpFrame::Message(content) | TcpFrame::ReplyMessage(content) => {
                self.check_content_len(content.len())?;
                dst.put_u8(command);
                let mut header = Vec::with_capacity(cvli::MAX_CVLI_LEN);
                cvli::encode(content.len() as u32, &mut header);
                dst.reserve(header.len() + content.len());
                dst.put_slice(&header);
                dst.put_slice(&content);
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown tcp command {0}")]
    UnknownCommand(u8),
    #[error("content length {len} exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("content length {0} too short for sealed payload")]
    BadLength(usize),
    #[error("malformed length header")]
    BadHeader,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
