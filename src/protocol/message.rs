//! Peer-wire messages
//!
//! Every message after the handshake is a 4-byte big-endian length prefix
//! followed by `length` payload bytes; a zero length is a keep-alive and
//! the first payload byte otherwise is the message id. Fixed-size messages
//! are validated to their exact length, unknown ids are surfaced as
//! [`Message::Unknown`] for the session to ignore.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TorrentError;

/// Known message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    /// Map a wire byte to a known id
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageId::Choke),
            1 => Some(MessageId::Unchoke),
            2 => Some(MessageId::Interested),
            3 => Some(MessageId::NotInterested),
            4 => Some(MessageId::Have),
            5 => Some(MessageId::Bitfield),
            6 => Some(MessageId::Request),
            7 => Some(MessageId::Piece),
            8 => Some(MessageId::Cancel),
            9 => Some(MessageId::Port),
            _ => None,
        }
    }
}

/// One peer-wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { piece: u32, begin: u32, length: u32 },
    Piece { piece: u32, begin: u32, data: Vec<u8> },
    Cancel { piece: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    Unknown { id: u8 },
}

impl Message {
    /// The message id, None for KeepAlive
    pub fn message_id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke as u8),
            Message::Unchoke => Some(MessageId::Unchoke as u8),
            Message::Interested => Some(MessageId::Interested as u8),
            Message::NotInterested => Some(MessageId::NotInterested as u8),
            Message::Have { .. } => Some(MessageId::Have as u8),
            Message::Bitfield { .. } => Some(MessageId::Bitfield as u8),
            Message::Request { .. } => Some(MessageId::Request as u8),
            Message::Piece { .. } => Some(MessageId::Piece as u8),
            Message::Cancel { .. } => Some(MessageId::Cancel as u8),
            Message::Port { .. } => Some(MessageId::Port as u8),
            Message::Unknown { id } => Some(*id),
        }
    }

    /// Payload length including the id byte
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Unknown { .. } => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Serialize the message including its length prefix
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id);
        }
        match self {
            Message::Have { piece } => buf.put_u32(*piece),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { piece, begin, length }
            | Message::Cancel { piece, begin, length } => {
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { piece, begin, data } => {
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }
        buf.to_vec()
    }

    /// Deserialize a message from its full framed form (prefix included)
    pub fn deserialize(frame: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(frame);
        if buf.remaining() < 4 {
            return Err(TorrentError::malformed("Frame shorter than length prefix").into());
        }
        let length = buf.get_u32() as usize;
        if buf.remaining() != length {
            return Err(TorrentError::malformed_with_source(
                "Frame length prefix mismatch",
                format!("prefix {}, payload {}", length, buf.remaining()),
            )
            .into());
        }
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let Some(message_id) = MessageId::from_u8(id) else {
            return Ok(Message::Unknown { id });
        };

        let expect_exact = |want: usize| -> Result<()> {
            if length != want {
                Err(TorrentError::malformed_with_source(
                    "Wrong payload length for message",
                    format!("id {}, expected {}, got {}", id, want, length),
                )
                .into())
            } else {
                Ok(())
            }
        };

        match message_id {
            MessageId::Choke => {
                expect_exact(1)?;
                Ok(Message::Choke)
            }
            MessageId::Unchoke => {
                expect_exact(1)?;
                Ok(Message::Unchoke)
            }
            MessageId::Interested => {
                expect_exact(1)?;
                Ok(Message::Interested)
            }
            MessageId::NotInterested => {
                expect_exact(1)?;
                Ok(Message::NotInterested)
            }
            MessageId::Have => {
                expect_exact(5)?;
                Ok(Message::Have { piece: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bitfield: buf.to_vec() }),
            MessageId::Request => {
                expect_exact(13)?;
                Ok(Message::Request {
                    piece: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                if length < 9 {
                    return Err(TorrentError::malformed_with_source(
                        "Piece message too short",
                        format!("{} bytes", length),
                    )
                    .into());
                }
                Ok(Message::Piece {
                    piece: buf.get_u32(),
                    begin: buf.get_u32(),
                    data: buf.to_vec(),
                })
            }
            MessageId::Cancel => {
                expect_exact(13)?;
                Ok(Message::Cancel {
                    piece: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Port => {
                expect_exact(3)?;
                Ok(Message::Port { listen_port: buf.get_u16() })
            }
        }
    }
}
