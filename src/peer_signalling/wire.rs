use crate::bdaddr::{AddrType, BdAddr};
use crate::error::WireError;
use crate::utils::format_hex;

use super::messages::{ChannelMask, MarshalledMessage};

const FRAME_TYPE_REQUEST: u8 = 1;
const FRAME_TYPE_RESPONSE: u8 = 2;
const FRAME_TYPE_MARSHAL: u8 = 3;

const HEADER_LEN: usize = 5;
const RESPONSE_LEN: usize = HEADER_LEN;

const CMD_ADD_LINK_KEY: u8 = 1;
const CMD_PAIR_HANDSET_ADDRESS: u8 = 2;
const CMD_MSG_CHANNEL: u8 = 3;
const CMD_CONNECT_HANDSET: u8 = 4;

const ADDR_LEN: usize = 6;
const CONNECT_HANDSET_PLAY_MEDIA: u8 = 1 << 0;

/// Outcome carried by a response frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseStatus {
    Success,
    Fail,
}

impl ResponseStatus {
    const fn as_raw(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::Fail => 1,
        }
    }

    const fn from_raw(value: u16) -> Self {
        match value {
            0 => Self::Success,
            _ => Self::Fail,
        }
    }
}

/// Request commands understood by the peer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    AddLinkKey {
        addr_type: AddrType,
        addr: BdAddr,
        key_type: u8,
        key: Vec<u8>,
    },
    PairHandsetAddress {
        addr: BdAddr,
    },
    MsgChannel {
        channel: ChannelMask,
        data: Vec<u8>,
    },
    ConnectHandset {
        play_media: bool,
    },
}

impl Command {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::AddLinkKey {
                addr_type,
                addr,
                key_type,
                key,
            } => {
                let mut payload = Vec::with_capacity(3 + ADDR_LEN + key.len());
                payload.push(CMD_ADD_LINK_KEY);
                payload.push(addr_type.as_wire());
                payload.extend_from_slice(addr.as_bytes());
                payload.push(*key_type);
                payload.extend_from_slice(key);
                payload
            }
            Self::PairHandsetAddress { addr } => {
                let mut payload = vec![CMD_PAIR_HANDSET_ADDRESS];
                payload.extend_from_slice(addr.as_bytes());
                payload
            }
            Self::MsgChannel { channel, data } => {
                let mut payload = Vec::with_capacity(7 + data.len());
                payload.push(CMD_MSG_CHANNEL);
                payload.extend_from_slice(&channel.bits().to_le_bytes());
                payload.extend_from_slice(&data_len(data).to_le_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Self::ConnectHandset { play_media } => {
                let flags = if *play_media {
                    CONNECT_HANDSET_PLAY_MEDIA
                } else {
                    0
                };
                vec![CMD_CONNECT_HANDSET, flags]
            }
        }
    }

    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (&command, body) = payload.split_first().ok_or(WireError::Truncated {
            needed: 1,
            actual: 0,
        })?;

        match command {
            CMD_ADD_LINK_KEY => {
                ensure_len(body, 2 + ADDR_LEN)?;
                let addr_type = AddrType::from_wire(body[0])
                    .ok_or(WireError::InvalidAddrType { value: body[0] })?;
                Ok(Self::AddLinkKey {
                    addr_type,
                    addr: read_addr(&body[1..])?,
                    key_type: body[1 + ADDR_LEN],
                    key: body[2 + ADDR_LEN..].to_vec(),
                })
            }
            CMD_PAIR_HANDSET_ADDRESS => Ok(Self::PairHandsetAddress {
                addr: read_addr(body)?,
            }),
            CMD_MSG_CHANNEL => {
                ensure_len(body, 6)?;
                let channel = ChannelMask::from_bits(read_u32(body, 0));
                let declared = usize::from(read_u16(body, 4));
                let data = &body[6..];
                if declared != data.len() {
                    return Err(WireError::BadLength {
                        declared,
                        actual: data.len(),
                    });
                }
                Ok(Self::MsgChannel {
                    channel,
                    data: data.to_vec(),
                })
            }
            CMD_CONNECT_HANDSET => {
                ensure_len(body, 1)?;
                Ok(Self::ConnectHandset {
                    play_media: body[0] & CONNECT_HANDSET_PLAY_MEDIA != 0,
                })
            }
            value => Err(WireError::UnknownCommand { value }),
        }
    }
}

/// One frame on the peer signalling channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Request { opid: u16, command: Command },
    Response { opid: u16, status: ResponseStatus },
    Marshal { channel: ChannelMask, payload: Vec<u8> },
}

impl Frame {
    /// Builds a marshal frame carrying `message` serialised as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Marshal`] if the message cannot be serialised.
    pub fn marshal(channel: ChannelMask, message: &MarshalledMessage) -> Result<Self, WireError> {
        Ok(Self::Marshal {
            channel,
            payload: serde_json::to_vec(message)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Request { opid, command } => {
                let payload = command.encode();
                let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
                frame.push(FRAME_TYPE_REQUEST);
                frame.extend_from_slice(&opid.to_le_bytes());
                frame.extend_from_slice(&data_len(&payload).to_le_bytes());
                frame.extend_from_slice(&payload);
                frame
            }
            Self::Response { opid, status } => {
                let mut frame = Vec::with_capacity(RESPONSE_LEN);
                frame.push(FRAME_TYPE_RESPONSE);
                frame.extend_from_slice(&opid.to_le_bytes());
                frame.extend_from_slice(&status.as_raw().to_le_bytes());
                frame
            }
            Self::Marshal { channel, payload } => {
                let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
                frame.push(FRAME_TYPE_MARSHAL);
                frame.extend_from_slice(&channel.bits().to_le_bytes());
                frame.extend_from_slice(payload);
                frame
            }
        }
    }

    /// Parses one complete frame.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the frame is short, its declared length
    /// disagrees with the bytes present, or a type or command byte is unknown.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ensure_len(bytes, HEADER_LEN)?;
        match bytes[0] {
            FRAME_TYPE_REQUEST => {
                let opid = read_u16(bytes, 1);
                let declared = usize::from(read_u16(bytes, 3));
                let payload = &bytes[HEADER_LEN..];
                if declared != payload.len() {
                    return Err(WireError::BadLength {
                        declared,
                        actual: payload.len(),
                    });
                }
                Ok(Self::Request {
                    opid,
                    command: Command::decode(payload)?,
                })
            }
            FRAME_TYPE_RESPONSE => {
                if bytes.len() != RESPONSE_LEN {
                    return Err(WireError::BadLength {
                        declared: RESPONSE_LEN,
                        actual: bytes.len(),
                    });
                }
                Ok(Self::Response {
                    opid: read_u16(bytes, 1),
                    status: ResponseStatus::from_raw(read_u16(bytes, 3)),
                })
            }
            FRAME_TYPE_MARSHAL => Ok(Self::Marshal {
                channel: ChannelMask::from_bits(read_u32(bytes, 1)),
                payload: bytes[HEADER_LEN..].to_vec(),
            }),
            value => Err(WireError::UnknownFrameType { value }),
        }
    }

    /// Hex rendering for trace output.
    #[must_use]
    pub fn describe(&self) -> String {
        format_hex(&self.encode())
    }
}

/// Parses the JSON payload of a marshal frame.
///
/// # Errors
///
/// Returns [`WireError::Marshal`] when the payload is not a known message.
pub fn decode_marshalled(payload: &[u8]) -> Result<MarshalledMessage, WireError> {
    Ok(serde_json::from_slice(payload)?)
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), WireError> {
    if bytes.len() < needed {
        return Err(WireError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_addr(bytes: &[u8]) -> Result<BdAddr, WireError> {
    ensure_len(bytes, ADDR_LEN)?;
    let mut addr = [0_u8; ADDR_LEN];
    addr.copy_from_slice(&bytes[..ADDR_LEN]);
    Ok(BdAddr::new(addr))
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn data_len(data: &[u8]) -> u16 {
    u16::try_from(data.len()).unwrap_or(u16::MAX)
}
