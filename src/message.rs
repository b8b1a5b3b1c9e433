//! Consensus wire messages.
//!
//! Every outgoing message is `[class tag][instruction tag][message type]`
//! followed by a body. All bodies open with the same fixed header — consensus
//! id, block hash, sender's committee index — and close with a 64-byte
//! signature by the sender over the whole body up to (but not including) the
//! signature itself. Integers are big-endian throughout.

use crate::error::Error;

pub(crate) mod constants;

/// The message-type byte following the class and instruction tags. Exposed
/// so the host dispatcher can route inbound traffic without parsing bodies.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MessageType {
    /// Leader announces the payload to the committee.
    Announce = 0x00,
    /// Backup sends its round-1 commit point.
    Commit = 0x01,
    /// Leader challenges a candidate subset.
    Challenge = 0x02,
    /// Backup answers a challenge with its response share.
    Response = 0x03,
    /// Leader publishes the round-1 collective signature.
    CollectiveSig = 0x04,
    /// Backup sends its round-2 commit point.
    FinalCommit = 0x05,
    /// Leader challenges a candidate subset in round 2.
    FinalChallenge = 0x06,
    /// Backup answers a round-2 challenge.
    FinalResponse = 0x07,
    /// Leader publishes the final collective signature.
    FinalCollectiveSig = 0x08,
    /// Backup reports that payload validation failed.
    CommitFailure = 0x09,
    /// Leader declares the instance failed.
    ConsensusFailure = 0x0a,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        Ok(match byte {
            0x00 => MessageType::Announce,
            0x01 => MessageType::Commit,
            0x02 => MessageType::Challenge,
            0x03 => MessageType::Response,
            0x04 => MessageType::CollectiveSig,
            0x05 => MessageType::FinalCommit,
            0x06 => MessageType::FinalChallenge,
            0x07 => MessageType::FinalResponse,
            0x08 => MessageType::FinalCollectiveSig,
            0x09 => MessageType::CommitFailure,
            0x0a => MessageType::ConsensusFailure,
            _ => return Err(Error::MalformedMessage),
        })
    }
}

/// The fields every body opens with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Header {
    pub consensus_id: u32,
    pub block_hash: [u8; constants::BLOCK_HASH_SIZE],
    pub peer_id: u16,
}

/// A bounds-checked forward cursor over a message body. Every read either
/// yields the requested bytes or fails with [`Error::MalformedMessage`];
/// there is no partial state to unwind.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::MalformedMessage)?;
        if end > self.buf.len() {
            return Err(Error::MalformedMessage);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn header(&mut self) -> Result<Header, Error> {
        let consensus_id = self.u32()?;
        let mut block_hash = [0u8; constants::BLOCK_HASH_SIZE];
        block_hash.copy_from_slice(self.bytes(constants::BLOCK_HASH_SIZE)?);
        let peer_id = self.u16()?;
        Ok(Header {
            consensus_id,
            block_hash,
            peer_id,
        })
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Offset of the cursor from the start of the body.
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Start a message: class tag, instruction tag, type byte.
pub(crate) fn begin(class_tag: u8, instruction_tag: u8, kind: MessageType) -> Vec<u8> {
    vec![class_tag, instruction_tag, kind as u8]
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_header(
    buf: &mut Vec<u8>,
    consensus_id: u32,
    block_hash: &[u8; constants::BLOCK_HASH_SIZE],
    peer_id: u16,
) {
    put_u32(buf, consensus_id);
    buf.extend_from_slice(block_hash);
    put_u16(buf, peer_id);
}
