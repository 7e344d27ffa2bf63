use crate::chunk::Chunk;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISCSI, Crc};
use log::trace;
use shared::error::{Error, Result};
use shared::marshal::*;

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Packet represents an SCTP packet, defined in <https://tools.ietf.org/html/rfc4960#section-3>
///
///```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Source Port Number        |     Destination Port Number   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Verification Tag                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Checksum                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    /// Verifies the CRC32c checksum and decodes the chunks.
    ///
    /// A chunk that does not fit the packet ends decoding, as does an unrecognised chunk
    /// type whose high bit asks the receiver to stop; what was decoded before it is kept.
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let theirs = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let ours = generate_packet_checksum(raw);
        if theirs != ours {
            return Err(Error::ErrChecksumMismatch { theirs, ours });
        }

        let reader = &mut raw.clone();
        let source_port = reader.get_u16();
        let destination_port = reader.get_u16();
        let verification_tag = reader.get_u32();
        reader.advance(4);

        let mut chunks = vec![];
        while reader.remaining() >= 4 {
            match Chunk::unmarshal(reader) {
                Ok(Chunk::Unknown(header)) if !header.typ.is_skippable() => {
                    trace!("stop processing packet at unknown chunk {}", header.typ);
                    break;
                }
                Ok(Chunk::Unknown(header)) => {
                    trace!("skip unknown chunk {}", header.typ);
                }
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    trace!("stop processing packet at malformed chunk: {err}");
                    break;
                }
            }
        }

        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }

    pub fn marshal(&self) -> Result<BytesMut> {
        let size =
            PACKET_HEADER_SIZE + self.chunks.iter().map(|c| c.marshal_size()).sum::<usize>();
        let mut raw = BytesMut::with_capacity(size);
        raw.put_u16(self.source_port);
        raw.put_u16(self.destination_port);
        raw.put_u32(self.verification_tag);
        raw.put_u32(0);
        raw.resize(size, 0);

        let mut offset = PACKET_HEADER_SIZE;
        for chunk in &self.chunks {
            offset += chunk.marshal_to(&mut raw[offset..])?;
        }

        let checksum = generate_packet_checksum(&raw);
        raw[8..12].copy_from_slice(&checksum.to_le_bytes());
        Ok(raw)
    }
}

/// CRC32c over the packet with the checksum field taken as zero.
pub(crate) fn generate_packet_checksum(raw: &[u8]) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[0..8]);
    digest.update(&[0u8; 4]);
    digest.update(&raw[PACKET_HEADER_SIZE..]);
    digest.finalize()
}
