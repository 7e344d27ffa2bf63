#![allow(dead_code)]

use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer: short")]
    ErrBufferShort,
    #[error(
        "not long enough to decode: (expected: {expected}, actual: {actual})"
    )]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },

    //STUN errors
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("transaction is timed out")]
    ErrTransactionTimeOut,
    #[error("transaction not exists")]
    ErrTransactionNotExists,
    #[error("no default reason for ErrorCode")]
    ErrNoDefaultReason,
    #[error("unexpected EOF")]
    ErrUnexpectedEof,
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("attribute size overflow")]
    ErrAttributeSizeOverflow,
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,
    #[error("integrity check failed")]
    ErrIntegrityMismatch,
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,
    #[error("FINGERPRINT before MESSAGE-INTEGRITY attribute")]
    ErrFingerprintBeforeIntegrity,
    #[error("invalid length of IP value")]
    ErrBadIpLength,
    #[error("unsupported address family")]
    ErrBadAddressFamily,
    #[error("STUN server address is not set for the client")]
    ErrStunserverAddressNotSet,
    #[error("NAT discovery is already in progress")]
    ErrNatDiscoveryInProgress,

    // TURN errors
    #[error("non-STUN message from STUN server")]
    ErrNonStunmessage,
    #[error("unexpected STUN request message")]
    ErrUnexpectedStunrequestMessage,
    #[error("channel number not in [0x4000, 0x7FFF]")]
    ErrInvalidChannelNumber,
    #[error("channelData length != len(Data)")]
    ErrBadChannelDataLength,
    #[error("no binding found for channel")]
    ErrChannelBindNotFound,
    #[error("only one Allocate() caller is allowed")]
    ErrOneAllocateOnly,
    #[error("already allocated")]
    ErrAlreadyAllocated,
    #[error("no relay has been allocated")]
    ErrNoAllocation,
    #[error("TURN server address is not set for the client")]
    ErrTurnServerAddressNotSet,
    #[error("allocate error response without REALM and NONCE")]
    ErrAllocateChallengeMissing,

    // ICE errors
    #[error("no free ICE slot available")]
    ErrIceNoFreeSlot,
    #[error("ICE slot is bound to a live DTLS session")]
    ErrIceSlotBusy,
    #[error("ICE slot does not exist")]
    ErrIceSlotNotExisted,
    #[error("unsupported offer block version {0}")]
    ErrIceOfferVersion(u16),
    #[error("offer block carries more than {0} candidates")]
    ErrIceTooManyCandidates(usize),
    #[error("offer block field exceeds 255 bytes")]
    ErrIceOfferFieldTooLong,
    #[error("local credentials must be an 8 byte username and a 32 byte key")]
    ErrIceCredentialsLength,
    #[error("only IPv4 candidates are supported")]
    ErrIceCandidateNotIpv4,

    //SCTP errors
    #[error("raw is too small for a SCTP chunk")]
    ErrChunkHeaderTooSmall,
    #[error("not enough data left in SCTP packet to satisfy requested length")]
    ErrChunkHeaderNotEnoughSpace,
    #[error("chunk has invalid length")]
    ErrChunkHeaderInvalidLength,
    #[error("chunk Value isn't long enough for mandatory parameters exp")]
    ErrChunkValueNotLongEnough,
    #[error("packet is smaller than the header size")]
    ErrChunkPayloadSmall,
    #[error("SACK Chunk size is not large enough to contain header")]
    ErrSackSizeNotLargeEnoughInfo,
    #[error("param header too short")]
    ErrParamHeaderTooShort,
    #[error("param self reported length is longer than header length")]
    ErrParamHeaderSelfReportedLengthLonger,
    #[error("outgoing SSN reset request parameter too short")]
    ErrSsnResetRequestParamTooShort,
    #[error("reconfig response parameter too short")]
    ErrReconfigRespParamTooShort,
    #[error("raw is smaller than the minimum length for a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("checksum mismatch theirs: {theirs:#010x}, ours: {ours:#010x}")]
    ErrChecksumMismatch { theirs: u32, ours: u32 },
    #[error("no cookie in InitAck")]
    ErrInitAckNoCookie,
    #[error("sending payload data in non-Established state")]
    ErrPayloadDataStateNotExist,
    #[error("stream {0} is not assigned")]
    ErrStreamNotAssigned(u16),
    #[error("stream identifier {0} is out of range")]
    ErrStreamIdOutOfRange(u16),
    #[error("refusing to send an empty payload")]
    ErrEmptyPayload,

    //Data Channel
    #[error("Max Data Channel ID")]
    ErrMaxDataChannelID,
    #[error("data channel on stream {0} already exists")]
    ErrDataChannelExists(u16),
    #[error("Unknown MessageType {0}")]
    InvalidMessageType(u8),
    #[error("Unknown ChannelType {0}")]
    InvalidChannelType(u8),
    #[error("Unknown PayloadProtocolIdentifier {0}")]
    InvalidPayloadProtocolIdentifier(u32),

    // DTLS session errors
    #[error("no free DTLS session slot available")]
    ErrDtlsNoFreeSlot,
    #[error("DTLS session does not exist")]
    ErrDtlsSessionNotExisted,
    #[error("DTLS handshake failed")]
    ErrDtlsHandshakeFailed,
    #[error("DTLS session is not connected")]
    ErrDtlsNotConnected,
    #[error("conn is closed")]
    ErrConnClosed,
    #[error("tls engine: {0}")]
    ErrTlsEngine(String),

    #[error("utf-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Io(#[source] IoError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
