//! OpenTimestamps Proof Format
//!
//! Decoder and encoder for the subset of the OpenTimestamps serialization
//! that calendars emit: sha256, append and prepend operations, forks, and
//! Bitcoin and pending attestations. Every message in a decoded tree is
//! computed by replaying the operations from the starting digest, so an
//! attestation only ever vouches for the message its path produces.

use sha2::{Digest, Sha256};

use crate::error::{LedgerError, LedgerResult};

/// Opening bytes of a detached timestamp file
pub const HEADER_MAGIC: &[u8; 31] =
    b"\x00OpenTimestamps\x00\x00Proof\x00\xbf\x89\xe2\xe8\x84\xe8\x92\x94";
const MAJOR_VERSION: u64 = 1;

pub const BITCOIN_TAG: [u8; 8] = [0x05, 0x88, 0x96, 0x0d, 0x73, 0xd7, 0x19, 0x01];
pub const PENDING_TAG: [u8; 8] = [0x83, 0xdf, 0xe3, 0x0d, 0x2e, 0xf9, 0x0c, 0x8e];

const TAG_ATTESTATION: u8 = 0x00;
const TAG_FORK: u8 = 0xff;
const OP_SHA256: u8 = 0x08;
const OP_APPEND: u8 = 0xf0;
const OP_PREPEND: u8 = 0xf1;

const MAX_DEPTH: usize = 256;
const MAX_MESSAGE_LEN: usize = 4096;
const MAX_PAYLOAD_LEN: usize = 8192;
const MAX_URI_LEN: usize = 1000;

fn malformed(reason: impl std::fmt::Display) -> LedgerError {
    LedgerError::SerializationError(format!("Malformed timestamp: {}", reason))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Sha256,
    Append(Vec<u8>),
    Prepend(Vec<u8>),
}

impl Op {
    pub fn apply(&self, msg: &[u8]) -> Vec<u8> {
        match self {
            Op::Sha256 => Sha256::digest(msg).to_vec(),
            Op::Append(suffix) => [msg, suffix.as_slice()].concat(),
            Op::Prepend(prefix) => [prefix.as_slice(), msg].concat(),
        }
    }

    fn read(reader: &mut Reader<'_>, tag: u8) -> LedgerResult<Self> {
        match tag {
            OP_SHA256 => Ok(Op::Sha256),
            OP_APPEND => Ok(Op::Append(reader.varbytes(MAX_MESSAGE_LEN)?.to_vec())),
            OP_PREPEND => Ok(Op::Prepend(reader.varbytes(MAX_MESSAGE_LEN)?.to_vec())),
            other => Err(malformed(format!("unsupported operation 0x{:02x}", other))),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Op::Sha256 => out.push(OP_SHA256),
            Op::Append(arg) => {
                out.push(OP_APPEND);
                write_varbytes(out, arg);
            }
            Op::Prepend(arg) => {
                out.push(OP_PREPEND);
                write_varbytes(out, arg);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtsAttestation {
    /// The message is the Merkle root of the block at `height`
    Bitcoin { height: u64 },
    /// A calendar promises to commit the message later
    Pending { uri: String },
    Unknown { tag: [u8; 8], payload: Vec<u8> },
}

impl OtsAttestation {
    fn read(reader: &mut Reader<'_>) -> LedgerResult<Self> {
        let mut tag = [0u8; 8];
        tag.copy_from_slice(reader.take(8)?);
        let payload = reader.varbytes(MAX_PAYLOAD_LEN)?;
        let mut inner = Reader::new(payload);

        let attestation = match tag {
            BITCOIN_TAG => OtsAttestation::Bitcoin {
                height: inner.varuint()?,
            },
            PENDING_TAG => {
                let uri = std::str::from_utf8(inner.varbytes(MAX_URI_LEN)?)
                    .map_err(|_| malformed("calendar uri is not UTF-8"))?;
                OtsAttestation::Pending {
                    uri: uri.to_string(),
                }
            }
            _ => {
                return Ok(OtsAttestation::Unknown {
                    tag,
                    payload: payload.to_vec(),
                })
            }
        };
        inner.finish()?;
        Ok(attestation)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let tag = match self {
            OtsAttestation::Bitcoin { height } => {
                write_varuint(&mut payload, *height);
                BITCOIN_TAG
            }
            OtsAttestation::Pending { uri } => {
                write_varbytes(&mut payload, uri.as_bytes());
                PENDING_TAG
            }
            OtsAttestation::Unknown { tag, payload: raw } => {
                payload.extend_from_slice(raw);
                *tag
            }
        };
        out.extend_from_slice(&tag);
        write_varbytes(out, &payload);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Attest(OtsAttestation),
    Op(Op, Timestamp),
}

/// A message together with everything that attests it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    pub msg: Vec<u8>,
    pub steps: Vec<Step>,
}

/// An attestation and the replayed message it vouches for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment<'a> {
    pub msg: &'a [u8],
    pub attestation: &'a OtsAttestation,
}

impl Timestamp {
    /// Decode a bare timestamp whose starting message is `msg`
    pub fn decode(msg: &[u8], bytes: &[u8]) -> LedgerResult<Self> {
        let mut reader = Reader::new(bytes);
        let timestamp = Self::read(&mut reader, msg.to_vec(), 0)?;
        reader.finish()?;
        Ok(timestamp)
    }

    fn read(reader: &mut Reader<'_>, msg: Vec<u8>, depth: usize) -> LedgerResult<Self> {
        if depth > MAX_DEPTH {
            return Err(malformed("nesting too deep"));
        }
        let mut steps = Vec::new();
        loop {
            let tag = reader.byte()?;
            if tag == TAG_FORK {
                let tag = reader.byte()?;
                steps.push(Self::read_step(reader, &msg, tag, depth)?);
            } else {
                steps.push(Self::read_step(reader, &msg, tag, depth)?);
                break;
            }
        }
        Ok(Self { msg, steps })
    }

    fn read_step(reader: &mut Reader<'_>, msg: &[u8], tag: u8, depth: usize) -> LedgerResult<Step> {
        if tag == TAG_ATTESTATION {
            return Ok(Step::Attest(OtsAttestation::read(reader)?));
        }
        let op = Op::read(reader, tag)?;
        let next = op.apply(msg);
        if next.len() > MAX_MESSAGE_LEN {
            return Err(malformed("message grows past the size limit"));
        }
        let child = Self::read(reader, next, depth + 1)?;
        Ok(Step::Op(op, child))
    }

    /// Every step but the last is announced by a fork marker
    fn write(&self, out: &mut Vec<u8>) {
        let last = self.steps.len().saturating_sub(1);
        for (i, step) in self.steps.iter().enumerate() {
            if i < last {
                out.push(TAG_FORK);
            }
            match step {
                Step::Attest(attestation) => {
                    out.push(TAG_ATTESTATION);
                    attestation.write(out);
                }
                Step::Op(op, child) => {
                    op.write(out);
                    child.write(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    pub fn commitments(&self) -> Vec<Commitment<'_>> {
        let mut found = Vec::new();
        self.collect(&mut found);
        found
    }

    fn collect<'a>(&'a self, found: &mut Vec<Commitment<'a>>) {
        for step in &self.steps {
            match step {
                Step::Attest(attestation) => found.push(Commitment {
                    msg: &self.msg,
                    attestation,
                }),
                Step::Op(_, child) => child.collect(found),
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.commitments()
            .iter()
            .any(|c| matches!(c.attestation, OtsAttestation::Bitcoin { .. }))
    }

    /// Graft `other`, a timestamp of some message in this tree, onto every
    /// node holding that message. Returns whether anything new was added.
    pub fn merge(&mut self, other: &Timestamp) -> bool {
        let mut changed = false;
        if self.msg == other.msg {
            for step in &other.steps {
                if !self.steps.contains(step) {
                    self.steps.push(step.clone());
                    changed = true;
                }
            }
            return changed;
        }
        for step in &mut self.steps {
            if let Step::Op(_, child) = step {
                changed |= child.merge(other);
            }
        }
        changed
    }
}

/// A timestamp bound to the sha256 digest it starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedTimestamp {
    pub digest: [u8; 32],
    pub timestamp: Timestamp,
}

impl DetachedTimestamp {
    pub fn new(digest: [u8; 32], timestamp: Timestamp) -> LedgerResult<Self> {
        if timestamp.msg != digest {
            return Err(malformed("timestamp does not start from the digest"));
        }
        Ok(Self { digest, timestamp })
    }

    pub fn decode(bytes: &[u8]) -> LedgerResult<Self> {
        let mut reader = Reader::new(bytes);
        if reader.take(HEADER_MAGIC.len())? != HEADER_MAGIC.as_slice() {
            return Err(malformed("missing OpenTimestamps header"));
        }
        let version = reader.varuint()?;
        if version != MAJOR_VERSION {
            return Err(malformed(format!("unsupported version {}", version)));
        }
        if reader.byte()? != OP_SHA256 {
            return Err(malformed("only sha256 file digests are supported"));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(reader.take(32)?);

        let timestamp = Timestamp::read(&mut reader, digest.to_vec(), 0)?;
        reader.finish()?;
        Ok(Self { digest, timestamp })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_MAGIC.len() + 34);
        out.extend_from_slice(HEADER_MAGIC);
        write_varuint(&mut out, MAJOR_VERSION);
        out.push(OP_SHA256);
        out.extend_from_slice(&self.digest);
        self.timestamp.write(&mut out);
        out
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> LedgerResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| malformed("unexpected end of data"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> LedgerResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// LEB128 unsigned integer
    fn varuint(&mut self) -> LedgerResult<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift >= 64 {
                return Err(malformed("varuint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn varbytes(&mut self, max: usize) -> LedgerResult<&'a [u8]> {
        let len = self.varuint()?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= max)
            .ok_or_else(|| malformed(format!("field of {} bytes exceeds {}", len, max)))?;
        self.take(len)
    }

    fn finish(&self) -> LedgerResult<()> {
        if self.pos != self.bytes.len() {
            return Err(malformed(format!(
                "{} trailing byte(s)",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varuint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}
