//! MRT record walker for BGP4MP update archives (RFC 6396).
//!
//! Records are read one at a time from any [`Read`] source, so a
//! decompressed archive is never held in memory. Only BGP UPDATE messages
//! carried in BGP4MP / BGP4MP_ET `MESSAGE*` subtypes contribute
//! observations; every other record is counted as skipped.

use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::engine::aggregate::{observe, Contributions, ObservationKey};

const MRT_HEADER_SIZE: usize = 12;

const TYPE_BGP4MP: u16 = 16;
const TYPE_BGP4MP_ET: u16 = 17;

const SUBTYPE_MESSAGE: u16 = 1;
const SUBTYPE_MESSAGE_AS4: u16 = 4;
const SUBTYPE_MESSAGE_LOCAL: u16 = 6;
const SUBTYPE_MESSAGE_AS4_LOCAL: u16 = 7;

const BGP_MARKER_SIZE: usize = 16;
const BGP_HEADER_SIZE: usize = 19;
const BGP_MSG_UPDATE: u8 = 2;

const ATTR_FLAG_EXTENDED_LENGTH: u8 = 0x10;
const ATTR_MP_REACH_NLRI: u8 = 14;

const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;
const SAFI_UNICAST: u8 = 1;

/// Largest record body accepted; a corrupt length field must not turn into
/// a huge allocation.
const MAX_RECORD_LEN: usize = 1 << 24;

/// Errors that can occur while walking MRT records.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("record header truncated: {size} bytes")]
    TruncatedHeader { size: usize },

    #[error("record truncated: header announces {expected} bytes, {available} available")]
    TruncatedRecord { expected: usize, available: usize },

    #[error("record length {len} exceeds limit")]
    RecordTooLarge { len: usize },

    #[error("reading {section}: unexpected end of data")]
    PayloadTruncated { section: &'static str },

    #[error("invalid BGP message length {len}")]
    InvalidMessageLength { len: usize },

    #[error("invalid prefix length {bits} for AFI {afi}")]
    InvalidPrefixLength { afi: u16, bits: u8 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Record counts from one parse pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseSummary {
    pub records: u64,
    pub updates: u64,
    pub skipped: u64,
    pub prefixes: u64,
}

/// Walks every MRT record in `reader`, adding one observation per announced
/// prefix to `out`.
pub fn parse_stream<R: Read>(
    mut reader: R,
    out: &mut Contributions,
) -> Result<ParseSummary, ParseError> {
    let mut summary = ParseSummary::default();
    let mut header = [0u8; MRT_HEADER_SIZE];
    let mut body = Vec::new();

    loop {
        let got = read_full(&mut reader, &mut header)?;
        if got == 0 {
            break;
        }
        if got < MRT_HEADER_SIZE {
            return Err(ParseError::TruncatedHeader { size: got });
        }

        let mrt_type = u16::from_be_bytes([header[4], header[5]]);
        let subtype = u16::from_be_bytes([header[6], header[7]]);
        let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if len > MAX_RECORD_LEN {
            return Err(ParseError::RecordTooLarge { len });
        }

        body.resize(len, 0);
        let available = read_full(&mut reader, &mut body)?;
        if available < len {
            return Err(ParseError::TruncatedRecord {
                expected: len,
                available,
            });
        }

        summary.records += 1;
        match parse_record(mrt_type, subtype, &body, out)? {
            Some(prefixes) => {
                summary.updates += 1;
                summary.prefixes += prefixes;
            }
            None => summary.skipped += 1,
        }
    }

    Ok(summary)
}

/// Returns the number of prefixes observed, or `None` when the record does
/// not carry a BGP UPDATE.
fn parse_record(
    mrt_type: u16,
    subtype: u16,
    body: &[u8],
    out: &mut Contributions,
) -> Result<Option<u64>, ParseError> {
    let mut r = ByteReader::new(body);

    match mrt_type {
        TYPE_BGP4MP => {}
        TYPE_BGP4MP_ET => {
            r.take(4, "BGP4MP_ET microsecond timestamp")?;
        }
        _ => return Ok(None),
    }

    let as4 = match subtype {
        SUBTYPE_MESSAGE | SUBTYPE_MESSAGE_LOCAL => false,
        SUBTYPE_MESSAGE_AS4 | SUBTYPE_MESSAGE_AS4_LOCAL => true,
        _ => return Ok(None),
    };

    let peer_as = if as4 {
        r.u32("BGP4MP peer AS")?
    } else {
        u32::from(r.u16("BGP4MP peer AS")?)
    };
    if as4 {
        r.u32("BGP4MP local AS")?;
    } else {
        r.u16("BGP4MP local AS")?;
    }
    r.u16("BGP4MP interface index")?;

    let addr_len = match r.u16("BGP4MP address family")? {
        AFI_IPV4 => 4,
        AFI_IPV6 => 16,
        _ => return Ok(None),
    };
    r.take(addr_len, "BGP4MP peer address")?;
    r.take(addr_len, "BGP4MP local address")?;

    r.take(BGP_MARKER_SIZE, "BGP marker")?;
    let msg_len = usize::from(r.u16("BGP message length")?);
    let msg_type = r.u8("BGP message type")?;
    if msg_len < BGP_HEADER_SIZE || msg_len - BGP_HEADER_SIZE > r.remaining() {
        return Err(ParseError::InvalidMessageLength { len: msg_len });
    }
    if msg_type != BGP_MSG_UPDATE {
        return Ok(None);
    }

    let message = r.take(msg_len - BGP_HEADER_SIZE, "BGP UPDATE")?;
    parse_update(peer_as, message, out).map(Some)
}

fn parse_update(peer_as: u32, message: &[u8], out: &mut Contributions) -> Result<u64, ParseError> {
    let mut r = ByteReader::new(message);

    let withdrawn_len = usize::from(r.u16("withdrawn routes length")?);
    r.take(withdrawn_len, "withdrawn routes")?;

    let attrs_len = usize::from(r.u16("path attributes length")?);
    let mut attrs = ByteReader::new(r.take(attrs_len, "path attributes")?);

    let mut prefixes = 0;
    while attrs.remaining() > 0 {
        let flags = attrs.u8("attribute flags")?;
        let code = attrs.u8("attribute type")?;
        let len = if flags & ATTR_FLAG_EXTENDED_LENGTH != 0 {
            usize::from(attrs.u16("attribute length")?)
        } else {
            usize::from(attrs.u8("attribute length")?)
        };
        let value = attrs.take(len, "attribute value")?;

        if code == ATTR_MP_REACH_NLRI {
            prefixes += parse_mp_reach(peer_as, value, out)?;
        }
    }

    prefixes += walk_prefixes(peer_as, AFI_IPV4, r.rest(), out)?;
    Ok(prefixes)
}

fn parse_mp_reach(peer_as: u32, value: &[u8], out: &mut Contributions) -> Result<u64, ParseError> {
    let mut r = ByteReader::new(value);

    let afi = r.u16("MP_REACH_NLRI AFI")?;
    let safi = r.u8("MP_REACH_NLRI SAFI")?;
    let next_hop_len = usize::from(r.u8("MP_REACH_NLRI next hop length")?);
    r.take(next_hop_len, "MP_REACH_NLRI next hop")?;
    r.u8("MP_REACH_NLRI reserved")?;

    if safi != SAFI_UNICAST || (afi != AFI_IPV4 && afi != AFI_IPV6) {
        return Ok(0);
    }

    walk_prefixes(peer_as, afi, r.rest(), out)
}

fn walk_prefixes(
    peer_as: u32,
    afi: u16,
    nlri: &[u8],
    out: &mut Contributions,
) -> Result<u64, ParseError> {
    let max_bits = if afi == AFI_IPV4 { 32 } else { 128 };
    let mut r = ByteReader::new(nlri);
    let mut count = 0;

    while r.remaining() > 0 {
        let bits = r.u8("NLRI prefix length")?;
        if bits > max_bits {
            return Err(ParseError::InvalidPrefixLength { afi, bits });
        }
        let bytes = r.take(usize::from(bits).div_ceil(8), "NLRI prefix")?;

        observe(out, ObservationKey::new(peer_as, format_prefix(afi, bits, bytes)));
        count += 1;
    }

    Ok(count)
}

/// Renders a prefix in CIDR notation with host bits cleared.
fn format_prefix(afi: u16, bits: u8, bytes: &[u8]) -> String {
    if afi == AFI_IPV4 {
        let mut octets = [0u8; 4];
        octets[..bytes.len()].copy_from_slice(bytes);
        let mask = u32::MAX.checked_shl(32 - u32::from(bits)).unwrap_or(0);
        let addr = Ipv4Addr::from(u32::from_be_bytes(octets) & mask);
        format!("{addr}/{bits}")
    } else {
        let mut octets = [0u8; 16];
        octets[..bytes.len()].copy_from_slice(bytes);
        let mask = u128::MAX.checked_shl(128 - u32::from(bits)).unwrap_or(0);
        let addr = Ipv6Addr::from(u128::from_be_bytes(octets) & mask);
        format!("{addr}/{bits}")
    }
}

/// Fills `buf` as far as the source allows; returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Bounds-checked big-endian reader
// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    fn take(&mut self, n: usize, section: &'static str) -> Result<&'a [u8], ParseError> {
        if self.buf.len() < n {
            return Err(ParseError::PayloadTruncated { section });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    #[inline]
    fn take_array<const N: usize>(&mut self, section: &'static str) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, section)?);
        Ok(out)
    }

    #[inline]
    fn u8(&mut self, section: &'static str) -> Result<u8, ParseError> {
        Ok(self.take_array::<1>(section)?[0])
    }

    #[inline]
    fn u16(&mut self, section: &'static str) -> Result<u16, ParseError> {
        Ok(u16::from_be_bytes(self.take_array(section)?))
    }

    #[inline]
    fn u32(&mut self, section: &'static str) -> Result<u32, ParseError> {
        Ok(u32::from_be_bytes(self.take_array(section)?))
    }
}
