// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Just-enough QUIC header inspection for demultiplexing.
//!
//! Steering needs three facts about a datagram: whether it parses as QUIC
//! at all, which header form it carries, and the CIDs relevant to routing.
//! Header protection makes anything past the invariant header unreadable
//! without crypto context, so only the version-independent prefix is
//! decoded here. Short headers carry no CID length on the wire; the local
//! namespace fixes it at 12.

use thiserror::Error;

use crate::cid::CID_LEN;

const LONG_HEADER_FORM: u8 = 0x80;
const MAX_CID_LEN: usize = 20;

/// The steering-relevant view of a datagram's first packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Header<'a> {
    /// Long header; both CIDs are carried explicitly.
    Long {
        dst_cid: &'a [u8],
        src_cid: &'a [u8],
    },
    /// Short header; the destination CID length is implied.
    Short { dst_cid: &'a [u8] },
}

impl<'a> Header<'a> {
    /// The CID that routes this datagram onward.
    pub(crate) fn dst_cid(&self) -> &'a [u8] {
        match self {
            Self::Long { dst_cid, .. } | Self::Short { dst_cid } => dst_cid,
        }
    }

    /// The CID carrying the plane discriminator at the rendezvous.
    ///
    /// A long-header destination CID is client-chosen and may be
    /// arbitrary; the server-controlled source CID is authoritative there.
    /// Short headers only have the destination.
    pub(crate) fn plane_cid(&self) -> &'a [u8] {
        match self {
            Self::Long { src_cid, .. } => src_cid,
            Self::Short { dst_cid } => dst_cid,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub(crate) struct ParseError(&'static str);

/// Decodes the invariant header of the first QUIC packet in `datagram`.
pub(crate) fn decode(datagram: &[u8]) -> Result<Header<'_>, ParseError> {
    let (&first, rest) = datagram
        .split_first()
        .ok_or(ParseError("empty datagram"))?;
    if first & LONG_HEADER_FORM == 0 {
        let dst_cid = rest
            .get(..CID_LEN)
            .ok_or(ParseError("short header truncated"))?;
        return Ok(Header::Short { dst_cid });
    }
    // Version; its value is irrelevant to steering.
    let rest = rest.get(4..).ok_or(ParseError("long header truncated"))?;
    let (dst_cid, rest) = get_cid(rest)?;
    let (src_cid, _) = get_cid(rest)?;
    Ok(Header::Long { dst_cid, src_cid })
}

fn get_cid(buf: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let (&len, rest) = buf
        .split_first()
        .ok_or(ParseError("connection ID length missing"))?;
    let len = len as usize;
    if len > MAX_CID_LEN {
        return Err(ParseError("illegal connection ID length"));
    }
    if rest.len() < len {
        return Err(ParseError("connection ID longer than packet"));
    }
    Ok(rest.split_at(len))
}
