//! Preview snapshot appended to the tail of every finished file.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u32 size | "thm" | u8 type | u32 width | u32 height | u32 virtual_width | u32 virtual_height | payload
//! ```
//!
//! `size` covers the whole box including its 8-byte header.

use camrec_media_info::{ThumbnailKind, ThumbnailParams};

pub const TAG: &[u8; 3] = b"thm";
pub const HEADER_LEN: usize = 8;
pub const GEOMETRY_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BoxError {
    #[error("Box truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Not a thumbnail box")]
    BadTag,
    #[error("Unknown thumbnail type {0}")]
    UnknownType(u8),
    #[error("Thumbnail too large for a 32-bit box ({0} bytes)")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailBox {
    pub params: ThumbnailParams,
    pub payload: Vec<u8>,
}

impl ThumbnailBox {
    pub fn new(params: ThumbnailParams, payload: Vec<u8>) -> Self {
        Self { params, payload }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + GEOMETRY_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, BoxError> {
        let len = self.encoded_len();
        let size = u32::try_from(len).map_err(|_| BoxError::TooLarge(self.payload.len()))?;

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(TAG);
        out.push(self.params.kind.code());
        for value in [
            self.params.width,
            self.params.height,
            self.params.virtual_width,
            self.params.virtual_height,
        ] {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);

        Ok(out)
    }

    /// Parses a box starting at the beginning of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, BoxError> {
        let fixed = HEADER_LEN + GEOMETRY_LEN;
        if bytes.len() < fixed {
            return Err(BoxError::Truncated {
                needed: fixed,
                available: bytes.len(),
            });
        }

        if &bytes[4..7] != TAG {
            return Err(BoxError::BadTag);
        }

        let size = read_u32(bytes, 0) as usize;
        if size < fixed {
            return Err(BoxError::BadTag);
        }
        if bytes.len() < size {
            return Err(BoxError::Truncated {
                needed: size,
                available: bytes.len(),
            });
        }

        let kind = ThumbnailKind::from_code(bytes[7]).ok_or(BoxError::UnknownType(bytes[7]))?;

        Ok(Self {
            params: ThumbnailParams {
                kind,
                width: read_u32(bytes, 8),
                height: read_u32(bytes, 12),
                virtual_width: read_u32(bytes, 16),
                virtual_height: read_u32(bytes, 20),
            },
            payload: bytes[fixed..size].to_vec(),
        })
    }

    /// Finds the last well-formed box in `bytes`, returning its offset.
    pub fn find_last(bytes: &[u8]) -> Option<(usize, Self)> {
        let mut end = bytes.len();
        while end >= HEADER_LEN {
            let at = bytes[..end]
                .windows(TAG.len())
                .rposition(|w| w == TAG)?
                .checked_sub(4)?;

            if let Ok(thumbnail) = Self::decode(&bytes[at..]) {
                return Some((at, thumbnail));
            }

            end = at + 4 + TAG.len() - 1;
        }

        None
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
