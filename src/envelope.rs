//! Binary file envelope shared by model and artifact files
//!
//! Every file the pipeline reads or writes uses the same envelope:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Magic (4 bytes)                              │
//! │ Version: major.minor (2 bytes)               │
//! │ Reserved flags (2 bytes)                     │
//! │ Payload length (8 bytes, little-endian)      │
//! │ Payload CRC32 (4 bytes, little-endian)       │
//! ├──────────────────────────────────────────────┤
//! │ JSON payload                                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The CRC covers only the payload; header corruption is caught by the
//! magic and length checks.

use crate::error::{PortarError, Result};

/// Envelope header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Format version written by this crate
pub const VERSION: (u8, u8) = (1, 0);

/// CRC32 checksum (IEEE polynomial 0xEDB88320)
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

/// Wrap a payload in the envelope
#[must_use]
pub fn write_envelope(magic: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    out.push(VERSION.0);
    out.push(VERSION.1);
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc32(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate an envelope and return the payload slice
///
/// # Errors
///
/// Returns error on wrong magic, unsupported major version, truncation, or
/// CRC mismatch.
pub fn read_envelope(magic: [u8; 4], data: &[u8]) -> Result<&[u8]> {
    if data.len() < HEADER_SIZE {
        return Err(PortarError::Format {
            reason: format!(
                "File too short for envelope header: {} bytes (need {HEADER_SIZE})",
                data.len()
            ),
        });
    }
    if data[0..4] != magic {
        return Err(PortarError::Format {
            reason: format!(
                "Bad magic: expected {:?}, got {:?}",
                magic,
                &data[0..4]
            ),
        });
    }
    if data[4] != VERSION.0 {
        return Err(PortarError::Format {
            reason: format!("Unsupported format version {}.{}", data[4], data[5]),
        });
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[8..16]);
    let payload_len = u64::from_le_bytes(len_bytes) as usize;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[16..20]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let end = HEADER_SIZE + payload_len;
    if data.len() < end {
        return Err(PortarError::Format {
            reason: format!(
                "File truncated: expected {end} bytes for payload, got {}",
                data.len()
            ),
        });
    }

    let payload = &data[HEADER_SIZE..end];
    let actual_crc = crc32(payload);
    if actual_crc != expected_crc {
        return Err(PortarError::Format {
            reason: format!(
                "Checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            ),
        });
    }

    Ok(payload)
}
