// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HXE image codec.
//!
//! An HXE file is the unit of deployment for HSX applications: a 64-byte
//! header, the code section (little-endian 32-bit words), the rodata
//! section, and an optional length-prefixed JSON manifest. The header
//! carries a CRC-32 over the numeric header fields plus both sections, so
//! a flipped bit anywhere in executable content is caught before a task
//! is ever created from it.
//!
//! Layout (all integers little-endian):
//!
//! | bytes  | field |
//! |--------|-------|
//! | 0..4   | magic `"HSXE"` |
//! | 4..6   | format version |
//! | 6..8   | flags ([`HxeFlags`]) |
//! | 8..12  | entry pc (code offset) |
//! | 12..16 | code length |
//! | 16..20 | rodata length |
//! | 20..24 | bss size |
//! | 24..28 | required capabilities ([`Capabilities`]) |
//! | 28..32 | CRC-32 |
//! | 32..64 | app name, NUL-terminated ASCII |
//!
//! The CRC input is header bytes 0..32 with the CRC field itself zeroed,
//! followed by the code bytes and then the rodata bytes; the name field
//! is not covered.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use hsx_abi::{
    Capabilities, HxeFlags, HXE_CRC_OFFSET, HXE_HEADER_LEN, HXE_MAGIC,
    HXE_NAME_LEN, HXE_NAME_MAX, HXE_NAME_OFFSET, HXE_VERSION,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Errors produced while decoding or constructing an image.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum HxeError {
    #[error("bad magic (expected \"HSXE\")")]
    BadMagic,
    #[error("unsupported format version {0:#06x}")]
    BadVersion(u16),
    #[error("file truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("crc mismatch: header says {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("code length {0} is not a multiple of the 4-byte instruction width")]
    CodeMisaligned(u32),
    #[error("entry pc {entry:#x} is outside the code section (len {code_len:#x})")]
    EntryOutOfRange { entry: u32, code_len: u32 },
    #[error("app name is missing its NUL terminator or exceeds {HXE_NAME_MAX} bytes")]
    BadName,
    #[error("app name contains non-ASCII or control bytes")]
    NameNotAscii,
    #[error("unknown header flag bits {0:#06x}")]
    UnknownFlags(u16),
    #[error("manifest is not valid UTF-8 JSON: {0}")]
    BadManifest(String),
    #[error("{0} trailing bytes after the manifest")]
    TrailingBytes(usize),
}

/// A decoded (or to-be-encoded) HXE image.
#[derive(Clone, Debug, PartialEq)]
pub struct HxeImage {
    pub name: String,
    pub flags: HxeFlags,
    pub entry: u32,
    pub bss_len: u32,
    pub capabilities: Capabilities,
    pub code: Vec<u8>,
    pub rodata: Vec<u8>,
    pub manifest: Option<serde_json::Value>,
}

impl HxeImage {
    /// Constructs an image from parts, applying the same validity rules
    /// as the decoder. The toolchain's writer goes through this before
    /// [`HxeImage::encode`].
    pub fn new(
        name: &str,
        flags: HxeFlags,
        entry: u32,
        code: Vec<u8>,
        rodata: Vec<u8>,
        bss_len: u32,
        capabilities: Capabilities,
    ) -> Result<Self, HxeError> {
        if name.len() > HXE_NAME_MAX || name.is_empty() {
            return Err(HxeError::BadName);
        }
        if !name.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(HxeError::NameNotAscii);
        }
        if code.len() % 4 != 0 {
            return Err(HxeError::CodeMisaligned(code.len() as u32));
        }
        if entry as usize >= code.len() || entry % 4 != 0 {
            return Err(HxeError::EntryOutOfRange {
                entry,
                code_len: code.len() as u32,
            });
        }
        Ok(Self {
            name: name.to_string(),
            flags,
            entry,
            bss_len,
            capabilities,
            code,
            rodata,
            manifest: None,
        })
    }

    pub fn allow_multiple_instances(&self) -> bool {
        self.flags.contains(HxeFlags::ALLOW_MULTIPLE_INSTANCES)
    }

    /// Decodes and fully validates an image.
    pub fn parse(bytes: &[u8]) -> Result<Self, HxeError> {
        if bytes.len() < HXE_HEADER_LEN {
            return Err(HxeError::Truncated {
                needed: HXE_HEADER_LEN,
                have: bytes.len(),
            });
        }
        if bytes[0..4] != HXE_MAGIC {
            return Err(HxeError::BadMagic);
        }
        let version = LittleEndian::read_u16(&bytes[4..6]);
        if version != HXE_VERSION {
            return Err(HxeError::BadVersion(version));
        }
        let raw_flags = LittleEndian::read_u16(&bytes[6..8]);
        let flags = HxeFlags::from_bits(raw_flags)
            .ok_or(HxeError::UnknownFlags(raw_flags))?;
        let entry = LittleEndian::read_u32(&bytes[8..12]);
        let code_len = LittleEndian::read_u32(&bytes[12..16]);
        let rodata_len = LittleEndian::read_u32(&bytes[16..20]);
        let bss_len = LittleEndian::read_u32(&bytes[20..24]);
        let capabilities = Capabilities::from_bits_truncate(
            LittleEndian::read_u32(&bytes[24..28]),
        );
        let stored_crc = LittleEndian::read_u32(&bytes[28..32]);

        if code_len % 4 != 0 {
            return Err(HxeError::CodeMisaligned(code_len));
        }

        let code_start = HXE_HEADER_LEN;
        let code_end = code_start + code_len as usize;
        let rodata_end = code_end + rodata_len as usize;
        if bytes.len() < rodata_end {
            return Err(HxeError::Truncated {
                needed: rodata_end,
                have: bytes.len(),
            });
        }
        let code = &bytes[code_start..code_end];
        let rodata = &bytes[code_end..rodata_end];

        let computed = image_crc(&bytes[0..HXE_HEADER_LEN], code, rodata);
        if computed != stored_crc {
            return Err(HxeError::CrcMismatch {
                stored: stored_crc,
                computed,
            });
        }

        if entry >= code_len || entry % 4 != 0 {
            return Err(HxeError::EntryOutOfRange { entry, code_len });
        }

        let name = parse_name(&bytes[HXE_NAME_OFFSET..HXE_NAME_OFFSET + HXE_NAME_LEN])?;

        let manifest = parse_manifest(&bytes[rodata_end..])?;

        Ok(Self {
            name,
            flags,
            entry,
            bss_len,
            capabilities,
            code: code.to_vec(),
            rodata: rodata.to_vec(),
            manifest,
        })
    }

    /// Serializes the image, computing the CRC field.
    pub fn encode(&self) -> Vec<u8> {
        let manifest_bytes = self
            .manifest
            .as_ref()
            .map(|m| serde_json::to_vec(m).unwrap_or_default());
        let total = HXE_HEADER_LEN
            + self.code.len()
            + self.rodata.len()
            + manifest_bytes.as_ref().map_or(0, |m| 4 + m.len());
        let mut out = vec![0u8; HXE_HEADER_LEN];
        out.reserve(total - HXE_HEADER_LEN);

        out[0..4].copy_from_slice(&HXE_MAGIC);
        LittleEndian::write_u16(&mut out[4..6], HXE_VERSION);
        LittleEndian::write_u16(&mut out[6..8], self.flags.bits());
        LittleEndian::write_u32(&mut out[8..12], self.entry);
        LittleEndian::write_u32(&mut out[12..16], self.code.len() as u32);
        LittleEndian::write_u32(&mut out[16..20], self.rodata.len() as u32);
        LittleEndian::write_u32(&mut out[20..24], self.bss_len);
        LittleEndian::write_u32(&mut out[24..28], self.capabilities.bits());
        // CRC field stays zero while we compute over it.
        let name_bytes = self.name.as_bytes();
        out[HXE_NAME_OFFSET..HXE_NAME_OFFSET + name_bytes.len()]
            .copy_from_slice(name_bytes);

        let crc = image_crc(&out[0..HXE_HEADER_LEN], &self.code, &self.rodata);
        LittleEndian::write_u32(
            &mut out[HXE_CRC_OFFSET..HXE_CRC_OFFSET + 4],
            crc,
        );

        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.rodata);
        if let Some(m) = manifest_bytes {
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, m.len() as u32);
            out.extend_from_slice(&len);
            out.extend_from_slice(&m);
        }
        out
    }
}

/// CRC-32 (IEEE polynomial) over the numeric header fields (with the CRC
/// slot zeroed), the code bytes, and the rodata bytes.
fn image_crc(header: &[u8], code: &[u8], rodata: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&header[0..HXE_CRC_OFFSET]);
    digest.update(&[0u8; 4]);
    // Name field (bytes 32..64) is not covered.
    digest.update(code);
    digest.update(rodata);
    digest.finalize()
}

fn parse_name(field: &[u8]) -> Result<String, HxeError> {
    let nul = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(HxeError::BadName)?;
    if nul > HXE_NAME_MAX || nul == 0 {
        return Err(HxeError::BadName);
    }
    let raw = &field[..nul];
    if !raw.iter().all(|&b| b.is_ascii_graphic() || b == b' ') {
        return Err(HxeError::NameNotAscii);
    }
    Ok(raw.iter().map(|&b| b as char).collect())
}

fn parse_manifest(rest: &[u8]) -> Result<Option<serde_json::Value>, HxeError> {
    if rest.is_empty() {
        return Ok(None);
    }
    if rest.len() < 4 {
        return Err(HxeError::Truncated {
            needed: 4,
            have: rest.len(),
        });
    }
    let len = LittleEndian::read_u32(&rest[0..4]) as usize;
    if rest.len() < 4 + len {
        return Err(HxeError::Truncated {
            needed: 4 + len,
            have: rest.len(),
        });
    }
    if rest.len() > 4 + len {
        return Err(HxeError::TrailingBytes(rest.len() - 4 - len));
    }
    serde_json::from_slice(&rest[4..4 + len])
        .map(Some)
        .map_err(|e| HxeError::BadManifest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HxeImage {
        // Two NOP-ish words; contents don't matter to the codec.
        let code = [0x0140_0000u32, 0x0140_0000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        HxeImage::new(
            "blinky",
            HxeFlags::empty(),
            0,
            code,
            b"hello rodata".to_vec(),
            128,
            Capabilities::MAILBOX | Capabilities::STDIO,
        )
        .unwrap()
    }

    #[test]
    fn encode_parse_round_trip() {
        let image = sample();
        let bytes = image.encode();
        let parsed = HxeImage::parse(&bytes).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn round_trip_with_manifest() {
        let mut image = sample();
        image.manifest =
            Some(serde_json::json!({ "provision": { "uart": true } }));
        let parsed = HxeImage::parse(&image.encode()).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert_eq!(HxeImage::parse(&bytes), Err(HxeError::BadMagic));
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = sample().encode();
        bytes[4] = 0x99;
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(HxeError::BadVersion(_))
        ));
    }

    #[test]
    fn rejects_flipped_code_byte() {
        let mut bytes = sample().encode();
        bytes[HXE_HEADER_LEN + 5] ^= 0x01;
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(HxeError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn rejects_flipped_rodata_byte() {
        let image = sample();
        let mut bytes = image.encode();
        let rodata_start = HXE_HEADER_LEN + image.code.len();
        bytes[rodata_start] ^= 0x80;
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(HxeError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn name_corruption_is_not_covered_by_crc() {
        // The name is outside the CRC, so a name edit parses fine; this
        // pins the documented coverage so it can't drift silently.
        let mut bytes = sample().encode();
        bytes[HXE_NAME_OFFSET] = b'z';
        let parsed = HxeImage::parse(&bytes).unwrap();
        assert_eq!(parsed.name, "zlinky");
    }

    #[test]
    fn rejects_truncated_sections() {
        let bytes = sample().encode();
        assert!(matches!(
            HxeImage::parse(&bytes[..bytes.len() - 3]),
            Err(HxeError::Truncated { .. })
        ));
        assert!(matches!(
            HxeImage::parse(&bytes[..10]),
            Err(HxeError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unterminated_name() {
        let mut bytes = sample().encode();
        for b in &mut bytes[HXE_NAME_OFFSET..HXE_NAME_OFFSET + HXE_NAME_LEN] {
            *b = b'a';
        }
        assert_eq!(HxeImage::parse(&bytes), Err(HxeError::BadName));
    }

    #[test]
    fn rejects_misaligned_entry() {
        assert!(matches!(
            HxeImage::new(
                "x",
                HxeFlags::empty(),
                2,
                vec![0; 8],
                vec![],
                0,
                Capabilities::empty(),
            ),
            Err(HxeError::EntryOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = sample().encode();
        bytes.extend_from_slice(&[0, 0, 0, 0, 1, 2, 3]);
        // 4-byte length prefix of 0 followed by 3 stray bytes.
        assert!(matches!(
            HxeImage::parse(&bytes),
            Err(HxeError::TrailingBytes(3))
        ));
    }
}
