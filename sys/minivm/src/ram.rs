// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat byte-addressable guest RAM.
//!
//! All guest-visible state lives here: register banks, stacks, loaded
//! images, and application data. Word accesses are little-endian and must
//! be 4-aligned. Ranges holding code and rodata are marked read-only by
//! the loader; a guest store into one faults instead of corrupting shared
//! image pages.

use hsx_abi::FaultKind;

/// Why a memory access was refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemFaultKind {
    /// Address (or the end of the access) falls outside RAM.
    OutOfRange,
    /// Word access at a non-multiple-of-4 address.
    Unaligned,
    /// Store into a read-only range.
    ReadOnly,
}

/// A refused memory access: the offending address plus the reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemFault {
    pub addr: u32,
    pub kind: MemFaultKind,
}

impl From<MemFault> for FaultKind {
    fn from(f: MemFault) -> Self {
        match f.kind {
            MemFaultKind::Unaligned => {
                FaultKind::UnalignedAccess { addr: f.addr }
            }
            MemFaultKind::OutOfRange | MemFaultKind::ReadOnly => {
                FaultKind::BadMemory { addr: f.addr }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ram {
    bytes: Vec<u8>,
    /// Read-only `[base, end)` ranges, kept sorted by base. There is one
    /// per loaded image, so linear scans are fine.
    readonly: Vec<(u32, u32)>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            readonly: Vec::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Marks `[base, base+len)` read-only for guest stores and checked
    /// host writes. The loader calls this after copying an image in.
    pub fn protect(&mut self, base: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.readonly.push((base, base + len));
        self.readonly.sort_unstable();
    }

    /// Removes protection for the range previously passed to `protect`.
    pub fn unprotect(&mut self, base: u32, len: u32) {
        self.readonly.retain(|&(b, e)| !(b == base && e == base + len));
    }

    fn check_range(&self, addr: u32, len: u32) -> Result<(), MemFault> {
        let end = addr.checked_add(len).ok_or(MemFault {
            addr,
            kind: MemFaultKind::OutOfRange,
        })?;
        if end > self.len() {
            return Err(MemFault {
                addr,
                kind: MemFaultKind::OutOfRange,
            });
        }
        Ok(())
    }

    fn check_writable(&self, addr: u32, len: u32) -> Result<(), MemFault> {
        let end = addr + len;
        for &(b, e) in &self.readonly {
            if addr < e && end > b {
                return Err(MemFault {
                    addr,
                    kind: MemFaultKind::ReadOnly,
                });
            }
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, MemFault> {
        if addr % 4 != 0 {
            return Err(MemFault {
                addr,
                kind: MemFaultKind::Unaligned,
            });
        }
        self.check_range(addr, 4)?;
        let i = addr as usize;
        Ok(u32::from_le_bytes([
            self.bytes[i],
            self.bytes[i + 1],
            self.bytes[i + 2],
            self.bytes[i + 3],
        ]))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemFault> {
        if addr % 4 != 0 {
            return Err(MemFault {
                addr,
                kind: MemFaultKind::Unaligned,
            });
        }
        self.check_range(addr, 4)?;
        self.check_writable(addr, 4)?;
        let i = addr as usize;
        self.bytes[i..i + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Byte-granularity read used by SVC handlers pulling guest buffers.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<&[u8], MemFault> {
        self.check_range(addr, len)?;
        Ok(&self.bytes[addr as usize..(addr + len) as usize])
    }

    /// Byte-granularity write used by SVC handlers delivering into guest
    /// buffers. Refuses read-only ranges like any guest store would.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
        let len = data.len() as u32;
        self.check_range(addr, len)?;
        self.check_writable(addr, len)?;
        self.bytes[addr as usize..(addr as usize + data.len())]
            .copy_from_slice(data);
        Ok(())
    }

    /// Unchecked-by-policy write used by the loader before protection is
    /// applied (still bounds-checked).
    pub fn load_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
        self.check_range(addr, data.len() as u32)?;
        self.bytes[addr as usize..addr as usize + data.len()]
            .copy_from_slice(data);
        Ok(())
    }

    /// Zeroes a range, bypassing write protection; used when recycling a
    /// task's regions.
    pub fn clear(&mut self, addr: u32, len: u32) -> Result<(), MemFault> {
        self.check_range(addr, len)?;
        self.bytes[addr as usize..(addr + len) as usize].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip() {
        let mut ram = Ram::new(64);
        ram.write_u32(8, 0xDEAD_BEEF).unwrap();
        assert_eq!(ram.read_u32(8).unwrap(), 0xDEAD_BEEF);
        // Little-endian layout.
        assert_eq!(ram.read_bytes(8, 4).unwrap(), &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn unaligned_word_access_refused() {
        let mut ram = Ram::new(64);
        let err = ram.read_u32(6).unwrap_err();
        assert_eq!(err.kind, MemFaultKind::Unaligned);
        let err = ram.write_u32(2, 1).unwrap_err();
        assert_eq!(err.kind, MemFaultKind::Unaligned);
    }

    #[test]
    fn out_of_range_refused() {
        let mut ram = Ram::new(16);
        assert_eq!(
            ram.read_u32(16).unwrap_err().kind,
            MemFaultKind::OutOfRange
        );
        // Access straddling the end is refused even though it starts
        // in-range.
        assert_eq!(
            ram.write_u32(12, 0).map(|_| ()),
            Ok(())
        );
        assert_eq!(
            ram.read_bytes(14, 4).unwrap_err().kind,
            MemFaultKind::OutOfRange
        );
        // Wraparound addresses don't sneak past the end check.
        assert_eq!(
            ram.read_bytes(u32::MAX - 1, 4).unwrap_err().kind,
            MemFaultKind::OutOfRange
        );
    }

    #[test]
    fn protected_range_refuses_stores_but_not_loads() {
        let mut ram = Ram::new(64);
        ram.load_bytes(16, &[1, 2, 3, 4]).unwrap();
        ram.protect(16, 16);
        assert_eq!(
            ram.write_u32(16, 0).unwrap_err().kind,
            MemFaultKind::ReadOnly
        );
        assert_eq!(
            ram.write_bytes(28, &[0]).unwrap_err().kind,
            MemFaultKind::ReadOnly
        );
        assert_eq!(ram.read_u32(16).unwrap(), 0x0403_0201);
        // Writes on either side still work.
        ram.write_u32(12, 7).unwrap();
        ram.write_u32(32, 7).unwrap();
        ram.unprotect(16, 16);
        ram.write_u32(16, 0).unwrap();
    }
}
