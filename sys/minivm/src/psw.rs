// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program status word.
//!
//! Four architectural flags in the low bits (Z, N, C, V per `hsx-abi`);
//! the remaining bits are reserved and always read as zero.

use hsx_abi::{PSW_C, PSW_N, PSW_V, PSW_Z};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Psw(u32);

impl Psw {
    const MASK: u32 = PSW_Z | PSW_N | PSW_C | PSW_V;

    pub fn from_bits(bits: u32) -> Self {
        Psw(bits & Self::MASK)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn z(self) -> bool {
        self.0 & PSW_Z != 0
    }

    pub fn n(self) -> bool {
        self.0 & PSW_N != 0
    }

    pub fn c(self) -> bool {
        self.0 & PSW_C != 0
    }

    pub fn v(self) -> bool {
        self.0 & PSW_V != 0
    }

    fn set(&mut self, bit: u32, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Sets Z and N from `result`, leaving C and V alone.
    pub fn set_zn(&mut self, result: u32) {
        self.set(PSW_Z, result == 0);
        self.set(PSW_N, result & 0x8000_0000 != 0);
    }

    /// Sets all four flags: Z and N from `result`, C and V as given.
    pub fn set_zncv(&mut self, result: u32, carry: bool, overflow: bool) {
        self.set_zn(result);
        self.set(PSW_C, carry);
        self.set(PSW_V, overflow);
    }

    /// Sets all four flags explicitly; used by ops whose Z/N don't come
    /// from a 32-bit result (the half-float group).
    pub fn set_flags(&mut self, z: bool, n: bool, c: bool, v: bool) {
        self.set(PSW_Z, z);
        self.set(PSW_N, n);
        self.set(PSW_C, c);
        self.set(PSW_V, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_do_not_stick() {
        let psw = Psw::from_bits(0xFFFF_FFF0 | PSW_Z);
        assert_eq!(psw.bits(), PSW_Z);
        assert!(psw.z());
        assert!(!psw.n());
    }

    #[test]
    fn zn_tracks_result() {
        let mut psw = Psw::default();
        psw.set_zncv(0, true, false);
        assert!(psw.z() && psw.c() && !psw.n() && !psw.v());
        psw.set_zncv(0x8000_0000, false, true);
        assert!(!psw.z() && !psw.c() && psw.n() && psw.v());
    }
}
