//! Cable capability profiles.
//!
//! A [`CableProfile`] describes how a particular adapter wires the SWD
//! signals onto the FTDI pin banks. The tap driver takes its own copy at
//! init and mutates the bank shadows in place as the line changes
//! direction; the profile a caller holds is never written back.

use serde::{Deserialize, Serialize};

use crate::mpsse;

/// Pin-bank bits to set and clear when the SWDIO line changes direction.
///
/// Applied to the dbus/cbus value shadows only; the direction registers
/// are handled by the tap itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitPatch {
    pub set_data_low: u8,
    pub clr_data_low: u8,
    pub set_data_high: u8,
    pub clr_data_high: u8,
}

impl BitPatch {
    /// A patch with no bits in any field patches nothing; a cable that
    /// leaves both SWD patches empty cannot shift SWD natively.
    pub fn is_empty(&self) -> bool {
        self.set_data_low == 0
            && self.clr_data_low == 0
            && self.set_data_high == 0
            && self.clr_data_high == 0
    }
}

/// Static description of an adapter cable.
///
/// `dbus_*`/`cbus_*` are the idle values and directions of the low and
/// high pin banks. `swd_read`/`swd_write` are the native-mode direction
/// patches; the `bitbang_*` fields describe the shared-pin fallback
/// wiring. Profiles are plain data and can be loaded from configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CableProfile {
    pub dbus_data: u8,
    pub dbus_ddr: u8,
    pub cbus_data: u8,
    pub cbus_ddr: u8,

    /// Applied when the host releases SWDIO.
    pub swd_read: BitPatch,
    /// Applied when the host retakes SWDIO.
    pub swd_write: BitPatch,

    /// Opcode that samples the bank holding the shared SWDIO pin,
    /// normally [`mpsse::GET_BITS_LOW`].
    pub bitbang_tms_in_port_cmd: u8,
    /// Mask of the shared pin within that bank's reply byte.
    pub bitbang_tms_in_pin: u8,
    /// dbus value to drive while the shared pin is released, if it
    /// differs from the idle `dbus_data`.
    pub bitbang_swd_dbus_read_data: u8,
}

impl CableProfile {
    /// Applies a direction patch to the bank value shadows. Clear bits
    /// win over set bits on overlap.
    pub(crate) fn apply(&mut self, patch: BitPatch) {
        self.dbus_data |= patch.set_data_low;
        self.dbus_data &= !patch.clr_data_low;
        self.cbus_data |= patch.set_data_high;
        self.cbus_data &= !patch.clr_data_high;
    }

    /// FT232H-class adapter with a level-shifting buffer on SWDIO whose
    /// direction input hangs off ACBUS0. DO drives the line, DI reads it
    /// back, the buffer is turned around together with the pins.
    pub fn buffered_swd() -> Self {
        Self {
            dbus_data: mpsse::PIN_CS,
            dbus_ddr: mpsse::PIN_TCK | mpsse::PIN_DO | mpsse::PIN_CS,
            cbus_data: 0x01,
            cbus_ddr: 0x01,
            swd_read: BitPatch {
                clr_data_high: 0x01,
                ..BitPatch::default()
            },
            swd_write: BitPatch {
                set_data_high: 0x01,
                ..BitPatch::default()
            },
            ..Self::default()
        }
    }

    /// Resistor-hack wiring: SWDIO sits on the TMS/CS pad alone, driven
    /// through a series resistor and read back on the same pad. Forces
    /// the shared-pin fallback mode.
    pub fn resistor_swd() -> Self {
        Self {
            dbus_data: mpsse::PIN_CS,
            dbus_ddr: mpsse::PIN_TCK | mpsse::PIN_DO | mpsse::PIN_CS,
            bitbang_tms_in_port_cmd: mpsse::GET_BITS_LOW,
            bitbang_tms_in_pin: mpsse::PIN_CS,
            bitbang_swd_dbus_read_data: mpsse::PIN_CS,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patch() {
        assert!(BitPatch::default().is_empty());
        let patch = BitPatch {
            clr_data_high: 0x01,
            ..BitPatch::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn apply_patches_both_banks() {
        let mut cable = CableProfile {
            dbus_data: 0b1010_0000,
            cbus_data: 0b0000_0001,
            ..CableProfile::default()
        };
        cable.apply(BitPatch {
            set_data_low: 0b0000_0101,
            clr_data_low: 0b1000_0000,
            set_data_high: 0b0000_0010,
            clr_data_high: 0b0000_0001,
        });
        assert_eq!(cable.dbus_data, 0b0010_0101);
        assert_eq!(cable.cbus_data, 0b0000_0010);
    }

    #[test]
    fn clear_wins_on_overlap() {
        let mut cable = CableProfile::default();
        cable.apply(BitPatch {
            set_data_low: 0x08,
            clr_data_low: 0x08,
            ..BitPatch::default()
        });
        assert_eq!(cable.dbus_data, 0);
    }

    #[test]
    fn builtin_profiles_pick_their_mode() {
        let buffered = CableProfile::buffered_swd();
        assert!(!buffered.swd_read.is_empty());
        assert!(!buffered.swd_write.is_empty());

        let resistor = CableProfile::resistor_swd();
        assert!(resistor.swd_read.is_empty());
        assert_ne!(resistor.bitbang_tms_in_pin, 0);
    }
}
