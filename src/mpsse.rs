//! FTDI MPSSE command set, as far as the SWD tap needs it.
//!
//! Values are from FTDI application note AN 108. Shift commands are a
//! single opcode byte whose low bits select edge, bit order and data
//! direction, followed by a length field and (for writes) payload bytes.

/// Clock data out on the negative TCK edge.
pub const WRITE_NEG: u8 = 0x01;
/// Length field counts bits instead of bytes.
pub const BITMODE: u8 = 0x02;
/// Shift least-significant bit first.
pub const LSB: u8 = 0x08;
/// Clock data out on the DO pin.
pub const DO_WRITE: u8 = 0x10;
/// Capture data from the DI pin.
pub const DO_READ: u8 = 0x20;
/// Clock data out on the TMS/CS pin.
pub const WRITE_TMS: u8 = 0x40;

pub const SET_BITS_LOW: u8 = 0x80;
pub const GET_BITS_LOW: u8 = 0x81;
pub const SET_BITS_HIGH: u8 = 0x82;
pub const GET_BITS_HIGH: u8 = 0x83;
pub const LOOPBACK_END: u8 = 0x85;
pub const TCK_DIVISOR: u8 = 0x86;
pub const SEND_IMMEDIATE: u8 = 0x87;

/// ADBUS0, the shift clock (SK). SWCLK in both wirings.
pub const PIN_TCK: u8 = 0x01;
/// ADBUS1, serial data out (DO).
pub const PIN_DO: u8 = 0x02;
/// ADBUS2, serial data in (DI).
pub const PIN_DI: u8 = 0x04;
/// ADBUS3, the TMS/CS pin used as the shared SWDIO pin in manual mode.
pub const PIN_CS: u8 = 0x08;

/// Every pin the tap reconfigures when the shared SWDIO pin changes
/// direction in manual mode.
pub const SWD_IO_MASK: u8 = PIN_DO | PIN_DI | PIN_CS;
/// The dedicated serial data pins.
pub const SWD_DATA_MASK: u8 = PIN_DO | PIN_DI;

/// Bit shift on the TMS/CS pin, LSB first. At most 7 payload bits per
/// command. Carries SWDIO in manual mode and the turnaround clock there.
pub const TMS_SHIFT: u8 = WRITE_TMS | LSB | BITMODE | WRITE_NEG;
/// Single-bit-granularity write on the dedicated data pin.
pub const DATA_SHIFT_OUT: u8 = DO_WRITE | LSB | BITMODE | WRITE_NEG;
/// Single-bit-granularity capture from the dedicated data pin. Captured
/// bits arrive right-aligned: after `n` bits the first one sits at bit
/// `8 - n` of the reply byte.
pub const DATA_SHIFT_IN: u8 = DO_READ | LSB | BITMODE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_opcode_values() {
        assert_eq!(TMS_SHIFT, 0x4b);
        assert_eq!(DATA_SHIFT_OUT, 0x1b);
        assert_eq!(DATA_SHIFT_IN, 0x2a);
    }

    #[test]
    fn swd_pin_masks() {
        assert_eq!(SWD_IO_MASK, 0x0e);
        assert_eq!(SWD_DATA_MASK, 0x06);
        // the shared pin is not part of the data-pin mask
        assert_eq!(SWD_DATA_MASK & PIN_CS, 0);
    }
}
