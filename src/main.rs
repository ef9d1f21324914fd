#![deny(unused_must_use)]

use anyhow::bail;

use swdtap::ftdi::{list_ftdi_devices, Ftdi, FtdiSelector};
use swdtap::{CableProfile, SwdTap};

/// Brings the target out of its power-on state and reads DPIDR, the one
/// register reachable without any prior configuration. Everything here
/// is built on the public shift API; a real debugger stacks its
/// request/response layer on the same calls.
fn read_dpidr(tap: &mut SwdTap<Ftdi>) -> Result<u32, anyhow::Error> {
    // line reset: >50 cycles with SWDIO high
    tap.seq_out(0xffff_ffff, 32)?;
    tap.seq_out(0x0007_ffff, 19)?;

    // JTAG-to-SWD switch sequence, then a second line reset and two idle
    // cycles so the DP state machine is back at its start
    tap.seq_out(0xe79e, 16)?;
    tap.seq_out(0xffff_ffff, 32)?;
    tap.seq_out(0x0007_ffff, 19)?;
    tap.seq_out(0, 2)?;

    // DPIDR read request: start, DP, read, A[3:2]=0, parity, stop, park
    tap.seq_out(0xa5, 8)?;
    let ack = tap.seq_in(3)?;
    if ack != 0b001 {
        bail!("target answered DPIDR read with ack {ack:#05b}");
    }
    let (dpidr, parity_ok) = tap.seq_in_parity()?;
    if !parity_ok {
        bail!("parity error in DPIDR read data phase");
    }
    // turnaround back plus idle cycles to finish the transaction
    tap.seq_out(0, 8)?;
    Ok(dpidr)
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let devs = list_ftdi_devices();
    for dev in &devs {
        tracing::info!("found {}", dev);
    }

    let selector = match std::env::args().nth(1) {
        Some(arg) => FtdiSelector::try_from(arg.as_str())?,
        None => {
            let Some(dev) = devs.first() else {
                bail!("no FTDI bridge connected");
            };
            FtdiSelector::from(dev)
        }
    };

    let dev = Ftdi::open_from_selector(&selector)?;
    let mut tap = SwdTap::new(dev, CableProfile::buffered_swd())?;

    let dpidr = read_dpidr(&mut tap)?;
    tracing::info!("dpidr {:#010x}", dpidr);
    println!("{dpidr:#010x}");

    Ok(())
}
