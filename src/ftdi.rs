//! nusb-backed transport for FT2232H/FT232H-class bridges.
//!
//! Implements [`CommandBuffer`] over interface A of the chip: opcode
//! bytes pile up in a local queue and go out in one bulk transfer on
//! flush, replies come back on the bulk-in endpoint with the two
//! modem-status bytes of every packet stripped. Device enumeration and
//! the `VID:PID[:serial]` selector live here too.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use anyhow::anyhow;
use async_io::{block_on, Timer};
use futures_lite::FutureExt;
use nusb::transfer::{Control, ControlType, Direction, EndpointType, Recipient, RequestBuffer};
use nusb::DeviceInfo;

use crate::buffer::CommandBuffer;
use crate::mpsse;

const FTDI_VID: u16 = 0x0403;
/// Product ids of the MPSSE-capable parts (FT2232C/H, FT4232H, FT232H).
const MPSSE_PIDS: &[u16] = &[0x6010, 0x6011, 0x6014];

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0b;

const BITMODE_RESET: u8 = 0x00;
const BITMODE_MPSSE: u8 = 0x02;

// interface A endpoints
const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;

/// Queued opcode bytes are pushed to the device once this many pile up,
/// keeping long shift batches streaming.
const WRITE_HIGH_WATER: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    #[error("no matching FTDI device found")]
    NotFound,
    #[error("device has no usable interface-A bulk endpoints")]
    NoBulkInterface,
    #[error("USB error")]
    Usb(#[from] io::Error),
}

/// An FTDI bridge found during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FtdiDeviceInfo {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl fmt::Display for FtdiDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} -- {:04x}:{:04x}:{}",
            self.identifier,
            self.vendor_id,
            self.product_id,
            self.serial_number.as_deref().unwrap_or(""),
        )
    }
}

/// Finds all MPSSE-capable FTDI bridges.
#[tracing::instrument(skip_all)]
pub fn list_ftdi_devices() -> Vec<FtdiDeviceInfo> {
    let devices = match nusb::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("error listing USB devices: {:?}", e);
            return vec![];
        }
    };
    let found: Vec<_> = devices
        .filter(|dev| dev.vendor_id() == FTDI_VID && MPSSE_PIDS.contains(&dev.product_id()))
        .map(|dev| FtdiDeviceInfo {
            identifier: dev.product_string().unwrap_or("FTDI").to_string(),
            vendor_id: dev.vendor_id(),
            product_id: dev.product_id(),
            serial_number: dev.serial_number().map(Into::into),
        })
        .collect();
    tracing::debug!("found {} FTDI bridges", found.len());
    found
}

/// Selects one bridge by `VID:PID` and optional serial number.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct FtdiSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl FtdiSelector {
    fn matches(&self, info: &DeviceInfo) -> bool {
        info.vendor_id() == self.vendor_id
            && info.product_id() == self.product_id
            && self
                .serial_number
                .as_ref()
                .map(|s| info.serial_number() == Some(s))
                .unwrap_or(true)
    }
}

impl TryFrom<&str> for FtdiSelector {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut split = value.splitn(3, ':');
        let vendor_id = split.next().unwrap(); // first split always succeeds
        let product_id = split
            .next()
            .ok_or_else(|| anyhow!("expected VID:PID[:serial]"))?;
        let serial_number = split.next().map(|s| s.to_string());

        Ok(FtdiSelector {
            vendor_id: u16::from_str_radix(vendor_id, 16)?,
            product_id: u16::from_str_radix(product_id, 16)?,
            serial_number,
        })
    }
}

impl TryFrom<String> for FtdiSelector {
    type Error = anyhow::Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        TryFrom::<&str>::try_from(&value)
    }
}

impl From<&FtdiDeviceInfo> for FtdiSelector {
    fn from(info: &FtdiDeviceInfo) -> Self {
        FtdiSelector {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial_number: info.serial_number.clone(),
        }
    }
}

impl fmt::Display for FtdiSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(ref sn) = self.serial_number {
            write!(f, ":{sn}")?;
        }
        Ok(())
    }
}

/// An open bridge in MPSSE mode, interface A claimed.
pub struct Ftdi {
    handle: nusb::Interface,
    read_timeout: Duration,
    write_timeout: Duration,
    max_packet_size: usize,
    queue: Vec<u8>,
    read_queue: VecDeque<u8>,
}

impl Ftdi {
    /// Opens the first bridge matching `selector`.
    pub fn open_from_selector(selector: &FtdiSelector) -> Result<Self, FtdiError> {
        tracing::trace!("attempting to open device matching {}", selector);
        let devices = nusb::list_devices().map_err(io::Error::from)?;
        for device in devices {
            if selector.matches(&device) {
                return Self::open(&device);
            }
        }
        Err(FtdiError::NotFound)
    }

    /// Opens a specific bridge and puts it into MPSSE mode. Pin
    /// directions stay untouched; the tap driver programs them with its
    /// own configuration command.
    pub fn open(device_info: &DeviceInfo) -> Result<Self, FtdiError> {
        let device = device_info.open().map_err(io::Error::from)?;

        // interface A is the first with the 0x81/0x02 bulk endpoint pair
        let config = device
            .active_configuration()
            .map_err(|_| FtdiError::NoBulkInterface)?;
        let mut claimed = None;
        for interface in config.interfaces() {
            for desc in interface.alt_settings() {
                let eps: Vec<_> = desc.endpoints().collect();
                let bulk_a = eps.iter().any(|ep| {
                    ep.transfer_type() == EndpointType::Bulk
                        && ep.direction() == Direction::In
                        && ep.address() == EP_IN
                }) && eps.iter().any(|ep| {
                    ep.transfer_type() == EndpointType::Bulk
                        && ep.direction() == Direction::Out
                        && ep.address() == EP_OUT
                });
                if bulk_a {
                    let max_packet_size = eps
                        .iter()
                        .find(|ep| ep.address() == EP_IN)
                        .map(|ep| ep.max_packet_size())
                        .unwrap_or(64);
                    claimed = Some((interface.interface_number(), max_packet_size));
                    break;
                }
            }
            if claimed.is_some() {
                break;
            }
        }
        let Some((interface_number, max_packet_size)) = claimed else {
            return Err(FtdiError::NoBulkInterface);
        };
        let handle = device
            .claim_interface(interface_number)
            .map_err(io::Error::from)?;

        tracing::debug!(
            "opened {:04x}:{:04x} on interface {}",
            device_info.vendor_id(),
            device_info.product_id(),
            interface_number
        );

        let mut ftdi = Self {
            handle,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_packet_size,
            queue: Vec::new(),
            read_queue: VecDeque::new(),
        };
        ftdi.attach()?;
        Ok(ftdi)
    }

    fn attach(&mut self) -> Result<(), FtdiError> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, 1)?;
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([0, BITMODE_RESET]),
        )?;
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([0, BITMODE_MPSSE]),
        )?;
        self.read_queue.clear();
        Ok(())
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), FtdiError> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: 1, // interface A
                },
                &[],
                self.write_timeout,
            )
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn write_bulk(&self, buf: &[u8]) -> io::Result<usize> {
        let fut = async {
            let comp = self.handle.bulk_out(EP_OUT, buf.to_vec()).await;
            comp.status.map_err(io::Error::other)?;
            Ok(comp.data.actual_length())
        };
        block_on(fut.or(async {
            Timer::after(self.write_timeout).await;
            Err(io::ErrorKind::TimedOut.into())
        }))
    }

    fn read_bulk(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.handle.bulk_in_queue(EP_IN);
        queue.submit(RequestBuffer::new(buf.len()));
        let comp = block_on(
            async { Some(queue.next_complete().await) }.or(async {
                Timer::after(self.read_timeout).await;
                None
            }),
        );
        let Some(comp) = comp else {
            queue.cancel_all();
            let _ = block_on(queue.next_complete());
            return Err(io::ErrorKind::TimedOut.into());
        };
        comp.status.map_err(io::Error::other)?;
        let n = comp.data.len();
        buf[..n].copy_from_slice(&comp.data);
        Ok(n)
    }
}

impl CommandBuffer for Ftdi {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.queue.extend_from_slice(bytes);
        if self.queue.len() >= WRITE_HIGH_WATER {
            self.flush()?;
        }
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) -> io::Result<()> {
        // make the chip answer right away instead of waiting out the
        // latency timer
        self.queue.push(mpsse::SEND_IMMEDIATE);
        self.flush()?;

        let mut filled = 0;
        while filled < out.len() {
            if let Some(byte) = self.read_queue.pop_front() {
                out[filled] = byte;
                filled += 1;
                continue;
            }
            let mut buf = vec![0u8; self.max_packet_size];
            let n = self.read_bulk(&mut buf)?;
            // every packet starts with two modem-status bytes
            if n > 2 {
                self.read_queue.extend(&buf[2..n]);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sent = 0;
        while sent < self.queue.len() {
            sent += self.write_bulk(&self.queue[sent..])?;
        }
        self.queue.clear();
        Ok(())
    }
}
