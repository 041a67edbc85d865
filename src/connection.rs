use crate::kamstrup::{KamstrupCodec, ReplyKind, Request, decode_value};
use crate::registers::RegisterIndex;
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt as _;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open {1:?} for reading and writing")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device the meter's optical head is attached to.
    #[arg(long, short = 'd')]
    device: PathBuf,

    /// The baud rate the meter talks at.
    ///
    /// Multical 402 units communicate at 1200 baud, 8 data bits, 2 stop bits,
    /// no parity. The rate also determines how long a response may
    /// legitimately occupy the wire before it counts as timed out.
    #[arg(long, default_value = "1200")]
    baudrate: u32,

    /// Consider a register read failed if the response isn't received in this
    /// amount of time plus the time the frame spends on the wire.
    #[arg(long, default_value = "2s")]
    read_timeout: humantime::Duration,
}

pub struct Connection {
    args: Args,
}

impl Connection {
    pub fn new(args: Args) -> Connection {
        Self { args }
    }

    fn open(&self) -> Result<tokio_serial::SerialStream, Error> {
        let device = &self.args.device;
        info!(message = "opening serial device", device = %device.display());
        tokio_serial::new(device.to_string_lossy(), self.args.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::Two)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| Error::OpenDevice(e, device.clone()))
    }

    /// Run one read cycle over `parameters`.
    ///
    /// The device is opened when the cycle starts and closed when it
    /// finishes, successful or not. A parameter that fails to read is logged
    /// and left out of the result; the remaining parameters are still
    /// attempted. The link is half duplex, so requests go out strictly one at
    /// a time.
    pub async fn read_cycle(
        &self,
        parameters: &[RegisterIndex],
    ) -> Result<BTreeMap<&'static str, f64>, Error> {
        let device = self.open()?;
        // `read_cycle_on` consumes the stream. It is dropped, and the device
        // with it closed, on every path out of the cycle.
        Ok(read_cycle_on(device, *self.args.read_timeout, self.args.baudrate, parameters).await)
    }
}

/// The read cycle proper, generic over the transport so the request/response
/// loop can run against an in-memory stream as easily as a serial device.
pub async fn read_cycle_on<T: AsyncRead + AsyncWrite + Unpin>(
    io: T,
    read_timeout: Duration,
    baudrate: u32,
    parameters: &[RegisterIndex],
) -> BTreeMap<&'static str, f64> {
    let mut io = Framed::new(io, KamstrupCodec {});
    let mut values = BTreeMap::new();
    for register in parameters {
        if let Some(value) = read_register(&mut io, read_timeout, baudrate, *register).await {
            values.insert(register.name(), value);
        }
    }
    values
}

async fn read_register<T: AsyncRead + AsyncWrite + Unpin>(
    io: &mut Framed<T, KamstrupCodec>,
    read_timeout: Duration,
    baudrate: u32,
    register: RegisterIndex,
) -> Option<f64> {
    let request = Request { address: register.address() };
    if let Err(e) = io.send(&request).await {
        warn!(
            name = register.name(),
            error = &e as &dyn std::error::Error,
            "could not send out the read command"
        );
        return None;
    }
    // 8N2 moves one byte per 11 bauds; grant the response its wire time on
    // top of the configured wait.
    let response_length = u64::from(request.expected_response_length());
    let wire_time = Duration::from_secs(response_length) / (baudrate / 11).max(1);
    let reply = match tokio::time::timeout(read_timeout + wire_time, io.next()).await {
        Err(_elapsed) => {
            warn!(name = register.name(), "timed out waiting for a response");
            return None;
        }
        Ok(None) => {
            warn!(name = register.name(), "stream closed before a response arrived");
            return None;
        }
        Ok(Some(Err(e))) => {
            warn!(
                name = register.name(),
                error = &e as &dyn std::error::Error,
                "could not read data from the stream"
            );
            return None;
        }
        Ok(Some(Ok(reply))) => reply,
    };
    let body = match reply.kind {
        ReplyKind::Body(body) => body,
        ReplyKind::TruncatedEscape => {
            warn!(name = register.name(), "frame ended inside an escape sequence");
            return None;
        }
        ReplyKind::Runt { length } => {
            warn!(name = register.name(), length, "frame too short to carry a checksum");
            return None;
        }
        ReplyKind::CrcMismatch { residue } => {
            warn!(name = register.name(), residue, "discarding response with a bad checksum");
            return None;
        }
    };
    match decode_value(&body, register.address()) {
        Ok(value) => {
            debug!(name = register.name(), value, "register read out");
            Some(value)
        }
        Err(e) => {
            warn!(
                name = register.name(),
                error = &e as &dyn std::error::Error,
                "response did not decode"
            );
            None
        }
    }
}
