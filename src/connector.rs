//! Provides an asynchronous connector for Seplos BMS packs sharing one serial bus.
//!
//! The connector scans the bus for packs, polls telemetry and alarm data from every
//! pack it found and keeps a bounded history of the decoded samples. Only one request
//! is on the wire at a time: a second request of the same kind while the first one is
//! still waiting is rejected with [`Error::Busy`] instead of being queued.
//!
//! # Example
//!
//! ```no_run
//! use seplosbms_lib::connector::SeplosBms;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), seplosbms_lib::Error> {
//!     let bms = Arc::new(SeplosBms::new("/dev/ttyUSB0"));
//!     bms.set_timeout(Duration::from_millis(500));
//!
//!     let devices = bms.initialize().await?;
//!     println!("Found packs: {devices:?}");
//!
//!     let poller = bms.clone();
//!     tokio::spawn(async move { poller.start_continuous_polling().await });
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     for (address, samples) in bms.telemetry_history() {
//!         println!("{address}: {:?}", samples.last());
//!     }
//!     bms.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::history::{History, DEFAULT_STORE_SIZE};
use crate::protocol::*;
use crate::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Default time to wait for a response line after a request was written.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);
pub const BAUD_RATE: u32 = 19200;

/// A specialized `Result` type for connector operations.
type Result<T> = std::result::Result<T, Error>;

type Opener<S> = Box<dyn FnMut() -> Result<S> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Link<S> {
    open: Opener<S>,
    stream: Option<BufReader<S>>,
}

impl<S> fmt::Debug for Link<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("is_open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

/// Clears a pending flag when the exchange ends, also if the exchange future is dropped.
struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The connector for all packs on one bus.
///
/// All methods take `&self`, so the connector is usually shared with an [`std::sync::Arc`]
/// between the polling task and the consumers reading the history.
#[derive(Debug)]
pub struct SeplosBms<S> {
    link: tokio::sync::Mutex<Link<S>>,
    telemetry_pending: AtomicBool,
    alarm_pending: AtomicBool,
    polling: AtomicBool,
    timeout: Mutex<Duration>,
    interval: Mutex<Duration>,
    devices: Mutex<Vec<Address>>,
    telemetry: Mutex<History<TelemetrySample>>,
    alarms: Mutex<History<AlarmSample>>,
}

#[cfg(feature = "tokio-serial-async")]
impl SeplosBms<tokio_serial::SerialStream> {
    /// Creates a connector for the serial port at `port` (e.g. `/dev/ttyUSB0` or `COM3`).
    ///
    /// The port is opened by [`SeplosBms::open`] or [`SeplosBms::initialize`] with
    /// 19200 baud, 8 data bits, no parity, one stop bit and no flow control.
    pub fn new(port: &str) -> Self {
        use tokio_serial::SerialPortBuilderExt;

        let port = port.to_string();
        Self::with_opener(move || {
            log::trace!("open serial port {port}");
            Ok(tokio_serial::new(&port, BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?)
        })
    }
}

impl<S> SeplosBms<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a connector whose transport is produced by `open` each time it is opened.
    pub fn with_opener(open: impl FnMut() -> Result<S> + Send + 'static) -> Self {
        Self {
            link: tokio::sync::Mutex::new(Link {
                open: Box::new(open),
                stream: None,
            }),
            telemetry_pending: AtomicBool::new(false),
            alarm_pending: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            interval: Mutex::new(Duration::ZERO),
            devices: Mutex::new(Vec::new()),
            telemetry: Mutex::new(History::new(DEFAULT_STORE_SIZE)),
            alarms: Mutex::new(History::new(DEFAULT_STORE_SIZE)),
        }
    }

    /// Creates a connector on an already established stream; it can be opened only once.
    pub fn from_stream(stream: S) -> Self {
        let mut stream = Some(stream);
        Self::with_opener(move || {
            stream.take().ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "stream was already consumed",
                ))
            })
        })
    }

    /// Sets how long a request waits for its response line.
    pub fn set_timeout(&self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        *lock(&self.timeout) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    /// Sets the pause between two polling cycles, zero polls back to back.
    pub fn set_interval(&self, interval: Duration) {
        log::trace!("set polling interval to {interval:?}");
        *lock(&self.interval) = interval;
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.interval)
    }

    /// Sets the number of samples kept per pack for telemetry and alarms each.
    pub fn set_store_size(&self, store_size: usize) {
        lock(&self.telemetry).set_store_size(store_size);
        lock(&self.alarms).set_store_size(store_size);
    }

    pub fn store_size(&self) -> usize {
        lock(&self.telemetry).store_size()
    }

    /// Opens the transport, does nothing if it is already open.
    pub async fn open(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.stream.is_none() {
            let stream = (link.open)()?;
            link.stream = Some(BufReader::new(stream));
            log::debug!("transport opened");
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(mut stream) = self.link.lock().await.stream.take() {
            if let Err(err) = stream.shutdown().await {
                log::warn!("cannot shut down transport: {err}");
            }
            log::debug!("transport closed");
        }
    }

    /// Opens the transport and scans the bus for packs.
    ///
    /// Fails only if the transport cannot be opened, an empty bus is not an error.
    pub async fn initialize(&self) -> Result<Vec<Address>> {
        self.open().await?;
        Ok(self.scan().await)
    }

    /// Requests telemetry from every address and remembers the packs that answered.
    ///
    /// The scan is sequential, in the worst case it takes 16 times the timeout.
    pub async fn scan(&self) -> Vec<Address> {
        log::debug!("scanning for devices");
        let mut devices = Vec::new();
        for address in Address::all() {
            match self.request_telemetry(address).await {
                Ok(_) => {
                    log::info!("found device at address {address}");
                    devices.push(address);
                }
                Err(err) => log::trace!("no device at address {address} ({err})"),
            }
        }
        *lock(&self.devices) = devices.clone();
        devices
    }

    /// Packs found by the last scan in ascending address order.
    pub fn devices(&self) -> Vec<Address> {
        lock(&self.devices).clone()
    }

    /// Requests telemetry data from the pack at `address`.
    ///
    /// A successfully decoded sample is also appended to the telemetry history.
    pub async fn request_telemetry(&self, address: Address) -> Result<TelemetrySample> {
        self.exchange(
            address,
            Command::Telemetry,
            &self.telemetry_pending,
            TelemetrySample::decode,
            &self.telemetry,
        )
        .await
    }

    /// Requests alarm and warning data from the pack at `address`.
    ///
    /// A successfully decoded sample is also appended to the alarm history.
    pub async fn request_alarm(&self, address: Address) -> Result<AlarmSample> {
        self.exchange(
            address,
            Command::Alarm,
            &self.alarm_pending,
            AlarmSample::decode,
            &self.alarms,
        )
        .await
    }

    async fn exchange<T: Clone>(
        &self,
        address: Address,
        command: Command,
        pending: &AtomicBool,
        decode: fn(&str) -> Result<T>,
        history: &Mutex<History<T>>,
    ) -> Result<T> {
        if pending.swap(true, Ordering::AcqRel) {
            log::debug!("{command} request for {address} rejected, previous one still pending");
            return Err(Error::Busy);
        }
        let _pending = PendingGuard(pending);

        let line = self
            .send_and_receive(&encode_request(address, command))
            .await?;
        // A frame error releases this kind only. The other kind's flag is held by its own
        // exchange, which may still be waiting for the link.
        let frame = decode_response(&line)?;
        if frame.address != address.value() {
            log::warn!(
                "{command} response from address {} (ADR {:02X}) for request to {address}",
                frame.address,
                frame.address
            );
        }

        let sample = decode(frame.info).inspect_err(|err| {
            log::warn!("discard {command} response from {address}: {err}");
        })?;
        lock(history).append(address, sample.clone());
        Ok(sample)
    }

    /// Writes a request and waits for one response line or the timeout, whichever comes first.
    async fn send_and_receive(&self, request: &str) -> Result<String> {
        let timeout = self.timeout();
        let mut link = self.link.lock().await;
        let stream = link.stream.as_mut().ok_or(Error::NotOpen)?;

        // A response arriving after its timeout must not be taken as the answer to this request.
        discard_pending(stream).await?;

        log::trace!("write frame: {request:?}");
        stream.write_all(request.as_bytes()).await?;

        let mut rx_buffer = Vec::new();
        let received =
            tokio::time::timeout(timeout, stream.read_until(END_OF_FRAME, &mut rx_buffer)).await;
        match received {
            Ok(Ok(_)) if rx_buffer.last() == Some(&END_OF_FRAME) => {
                rx_buffer.pop();
                let line = String::from_utf8_lossy(&rx_buffer).into_owned();
                log::trace!("received line: {line:?}");
                Ok(line)
            }
            Ok(Ok(_)) => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                log::trace!("no response within {timeout:?}");
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Runs one telemetry and one alarm exchange for every known pack.
    pub async fn poll_once(&self) {
        for address in self.devices() {
            if let Err(err) = self.request_telemetry(address).await {
                log::warn!("cannot get telemetry from {address}: {err}");
            }
            if let Err(err) = self.request_alarm(address).await {
                log::warn!("cannot get alarms from {address}: {err}");
            }
        }
    }

    /// Polls all known packs until [`SeplosBms::stop_continuous_polling`] is called.
    ///
    /// Returns immediately if polling is already running. The stop request is checked
    /// between two cycles, an exchange in flight is always completed.
    pub async fn start_continuous_polling(&self) {
        if self.polling.swap(true, Ordering::AcqRel) {
            log::debug!("continuous polling already running");
            return;
        }
        log::info!("start continuous polling of {:?}", self.devices());
        while self.polling.load(Ordering::Acquire) {
            let idle = self.devices().is_empty();
            self.poll_once().await;
            let interval = self.interval();
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            } else if idle {
                // no exchange paced this pass
                tokio::time::sleep(self.timeout()).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        log::info!("continuous polling stopped");
    }

    pub fn stop_continuous_polling(&self) {
        self.polling.store(false, Ordering::Release);
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn telemetry_history(&self) -> Vec<(Address, Vec<TelemetrySample>)> {
        lock(&self.telemetry).snapshot()
    }

    pub fn alarm_history(&self) -> Vec<(Address, Vec<AlarmSample>)> {
        lock(&self.alarms).snapshot()
    }

    pub fn latest_telemetry(&self, address: Address) -> Option<TelemetrySample> {
        lock(&self.telemetry).latest(address).cloned()
    }

    pub fn latest_alarm(&self, address: Address) -> Option<AlarmSample> {
        lock(&self.alarms).latest(address).cloned()
    }

    /// Stops polling and closes the transport.
    pub async fn shutdown(&self) {
        self.stop_continuous_polling();
        self.close().await;
    }
}

/// Drops whatever the transport already buffered without waiting for more.
async fn discard_pending<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) -> Result<()> {
    loop {
        let pending = std::future::poll_fn(|cx| {
            match tokio::io::AsyncBufRead::poll_fill_buf(Pin::new(&mut *stream), cx) {
                Poll::Ready(Ok(buffer)) => Poll::Ready(Ok(buffer.len())),
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Ready(Ok(0)),
            }
        })
        .await?;
        if pending == 0 {
            return Ok(());
        }
        log::trace!("discard {pending} pending bytes");
        stream.consume(pending);
    }
}
