//! Serialized request connection
//!
//! One physical link, many concurrent callers. Requests are queued in FIFO
//! order and a single worker task performs the write / read-until-complete
//! exchange for one request at a time. The worker also owns the reconnect
//! policy; a second task closes the link after an idle period.
//!
//! ```text
//! invoke() ─┐
//! invoke() ─┼─► RequestQueue ─► worker ─► link lock ─► Transport
//! invoke() ─┘                                 ▲
//!                              idle timer ────┘
//! ```

mod cancel;
mod queue;

pub use cancel::{CancelContext, CancelReason};
pub use queue::Completeness;

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::constants::READ_BUFFER_SIZE;
use crate::error::{ModbusError, ModbusResult, TransportError};
use crate::transport::{
    SerialTransport, SerialTransportConfig, TcpTransport, TcpTransportConfig, Transport,
};
use queue::{QueueItem, RequestQueue};

/// Timing policy of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Give up reconnecting after this long; `None` retries forever
    pub connect_timeout: Option<Duration>,
    /// Bound on one connect attempt and on each read call
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Close the link after this long without a completed request
    pub idle_timeout: Duration,
    /// Guard time between two requests (serial inter-frame gap)
    pub inter_request_delay: Duration,
    /// First reconnect back-off step, doubled per failure
    pub reconnect_min_delay: Duration,
    /// Back-off ceiling
    pub reconnect_max_delay: Duration,
}

impl ConnectionOptions {
    pub fn tcp() -> Self {
        Self {
            connect_timeout: None,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(6),
            inter_request_delay: Duration::ZERO,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }

    pub fn serial() -> Self {
        Self {
            inter_request_delay: Duration::from_micros(1750),
            ..Self::tcp()
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::tcp()
    }
}

/// Link state as seen by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// State shared between the handle, the worker and the idle timer
struct Shared {
    name: String,
    options: ConnectionOptions,
    link: tokio::sync::Mutex<Box<dyn Transport>>,
    state: Mutex<ConnectionState>,
    queue: RequestQueue,
    idle_deadline: Mutex<Option<Instant>>,
    idle_rearmed: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    async fn close_link(&self, link: &mut dyn Transport) {
        if let Err(e) = link.disconnect().await {
            debug!("{}: close: {e}", self.name);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Must be called with the link lock held
    fn arm_idle_timer(&self) {
        *self.idle_deadline.lock() = Some(Instant::now() + self.options.idle_timeout);
        self.idle_rearmed.notify_one();
    }

    /// Open the link, backing off exponentially between failed attempts
    async fn ensure_connected(&self, link: &mut dyn Transport) -> ModbusResult<()> {
        if link.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let started = Instant::now();
        let mut delay = self.options.reconnect_min_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            // Reset whatever a failed exchange left behind
            if let Err(e) = link.disconnect().await {
                debug!("{}: reset: {e}", self.name);
            }

            let err = match timeout(self.options.read_timeout, link.connect()).await {
                Ok(Ok(())) => {
                    self.set_state(ConnectionState::Connected);
                    info!("{}: connected (#{} attempts)", self.name, attempts);
                    return Ok(());
                },
                Ok(Err(e)) => ModbusError::from(e),
                Err(_) => ModbusError::from(TransportError::Timeout(format!(
                    "Connect to {} timed out",
                    self.name
                ))),
            };

            let mut wait = delay;
            if let Some(limit) = self.options.connect_timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    self.set_state(ConnectionState::Disconnected);
                    warn!("{}: giving up after {} attempts: {err}", self.name, attempts);
                    return Err(err);
                }
                wait = wait.min(limit - elapsed);
            }

            warn!("{}: retry {} in {}ms: {err}", self.name, attempts, wait.as_millis());
            sleep(wait).await;
            delay = (delay * 2).min(self.options.reconnect_max_delay);
        }
    }

    /// Connect if needed, write the request and read until the frame is complete
    async fn exchange(&self, link: &mut dyn Transport, item: &QueueItem) -> ModbusResult<Vec<u8>> {
        self.ensure_connected(link).await?;

        timeout(self.options.write_timeout, link.send(&item.request))
            .await
            .map_err(|_| TransportError::Timeout("Write timed out".to_string()))??;
        debug!("{} TX: {}B", self.name, item.request.len());

        let mut response = Vec::with_capacity(64);
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = timeout(self.options.read_timeout, link.receive(&mut buffer))
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "No complete response after {}B",
                        response.len()
                    ))
                })??;
            if n == 0 {
                return Err(ModbusError::EndOfStream);
            }
            response.extend_from_slice(&buffer[..n]);
            if (item.is_complete)(&response) {
                break;
            }
        }

        debug!("{} RX: {}B", self.name, response.len());
        Ok(response)
    }

    async fn process(&self, item: &QueueItem) -> ModbusResult<Vec<u8>> {
        let mut link = tokio::select! {
            biased;
            reason = item.cancel.cancelled() => return Err(reason.into_error()),
            link = self.link.lock() => link,
        };

        let result = tokio::select! {
            biased;
            reason = item.cancel.cancelled() => Err(reason.into_error()),
            result = self.exchange(&mut **link, item) => result,
        };

        match &result {
            Ok(_) => self.arm_idle_timer(),
            // The link may hold a partial frame: reopen on next use
            Err(e) if e.needs_reconnect() || *e == ModbusError::Disposed => {
                self.close_link(&mut **link).await;
            },
            Err(_) => {},
        }
        result
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            item = shared.queue.pop() => item,
        };

        let result = match item.cancel.fired() {
            Some(reason) => Err(reason.into_error()),
            None => shared.process(&item).await,
        };
        if let Err(e) = &result {
            debug!("{}: request failed: {e}", shared.name);
        }
        // The caller may have stopped waiting
        let _ = item.reply.send(result);

        let delay = shared.options.inter_request_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = sleep(delay) => {},
            }
        }
    }
    debug!("{}: worker stopped", shared.name);
}

async fn run_idle_timer(shared: Arc<Shared>) {
    loop {
        let deadline = *shared.idle_deadline.lock();
        let Some(deadline) = deadline else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.idle_rearmed.notified() => {},
            }
            continue;
        };

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.idle_rearmed.notified() => {},
            _ = sleep_until(deadline) => {
                let mut link = shared.link.lock().await;
                // A request finishing meanwhile re-arms the deadline
                let expired = {
                    let mut current = shared.idle_deadline.lock();
                    if *current == Some(deadline) {
                        *current = None;
                        true
                    } else {
                        false
                    }
                };
                if expired && link.is_connected() {
                    info!(
                        "{}: idle for {}ms, closing",
                        shared.name,
                        shared.options.idle_timeout.as_millis()
                    );
                    shared.close_link(&mut **link).await;
                }
            },
        }
    }
}

/// Removes a still-queued request when its caller stops waiting
struct PendingRequest<'a> {
    queue: &'a RequestQueue,
    id: u64,
    _abandon: DropGuard,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.id);
    }
}

/// A Modbus link shared by concurrent callers
///
/// Must be created inside a tokio runtime: the constructors spawn the worker
/// and idle timer tasks.
pub struct ModbusConnection {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ModbusConnection {
    /// TCP link
    pub fn tcp(config: TcpTransportConfig, options: ConnectionOptions) -> ModbusResult<Self> {
        let name = format!("tcp://{}", config.endpoint());
        let transport = TcpTransport::new(config)?;
        Ok(Self::with_transport(name, Box::new(transport), options))
    }

    /// Serial (RS-232/RS-485) link
    pub fn serial(config: SerialTransportConfig, options: ConnectionOptions) -> ModbusResult<Self> {
        let name = format!("serial://{}", config.device);
        let transport = SerialTransport::new(config)?;
        Ok(Self::with_transport(name, Box::new(transport), options))
    }

    /// Any transport, e.g. a test double
    pub fn with_transport(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            options,
            link: tokio::sync::Mutex::new(transport),
            state: Mutex::new(ConnectionState::Disconnected),
            queue: RequestQueue::new(),
            idle_deadline: Mutex::new(None),
            idle_rearmed: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let worker = tokio::spawn(run_worker(shared.clone()));
        let idle_timer = tokio::spawn(run_idle_timer(shared.clone()));
        debug!("{}: connection created", shared.name);

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            idle_timer: Mutex::new(Some(idle_timer)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Requests waiting for the worker
    pub fn pending_requests(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queue `request` and wait for the bytes that complete it.
    ///
    /// `is_complete` is re-evaluated on the accumulated response after each
    /// read. Fails with [`ModbusError::Cancelled`] when `cancel` fires and
    /// with [`ModbusError::Disposed`] when the connection goes away first.
    pub async fn invoke(
        &self,
        request: Vec<u8>,
        is_complete: Completeness,
        cancel: &CancellationToken,
    ) -> ModbusResult<Vec<u8>> {
        if self.is_disposed() {
            return Err(ModbusError::Disposed);
        }
        if request.is_empty() {
            return Err(ModbusError::invalid_argument("Request must not be empty"));
        }

        let ctx = CancelContext::new(cancel.clone(), self.shared.shutdown.clone());
        if let Some(reason) = ctx.fired() {
            return Err(reason.into_error());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self
            .shared
            .queue
            .push(request, is_complete, ctx.clone(), reply_tx)?;
        let _pending = PendingRequest {
            queue: &self.shared.queue,
            id,
            _abandon: ctx.abandon_on_drop(),
        };

        tokio::select! {
            biased;
            result = reply_rx => result.unwrap_or(Err(ModbusError::Disposed)),
            reason = ctx.cancelled() => Err(reason.into_error()),
        }
    }

    /// Stop the worker, fail queued requests and close the link. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: disposing", self.shared.name);
        self.shared.shutdown.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("{}: worker ended abnormally: {e}", self.shared.name);
            }
        }
        let idle_timer = self.idle_timer.lock().take();
        if let Some(idle_timer) = idle_timer {
            let _ = idle_timer.await;
        }

        for item in self.shared.queue.close() {
            let _ = item.reply.send(Err(ModbusError::Disposed));
        }

        *self.shared.idle_deadline.lock() = None;
        let mut link = self.shared.link.lock().await;
        self.shared.close_link(&mut **link).await;
    }
}

impl Drop for ModbusConnection {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
        self.shared.shutdown.cancel();
        for item in self.shared.queue.close() {
            let _ = item.reply.send(Err(ModbusError::Disposed));
        }
    }
}
