use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::callbacks::{self, CallbackId, CallbackRegistry, CallbackResult, Event, EventKind};
use crate::channel::{ChannelState, ChannelStatus};
use crate::commands::{
    Command, Identify, MoveAbsolute, MoveHome, MoveRelative, Request, SetEnableState,
    SetPositionCounter, SetVelocityParams, Stop, StopMode, UpdateMessages,
};
use crate::config::DriverConfig;
use crate::dispatcher::{Completion, CompletionKind, Expire, PendingKey, PendingTable, Registration};
use crate::error::{EncodingError, Error};
use crate::monitor::Monitor;
use crate::protocol::payload::{self, Counter, HardwareInfo, VelocityParams};
use crate::protocol::{channel_address, Frame, MessageId, StatusBits, BROADCAST, CONTROLLER};
use crate::scaling::ScalingContext;
use crate::transport::Transport;

/// How long [`Controller::disconnect`] waits for queued callbacks.
const CALLBACK_DRAIN: Duration = Duration::from_millis(100);

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between callers, the monitor thread and outstanding [`Completion`]s.
pub(crate) struct Shared {
    pub(crate) config: DriverConfig,
    scaling: ScalingContext,
    writer: Mutex<Box<dyn Write + Send>>,
    pub(crate) channels: Mutex<Vec<ChannelState>>,
    pub(crate) pending: Mutex<PendingTable>,
    pub(crate) callbacks: Mutex<CallbackRegistry>,
    connected: AtomicBool,
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), Error> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let bytes = frame.encode()?;
        debug!(
            "sending {:#06x} to {:#04x}",
            frame.message_id,
            frame.destination_address()
        );
        trace!("tx {}", hex::encode(&bytes));
        let mut writer = lock(&self.writer);
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Reverts a home that will never complete.
    fn home_abandoned(&self, channel: Option<u8>) {
        let Some(channel) = channel else { return };
        if let Some(state) = lock(&self.channels).get_mut(usize::from(channel - 1)) {
            if state.status().homing() {
                warn!("channel {} homing abandoned", channel);
                state.home_failed();
            }
        }
    }

    /// Answers and clears every pending request past its deadline.
    pub(crate) fn sweep(&self, now: Instant) {
        let expired = lock(&self.pending).take_expired(now);
        for request in expired {
            let (channel, kind) = request.key();
            if kind == CompletionKind::Home {
                self.home_abandoned(channel);
            }
            request.fail();
        }
    }
}

impl Expire for Shared {
    fn expire(&self, key: PendingKey, token: u64) -> bool {
        let removed = lock(&self.pending).take(key, token);
        if removed && key.1 == CompletionKind::Home {
            self.home_abandoned(key.0);
        }
        removed
    }
}

/// Velocity profile in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityProfile {
    /// Start velocity, units/s.
    pub min_velocity: f64,
    /// Maximum velocity, units/s.
    pub max_velocity: f64,
    /// Acceleration, units/s².
    pub acceleration: f64,
}

/// The main struct for interacting with an APT controller.
///
/// All methods take `&self`; a controller can be shared between threads. Blocking calls wait
/// for the device's reply, the `start_*` variants return a [`Completion`] instead.
///
/// ```no_run
/// # fn main() -> Result<(), apt_stage::Error> {
/// # let transport: (std::io::Empty, std::io::Sink) = (std::io::empty(), std::io::sink());
/// use std::time::Duration;
/// let controller = apt_stage::Controller::connect(transport, apt_stage::DriverConfig::default())?;
/// controller.enable_channel(1, true)?;
/// controller.home(1, Duration::from_secs(30))?;
/// controller.move_absolute(1, 10.0, Duration::from_secs(10))?;
/// # Ok(())
/// # }
/// ```
pub struct Controller {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    callback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.shared.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Controller {
    /// Splits `transport`, starts the monitor and callback threads and, if configured, starts the
    /// controller's update messages and logs its hardware info.
    pub fn connect<T: Transport>(transport: T, config: DriverConfig) -> Result<Self, Error> {
        let (reader, writer) = transport.split()?;
        let writer: Box<dyn Write + Send> = Box::new(writer);
        let channels: Vec<ChannelState> = (1..=config.channel_count)
            .filter_map(|id| channel_address(id).map(|address| ChannelState::new(id, address)))
            .collect();
        let shared = Arc::new(Shared {
            scaling: config.scaling(),
            config,
            writer: Mutex::new(writer),
            channels: Mutex::new(channels),
            pending: Mutex::new(PendingTable::default()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            connected: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        });

        let (events, callback_thread) = callbacks::spawn()?;
        let monitor = Monitor::new(reader, Arc::clone(&shared), events);
        let monitor = thread::Builder::new()
            .name("apt-monitor".into())
            .spawn(move || monitor.run())?;

        let controller = Controller {
            shared,
            monitor: Mutex::new(Some(monitor)),
            callback_thread: Mutex::new(Some(callback_thread)),
        };
        info!(
            "connected with {} channels at {} counts/unit",
            controller.shared.config.channel_count,
            controller.shared.scaling.encoder_counts_per_unit()
        );

        if controller.shared.config.update_messages {
            controller.start_update_messages()?;
        }
        if controller.shared.config.request_hardware_info {
            match controller.hardware_info() {
                Ok(hw) => info!(
                    "{} serial {} firmware {}.{}.{}, {} channels",
                    hw.model,
                    hw.serial_number,
                    hw.firmware_version.0,
                    hw.firmware_version.1,
                    hw.firmware_version.2,
                    hw.channel_count
                ),
                Err(e) => warn!("hardware info unavailable: {}", e),
            }
        }
        Ok(controller)
    }

    /// Stops update messages, stops the monitor thread and fails every pending request with
    /// [`Error::Disconnected`]. No channel state changes after this returns.
    ///
    /// Queued callbacks get a short time to finish. A callback still running after that is left
    /// to finish on the detached callback thread.
    ///
    /// Calling it again is a no-op.
    pub fn disconnect(&self) {
        if !self.shared.connected.load(Ordering::Acquire) {
            return;
        }
        if self.shared.config.update_messages {
            if let Err(e) = self.stop_update_messages() {
                warn!("could not stop update messages: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.stopping.store(true, Ordering::Release);

        if let Some(handle) = lock(&self.monitor).take() {
            if handle.join().is_err() {
                error!("status monitor panicked");
            }
        }
        lock(&self.shared.pending).fail_all();
        // the monitor held the only event sender, so the callback thread drains and exits
        if let Some(handle) = lock(&self.callback_thread).take() {
            let deadline = Instant::now() + CALLBACK_DRAIN;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(self.shared.config.poll_interval);
            }
            if !handle.is_finished() {
                warn!("callbacks still running after {:?}, detaching the callback thread", CALLBACK_DRAIN);
            } else if handle.join().is_err() {
                error!("callback thread panicked");
            }
        }
        info!("disconnected");
    }

    /// Whether [`Controller::disconnect`] has not been called yet.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// The configuration the controller was connected with.
    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// The unit conversion used for every physical value.
    pub fn scaling(&self) -> ScalingContext {
        self.shared.scaling
    }

    fn address(&self, channel: u8) -> Result<u8, Error> {
        if channel == 0 || channel > self.shared.config.channel_count {
            return Err(Error::InvalidChannel(channel));
        }
        lock(&self.shared.channels)
            .get(usize::from(channel - 1))
            .map(ChannelState::address)
            .ok_or(Error::InvalidChannel(channel))
    }

    fn with_channel<R>(&self, channel: u8, f: impl FnOnce(&mut ChannelState) -> R) -> Result<R, Error> {
        self.address(channel)?;
        let mut channels = lock(&self.shared.channels);
        let state = channels
            .get_mut(usize::from(channel - 1))
            .ok_or(Error::InvalidChannel(channel))?;
        Ok(f(state))
    }

    fn send(&self, command: &dyn Command, destination: u8) -> Result<(), Error> {
        self.shared.write_frame(&command.to_frame(destination))
    }

    fn completion(&self, registration: Registration) -> Completion {
        let owner = Arc::downgrade(&self.shared);
        let owner: Weak<dyn Expire> = owner;
        Completion::new(registration, owner)
    }

    /// Writes `frame` on behalf of `registration`. A failed write removes the registration.
    fn write_registered(&self, registration: &Registration, frame: &Frame) -> Result<(), Error> {
        self.shared.write_frame(frame).map_err(|e| {
            lock(&self.shared.pending).take(registration.key, registration.token);
            e
        })
    }

    /// Registers a pending request, then writes the command.
    fn request(
        &self,
        key: PendingKey,
        command: &dyn Command,
        destination: u8,
        expected: MessageId,
        timeout: Duration,
    ) -> Result<Completion, Error> {
        let frame = command.to_frame(destination);
        let registration = lock(&self.shared.pending).insert(key, frame.message_id, expected, timeout)?;
        self.write_registered(&registration, &frame)?;
        Ok(self.completion(registration))
    }

    fn query(&self, channel: Option<u8>, kind: CompletionKind, request: Request) -> Result<Frame, Error> {
        let destination = match channel {
            Some(channel) => self.address(channel)?,
            None => CONTROLLER,
        };
        self.request(
            (channel, kind),
            &request,
            destination,
            request.response_id(),
            self.shared.config.query_timeout,
        )?
        .wait_frame()
    }

    /// Writes `set`, then `request`, and returns the reply to `request`.
    ///
    /// The `(channel, kind)` slot is taken before `set` goes out, so a colliding call fails
    /// without touching the device.
    fn set_and_query(
        &self,
        channel: u8,
        kind: CompletionKind,
        set: &dyn Command,
        request: Request,
    ) -> Result<Frame, Error> {
        let address = self.address(channel)?;
        let query = request.to_frame(address);
        let registration = lock(&self.shared.pending).insert(
            (Some(channel), kind),
            query.message_id,
            request.response_id(),
            self.shared.config.query_timeout,
        )?;
        self.write_registered(&registration, &set.to_frame(address))?;
        self.write_registered(&registration, &query)?;
        self.completion(registration).wait_frame()
    }

    /// Like [`Controller::request`], for commands that set the channel's state optimistically
    /// before they are sent. The state change is undone if the command cannot be sent.
    fn motion_request(
        &self,
        channel: u8,
        kind: CompletionKind,
        command: &dyn Command,
        expected: MessageId,
        timeout: Duration,
        begin: impl FnOnce(&mut ChannelState),
    ) -> Result<Completion, Error> {
        let address = self.address(channel)?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let frame = command.to_frame(address);
        // the monitor cannot apply a frame between taking the slot and the optimistic update
        let (registration, before, after) = {
            let mut channels = lock(&self.shared.channels);
            let state = channels
                .get_mut(usize::from(channel - 1))
                .ok_or(Error::InvalidChannel(channel))?;
            let registration =
                lock(&self.shared.pending).insert((Some(channel), kind), frame.message_id, expected, timeout)?;
            let before = state.mark();
            begin(state);
            (registration, before, state.mark())
        };
        if let Err(e) = self.write_registered(&registration, &frame) {
            let _ = self.with_channel(channel, |state| state.undo(before, after));
            return Err(e);
        }
        Ok(self.completion(registration))
    }

    fn check_ready(&self, channel: u8) -> Result<(), Error> {
        let ready = self.with_channel(channel, |state| state.is_ready())?;
        if self.shared.config.require_ready_for_moves && !ready {
            return Err(Error::NotReady { channel });
        }
        Ok(())
    }

    fn counts(&self, what: &'static str, value: f64, convert: fn(&ScalingContext, f64) -> i64) -> Result<i32, Error> {
        let out_of_range = || EncodingError::ValueOutOfRange { what, value };
        if !value.is_finite() {
            return Err(out_of_range().into());
        }
        i32::try_from(convert(&self.shared.scaling, value)).map_err(|_| out_of_range().into())
    }

    /// Enables or disables the motor output, then reads the state back.
    ///
    /// Fails with [`Error::VerificationMismatch`] if the device reports the other state.
    pub fn enable_channel(&self, channel: u8, enable: bool) -> Result<(), Error> {
        let reply = self.set_and_query(
            channel,
            CompletionKind::EnableState,
            &SetEnableState { enable },
            Request::EnableState,
        )?;
        let expected = if enable {
            SetEnableState::ENABLED
        } else {
            SetEnableState::DISABLED
        };
        if reply.param2 != expected {
            return Err(Error::VerificationMismatch {
                channel,
                what: "enable state",
                expected: i64::from(expected),
                actual: i64::from(reply.param2),
            });
        }
        debug!("channel {} enabled: {}", channel, enable);
        Ok(())
    }

    /// Starts homing `channel`. The returned [`Completion`] resolves on `MOVE_HOMED`.
    ///
    /// If no `MOVE_HOMED` arrives within `timeout` the channel is left not homed with its error
    /// flag set.
    pub fn start_home(&self, channel: u8, timeout: Duration) -> Result<Completion, Error> {
        self.motion_request(
            channel,
            CompletionKind::Home,
            &MoveHome,
            MessageId::MotMoveHomed,
            timeout,
            ChannelState::begin_home,
        )
    }

    /// Homes `channel` and waits for it to finish.
    pub fn home(&self, channel: u8, timeout: Duration) -> Result<(), Error> {
        self.start_home(channel, timeout)?.wait()
    }

    /// Homes every configured channel at once and waits for all of them.
    ///
    /// Returns the first failure after every channel has finished or failed.
    pub fn home_all(&self, timeout: Duration) -> Result<(), Error> {
        let completions: Vec<Result<Completion, Error>> = (1..=self.shared.config.channel_count)
            .map(|channel| self.start_home(channel, timeout))
            .collect();
        completions
            .into_iter()
            .map(|completion| completion.and_then(Completion::wait))
            .fold(Ok(()), |first, result| first.and(result))
    }

    fn start_move(
        &self,
        channel: u8,
        command: &dyn Command,
        displacement: i64,
        timeout: Duration,
    ) -> Result<Completion, Error> {
        self.check_ready(channel)?;
        self.motion_request(
            channel,
            CompletionKind::Move,
            command,
            MessageId::MotMoveCompleted,
            timeout,
            |state| state.begin_move(displacement),
        )
    }

    /// Starts a move of `channel` to `position` units. Resolves on `MOVE_COMPLETED`.
    pub fn start_move_absolute(&self, channel: u8, position: f64, timeout: Duration) -> Result<Completion, Error> {
        let position = self.counts("position", position, ScalingContext::position_to_counts)?;
        let current = self.with_channel(channel, |state| state.position())?;
        let displacement = i64::from(position) - i64::from(current);
        self.start_move(channel, &MoveAbsolute { position }, displacement, timeout)
    }

    /// Moves `channel` to `position` units and waits for it to get there.
    pub fn move_absolute(&self, channel: u8, position: f64, timeout: Duration) -> Result<(), Error> {
        self.start_move_absolute(channel, position, timeout)?.wait()
    }

    /// Starts a move of `channel` by `distance` units. Resolves on `MOVE_COMPLETED`.
    pub fn start_move_relative(&self, channel: u8, distance: f64, timeout: Duration) -> Result<Completion, Error> {
        let distance = self.counts("distance", distance, ScalingContext::position_to_counts)?;
        self.start_move(channel, &MoveRelative { distance }, i64::from(distance), timeout)
    }

    /// Moves `channel` by `distance` units and waits for it to get there.
    pub fn move_relative(&self, channel: u8, distance: f64, timeout: Duration) -> Result<(), Error> {
        self.start_move_relative(channel, distance, timeout)?.wait()
    }

    /// Writes the velocity profile of `channel`, then reads it back.
    ///
    /// Velocities are in units/s and must satisfy `0 <= min <= max`; the acceleration in units/s²
    /// must not be negative. Fails with [`Error::VerificationMismatch`] if the device stored
    /// different values, e.g. because it clamped them.
    pub fn set_velocity_params(&self, channel: u8, min: f64, max: f64, accel: f64) -> Result<(), Error> {
        for (what, value) in [("min velocity", min), ("max velocity", max), ("acceleration", accel)] {
            if value < 0.0 {
                return Err(EncodingError::ValueOutOfRange { what, value }.into());
            }
        }
        if min > max {
            return Err(EncodingError::ValueOutOfRange {
                what: "min velocity",
                value: min,
            }
            .into());
        }
        let params = VelocityParams {
            min: self.counts("min velocity", min, ScalingContext::velocity_to_counts)?,
            accel: self.counts("acceleration", accel, ScalingContext::acceleration_to_counts)?,
            max: self.counts("max velocity", max, ScalingContext::velocity_to_counts)?,
        };
        let reply = self.set_and_query(
            channel,
            CompletionKind::VelocityParams,
            &SetVelocityParams(params),
            Request::VelocityParams,
        )?;
        let stored = VelocityParams::parse(&reply)?;
        let fields = [
            ("min velocity", params.min, stored.min),
            ("acceleration", params.accel, stored.accel),
            ("max velocity", params.max, stored.max),
        ];
        if let Some((what, expected, actual)) = fields.into_iter().find(|(_, wrote, read)| wrote != read) {
            return Err(Error::VerificationMismatch {
                channel,
                what,
                expected: i64::from(expected),
                actual: i64::from(actual),
            });
        }
        Ok(())
    }

    /// The velocity profile last read back from `channel`, if any.
    pub fn velocity_params(&self, channel: u8) -> Result<Option<VelocityProfile>, Error> {
        let scaling = self.shared.scaling;
        self.with_channel(channel, |state| {
            state.velocity().map(|params| VelocityProfile {
                min_velocity: scaling.counts_to_velocity(i64::from(params.min)),
                max_velocity: scaling.counts_to_velocity(i64::from(params.max)),
                acceleration: scaling.counts_to_acceleration(i64::from(params.accel)),
            })
        })
    }

    /// Stops `channel`. A pending move or home on it fails with [`Error::Stopped`] once the
    /// device confirms.
    pub fn stop(&self, channel: u8, mode: StopMode) -> Result<(), Error> {
        let address = self.address(channel)?;
        self.send(&Stop { mode }, address)
    }

    /// Stops every configured channel. Returns the first failure after trying all of them.
    pub fn stop_all(&self, mode: StopMode) -> Result<(), Error> {
        (1..=self.shared.config.channel_count)
            .map(|channel| self.stop(channel, mode))
            .fold(Ok(()), |first, result| first.and(result))
    }

    /// Last known position of `channel` in units. Does not talk to the device.
    pub fn get_position(&self, channel: u8) -> Result<f64, Error> {
        let counts = self.with_channel(channel, |state| state.position())?;
        Ok(self.shared.scaling.counts_to_position(i64::from(counts)))
    }

    /// Snapshot of `channel`'s last known state.
    pub fn get_channel_status(&self, channel: u8) -> Result<ChannelStatus, Error> {
        let scaling = self.shared.scaling;
        self.with_channel(channel, |state| state.snapshot(&scaling))
    }

    /// Runs `callback` on the callback thread whenever `kind` happens on `channel`.
    ///
    /// Callbacks for the same key run in registration order. Errors and panics are logged.
    pub fn register_completion_callback<F>(&self, channel: u8, kind: EventKind, callback: F) -> Result<CallbackId, Error>
    where
        F: Fn(&Event) -> CallbackResult + Send + Sync + 'static,
    {
        self.address(channel)?;
        Ok(lock(&self.shared.callbacks).register(channel, kind, Arc::new(callback)))
    }

    /// Removes a callback. Returns whether it was registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        lock(&self.shared.callbacks).unregister(id)
    }

    /// Flashes the front panel LED of `channel`.
    pub fn identify(&self, channel: u8) -> Result<(), Error> {
        let address = self.address(channel)?;
        self.send(&Identify, address)
    }

    /// Asks `channel` for a status update without waiting for it. The reply updates the channel
    /// state when it arrives.
    pub fn request_status_update(&self, channel: u8) -> Result<(), Error> {
        let address = self.address(channel)?;
        self.send(&Request::StatusUpdate, address)
    }

    /// Requests a status update from `channel` and returns the resulting snapshot.
    pub fn query_status(&self, channel: u8) -> Result<ChannelStatus, Error> {
        self.query(Some(channel), CompletionKind::Status, Request::StatusUpdate)?;
        self.get_channel_status(channel)
    }

    /// Reads the status register of `channel`.
    pub fn query_status_bits(&self, channel: u8) -> Result<StatusBits, Error> {
        let reply = self.query(Some(channel), CompletionKind::StatusBits, Request::StatusBits)?;
        Ok(payload::status_bits(&reply)?)
    }

    /// Reads the position counter of `channel`, in units.
    pub fn query_position(&self, channel: u8) -> Result<f64, Error> {
        let reply = self.query(Some(channel), CompletionKind::Position, Request::PositionCounter)?;
        let counter = Counter::parse(&reply, MessageId::MotGetPosCounter)?;
        Ok(self.shared.scaling.counts_to_position(i64::from(counter.value)))
    }

    /// Reads the encoder counter of `channel`, in counts.
    pub fn query_encoder(&self, channel: u8) -> Result<i32, Error> {
        let reply = self.query(Some(channel), CompletionKind::Encoder, Request::EncoderCounter)?;
        Ok(Counter::parse(&reply, MessageId::MotGetEncCounter)?.value)
    }

    /// Overwrites the position counter of `channel` with `position` units without moving.
    pub fn set_position_counter(&self, channel: u8, position: f64) -> Result<(), Error> {
        let value = self.counts("position", position, ScalingContext::position_to_counts)?;
        let address = self.address(channel)?;
        self.send(&SetPositionCounter { value }, address)
    }

    /// Reads the controller's identification block.
    pub fn hardware_info(&self) -> Result<HardwareInfo, Error> {
        let reply = self.query(None, CompletionKind::HardwareInfo, Request::HardwareInfo)?;
        Ok(HardwareInfo::parse(&reply)?)
    }

    /// Starts the controller's periodic status update messages.
    pub fn start_update_messages(&self) -> Result<(), Error> {
        self.send(&UpdateMessages { enable: true }, BROADCAST)
    }

    /// Stops the controller's periodic status update messages.
    pub fn stop_update_messages(&self) -> Result<(), Error> {
        self.send(&UpdateMessages { enable: false }, BROADCAST)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.disconnect();
    }
}
