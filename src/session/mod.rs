//! Session state machine.
//!
//! A [`SamplingSession`] owns everything one sampling run needs: the
//! backend, per-CPU state, the sample arena and the consumer doorbell. It
//! moves through `Stopped -> Configuring -> Stopped -> Starting -> Running
//! -> Stopping -> Stopped`, with `Aborting` as the discarding variant of
//! `Stopping`.

use crate::backend::{HardwareBackend, RegisterFault, RegisterFile};
use crate::buffer::SampleArena;
use crate::error::{Result, SamplingError};
use crate::interrupt::InterruptPath;
use crate::params::{Capture, SessionParams};
use crate::percpu::{CpuState, HandlerState, PreciseArea};
use crate::registers::{self, PackageCoordinator, Programmer, SessionConfig};
use crate::sample::InterruptFrame;
use crate::topology::Topology;
use crate::wake::Doorbell;
use crate::{debug, info, warn};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use serde::Serialize;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

mod stats;
mod timer;

pub use stats::{HandlerStats, SessionStats, Status, STAT_LEN};
pub use timer::CancelToken;

/// How long a blocked reader waits before re-checking the session.
const READ_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Configuring,
    Starting,
    Running,
    Stopping,
    Aborting,
}

impl SessionState {
    pub fn code(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Configuring => 1,
            Self::Starting => 2,
            Self::Running => 3,
            Self::Stopping => 4,
            Self::Aborting => 5,
        }
    }
}

#[derive(Default)]
struct Timers {
    delay: Option<Arc<CancelToken>>,
    duration: Option<Arc<CancelToken>>,
}

/// Drained records not yet handed to a reader.
#[derive(Default)]
struct Stream {
    data: Vec<u8>,
    position: usize,
}

impl Stream {
    fn remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }

    fn clear(&mut self) {
        self.data = Vec::new();
        self.position = 0;
    }
}

pub struct SamplingSession {
    this: Weak<SamplingSession>,
    backend: Box<dyn HardwareBackend>,
    regs: Arc<dyn RegisterFile>,
    topology: Topology,
    cpus: Box<[CpuState]>,
    packages: PackageCoordinator,
    arena: SampleArena,
    doorbell: Doorbell,
    handler_stats: HandlerStats,
    paused: AtomicU32,
    status: AtomicU8,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    config: spin::RwLock<Option<Arc<SessionConfig>>>,
    timers: Mutex<Timers>,
    started: Mutex<Option<Instant>>,
    final_stats: Mutex<Option<SessionStats>>,
    stream: Mutex<Stream>,
}

impl SamplingSession {
    pub fn new(
        backend: Box<dyn HardwareBackend>,
        regs: Arc<dyn RegisterFile>,
        topology: Topology,
    ) -> Arc<Self> {
        let cpus = topology.cpus().iter().copied().map(CpuState::new).collect();
        let packages = PackageCoordinator::new(topology.packages());

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            regs,
            topology,
            cpus,
            packages,
            arena: SampleArena::new(),
            doorbell: Doorbell::new(),
            handler_stats: HandlerStats::default(),
            paused: AtomicU32::new(0),
            status: AtomicU8::new(0),
            state: Mutex::new(SessionState::Stopped),
            state_changed: Condvar::new(),
            config: spin::RwLock::new(None),
            timers: Mutex::new(Timers::default()),
            started: Mutex::new(None),
            final_stats: Mutex::new(None),
            stream: Mutex::new(Stream::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn backend(&self) -> &dyn HardwareBackend {
        self.backend.as_ref()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    fn raise(&self, status: Status) {
        self.status.fetch_or(status.bits(), Ordering::AcqRel);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    /// Block until the session reaches `Stopped`.
    fn wait_stopped(&self) {
        let mut state = self.state.lock();
        while *state != SessionState::Stopped {
            self.state_changed.wait(&mut state);
        }
    }

    /// The active configuration, if any.
    pub fn config(&self) -> Option<Arc<SessionConfig>> {
        self.config.read().clone()
    }

    fn path(&self) -> InterruptPath<'_> {
        InterruptPath::new(
            self.backend.as_ref(),
            self.regs.as_ref(),
            &self.packages,
            &self.arena,
            self.doorbell.waker(),
            &self.cpus,
            &self.handler_stats,
            &self.paused,
        )
    }

    fn programmer(&self) -> Programmer<'_> {
        Programmer::new(self.backend.as_ref(), self.regs.as_ref(), &self.packages)
    }

    /// Validate `params` and build the register tables for the next start.
    pub fn configure(&self, params: &SessionParams) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Stopped {
                return Err(SamplingError::DeviceBusy("session is not stopped"));
            }
            *state = SessionState::Configuring;
        }

        let result = registers::configure(
            self.backend.as_ref(),
            self.regs.as_ref(),
            params,
            self.cpus.len(),
        );

        if let Ok(config) = &result {
            debug!(
                "session configured: {} events, {} byte buffer",
                config.events.len(),
                config.buffer_len()
            );
        }

        let mut state = self.state.lock();

        // an abort that arrived meanwhile owns the transition back
        if *state == SessionState::Aborting {
            *state = SessionState::Stopped;
            self.state_changed.notify_all();
            return Err(SamplingError::DeviceBusy("configuration was aborted"));
        }

        let result = result.map(|config| {
            *self.config.write() = Some(Arc::new(config));
        });

        *state = SessionState::Stopped;
        self.state_changed.notify_all();

        result
    }

    /// Arm every logical CPU and begin sampling. With `params` the session
    /// is configured first.
    pub fn start(&self, params: Option<&SessionParams>) -> Result<()> {
        if let Some(params) = params {
            self.configure(params)?;
        }

        let config = {
            let mut state = self.state.lock();
            if *state != SessionState::Stopped {
                return Err(SamplingError::DeviceBusy("session is not stopped"));
            }

            let config = self
                .config()
                .ok_or_else(|| SamplingError::invalid("session is not configured"))?;

            *state = SessionState::Starting;
            self.status.store(0, Ordering::Release);
            config
        };

        self.handler_stats.reset();
        self.paused.store(0, Ordering::Release);
        *self.final_stats.lock() = None;
        self.stream.lock().clear();

        if let Err(e) = self.arena.prepare(
            config.record_len(),
            config.samples_per_buffer,
            config.max_samples,
        ) {
            self.set_state(SessionState::Stopped);
            return Err(e);
        }

        if let Some(delay) = config.start_delay {
            let token = Arc::new(CancelToken::new());
            self.timers.lock().delay = Some(token.clone());

            // an abort that already ran could not see the token
            if self.state() != SessionState::Aborting {
                debug!("delaying start by {}", humantime::format_duration(delay));
                token.sleep(delay);
            }

            self.timers.lock().delay = None;
        }

        if self.state() == SessionState::Aborting {
            self.arena.release();
            self.set_state(SessionState::Stopped);
            return Err(SamplingError::DeviceBusy("start was aborted"));
        }

        let precise = config
            .tables
            .sets()
            .iter()
            .any(|set| set.counters().any(|c| c.capture.contains(Capture::PRECISE)));

        *self.started.lock() = Some(Instant::now());
        self.arena.activate();

        let armed: Vec<std::result::Result<(), RegisterFault>> = self
            .cpus
            .par_iter()
            .map(|cpu| self.arm(cpu, &config, precise))
            .collect();

        if let Some(Err(e)) = armed.into_iter().find(|r| r.is_err()) {
            warn!("failed to arm sampling: {e}");
            self.arena.deactivate();
            self.disarm_all(&config);
            self.arena.release();
            self.set_state(SessionState::Stopped);
            return Err(e.into());
        }

        if let Some(duration) = config.max_duration {
            self.arm_duration_timer(duration);
        }

        {
            let mut state = self.state.lock();
            if *state == SessionState::Starting {
                *state = SessionState::Running;
                self.state_changed.notify_all();
                info!("sampling started on {} cpus", self.cpus.len());
                return Ok(());
            }
        }

        // aborted while arming
        self.halt(true);
        self.arena.release();
        self.set_state(SessionState::Stopped);
        Err(SamplingError::DeviceBusy("start was aborted"))
    }

    fn arm_duration_timer(&self, duration: Duration) {
        let token = Arc::new(CancelToken::new());
        self.timers.lock().duration = Some(token.clone());

        let session = self.this.clone();

        std::thread::spawn(move || {
            if !token.sleep(duration) {
                return;
            }

            if let Some(session) = session.upgrade() {
                info!("maximum duration reached, stopping");
                session.raise(Status::DURATION_EXPIRED);
                if let Err(e) = session.stop(true) {
                    debug!("duration stop skipped: {e}");
                }
            }
        });
    }

    fn arm(
        &self,
        cpu: &CpuState,
        config: &SessionConfig,
        precise: bool,
    ) -> std::result::Result<(), RegisterFault> {
        let mut local = cpu.lock();
        let set = config.tables.set_for(cpu.thread());

        local.precise = precise.then(|| Arc::new(PreciseArea::new()));
        local.saved_route = Some(self.backend.arm_interrupt(self.regs.as_ref(), cpu.id())?);

        self.programmer()
            .apply(cpu.id(), cpu.package(), set, &mut local.joined)?;

        cpu.request_start_all();
        local.handler = HandlerState::Armed;

        Ok(())
    }

    fn disarm(&self, cpu: &CpuState, config: &SessionConfig) -> std::result::Result<(), RegisterFault> {
        let mut local = cpu.lock();
        let set = config.tables.set_for(cpu.thread());

        local.handler = HandlerState::Disabled;

        let mut result = Ok(());

        if let Some(saved) = local.saved_route.take() {
            result = self
                .backend
                .restore_interrupt(self.regs.as_ref(), cpu.id(), saved);
        }

        let joined = std::mem::take(&mut local.joined);
        let restored = self
            .programmer()
            .restore(cpu.id(), cpu.package(), set, joined);

        local.precise = None;
        cpu.take_start_all();

        result.and(restored)
    }

    fn disarm_all(&self, config: &SessionConfig) {
        let failures = self
            .cpus
            .par_iter()
            .map(|cpu| self.disarm(cpu, config))
            .filter_map(|r| r.err())
            .inspect(|e| warn!("failed to restore registers: {e}"))
            .count();

        if failures > 0 {
            self.raise(Status::HARDWARE_ANOMALY);
        }
    }

    /// Disable sampling on every CPU, restore registers and capture the
    /// final statistics. The caller has moved the state to `Stopping` or
    /// `Aborting`.
    fn halt(&self, flush: bool) {
        if let Some(token) = self.timers.lock().duration.take() {
            token.cancel();
        }

        self.arena.deactivate();

        if let Some(config) = self.config() {
            self.disarm_all(&config);
        }

        if flush {
            self.arena.request_flush();
        }

        let stats = self.snapshot(SessionState::Stopped);
        *self.final_stats.lock() = Some(stats);

        info!(
            "sampling stopped: {} samples, {} interrupts",
            stats.samples, stats.interrupts
        );

        if flush {
            self.doorbell.waker().ring();
        }
    }

    /// Stop sampling. Stopping a stopped session succeeds and changes
    /// nothing.
    pub fn stop(&self, flush: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Stopped => return Ok(()),
                SessionState::Running => *state = SessionState::Stopping,
                _ => return Err(SamplingError::DeviceBusy("session is changing state")),
            }
        }

        self.halt(flush);
        self.set_state(SessionState::Stopped);

        Ok(())
    }

    /// Stop, then free the buffer and drop undelivered data.
    pub fn abort(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                SessionState::Aborting => return Ok(()),
                SessionState::Stopped => {
                    // held so a racing start cannot prepare the arena first
                    self.raise(Status::ABORTED);
                    self.arena.release();
                    self.stream.lock().clear();
                    return Ok(());
                }
                _ => *state = SessionState::Aborting,
            }
            previous
        };

        self.raise(Status::ABORTED);

        {
            let timers = self.timers.lock();
            if let Some(token) = &timers.delay {
                token.cancel();
            }
            if let Some(token) = &timers.duration {
                token.cancel();
            }
        }

        if previous == SessionState::Running {
            self.halt(true);
            self.set_state(SessionState::Stopped);
        } else {
            self.wait_stopped();
        }

        self.arena.release();
        self.stream.lock().clear();

        info!("session aborted");

        Ok(())
    }

    pub fn pause(&self) {
        self.paused.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        let _ = self
            .paused
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) > 0
    }

    /// Re-enable the arena after a drain and re-arm CPUs that suspended
    /// when it filled. Returns whether sampling is active again.
    pub fn resume_sampling(&self) -> bool {
        if self.state() != SessionState::Running || !self.arena.resume() {
            return false;
        }

        let Some(config) = self.config() else {
            return false;
        };

        self.cpus.par_iter().for_each(|cpu| {
            let mut local = cpu.lock();
            if local.handler != HandlerState::Suspended {
                return;
            }

            let set = config.tables.set_for(cpu.thread());
            match self
                .programmer()
                .apply(cpu.id(), cpu.package(), set, &mut local.joined)
            {
                Ok(()) => local.handler = HandlerState::Armed,
                Err(e) => {
                    warn!("failed to resume cpu {}: {e}", cpu.id());
                    self.handler_stats.anomalies.increment();
                }
            }
        });

        true
    }

    /// Overflow interrupt entry for `cpu`.
    pub fn handle_overflow(&self, cpu: usize, frame: &InterruptFrame) {
        let Some(config) = self.config.try_read() else {
            self.handler_stats.skipped.increment();
            return;
        };

        match config.as_ref() {
            Some(config) => self.path().handle_overflow(config, cpu, frame),
            None => {
                self.handler_stats.skipped.increment();
            }
        }
    }

    /// Timer tick entry for `cpu`, used by time-based sampling.
    pub fn handle_timer_tick(&self, cpu: usize, frame: &InterruptFrame) {
        if let Some(config) = self.config.try_read() {
            if let Some(config) = config.as_ref() {
                self.path().handle_timer_tick(config, cpu, frame);
            }
        }
    }

    pub fn precise_area(&self, cpu: usize) -> Option<Arc<PreciseArea>> {
        self.cpus.get(cpu)?.precise_area()
    }

    pub fn handler_state(&self, cpu: usize) -> Option<HandlerState> {
        self.cpus.get(cpu).map(|c| c.handler_state())
    }

    /// Per-CPU event totals for the counter at overflow bit `bit` of
    /// hardware thread `thread`.
    pub fn event_total(&self, thread: usize, bit: usize, cpu: usize) -> u64 {
        self.config()
            .and_then(|c| c.tables.set_for(thread).counter(bit).map(|d| d.total(cpu)))
            .unwrap_or(0)
    }

    pub fn handler_stats(&self) -> &HandlerStats {
        &self.handler_stats
    }

    pub fn wakeups(&self) -> u64 {
        self.doorbell.rings()
    }

    /// Bytes currently allocated for the sample buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn sampling_active(&self) -> bool {
        self.arena.is_active()
    }

    /// Times a package's shared registers were saved.
    pub fn shared_saves(&self) -> u64 {
        self.packages.saves()
    }

    fn snapshot(&self, state: SessionState) -> SessionStats {
        let stats = &self.handler_stats;

        let duration_us = self
            .started
            .lock()
            .map(|s| s.elapsed().as_micros() as u64)
            .unwrap_or(0);

        SessionStats {
            duration_us,
            interrupts: stats.interrupts.value(),
            samples: self.arena.samples(),
            skipped: stats.skipped.value(),
            lost: stats.lost.value(),
            dropped: stats.dropped.value(),
            deferred: stats.deferred.value(),
            precise_errors: stats.precise_errors.value(),
            anomalies: stats.anomalies.value(),
            timer_ticks: stats.timer_ticks.value(),
            state: state.code(),
            status: self.status(),
        }
    }

    /// Current statistics; once stopped, the ones captured by the stop.
    pub fn stat(&self) -> SessionStats {
        let state = self.state();

        if state == SessionState::Stopped {
            if let Some(mut stats) = *self.final_stats.lock() {
                stats.status = self.status();
                return stats;
            }
        }

        self.snapshot(state)
    }

    /// Copy whole records into `buf`. Blocks while the session runs and no
    /// data is ready; returns 0 once stopped and drained.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let Some(record_len) = self.config().map(|c| c.record_len()) else {
            return Ok(0);
        };

        if buf.len() < record_len {
            return Err(SamplingError::invalid(format!(
                "read buffer of {} bytes cannot hold a {record_len} byte record",
                buf.len()
            )));
        }

        loop {
            {
                let mut stream = self.stream.lock();
                let remaining = stream.remaining();

                if !remaining.is_empty() {
                    let len = remaining.len().min(buf.len()) / record_len * record_len;
                    buf[..len].copy_from_slice(&remaining[..len]);
                    stream.position += len;
                    if stream.remaining().is_empty() {
                        stream.clear();
                    }
                    return Ok(len);
                }
            }

            let state = self.state();

            if state == SessionState::Stopped && self.status().contains(Status::ABORTED) {
                return Ok(0);
            }

            if self.arena.flush_requested() || state != SessionState::Running {
                let data = self.arena.drain();

                if state == SessionState::Running {
                    if self.arena.limit_reached() {
                        self.raise(Status::SAMPLE_LIMIT);
                        info!("maximum samples reached, stopping");
                        // losing to a concurrent stop is fine
                        let _ = self.stop(true);
                    } else {
                        self.resume_sampling();
                    }
                }

                if !data.is_empty() {
                    let mut stream = self.stream.lock();
                    stream.data = data;
                    stream.position = 0;
                    continue;
                }

                if state == SessionState::Stopped {
                    return Ok(0);
                }

                if state == SessionState::Running {
                    continue;
                }
            }

            self.doorbell.wait(READ_POLL);
        }
    }
}

impl Drop for SamplingSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Stopped {
            let _ = self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedPmu;
    use crate::backend::{select, Family, RegisterId};
    use crate::params::{EventRequest, Method};
    use crate::sample::{SampleRecord, BASE_RECORD_LEN};
    use crate::wake::NonBlocking;

    /// Register access slow enough to abort a session mid-transition.
    struct SlowRegisters(Arc<SimulatedPmu>);

    impl NonBlocking for SlowRegisters {}

    impl RegisterFile for SlowRegisters {
        fn read(&self, cpu: usize, reg: RegisterId) -> std::result::Result<u64, RegisterFault> {
            std::thread::sleep(Duration::from_millis(20));
            self.0.read(cpu, reg)
        }

        fn write(
            &self,
            cpu: usize,
            reg: RegisterId,
            value: u64,
        ) -> std::result::Result<(), RegisterFault> {
            self.0.write(cpu, reg, value)
        }
    }

    /// Keeps the (cpu, register) of every write.
    struct Recorded {
        pmu: Arc<SimulatedPmu>,
        writes: Mutex<Vec<(usize, RegisterId)>>,
    }

    impl NonBlocking for Recorded {}

    impl RegisterFile for Recorded {
        fn read(&self, cpu: usize, reg: RegisterId) -> std::result::Result<u64, RegisterFault> {
            self.pmu.read(cpu, reg)
        }

        fn write(
            &self,
            cpu: usize,
            reg: RegisterId,
            value: u64,
        ) -> std::result::Result<(), RegisterFault> {
            self.writes.lock().push((cpu, reg));
            self.pmu.write(cpu, reg, value)
        }
    }

    fn slow_session() -> Arc<SamplingSession> {
        let backend = select(Family::P6);
        let topology = Topology::synthetic(1, backend.threads());
        let pmu = Arc::new(SimulatedPmu::new(backend.as_ref(), topology.len()));
        SamplingSession::new(backend, Arc::new(SlowRegisters(pmu)), topology)
    }

    fn wait_for(session: &SamplingSession, state: SessionState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.state() != state {
            assert!(Instant::now() < deadline, "never reached {state:?}");
            std::thread::yield_now();
        }
    }

    fn assert_disarmed(session: &SamplingSession) {
        for cpu in 0..session.topology().len() {
            assert_ne!(session.handler_state(cpu), Some(HandlerState::Armed));
        }
    }

    fn session(family: Family, packages: usize) -> (Arc<SamplingSession>, Arc<SimulatedPmu>) {
        let backend = select(family);
        let topology = Topology::synthetic(packages, backend.threads());
        let pmu = Arc::new(SimulatedPmu::new(backend.as_ref(), topology.len()));
        let session = SamplingSession::new(backend, pmu.clone(), topology);
        (session, pmu)
    }

    fn p6_params(sample_after: u64) -> SessionParams {
        SessionParams {
            samples_per_buffer: 1000,
            events: vec![
                EventRequest::control(0x186, 0x5300c0, 0xc1, 100),
                EventRequest::counter(0xc1, sample_after),
            ],
            ..Default::default()
        }
    }

    fn frame() -> InterruptFrame {
        InterruptFrame {
            ip: 0x401000,
            flags: 0x246,
            cs: 0x33,
            pid: 42,
            tid: 43,
            timestamp: 7,
        }
    }

    /// Count up to the next overflow of `counter` and deliver the
    /// interrupt, raised or not.
    fn overflow(session: &SamplingSession, pmu: &SimulatedPmu, cpu: usize, counter: u32, n: u64) {
        pmu.advance(cpu, RegisterId(counter), n).unwrap();
        session.handle_overflow(cpu, &frame());
    }

    fn read_all(session: &SamplingSession) -> Vec<SampleRecord> {
        let layout = session.config().unwrap().layout;
        let mut buf = vec![0; 64 * 1024];
        let mut records = Vec::new();

        loop {
            let len = session.read(&mut buf).unwrap();
            if len == 0 {
                break;
            }
            assert_eq!(len % layout.len(), 0);
            for chunk in buf[..len].chunks(layout.len()) {
                records.push(SampleRecord::decode(layout, chunk).unwrap());
            }
        }

        records
    }

    #[test]
    fn record_length_and_buffer_size() {
        let (session, _pmu) = session(Family::P6, 1);
        session.configure(&p6_params(100)).unwrap();

        let config = session.config().unwrap();
        assert_eq!(config.record_len(), BASE_RECORD_LEN);

        session.start(None).unwrap();
        assert_eq!(session.buffer_capacity(), 1000 * BASE_RECORD_LEN);
        session.stop(false).unwrap();
    }

    #[test]
    fn second_start_is_busy() {
        let (session, pmu) = session(Family::P6, 1);
        session.start(Some(&p6_params(100))).unwrap();

        overflow(&session, &pmu, 0, 0xc1, 100);

        let counter = pmu.read(0, RegisterId(0xc1)).unwrap();
        let pending = session.stat().samples;

        assert!(matches!(
            session.start(None),
            Err(SamplingError::DeviceBusy(_))
        ));
        assert!(matches!(
            session.start(Some(&p6_params(5))),
            Err(SamplingError::DeviceBusy(_))
        ));
        assert!(matches!(
            session.configure(&p6_params(5)),
            Err(SamplingError::DeviceBusy(_))
        ));

        assert_eq!(pmu.read(0, RegisterId(0xc1)).unwrap(), counter);
        assert_eq!(session.stat().samples, pending);
        assert_eq!(session.config().unwrap().tables.set_for(0).counter(0).unwrap().sample_after, 100);
        assert_eq!(session.state(), SessionState::Running);

        session.stop(true).unwrap();
    }

    #[test]
    fn buffer_full_wakes_once() {
        let (session, pmu) = session(Family::P6, 1);
        session.start(Some(&p6_params(100))).unwrap();

        for _ in 0..1500 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }

        let stats = session.stat();
        assert_eq!(stats.samples, 1000);
        assert_eq!(stats.interrupts, 1500);
        assert_eq!(stats.skipped, 500);
        assert!(!session.sampling_active());
        assert_eq!(session.handler_state(0), Some(HandlerState::Suspended));
        assert_eq!(session.wakeups(), 1);

        session.stop(true).unwrap();
        assert_eq!(read_all(&session).len(), 1000);
    }

    #[test]
    fn max_samples_stops_session() {
        let (session, pmu) = session(Family::P6, 1);
        let params = SessionParams {
            max_samples: Some(50),
            ..p6_params(100)
        };
        session.start(Some(&params)).unwrap();

        for _ in 0..60 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }

        assert_eq!(session.stat().samples, 50);
        assert!(!session.sampling_active());

        let records = read_all(&session);
        assert_eq!(records.len(), 50);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.status().contains(Status::SAMPLE_LIMIT));

        let mut buf = [0; 64];
        assert_eq!(session.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn simultaneous_overflows_share_one_capture() {
        let (session, pmu) = session(Family::P6, 1);
        let params = SessionParams {
            events: vec![
                EventRequest::control(0x186, 0x5300c0, 0xc1, 100),
                EventRequest::counter(0xc1, 100),
                EventRequest::control(0x187, 0x53003c, 0xc2, 200),
                EventRequest::counter(0xc2, 100),
            ],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        assert_eq!(pmu.advance(0, RegisterId(0xc1), 100).unwrap(), (100, true));
        assert_eq!(pmu.advance(0, RegisterId(0xc2), 100).unwrap(), (100, true));
        session.handle_overflow(0, &frame());

        assert_eq!(session.handler_stats().captures.value(), 1);

        session.stop(true).unwrap();
        let records = read_all(&session);
        assert_eq!(records.len(), 2);

        let (a, b) = (&records[0], &records[1]);
        assert_eq!(a.event_index, 0);
        assert_eq!(b.event_index, 1);
        assert_eq!(a.ip, 0x401000);
        assert_eq!(a.pid, 42);
        assert_eq!(
            SampleRecord {
                event_index: 0,
                ..b.clone()
            },
            *a
        );

        let config = session.config().unwrap();
        assert_eq!(config.events.get(b.event_index), Some(200));
    }

    #[test]
    fn abort_discards_buffered_data() {
        let (session, pmu) = session(Family::P6, 1);
        session.start(Some(&p6_params(100))).unwrap();

        for _ in 0..10 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }

        session.abort().unwrap();

        let mut buf = [0; 1024];
        assert_eq!(session.read(&mut buf).unwrap(), 0);
        assert_eq!(session.buffer_capacity(), 0);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.status().contains(Status::ABORTED));
    }

    #[test]
    fn repeated_stop_keeps_statistics() {
        let (session, pmu) = session(Family::P6, 1);

        // never started
        session.stop(true).unwrap();

        session.start(Some(&p6_params(100))).unwrap();
        for _ in 0..5 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }
        session.stop(true).unwrap();

        let first = session.stat();
        assert_eq!(first.samples, 5);

        std::thread::sleep(Duration::from_millis(5));

        for flush in [true, false, true] {
            session.stop(flush).unwrap();
            assert_eq!(session.stat(), first);
        }
    }

    #[test]
    fn drain_resumes_then_flushes_the_rest() {
        let (session, pmu) = session(Family::P6, 1);
        let params = SessionParams {
            samples_per_buffer: 10,
            ..p6_params(100)
        };
        session.start(Some(&params)).unwrap();

        for _ in 0..12 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }
        assert_eq!(session.handler_state(0), Some(HandlerState::Suspended));

        let mut buf = vec![0; 64 * 1024];
        assert_eq!(session.read(&mut buf).unwrap(), 10 * BASE_RECORD_LEN);
        assert_eq!(session.handler_state(0), Some(HandlerState::Armed));

        for _ in 0..5 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }

        session.stop(true).unwrap();
        let rest = read_all(&session);
        assert_eq!(rest.len(), 5);
        assert_eq!(session.stat().samples, 15);

        // suspended interrupts never reach the counter
        assert_eq!(session.event_total(0, 0, 0), 15 * 100);
    }

    #[test]
    fn shared_registers_saved_once_per_package() {
        let (session, pmu) = session(Family::Pentium4, 2);
        let escr = RegisterId(0x3b8);

        pmu.write(0, escr, 0x1234).unwrap();
        pmu.write(2, escr, 0x5678).unwrap();

        let params = SessionParams {
            events: vec![
                EventRequest::raw(0x3b8, 0x0600_020c),
                EventRequest::control(0x360, 0x0003_9000, 0x300, 1),
                EventRequest::counter(0x300, 1000),
            ],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        assert_eq!(session.shared_saves(), 2);
        assert_eq!(pmu.read(1, escr).unwrap(), 0x0600_020c);

        session.stop(false).unwrap();

        assert_eq!(pmu.read(0, escr).unwrap(), 0x1234);
        assert_eq!(pmu.read(3, escr).unwrap(), 0x5678);
    }

    #[test]
    fn zero_after_overflow_is_deferred() {
        let (session, pmu) = session(Family::Pentium4, 1);
        let params = SessionParams {
            events: vec![
                EventRequest::control(0x360, 0x0003_9000, 0x300, 1),
                EventRequest::counter(0x300, 10),
                EventRequest::control(0x361, 0x0003_9000, 0x301, 2),
                EventRequest::counter(0x301, 5),
            ],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        // lands on zero without an interrupt
        assert_eq!(pmu.advance(0, RegisterId(0x301), 5).unwrap(), (5, false));
        // the interrupt arrives one event after the wrap
        assert_eq!(pmu.advance(0, RegisterId(0x300), 11).unwrap(), (11, true));
        session.handle_overflow(0, &frame());

        assert_eq!(session.handler_stats().deferred.value(), 1);
        assert_eq!(session.stat().samples, 1);

        // forced to overflow on its next event
        assert_eq!(pmu.advance(0, RegisterId(0x301), 1).unwrap(), (1, true));
        session.handle_overflow(0, &frame());

        session.stop(true).unwrap();
        let records = read_all(&session);
        assert_eq!(
            records.iter().map(|r| r.event_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn precise_address_replaces_ip() {
        let (session, pmu) = session(Family::Pentium4, 1);
        let params = SessionParams {
            events: vec![
                EventRequest::control(0x360, 0x0003_9000, 0x300, 1)
                    .with_capture(Capture::PRECISE),
                EventRequest::counter(0x300, 10),
            ],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        session.precise_area(0).unwrap().post(0x401abc);
        overflow(&session, &pmu, 0, 0x300, 11);

        // nothing posted this time
        overflow(&session, &pmu, 0, 0x300, 11);
        assert_eq!(session.handler_stats().precise_errors.value(), 1);

        session.stop(true).unwrap();
        let records = read_all(&session);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, 0x401abc);
        assert!(records[0].precise);
        assert_eq!(records[1].ip, 0x401000);
        assert!(!records[1].precise);
    }

    #[test]
    fn address_capture_on_itanium() {
        let (session, pmu) = session(Family::Itanium, 1);
        let params = SessionParams {
            timestamp: true,
            events: vec![
                EventRequest::control(0x1004, 0x2c, 0x2004, 9).with_capture(Capture::ADDRESS),
                EventRequest::counter(0x2004, 10),
            ],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        pmu.write(0, RegisterId(0x2011), 0x4000_1236).unwrap();
        pmu.write(0, RegisterId(0x2002), 0x6000_0010).unwrap();
        pmu.write(0, RegisterId(0x2003), 17).unwrap();

        overflow(&session, &pmu, 0, 0x2004, 10);

        session.stop(true).unwrap();
        let records = read_all(&session);
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.ip, 0x4000_1230);
        assert_eq!(record.timestamp, Some(7));
        let address = record.address.unwrap();
        assert_eq!(address.instruction, 0x4000_1236);
        assert_eq!(address.data, 0x6000_0010);
        assert_eq!(address.latency, 17);
    }

    #[test]
    fn pause_skips_samples() {
        let (session, pmu) = session(Family::P6, 1);
        session.start(Some(&p6_params(100))).unwrap();

        session.pause();
        for _ in 0..3 {
            overflow(&session, &pmu, 0, 0xc1, 100);
        }
        assert_eq!(session.stat().skipped, 3);
        assert_eq!(session.stat().samples, 0);

        session.resume();
        assert!(!session.is_paused());
        overflow(&session, &pmu, 0, 0xc1, 100);
        assert_eq!(session.stat().samples, 1);

        session.stop(false).unwrap();
    }

    #[test]
    fn unknown_cpu_is_dropped() {
        let backend = select(Family::P6);
        let lvt = backend.interrupt_route().lvt;
        let topology = Topology::synthetic(1, backend.threads());
        let pmu = Arc::new(SimulatedPmu::new(backend.as_ref(), topology.len()));
        let regs = Arc::new(Recorded {
            pmu,
            writes: Mutex::new(Vec::new()),
        });
        let session = SamplingSession::new(backend, regs.clone(), topology);

        session.start(Some(&p6_params(100))).unwrap();
        session.handle_overflow(99, &frame());

        // acknowledged, not sampled
        assert!(regs.writes.lock().contains(&(99, lvt)));

        let stats = session.stat();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.anomalies, 0);
        assert_eq!(stats.samples, 0);
        session.stop(false).unwrap();
    }

    #[test]
    fn time_based_sampling() {
        let (session, _pmu) = session(Family::P6, 1);
        let params = SessionParams {
            method: Method::TIME_BASED,
            events: vec![EventRequest::timer(1000, 55)],
            ..Default::default()
        };
        session.start(Some(&params)).unwrap();

        for _ in 0..3 {
            session.handle_timer_tick(0, &frame());
        }

        session.stop(true).unwrap();
        let records = read_all(&session);
        assert_eq!(records.len(), 3);
        assert_eq!(session.config().unwrap().events.get(records[0].event_index), Some(55));
        assert_eq!(session.stat().timer_ticks, 3);
    }

    #[test]
    fn abort_cancels_start_delay() {
        let (session, _pmu) = session(Family::P6, 1);
        let params = SessionParams {
            start_delay: Some(Duration::from_secs(60)),
            ..p6_params(100)
        };

        let starter = {
            let session = session.clone();
            std::thread::spawn(move || session.start(Some(&params)))
        };

        while session.state() != SessionState::Starting {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(10));

        session.abort().unwrap();

        assert!(matches!(
            starter.join().unwrap(),
            Err(SamplingError::DeviceBusy(_))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.buffer_capacity(), 0);
    }

    #[test]
    fn max_duration_stops_session() {
        let (session, _pmu) = session(Family::P6, 1);
        let params = SessionParams {
            max_duration: Some(Duration::from_millis(20)),
            ..p6_params(100)
        };
        session.start(Some(&params)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() != SessionState::Stopped && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.status().contains(Status::DURATION_EXPIRED));
    }

    #[test]
    fn probe_failure_is_not_supported() {
        let (session, pmu) = session(Family::P6, 1);
        pmu.poison(RegisterId(0xc1));
        assert!(matches!(
            session.configure(&p6_params(100)),
            Err(SamplingError::NotSupported(_))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn start_requires_configuration() {
        let (session, _pmu) = session(Family::P6, 1);
        assert!(matches!(
            session.start(None),
            Err(SamplingError::InvalidParameter(_))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn abort_while_start_configures() {
        let session = slow_session();

        let starter = {
            let session = session.clone();
            std::thread::spawn(move || session.start(Some(&p6_params(100))))
        };

        wait_for(&session, SessionState::Configuring);
        session.abort().unwrap();

        assert!(matches!(
            starter.join().unwrap(),
            Err(SamplingError::DeviceBusy(_))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.status().contains(Status::ABORTED));
        assert!(session.config().is_none());
        assert_disarmed(&session);
    }

    #[test]
    fn abort_while_configuring() {
        let session = slow_session();

        let configurer = {
            let session = session.clone();
            std::thread::spawn(move || session.configure(&p6_params(100)))
        };

        wait_for(&session, SessionState::Configuring);
        session.abort().unwrap();

        assert!(configurer.join().unwrap().is_err());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.config().is_none());
    }

    #[test]
    fn abort_while_arming() {
        let session = slow_session();
        session.configure(&p6_params(100)).unwrap();

        let starter = {
            let session = session.clone();
            std::thread::spawn(move || session.start(None))
        };

        wait_for(&session, SessionState::Starting);
        session.abort().unwrap();

        assert!(starter.join().unwrap().is_err());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.status().contains(Status::ABORTED));
        assert_eq!(session.buffer_capacity(), 0);
        assert_disarmed(&session);
    }
}
