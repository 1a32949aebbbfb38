//! Synthetic workload for the `record` command.
//!
//! Each simulated logical CPU gets a driver thread that pushes events
//! through the [`SimulatedPmu`] and delivers the interrupts it raises, with
//! made-up interrupt frames, until the session stops. A consumer streams
//! the records into the output file.

use crate::backend::sim::SimulatedPmu;
use crate::backend::{select, RegisterFile, RegisterId};
use crate::config::Config;
use crate::device::Device;
use crate::error::SamplingError;
use crate::output::{FileHeader, OutputError};
use crate::params::Capture;
use crate::registers::SessionConfig;
use crate::sample::InterruptFrame;
use crate::session::{SamplingSession, SessionState, SessionStats};
use crate::topology::{LogicalCpu, Topology};
use crate::{debug, info, warn};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Distance between the sampled instruction and the instruction pointer
/// the interrupt frame reports.
const SKID: u64 = 4;

/// Build a session on simulated registers for `config`. `detected` supplies
/// the family and package count the config leaves open.
pub fn simulate(config: &Config, detected: Option<&Topology>) -> Result<(Device, Arc<SimulatedPmu>), SamplingError> {
    let family = config
        .family(detected.and_then(|t| t.family()))
        .ok_or_else(|| {
            SamplingError::unsupported("no supported processor family detected, set [hardware] family")
        })?;

    let backend = select(family);

    let packages = config
        .topology()
        .packages()
        .or(detected.map(|t| t.packages()))
        .unwrap_or(1);

    let topology = Topology::synthetic(packages, backend.threads());

    debug!(
        "simulating {family}: {} packages, {} logical cpus",
        topology.packages(),
        topology.len()
    );

    let pmu = Arc::new(SimulatedPmu::new(backend.as_ref(), topology.len()));
    let session = SamplingSession::new(backend, pmu.clone(), topology);

    Ok((Device::new(session), pmu))
}

/// One counter a driver feeds events to.
#[derive(Debug, Clone, Copy)]
struct Feed {
    counter: RegisterId,
    events: u64,
    capture: Capture,
}

struct Plan {
    /// Per hardware thread.
    feeds: Vec<Vec<Feed>>,
    tick: Duration,
    timer: Option<Duration>,
    processes: u32,
    ip_base: u64,
    ip_span: u64,
    started: Instant,
}

impl Plan {
    fn new(config: &Config, session: &SessionConfig) -> Self {
        let workload = config.workload();

        let feeds = session
            .tables
            .sets()
            .iter()
            .map(|set| {
                set.counters()
                    .map(|counter| {
                        let weight = config
                            .events()
                            .iter()
                            .find(|e| {
                                e.counter == counter.id.0 && e.thread as usize == set.thread()
                            })
                            .map(|e| e.weight)
                            .unwrap_or(1);

                        Feed {
                            counter: counter.id,
                            events: workload.events_per_tick().saturating_mul(weight),
                            capture: counter.capture,
                        }
                    })
                    .collect()
            })
            .collect();

        Self {
            feeds,
            tick: workload.tick(),
            timer: session.timer.as_ref().map(|t| t.interval),
            processes: workload.processes(),
            ip_base: workload.ip_base(),
            ip_span: workload.ip_span(),
            started: Instant::now(),
        }
    }

    fn feeds(&self, thread: usize) -> &[Feed] {
        if self.feeds.is_empty() {
            return &[];
        }
        &self.feeds[thread % self.feeds.len()]
    }

    /// The instruction that caused sample `seq` and the frame the
    /// interrupt reports for it.
    fn frame(&self, seq: u64) -> (u64, InterruptFrame) {
        let ip = self.ip_base + (seq.wrapping_mul(0x9e37_79b9) % self.ip_span & !0x3);
        let pid = 1000 + (seq % self.processes as u64) as u32;

        let frame = InterruptFrame {
            ip: ip + SKID,
            flags: 0x246,
            cs: 0x33,
            pid,
            tid: pid,
            timestamp: self.started.elapsed().as_nanos() as u64,
        };

        (ip, frame)
    }
}

struct Driver {
    cpu: LogicalCpu,
    session: Arc<SamplingSession>,
    pmu: Arc<SimulatedPmu>,
    plan: Arc<Plan>,
    seq: u64,
}

impl Driver {
    fn run(&mut self) {
        let mut next_timer = self.plan.timer.map(|t| Instant::now() + t);

        let plan = self.plan.clone();

        while self.session.state() == SessionState::Running {
            for feed in plan.feeds(self.cpu.thread) {
                if let Err(e) = self.count(*feed) {
                    warn!("cpu {}: {e}", self.cpu.id);
                    return;
                }
            }

            if let (Some(next), Some(interval)) = (next_timer.as_mut(), plan.timer) {
                while Instant::now() >= *next {
                    self.seq += 1;
                    let (_, frame) = plan.frame(self.seq);
                    self.session.handle_timer_tick(self.cpu.id, &frame);
                    *next += interval;
                }
            }

            std::thread::sleep(plan.tick);
        }
    }

    /// Push one tick's worth of events into `feed.counter`, delivering an
    /// interrupt for every overflow.
    fn count(&mut self, feed: Feed) -> Result<(), crate::backend::RegisterFault> {
        let mut remaining = feed.events;

        while remaining > 0 {
            let (used, raised) = self.pmu.advance(self.cpu.id, feed.counter, remaining)?;
            remaining -= used;

            if raised {
                self.seq += 1;
                let (ip, frame) = self.plan.frame(self.seq);
                self.post_extensions(feed.capture, ip)?;
                self.session.handle_overflow(self.cpu.id, &frame);
            }
        }

        Ok(())
    }

    /// Leave what the hardware would have recorded for the sampled
    /// instruction where the handler looks for it.
    fn post_extensions(&self, capture: Capture, ip: u64) -> Result<(), crate::backend::RegisterFault> {
        let cpu = self.cpu.id;
        let backend = self.session.backend();

        if capture.contains(Capture::PRECISE) {
            if let Some(area) = self.session.precise_area(cpu) {
                area.post(ip);
            }
        }

        if capture.contains(Capture::ADDRESS) {
            if let Some(regs) = backend.address_registers() {
                self.pmu.write(cpu, regs.instruction, ip | (self.seq % 3))?;
                self.pmu
                    .write(cpu, regs.data, 0x6000_0000 + self.seq.wrapping_mul(64) % 0x10_0000)?;
                self.pmu.write(cpu, regs.latency, 4 + self.seq % 60)?;
            }
        }

        if capture.contains(Capture::BRANCH) {
            for (i, (from, to)) in backend.branch_registers().iter().enumerate() {
                let i = i as u64;
                self.pmu.write(cpu, *from, ip.saturating_sub(0x40 * (i + 1)))?;
                self.pmu.write(cpu, *to, ip.saturating_sub(0x40 * i + 0x20))?;
            }
        }

        Ok(())
    }
}

/// Copy records out of the session until it is stopped and drained.
fn consume<W: Write>(session: &SamplingSession, writer: &mut W, buffer_len: usize) -> Result<u64, OutputError> {
    let mut buf = vec![0u8; buffer_len];
    let mut bytes = 0u64;

    loop {
        let len = session.read(&mut buf)?;
        if len == 0 {
            break;
        }
        writer.write_all(&buf[..len])?;
        bytes += len as u64;
    }

    writer.flush()?;

    Ok(bytes)
}

/// Run a recording session end to end and return its final statistics.
pub fn record(device: &Device, pmu: Arc<SimulatedPmu>, config: &Config) -> Result<SessionStats, OutputError> {
    let session = device.session().clone();

    device.configure(&config.params().encode())?;

    let session_config = session
        .config()
        .ok_or_else(|| SamplingError::invalid("session has no configuration"))?;

    let output = config.general().output();
    let mut writer = BufWriter::new(File::create(&output)?);

    FileHeader::new(session.backend().family(), &session_config).write_to(&mut writer)?;

    device.start(&[])?;

    info!(
        "recording {} events on {} cpus to {}",
        session_config.events.len(),
        session.topology().len(),
        output.display()
    );

    let plan = Arc::new(Plan::new(config, &session_config));

    let cores = if config.workload().pin() {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    };

    let pending = Arc::new(AtomicUsize::new(session.topology().len()));
    let mut drivers = Vec::new();

    for cpu in session.topology().cpus().iter().copied() {
        let core = (!cores.is_empty()).then(|| cores[cpu.id % cores.len()]);
        let pending = pending.clone();

        let mut driver = Driver {
            cpu,
            session: session.clone(),
            pmu: pmu.clone(),
            plan: plan.clone(),
            seq: (cpu.id as u64) << 32,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("ebs-cpu{}", cpu.id))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        warn!("failed to pin driver thread for cpu: {}", cpu.id);
                    }
                }

                pending.fetch_sub(1, Ordering::Relaxed);

                driver.run();
            });

        match spawned {
            Ok(handle) => drivers.push(handle),
            Err(e) => {
                let _ = session.abort();
                return Err(e.into());
            }
        }
    }

    while pending.load(Ordering::Relaxed) > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    debug!("all driver threads launched");

    let buffer_len = session_config.buffer_len().max(session_config.record_len());
    let consumed = consume(&session, &mut writer, buffer_len);

    if consumed.is_err() {
        let _ = session.abort();
    }

    for driver in drivers {
        if driver.join().is_err() {
            warn!("driver thread panicked");
        }
    }

    let bytes = consumed?;
    let stats = session.stat();

    info!(
        "recorded {} samples ({bytes} bytes) in {}",
        bytes / session_config.record_len() as u64,
        humantime::format_duration(Duration::from_micros(stats.duration_us))
    );

    Ok(stats)
}
