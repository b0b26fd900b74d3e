// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery engine.
//!
//! A single actor task owns all sweep progression: port sweeps report back
//! through its command queue, and it alone runs the merge and delivers
//! events. The authoritative topology sits behind a lock so handles can
//! read snapshots without a round trip.
//!
//! ```ignore
//! let engine = DiscoveryEngine::start(EngineConfig::default(), transport)?;
//! let handle = engine.handle();
//! handle.add_port(point).await?;
//! handle.register_for_unit_events(|event: &DiscoveryEvent, _: &mut Option<EventContext>| {
//!     println!("{}", event);
//!     Verdict::Accept
//! }).await?;
//! let report = handle.run_sweep().await?;
//! engine.stop().await?;
//! ```

use crate::config::EngineConfig;
use crate::error::DiscoveryError;
use crate::model::{AttachmentPoint, PortGuid};
use crate::notify::{Audience, EventClasses, EventSink, Notifier, RegistrationHandle};
use crate::pipeline::{PortSweep, SweepContext};
use crate::pool::{PoolStats, Pools};
use crate::scheduler::{SchedulerState, SweepScheduler};
use crate::topology::{ChangeCounts, ProvisionalTopology, Topology};
use crate::transport::FabricTransport;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Local port state change reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Up,
    Down,
    /// Subnet manager changed or reprogrammed the fabric
    SmChange,
}

/// Summary of one completed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub generation: u64,
    pub ports_swept: usize,
    /// Authoritative topology after the merge
    pub units: usize,
    pub controllers: usize,
    pub paths: usize,
    pub changes: ChangeCounts,
    /// Events produced by the merge
    pub events: usize,
    /// Sink calls made delivering them
    pub delivered: usize,
    pub elapsed_ms: u64,
}

/// Engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub sweeps_completed: u64,
    pub generation: u64,
    pub ports: usize,
    pub subscribers: usize,
    pub scheduler: SchedulerState,
    pub last_report: Option<SweepReport>,
    pub pools: Vec<PoolStats>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    AddPort(AttachmentPoint, Reply<()>),
    RemovePort(PortGuid, Reply<Result<(), DiscoveryError>>),
    PortEvent(PortGuid, PortEvent),
    Rescan,
    RunSweep(Reply<SweepReport>),
    Register {
        classes: EventClasses,
        sink: Box<dyn EventSink>,
        reply: Reply<RegistrationHandle>,
    },
    Deregister(RegistrationHandle, Reply<Result<(), DiscoveryError>>),
    Stats(Reply<EngineStats>),
    PortSweepDone {
        port: PortGuid,
        generation: u64,
        topology: ProvisionalTopology,
    },
    Shutdown,
}

struct PortState {
    point: AttachmentPoint,
    sweep: Option<AbortHandle>,
}

/// Actor state. Only the actor task touches it.
struct EngineCore {
    config: EngineConfig,
    ctx: SweepContext,
    topology: Arc<RwLock<Topology>>,
    notifier: Notifier,
    scheduler: SweepScheduler,
    ports: BTreeMap<PortGuid, PortState>,
    commands: mpsc::WeakUnboundedSender<Command>,
    generation_tx: watch::Sender<u64>,
    generation: u64,
    outstanding: usize,
    ports_swept: usize,
    sweep_started: Instant,
    provisional: ProvisionalTopology,
    waiters: Vec<Reply<SweepReport>>,
    sweeps_completed: u64,
    last_report: Option<SweepReport>,
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Discovery engine '{}' started", self.config.name);
        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = wait_until(deadline) => self.on_timer(),
            }
        }
        self.shutdown();
        info!("Discovery engine '{}' stopped", self.config.name);
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::AddPort(point, reply) => {
                let port = point.port_guid;
                match self.ports.get_mut(&port) {
                    Some(state) => state.point = point,
                    None => {
                        info!("Attachment point {} added", point);
                        self.ports.insert(port, PortState { point, sweep: None });
                    }
                }
                self.scheduler.on_trigger(now);
                let _ = reply.send(());
            }
            Command::RemovePort(port, reply) => {
                let result = match self.ports.remove(&port) {
                    Some(state) => {
                        if let Some(sweep) = state.sweep {
                            debug!("Port {}: cancelling in-flight sweep", port);
                            sweep.abort();
                        }
                        info!("Attachment point {} removed", state.point);
                        self.scheduler.on_trigger(now);
                        Ok(())
                    }
                    None => Err(DiscoveryError::UnknownPort(port)),
                };
                let _ = reply.send(result);
            }
            Command::PortEvent(port, event) => {
                if self.ports.contains_key(&port) {
                    debug!("Port {}: {:?}", port, event);
                    self.scheduler.on_trigger(now);
                } else {
                    warn!("Port event {:?} for unknown port {}", event, port);
                }
            }
            Command::Rescan => self.scheduler.on_rescan_request(now),
            Command::RunSweep(reply) => {
                self.waiters.push(reply);
                if self.scheduler.state() != SchedulerState::SweepRunning {
                    self.scheduler.force(now);
                    self.start_sweep();
                }
            }
            Command::Register {
                classes,
                sink,
                reply,
            } => {
                let handle = self.notifier.register(classes, sink);
                let events = self.topology.read().snapshot_events();
                let delivered = self.notifier.deliver(&events, Audience::One(handle));
                debug!("{}: replayed {} events", handle, delivered);
                let _ = reply.send(handle);
            }
            Command::Deregister(handle, reply) => {
                let _ = reply.send(self.notifier.deregister(handle));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::PortSweepDone {
                port,
                generation,
                topology,
            } => self.on_port_sweep_done(port, generation, topology),
            Command::Shutdown => {}
        }
    }

    fn on_timer(&mut self) {
        if self.scheduler.is_due(Instant::now()) {
            self.start_sweep();
        }
    }

    fn start_sweep(&mut self) {
        debug_assert_eq!(self.outstanding, 0, "sweep started with port sweeps outstanding");
        self.scheduler.begin_sweep();
        self.generation += 1;
        self.ports_swept = 0;
        self.sweep_started = Instant::now();
        info!(
            "Sweep {} started on {} attachment points",
            self.generation,
            self.ports.len()
        );

        let points: Vec<AttachmentPoint> = self.ports.values().map(|s| s.point).collect();
        for point in points {
            self.spawn_port_sweep(point);
        }
        if self.outstanding == 0 {
            self.finish_sweep();
        }
    }

    fn spawn_port_sweep(&mut self, point: AttachmentPoint) {
        let port = point.port_guid;
        let generation = self.generation;
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let Some(state) = self.ports.get_mut(&port) else {
            return;
        };
        debug_assert!(state.sweep.is_none(), "two sweeps on port {}", port);

        let sweep = PortSweep::new(self.ctx.clone(), point, generation);
        let task: JoinHandle<ProvisionalTopology> = tokio::spawn(sweep.run());
        state.sweep = Some(task.abort_handle());
        self.outstanding += 1;

        // Reports back even when the sweep is cancelled
        tokio::spawn(async move {
            let topology = match task.await {
                Ok(topology) => topology,
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!("Port {}: sweep task failed: {}", port, e);
                    }
                    ProvisionalTopology::default()
                }
            };
            let _ = commands.send(Command::PortSweepDone {
                port,
                generation,
                topology,
            });
        });
    }

    fn on_port_sweep_done(
        &mut self,
        port: PortGuid,
        generation: u64,
        topology: ProvisionalTopology,
    ) {
        let pools = self.ctx.pools.clone();
        if generation != self.generation || self.outstanding == 0 {
            warn!("Port {}: stale result for sweep {}", port, generation);
            topology.release(&pools);
            return;
        }
        self.outstanding -= 1;

        match self.ports.get_mut(&port) {
            Some(state) => {
                state.sweep = None;
                self.ports_swept += 1;
                debug!("Port {}: contributed {} units", port, topology.len());
                self.provisional.absorb(&pools, topology);
            }
            None => {
                debug!("Port {}: removed during sweep, result discarded", port);
                topology.release(&pools);
            }
        }

        if self.outstanding == 0 {
            self.finish_sweep();
        }
    }

    fn finish_sweep(&mut self) {
        debug_assert_eq!(self.outstanding, 0, "merge with port sweeps outstanding");
        let provisional = std::mem::take(&mut self.provisional);
        let missed_limit = self.config.sweep.missed_sweeps_before_removal;

        let (outcome, units, controllers, paths) = {
            let mut topology = self.topology.write();
            let outcome = topology.merge(provisional, &self.ctx.pools, missed_limit);
            (
                outcome,
                topology.len(),
                topology.controller_count(),
                topology.path_count(),
            )
        };
        let delivered = self.notifier.deliver(&outcome.events, Audience::All);

        let report = SweepReport {
            generation: self.generation,
            ports_swept: self.ports_swept,
            units,
            controllers,
            paths,
            changes: outcome.counts,
            events: outcome.events.len(),
            delivered,
            elapsed_ms: self.sweep_started.elapsed().as_millis() as u64,
        };
        info!(
            "Sweep {} complete: {} units, {} controllers ({} events, {} delivered)",
            report.generation, report.units, report.controllers, report.events, report.delivered
        );

        self.sweeps_completed += 1;
        self.last_report = Some(report.clone());
        self.generation_tx.send_replace(self.generation);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(report.clone());
        }
        self.scheduler.on_sweep_complete(Instant::now());
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            name: self.config.name.clone(),
            sweeps_completed: self.sweeps_completed,
            generation: self.generation,
            ports: self.ports.len(),
            subscribers: self.notifier.len(),
            scheduler: self.scheduler.state(),
            last_report: self.last_report.clone(),
            pools: self.ctx.pools.stats(),
        }
    }

    fn shutdown(&mut self) {
        for state in self.ports.values_mut() {
            if let Some(sweep) = state.sweep.take() {
                sweep.abort();
            }
        }
        self.scheduler.cancel();
        self.waiters.clear();
        std::mem::take(&mut self.provisional).release(&self.ctx.pools);
        self.topology.write().clear(&self.ctx.pools);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    topology: Arc<RwLock<Topology>>,
    generation: watch::Receiver<u64>,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<(), DiscoveryError> {
        self.commands
            .send(command)
            .map_err(|_| DiscoveryError::NotRunning)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DiscoveryError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| DiscoveryError::NotRunning)
    }

    /// Add (or update) an attachment point. Counts as a port-up trigger.
    pub async fn add_port(&self, point: AttachmentPoint) -> Result<(), DiscoveryError> {
        self.request(|reply| Command::AddPort(point, reply)).await
    }

    /// Remove an attachment point, cancelling its in-flight sweep.
    pub async fn remove_port(&self, port: PortGuid) -> Result<(), DiscoveryError> {
        self.request(|reply| Command::RemovePort(port, reply)).await?
    }

    pub fn port_event(&self, port: PortGuid, event: PortEvent) -> Result<(), DiscoveryError> {
        self.send(Command::PortEvent(port, event))
    }

    /// On-demand coalesced rescan.
    pub fn request_rescan(&self) -> Result<(), DiscoveryError> {
        self.send(Command::Rescan)
    }

    /// Sweep now and wait for the result. Joins a sweep already running.
    pub async fn run_sweep(&self) -> Result<SweepReport, DiscoveryError> {
        self.request(Command::RunSweep).await
    }

    /// Subscribe to `classes`. The current topology is replayed to the
    /// sink before this returns.
    pub async fn register<S>(
        &self,
        classes: EventClasses,
        sink: S,
    ) -> Result<RegistrationHandle, DiscoveryError>
    where
        S: EventSink + 'static,
    {
        let sink: Box<dyn EventSink> = Box::new(sink);
        self.request(|reply| Command::Register {
            classes,
            sink,
            reply,
        })
        .await
    }

    pub async fn register_for_unit_events<S>(
        &self,
        sink: S,
    ) -> Result<RegistrationHandle, DiscoveryError>
    where
        S: EventSink + 'static,
    {
        self.register(EventClasses::UNITS, sink).await
    }

    pub async fn register_for_controller_events<S>(
        &self,
        sink: S,
    ) -> Result<RegistrationHandle, DiscoveryError>
    where
        S: EventSink + 'static,
    {
        self.register(EventClasses::CONTROLLERS | EventClasses::PATHS, sink)
            .await
    }

    pub async fn deregister(&self, handle: RegistrationHandle) -> Result<(), DiscoveryError> {
        self.request(|reply| Command::Deregister(handle, reply)).await?
    }

    /// Copy of the authoritative topology.
    pub fn snapshot(&self) -> Topology {
        self.topology.read().clone()
    }

    /// Watch the generation of the last completed sweep.
    pub fn sweep_generation(&self) -> watch::Receiver<u64> {
        self.generation.clone()
    }

    pub async fn stats(&self) -> Result<EngineStats, DiscoveryError> {
        self.request(Command::Stats).await
    }
}

/// A running discovery engine.
pub struct DiscoveryEngine {
    handle: EngineHandle,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Validate `config` and spawn the engine on the current runtime.
    pub fn start(
        config: EngineConfig,
        transport: Arc<dyn FabricTransport>,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::Task(e.to_string()))?;

        let pools = Arc::new(Pools::new(&config.pool));
        let topology = Arc::new(RwLock::new(Topology::new()));
        let (commands, rx) = mpsc::unbounded_channel();
        let (generation_tx, generation) = watch::channel(0);

        let core = EngineCore {
            ctx: SweepContext::new(&config, transport, pools),
            scheduler: SweepScheduler::new(&config.sweep, Instant::now()),
            config,
            topology: topology.clone(),
            notifier: Notifier::new(),
            ports: BTreeMap::new(),
            commands: commands.downgrade(),
            generation_tx,
            generation: 0,
            outstanding: 0,
            ports_swept: 0,
            sweep_started: Instant::now(),
            provisional: ProvisionalTopology::default(),
            waiters: Vec::new(),
            sweeps_completed: 0,
            last_report: None,
        };
        let task = runtime.spawn(core.run(rx));

        Ok(Self {
            handle: EngineHandle {
                commands,
                topology,
                generation,
            },
            task: Some(task),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Cancel in-flight sweeps and wait for the engine task to exit.
    pub async fn stop(mut self) -> Result<(), DiscoveryError> {
        let _ = self.handle.send(Command::Shutdown);
        match self.task.take() {
            Some(task) => task.await.map_err(|e| DiscoveryError::Task(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.handle.send(Command::Shutdown);
        }
    }
}
