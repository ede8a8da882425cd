//! Agent loop
//!
//! Startup: initial state → provision → connect → full push → current desired.
//! Then one owner loop runs {telemetry cycle, full-sync tick, sleep} until
//! cancelled. Inbound events never touch the loop's backoff state: desired
//! patches are applied one at a time in arrival order, commands each run on
//! their own task.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandRequest, CommandResponse, CommandRouter};
use crate::component::SharedRoot;
use crate::config::LoopConfig;
use crate::error::AgentError;
use crate::initial_state::{apply_version, load_initial_state, ConfigSource};
use crate::properties::{
    Backoff, Clock, DesiredPatch, PatchReconciler, PropertySynchronizer, SyncOutcome, SystemClock,
};
use crate::telemetry::TelemetryScheduler;
use crate::transport::{Connector, Inbound, Link, SharedTransport};

/// Software version reported through the root's initial state
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Agent {
    root: SharedRoot,
    telemetry: TelemetryScheduler,
    properties: PropertySynchronizer,
    run_once: bool,
}

impl Agent {
    pub fn new(root: SharedRoot, config: &LoopConfig) -> Self {
        Self::with_clock(root, config, Arc::new(SystemClock))
    }

    pub fn with_clock(root: SharedRoot, config: &LoopConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            telemetry: TelemetryScheduler::new(config.telemetry_retry()),
            properties: PropertySynchronizer::new(
                Backoff::new(config.backoff_initial(), config.backoff_cap()),
                clock,
            ),
            run_once: config.run_once,
        }
    }

    pub fn root(&self) -> &SharedRoot {
        &self.root
    }

    pub fn synchronizer(&self) -> &PropertySynchronizer {
        &self.properties
    }

    /// Apply `InitialState` and the agent version; returns the configured key count
    pub fn initialize(&self, config: &dyn ConfigSource) -> usize {
        let applied = load_initial_state(self.root.as_ref(), config);
        apply_version(self.root.as_ref(), AGENT_VERSION);
        applied
    }

    /// Run until `cancel` fires (or one iteration in run-once mode)
    ///
    /// Only provisioning and connect failures are returned; everything after
    /// connect is logged and retried on the next iteration.
    pub async fn run(&mut self, connector: &dyn Connector, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Starting twinlink agent v{}", AGENT_VERSION);
        info!("Agent: Model {}", self.root.identity());

        let identity = connector.provision().await?;
        let Link { transport, inbound } = connector.connect(&identity).await?;
        info!("Agent: Connected as {}", identity.device_id);

        let startup_version = self.startup_sync(&transport).await;

        let stop = cancel.child_token();
        let dispatcher = tokio::spawn(dispatch_inbound(
            self.root.clone(),
            transport.clone(),
            inbound,
            startup_version,
            stop.clone(),
        ));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let report = self.telemetry.run_cycle(self.root.as_ref(), transport.as_ref()).await;
            self.properties.tick(self.root.as_ref(), transport.as_ref()).await;

            if self.run_once {
                info!("Agent: Run once complete");
                break;
            }

            debug!("Agent: Sleeping {}", humantime::format_duration(report.next_delay));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(report.next_delay) => {}
            }
        }

        stop.cancel();
        if let Err(e) = dispatcher.await {
            error!("Agent: Inbound dispatcher failed: {}", e);
        }

        info!("Agent: Stopped");
        Ok(())
    }

    /// First full push, then whatever desired state is already waiting.
    /// Returns the version of the desired patch applied, if any.
    async fn startup_sync(&mut self, transport: &SharedTransport) -> Option<i64> {
        if let SyncOutcome::Failed = self.properties.tick(self.root.as_ref(), transport.as_ref()).await {
            warn!("Property: Initial report failed, will retry on the next iteration");
        }

        match transport.fetch_desired().await {
            Ok(Some(patch)) => {
                let report = PatchReconciler::reconcile(self.root.as_ref(), transport.as_ref(), &patch).await;
                debug!("Property: Startup reconcile {:?}", report);
                Some(patch.version)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Property: Unable to read desired state: {}", e);
                None
            }
        }
    }
}

async fn dispatch_inbound(
    root: SharedRoot,
    transport: SharedTransport,
    mut inbound: mpsc::Receiver<Inbound>,
    applied_version: Option<i64>,
    stop: CancellationToken,
) {
    let (patches, queue) = mpsc::unbounded_channel();
    let reconciler = tokio::spawn(reconcile_in_order(root.clone(), transport, queue, applied_version));
    let mut commands: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Agent: Inbound channel closed");
                    break;
                }
            },
        };

        match event {
            Inbound::Desired(patch) => {
                if patches.send(patch).is_err() {
                    error!("Agent: Patch reconciler is gone");
                    break;
                }
            }
            Inbound::Command(request, reply) => {
                commands.retain(|task| !task.is_finished());
                commands.push(tokio::spawn(handle_command(root.clone(), request, reply)));
            }
        }
    }

    // closing the queue lets the reconciler finish what is already queued
    drop(patches);
    for result in join_all(commands).await {
        if let Err(e) = result {
            error!("Agent: Command handler failed: {}", e);
        }
    }
    if let Err(e) = reconciler.await {
        error!("Agent: Patch reconciler failed: {}", e);
    }
}

/// Apply queued patches one after another; a patch older than the last
/// applied one would roll properties back and is dropped
async fn reconcile_in_order(
    root: SharedRoot,
    transport: SharedTransport,
    mut queue: mpsc::UnboundedReceiver<DesiredPatch>,
    mut applied_version: Option<i64>,
) {
    while let Some(patch) = queue.recv().await {
        if let Some(applied) = applied_version.filter(|applied| patch.version < *applied) {
            warn!("Property: Ignoring desired v{}, already at v{}", patch.version, applied);
            continue;
        }
        applied_version = Some(patch.version);
        PatchReconciler::reconcile(root.as_ref(), transport.as_ref(), &patch).await;
    }
}

async fn handle_command(root: SharedRoot, request: CommandRequest, reply: oneshot::Sender<CommandResponse>) {
    let response = CommandRouter::handle(root.as_ref(), &request);
    if reply.send(response).is_err() {
        warn!(command = %request.name, "Command: Caller went away before {} completed", request.name);
    }
}
