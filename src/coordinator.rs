//! Update Coordinator - the orchestrating state machine and public facade.
//!
//! Owns the check timer, decides when to check, when to resume a prior
//! download, and when to hand a verified package to the installer. All state
//! transitions happen on a single driver task; the network check and the
//! file transfer run as independent tasks that report back over a channel,
//! so only one check or one download is ever outstanding at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::checker::{CheckOutcome, VersionChecker};
use crate::config::UpdaterConfig;
use crate::downloader::{CancelHandle, DownloadResult, PackageDownloader};
use crate::event_bus::{UpdateEvent, UpdateEventBus};
use crate::installer::InstallInvoker;
use crate::markers::{DownloadMarker, InstallMarker, MarkerKind, MarkerStore, remove_partial_file};
use crate::types::{UpdateQuery, UpdaterState};
use crate::version::Version;

enum Command {
    StopChecking,
}

enum TaskOutcome {
    Check(CheckOutcome),
    Download(DownloadResult),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    Check,
    Download,
}

/// Public facade for the background update service.
///
/// Owned by the application's top-level context; construct it, call
/// [`start_checking`](Self::start_checking), subscribe to
/// [`events`](Self::events), and call [`stop_checking`](Self::stop_checking)
/// on shutdown.
pub struct UpdateCoordinator {
    events: UpdateEventBus,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    state_rx: watch::Receiver<UpdaterState>,
    cancel: CancelHandle,
    driver: Option<Driver>,
    task: Option<JoinHandle<()>>,
}

impl UpdateCoordinator {
    /// Build a coordinator from configuration and the running binary's
    /// version.
    ///
    /// Resolves the data and download directories (creating them if
    /// missing), loads or creates the per-install id, and wires up the
    /// checker, downloader, and installer. Nothing runs until
    /// [`start_checking`](Self::start_checking).
    pub fn new(config: UpdaterConfig, running_version: Version) -> Result<Self> {
        let data_dir = config.resolve_data_dir()?;
        let download_dir = config.resolve_download_dir()?;
        let install_id = crate::config::load_or_create_install_id(&data_dir)?;

        let markers = MarkerStore::new(&data_dir);
        let checker = VersionChecker::new(&config.check_url)?;
        let downloader = Arc::new(PackageDownloader::new(
            markers.clone(),
            download_dir,
            config.bandwidth_limit_kibps,
        )?);
        let invoker = InstallInvoker::new(&config.install_command, config.install_args.clone());
        let query = config.query(running_version, &install_id);

        let events = UpdateEventBus::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(UpdaterState::Initial);
        let cancel = downloader.cancel_handle();

        let driver = Driver {
            check_period: Duration::from_secs(config.check_period_secs),
            auto_install: config.auto_install,
            running_version,
            query,
            checker,
            downloader,
            markers,
            invoker,
            events: events.clone(),
            state_tx,
            state: UpdaterState::Initial,
            pending: Pending::Idle,
        };

        Ok(Self {
            events,
            command_tx,
            command_rx: Some(command_rx),
            state_rx,
            cancel,
            driver: Some(driver),
            task: None,
        })
    }

    /// Event bus the coordinator publishes lifecycle notifications to
    pub fn events(&self) -> &UpdateEventBus {
        &self.events
    }

    /// Current state machine value
    pub fn state(&self) -> UpdaterState {
        *self.state_rx.borrow()
    }

    /// Watch channel mirroring every state transition
    pub fn state_watch(&self) -> watch::Receiver<UpdaterState> {
        self.state_rx.clone()
    }

    /// Start the background service: recover any marker state left by a
    /// previous run, then begin the periodic check cycle.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is an
    /// error.
    pub fn start_checking(&mut self) -> Result<()> {
        let driver = self
            .driver
            .take()
            .ok_or_else(|| anyhow!("update coordinator already started"))?;
        let command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| anyhow!("update coordinator already started"))?;

        log::info!(
            "[UpdateCoordinator] Starting (version {}, channel {})",
            driver.running_version,
            driver.query.channel
        );
        self.task = Some(tokio::spawn(driver.run(command_rx)));
        Ok(())
    }

    /// Stop the service: cancels any in-flight download, stops the timer,
    /// and forces `Terminal`. Markers are left on disk so the next startup
    /// can recover.
    pub fn stop_checking(&self) {
        self.cancel.cancel();
        let _ = self.command_tx.send(Command::StopChecking);
    }

    /// Stop and wait for the driver task to finish
    pub async fn shutdown(mut self) {
        self.stop_checking();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct Driver {
    check_period: Duration,
    auto_install: bool,
    running_version: Version,
    query: UpdateQuery,
    checker: VersionChecker,
    downloader: Arc<PackageDownloader>,
    markers: MarkerStore,
    invoker: InstallInvoker,
    events: UpdateEventBus,
    state_tx: watch::Sender<UpdaterState>,
    state: UpdaterState,
    pending: Pending,
}

impl Driver {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel();

        let mut next_check = self.startup(&task_tx);

        while self.state != UpdaterState::Terminal {
            let deadline = next_check.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let timer_armed = self.pending == Pending::Idle && next_check.is_some();

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(Command::StopChecking) | None => {
                            log::info!("[UpdateCoordinator] Stop requested");
                            self.set_state(UpdaterState::Terminal);
                        }
                    }
                }
                Some(outcome) = task_rx.recv() => {
                    self.pending = Pending::Idle;
                    next_check = match outcome {
                        TaskOutcome::Check(outcome) => self.on_check_outcome(outcome, &task_tx),
                        TaskOutcome::Download(result) => self.on_download_result(result),
                    };
                }
                _ = tokio::time::sleep_until(deadline), if timer_armed => {
                    next_check = None;
                    self.begin_check(&task_tx);
                }
            }
        }

        log::info!("[UpdateCoordinator] Driver finished");
    }

    /// Startup recovery: a valid install marker wins, then a resumable
    /// download marker, otherwise schedule an immediate check. Stale markers
    /// (written by a different binary version) are silently discarded.
    fn startup(&mut self, task_tx: &mpsc::UnboundedSender<TaskOutcome>) -> Option<Instant> {
        if let Some(marker) = self.markers.read_install() {
            if marker.current_version == self.running_version.to_string() {
                self.finish_with_install(&marker);
                return None;
            }
            log::info!(
                "[UpdateCoordinator] Discarding stale install marker from version {}",
                marker.current_version
            );
            remove_partial_file(&marker.path);
            if let Err(err) = self.markers.delete(MarkerKind::Install) {
                log::warn!("[UpdateCoordinator] Failed to delete marker: {:#}", err);
            }
            self.downloader.sweep_stale_packages(None);
        }

        if let Some(marker) = self.markers.read_download() {
            if marker.current_version == self.running_version.to_string() {
                self.begin_resume(marker, task_tx);
                return None;
            }
            log::info!(
                "[UpdateCoordinator] Discarding stale download marker from version {}",
                marker.current_version
            );
            remove_partial_file(&marker.path);
            if let Err(err) = self.markers.delete(MarkerKind::Download) {
                log::warn!("[UpdateCoordinator] Failed to delete marker: {:#}", err);
            }
            self.downloader.sweep_stale_packages(None);
        }

        self.set_state(UpdaterState::CheckingForUpdate);
        Some(Instant::now())
    }

    fn set_state(&mut self, state: UpdaterState) {
        if self.state == state {
            return;
        }
        log::debug!("[UpdateCoordinator] {} -> {}", self.state, state);
        self.state = state;
        let _ = self.state_tx.send(state);
        self.events.publish(UpdateEvent::StateChange { state });
    }

    fn begin_check(&mut self, task_tx: &mpsc::UnboundedSender<TaskOutcome>) {
        self.set_state(UpdaterState::CheckingForUpdate);
        self.pending = Pending::Check;

        let checker = self.checker.clone();
        let query = self.query.clone();
        let task_tx = task_tx.clone();
        tokio::spawn(async move {
            let outcome = checker.check(&query).await;
            let _ = task_tx.send(TaskOutcome::Check(outcome));
        });
    }

    fn begin_resume(
        &mut self,
        marker: DownloadMarker,
        task_tx: &mpsc::UnboundedSender<TaskOutcome>,
    ) {
        self.events.publish(UpdateEvent::DownloadResume {
            channel: marker.update_channel.clone(),
            version: marker.update_version.clone(),
        });
        self.set_state(UpdaterState::Downloading);
        self.pending = Pending::Download;

        let downloader = self.downloader.clone();
        let task_tx = task_tx.clone();
        tokio::spawn(async move {
            let result = downloader.resume(&marker).await;
            let _ = task_tx.send(TaskOutcome::Download(result));
        });
    }

    fn on_check_outcome(
        &mut self,
        outcome: CheckOutcome,
        task_tx: &mpsc::UnboundedSender<TaskOutcome>,
    ) -> Option<Instant> {
        match outcome {
            CheckOutcome::NoUpdate => {
                self.set_state(UpdaterState::UpToDate);
                self.events.publish(UpdateEvent::CheckComplete {
                    update_available: false,
                    channel: self.query.channel.clone(),
                    version: String::new(),
                    required: false,
                    info_url: String::new(),
                });
                Some(Instant::now() + self.check_period)
            }
            CheckOutcome::Available(descriptor) => {
                self.set_state(UpdaterState::UpdateAvailable);
                self.events.publish(UpdateEvent::CheckComplete {
                    update_available: true,
                    channel: descriptor.channel.clone(),
                    version: descriptor.version.clone(),
                    required: descriptor.required,
                    info_url: descriptor.more_info.clone(),
                });

                self.set_state(UpdaterState::Downloading);
                self.pending = Pending::Download;
                let downloader = self.downloader.clone();
                let running_version = self.running_version;
                let task_tx = task_tx.clone();
                tokio::spawn(async move {
                    let result = downloader.download(&descriptor, running_version).await;
                    let _ = task_tx.send(TaskOutcome::Download(result));
                });
                None
            }
            CheckOutcome::Error(message) => {
                self.set_state(UpdaterState::TemporaryError);
                self.events.publish(UpdateEvent::CheckError { message });
                Some(Instant::now() + self.check_period)
            }
        }
    }

    fn on_download_result(&mut self, result: DownloadResult) -> Option<Instant> {
        match result {
            DownloadResult::Complete(marker) => {
                self.events.publish(UpdateEvent::DownloadComplete {
                    channel: marker.update_channel.clone(),
                    version: marker.update_version.clone(),
                    required: marker.required,
                    info_url: marker.more_info.clone(),
                });
                self.finish_with_install(&marker);
                None
            }
            DownloadResult::Cancelled => {
                // Only reached via stop_checking; the stop command drives
                // the state to Terminal
                None
            }
            DownloadResult::Failed { message, resumable } => {
                log::error!(
                    "[UpdateCoordinator] Download failed ({}): {}",
                    if resumable { "resumable" } else { "fatal" },
                    message
                );
                self.set_state(UpdaterState::Failure);
                self.events.publish(UpdateEvent::DownloadError { message });
                Some(Instant::now() + self.check_period)
            }
        }
    }

    /// Terminal hand-off for a verified package: invoke the installer when
    /// auto-install is on, otherwise leave the marker for the next startup
    fn finish_with_install(&mut self, marker: &InstallMarker) {
        if self.auto_install {
            self.set_state(UpdaterState::Installing);
            match self.install(marker) {
                Ok(()) => {}
                Err(err) => {
                    log::error!("[UpdateCoordinator] Install failed: {:#}", err);
                    self.events.publish(UpdateEvent::InstallError {
                        message: format!("{:#}", err),
                        required: marker.required,
                    });
                }
            }
            // The attempt is committed either way; never retry automatically
            if let Err(err) = self.markers.delete(MarkerKind::Install) {
                log::warn!("[UpdateCoordinator] Failed to delete install marker: {:#}", err);
            }
        } else {
            log::info!(
                "[UpdateCoordinator] Package {} ready to install at {:?}",
                marker.update_version,
                marker.path
            );
        }
        self.set_state(UpdaterState::Terminal);
    }

    fn install(&self, marker: &InstallMarker) -> Result<()> {
        self.invoker
            .invoke(&marker.path, marker.required)
            .context("installer launch failed")
    }
}
