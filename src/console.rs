// 控制台核心
// Composition root: builds every component, owns them, and wires all subscriptions in one place

use crate::bus::{Dispatcher, PollingScheduler, RequestQueue, WriteVerifier};
use crate::config::ConsoleConfig;
use crate::control::sequencer::drive_status;
use crate::control::{ControlSequencer, ModeController, SequencerPolicy, TestMode};
use crate::devices::plc::D0_MODE;
use crate::devices::AddressMap;
use crate::drivers::ModbusTransport;
use crate::error::{ControlError, StoreError, SupervisorError};
use crate::events::{next_event, EventBus};
use crate::monitoring::DataMonitor;
use crate::storage::{PersistenceWorker, SessionRecorder, SessionStore};
use crate::supervisor::ConnectionSupervisor;
use crate::types::*;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Operator commands addressed to the control sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    ReadyCheck,
    Start,
    Stop,
    Restart,
    Interrupt,
    Exit,
}

impl std::str::FromStr for OperatorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ready" | "ready-check" => Ok(OperatorCommand::ReadyCheck),
            "start" => Ok(OperatorCommand::Start),
            "stop" => Ok(OperatorCommand::Stop),
            "restart" => Ok(OperatorCommand::Restart),
            "interrupt" => Ok(OperatorCommand::Interrupt),
            "exit" => Ok(OperatorCommand::Exit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// Test bench console
pub struct Console {
    config: ConsoleConfig,
    events: EventBus,
    map: Arc<AddressMap>,
    queue: Arc<RequestQueue>,
    poller: Arc<PollingScheduler>,
    verifier: WriteVerifier,
    supervisor: Arc<ConnectionSupervisor>,
    sequencer: Arc<Mutex<ControlSequencer>>,
    modes: Arc<Mutex<ModeController>>,
    recorder: Arc<SessionRecorder>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Console {
    /// Build the console around a transport and a session store
    ///
    /// # Arguments
    /// * `config` - Validated configuration
    /// * `transport` - Modbus link, owned by the connection supervisor
    /// * `store` - Persistence backend, moved onto the worker thread
    ///
    /// # Returns
    /// The console, or an error if the persistence worker could not start
    pub fn new(
        config: ConsoleConfig,
        transport: Arc<dyn ModbusTransport>,
        store: Box<dyn SessionStore>,
    ) -> Result<Self, StoreError> {
        let events = EventBus::new();
        let map = Arc::new(AddressMap::standard());
        let queue = Arc::new(RequestQueue::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&transport),
            events.clone(),
            &config.dispatcher,
        ));
        let poller = Arc::new(PollingScheduler::new(Arc::clone(&queue), Arc::clone(&transport), &config.polling));
        for (name, register, tier) in map.default_polling() {
            poller.add_polled_register(&name, register, tier);
        }
        let verifier = WriteVerifier::new(
            Arc::clone(&queue),
            Arc::clone(&transport),
            events.clone(),
            Arc::clone(&map),
            config.verify.clone(),
        );
        let supervisor = Arc::new(ConnectionSupervisor::new(
            transport,
            Arc::clone(&queue),
            dispatcher,
            Arc::clone(&poller),
            verifier.clone(),
            events.clone(),
            &config.connection,
        ));

        let worker = Arc::new(PersistenceWorker::start(store, events.clone())?);
        let recorder = Arc::new(SessionRecorder::new(worker).with_history_limit(config.recording.history_limit));

        let policy = SequencerPolicy {
            owns_status_registers: config.control.owns_status_registers,
            verify_timeout: config.verify.timeout(),
        };
        let sequencer = Arc::new(Mutex::new(ControlSequencer::new(
            Arc::new(verifier.clone()),
            events.clone(),
            policy,
        )));
        let modes = Arc::new(Mutex::new(ModeController::new(
            Arc::new(verifier.clone()),
            Arc::clone(&recorder),
            events.clone(),
            config.control.write_before_session_confirmed,
            config.verify.mode_timeout(),
        )));

        Ok(Self {
            config,
            events,
            map,
            queue,
            poller,
            verifier,
            supervisor,
            sequencer,
            modes,
            recorder,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the event routing tasks. Must run before `connect`.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(tokio::spawn(self.verifier.clone().run(self.events.subscribe_bus())));

        let monitor = DataMonitor::new(Arc::clone(&self.map), self.events.clone(), Arc::clone(&self.recorder));
        tasks.push(tokio::spawn(monitor.run(self.events.subscribe_bus())));

        tasks.push(tokio::spawn(drive_status(Arc::clone(&self.sequencer), self.events.subscribe_bus())));

        // sequencer -> recorder / mode controller
        let mut control_rx = self.events.subscribe_control();
        let recorder = Arc::clone(&self.recorder);
        let modes = Arc::clone(&self.modes);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = next_event(&mut control_rx).await {
                match event {
                    ControlEvent::StartRecording => recorder.set_recording(true),
                    ControlEvent::StopRecording => recorder.set_recording(false),
                    ControlEvent::StopCurrentTest => modes.lock().force_stop(),
                    ControlEvent::StateChanged(_) => {}
                }
            }
        }));

        // verification results and session ids -> mode controller
        let mut verified_rx = self.events.subscribe_verified();
        let mut store_rx = self.events.subscribe_store();
        let recorder = Arc::clone(&self.recorder);
        let modes = Arc::clone(&self.modes);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    verified = next_event(&mut verified_rx) => match verified {
                        Some(result) => modes.lock().on_write_verified(&result),
                        None => break,
                    },
                    stored = next_event(&mut store_rx) => match stored {
                        Some(StoreEvent::SessionCreated { ticket, id }) => {
                            if recorder.on_session_created(ticket, id) {
                                modes.lock().on_session_created(id);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }));

        // transport failures -> supervisor
        let mut bus_rx = self.events.subscribe_bus();
        let supervisor = Arc::clone(&self.supervisor);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = next_event(&mut bus_rx).await {
                if let BusEvent::RequestFailed { link_lost: true, message, .. } = event {
                    supervisor.drop_link(&message).await;
                }
            }
        }));

        let autosave = Duration::from_secs(self.config.recording.autosave_secs);
        tasks.push(self.recorder.spawn_autosave(autosave));
        log::debug!("Console started with {} routing tasks", tasks.len());
    }

    /// Connect to the configured controller
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        let host = self.config.connection.host.clone();
        self.connect_to(&host, self.config.connection.port).await
    }

    pub async fn connect_to(&self, host: &str, port: u16) -> Result<(), SupervisorError> {
        self.supervisor.connect(host, port).await
    }

    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    pub fn reset_connection_attempts(&self) {
        self.supervisor.reset_attempts();
    }

    pub fn start_test(&self, mode: TestMode) -> Result<(), ControlError> {
        self.modes.lock().start_test(mode)
    }

    pub fn stop_test(&self) -> bool {
        self.modes.lock().stop_test()
    }

    /// Forward an operator command to the sequencer
    ///
    /// # Returns
    /// `false` if the command is not valid in the current state
    pub fn trigger(&self, command: OperatorCommand) -> bool {
        let mut sequencer = self.sequencer.lock();
        match command {
            OperatorCommand::ReadyCheck => sequencer.trigger_ready_check(),
            OperatorCommand::Start => sequencer.trigger_start(),
            OperatorCommand::Stop => sequencer.trigger_stop(),
            OperatorCommand::Restart => sequencer.trigger_restart(),
            OperatorCommand::Interrupt => sequencer.trigger_interrupt(),
            OperatorCommand::Exit => sequencer.trigger_exit(),
        }
    }

    /// Ask the store for past sessions; the answer arrives as `StoreEvent::SessionsLoaded`
    pub fn load_sessions(
        &self,
        from: DateTime<Local>,
        to: DateTime<Local>,
        test_type: Option<String>,
    ) -> Result<(), StoreError> {
        self.recorder.worker().load_sessions(from, to, test_type)
    }

    /// Ask for stored points; the answer arrives as `StoreEvent::DataPointsLoaded`
    pub fn load_data_points(&self, session_id: i64, parameter: Option<String>) -> Result<(), StoreError> {
        self.recorder.worker().load_data_points(session_id, parameter)
    }

    pub fn status(&self) -> ConsoleStatus {
        let (control_state, flags) = {
            let sequencer = self.sequencer.lock();
            (sequencer.state(), sequencer.flags())
        };
        let test_mode = self.modes.lock().current_mode().map(TestMode::register_value);
        let session_id = self.recorder.session().map(|s| s.id).filter(|id| *id > 0);
        ConsoleStatus {
            link: self.supervisor.link_state(),
            control_state,
            ready: flags.ready,
            started: flags.started,
            stop_asserted: flags.stop_asserted,
            complete_asserted: flags.complete_asserted,
            test_mode,
            session_id,
            queued_requests: self.queue.size(),
            pending_verifications: self.verifier.pending(),
        }
    }

    pub fn control_state(&self) -> ControlState {
        self.sequencer.lock().state()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    pub fn recorder(&self) -> &Arc<SessionRecorder> {
        &self.recorder
    }

    pub fn poller(&self) -> &Arc<PollingScheduler> {
        &self.poller
    }

    pub fn verifier(&self) -> &WriteVerifier {
        &self.verifier
    }

    /// Stop routing, drop the link and flush the store.
    ///
    /// A running test is stopped first and the link is held until the mode
    /// reset has been written, bounded by the mode verification window.
    pub async fn shutdown(&self) {
        let mut bus_rx = self.events.subscribe_bus();
        let stopped = {
            let mut modes = self.modes.lock();
            modes.is_running() && modes.stop_test()
        };
        if stopped && self.supervisor.link_state() == LinkState::Connected {
            let window = self.config.verify.mode_timeout();
            match tokio::time::timeout(window, mode_reset_written(&mut bus_rx)).await {
                Ok(true) => log::info!("Mode register reset before shutdown"),
                Ok(false) => log::warn!("Mode register reset rejected by controller"),
                Err(_) => log::warn!("Mode register reset not written within {:?}", window),
            }
        }
        self.supervisor.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.recorder.finalize();
        self.recorder.worker().stop();
        log::info!("Console shut down");
    }
}

/// Wait for the next completed write to the mode register
async fn mode_reset_written(rx: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> bool {
    while let Some(event) = next_event(rx).await {
        if let BusEvent::WriteCompleted { kind, address, success, .. } = event {
            if kind == D0_MODE.kind && address == D0_MODE.address {
                return success;
            }
        }
    }
    false
}
