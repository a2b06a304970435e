use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    hresult, CallStatus, CallbackToken, Engine, EngineError, MigrationPhase, MigrationTransport, OperationHandle,
    OperationResult, SystemHandle, Verb,
};
use crate::bridge::{CallbackAdapter, CorrelationKey, NotificationType};

const SIM_OWNER: &str = "hcstool";
const SIM_PROVIDER: &str = "hcstool-sim";
const DEFAULT_LATENCY: Duration = Duration::from_millis(25);

/// Misbehavior to apply to the next call of a given verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Refuse the call synchronously with this HRESULT.
    Reject(u32),
    /// Accept the call, then complete it with `status` and one error event.
    Fail { status: u32, message: String },
    /// Accept the call and never report completion.
    Silent,
    /// Raise an unrelated notification before the terminal one.
    Preface(NotificationType),
    /// Complete with a payload that is not JSON.
    Garbage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl SimState {
    fn as_str(self) -> &'static str {
        match self {
            SimState::Created => "Created",
            SimState::Running => "Running",
            SimState::Paused => "Paused",
            SimState::Stopped => "Stopped",
        }
    }
}

#[derive(Debug, Clone)]
struct RawEvent {
    code: u32,
    status: u32,
    payload: Option<String>,
}

struct Subscriber {
    token: CallbackToken,
    events: mpsc::UnboundedSender<Vec<RawEvent>>,
    worker: JoinHandle<()>,
}

struct SimSystem {
    runtime_id: Uuid,
    system_type: &'static str,
    owner: String,
    state: SimState,
    migration: Option<MigrationPhase>,
    backlog: Vec<RawEvent>,
}

#[derive(Default)]
struct SimHost {
    systems: HashMap<String, SimSystem>,
    handles: HashMap<SystemHandle, String>,
    subscribers: HashMap<SystemHandle, Subscriber>,
    callbacks: HashMap<CallbackToken, SystemHandle>,
    faults: HashMap<&'static str, VecDeque<SimFault>>,
    grants: Vec<(String, PathBuf)>,
    next_id: usize,
}

impl SimHost {
    fn allocate(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, target: &'static str) -> Option<SimFault> {
        self.faults.get_mut(target).and_then(VecDeque::pop_front)
    }

    fn system_id(&self, handle: SystemHandle, call: &'static str) -> Result<String, EngineError> {
        self.handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| EngineError::with_message(call, hresult::INVALID_ARG, "invalid compute system handle"))
    }
}

/// An in-process compute host.
///
/// It acknowledges calls as pending and reports completion later through the
/// registered callback, on its own thread, after a fixed latency. Events raised
/// before any callback is registered are held and flushed on registration.
/// Faults can be queued per verb to exercise rejection, failure, silence and
/// malformed payloads.
#[derive(Clone)]
pub struct SimEngine {
    host: Arc<Mutex<SimHost>>,
    latency: Duration,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self::with_latency(DEFAULT_LATENCY)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            host: Arc::new(Mutex::new(SimHost::default())),
            latency,
        }
    }

    /// Queue a fault for the next call of `verb`.
    pub fn inject(&self, verb: Verb, fault: SimFault) {
        self.host.lock().faults.entry(verb.name()).or_default().push_back(fault);
    }

    /// Queue a fault for the next migration call of `phase`.
    pub fn inject_migration(&self, phase: MigrationPhase, fault: SimFault) {
        self.host.lock().faults.entry(phase.name()).or_default().push_back(fault);
    }

    /// Add a running system nobody has a handle to yet.
    pub fn seed(&self, id: &str) {
        self.host.lock().systems.insert(
            id.to_string(),
            SimSystem {
                runtime_id: Uuid::new_v4(),
                system_type: "VirtualMachine",
                owner: "external".to_string(),
                state: SimState::Running,
                migration: None,
                backlog: Vec::new(),
            },
        );
    }

    /// Raise an unsolicited notification for `id`.
    pub fn raise(&self, id: &str, kind: NotificationType, status: u32) {
        let mut host = self.host.lock();
        self.dispatch(
            &mut host,
            id,
            vec![RawEvent {
                code: kind.code(),
                status,
                payload: None,
            }],
        );
    }

    pub fn state_of(&self, id: &str) -> Option<&'static str> {
        self.host.lock().systems.get(id).map(|system| system.state.as_str())
    }

    pub fn grants(&self) -> Vec<(String, PathBuf)> {
        self.host.lock().grants.clone()
    }

    pub fn callback_count(&self) -> usize {
        self.host.lock().subscribers.len()
    }

    /// Hand `events` to every subscribed handle of `id`, or hold them until
    /// one subscribes.
    fn dispatch(&self, host: &mut SimHost, id: &str, events: Vec<RawEvent>) {
        if events.is_empty() {
            return;
        }

        let mut delivered = false;
        for (handle, system_id) in &host.handles {
            if system_id != id {
                continue;
            }
            if let Some(subscriber) = host.subscribers.get(handle) {
                delivered |= subscriber.events.send(events.clone()).is_ok();
            }
        }

        if !delivered {
            if let Some(system) = host.systems.get_mut(id) {
                system.backlog.extend(events);
            }
        }
    }

    fn completion_events(&self, kind: NotificationType, id: &str, fault: Option<&SimFault>) -> Vec<RawEvent> {
        let terminal = RawEvent {
            code: kind.code(),
            status: hresult::S_OK,
            payload: None,
        };

        match fault {
            None | Some(SimFault::Reject(_)) => vec![terminal],
            Some(SimFault::Silent) => Vec::new(),
            Some(SimFault::Preface(other)) => vec![
                RawEvent {
                    code: other.code(),
                    status: hresult::S_OK,
                    payload: None,
                },
                terminal,
            ],
            Some(SimFault::Fail { status, message }) => vec![RawEvent {
                status: *status,
                payload: Some(failure_document(*status, message, id)),
                ..terminal
            }],
            Some(SimFault::Garbage) => vec![RawEvent {
                status: hresult::FAIL,
                payload: Some("{\"Error\":".to_string()),
                ..terminal
            }],
        }
    }
}

fn failure_document(status: u32, message: &str, id: &str) -> String {
    json!({
        "Error": status as i32,
        "ErrorEvents": [{
            "EventId": 1,
            "Message": message,
            "Provider": SIM_PROVIDER,
            "Data": [{"Type": "String", "Value": id}]
        }]
    })
    .to_string()
}

fn parse_document(call: &'static str, text: &str) -> Result<Value, EngineError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text)
        .map_err(|e| EngineError::with_message(call, hresult::INVALID_JSON, format!("invalid JSON document: {}", e)))
}

fn call_name(verb: Verb) -> &'static str {
    match verb {
        Verb::Create => "HcsCreateComputeSystem",
        Verb::Start => "HcsStartComputeSystem",
        Verb::Shutdown => "HcsShutdownComputeSystem",
        Verb::Terminate => "HcsTerminateComputeSystem",
        Verb::Pause => "HcsPauseComputeSystem",
        Verb::Resume => "HcsResumeComputeSystem",
        Verb::Save => "HcsSaveComputeSystem",
        Verb::Modify => "HcsModifyComputeSystem",
    }
}

fn invalid_state(call: &'static str, state: SimState) -> EngineError {
    EngineError::with_message(
        call,
        hresult::INVALID_STATE,
        format!("operation not valid while the system is {}", state.as_str()),
    )
}

fn spawn_dispatcher(adapter: CallbackAdapter, key: CorrelationKey, latency: Duration) -> std::io::Result<Subscriber> {
    let (events, mut rx) = mpsc::unbounded_channel::<Vec<RawEvent>>();
    let worker = std::thread::Builder::new()
        .name(format!("sim-callback-{}", key))
        .spawn(move || {
            while let Some(batch) = rx.blocking_recv() {
                std::thread::sleep(latency);
                for event in batch {
                    adapter.on_event(key, event.code, event.status, event.payload.as_deref());
                }
            }
        })?;

    Ok(Subscriber {
        token: CallbackToken(0),
        events,
        worker,
    })
}

impl Engine for SimEngine {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn create_system(&self, id: &str, configuration: &str) -> Result<(SystemHandle, CallStatus), EngineError> {
        const CALL: &str = "HcsCreateComputeSystem";
        let mut host = self.host.lock();

        let fault = host.take_fault(Verb::Create.name());
        if let Some(SimFault::Reject(hr)) = fault {
            return Err(EngineError::with_message(CALL, hr, "create refused"));
        }
        if host.systems.contains_key(id) {
            return Err(EngineError::with_message(
                CALL,
                hresult::ALREADY_EXISTS,
                format!("a compute system with id {} already exists", id),
            ));
        }

        let document = parse_document(CALL, configuration)?;
        let system_type = if document.get("VirtualMachine").is_some() {
            "VirtualMachine"
        } else {
            "Container"
        };
        let owner = document
            .get("Owner")
            .and_then(Value::as_str)
            .unwrap_or(SIM_OWNER)
            .to_string();

        let failed = matches!(fault, Some(SimFault::Fail { .. }) | Some(SimFault::Garbage));
        host.systems.insert(
            id.to_string(),
            SimSystem {
                runtime_id: Uuid::new_v4(),
                system_type,
                owner,
                state: if failed { SimState::Stopped } else { SimState::Created },
                migration: None,
                backlog: Vec::new(),
            },
        );

        let handle = SystemHandle(host.allocate());
        host.handles.insert(handle, id.to_string());

        let events = self.completion_events(NotificationType::SystemCreateCompleted, id, fault.as_ref());
        self.dispatch(&mut host, id, events);

        tracing::debug!(id, ?handle, "sim: create accepted");
        Ok((handle, CallStatus::Pending))
    }

    fn open_system(&self, id: &str) -> Result<SystemHandle, EngineError> {
        let mut host = self.host.lock();
        if !host.systems.contains_key(id) {
            return Err(EngineError::with_message(
                "HcsOpenComputeSystem",
                hresult::SYSTEM_NOT_FOUND,
                format!("compute system {} does not exist", id),
            ));
        }

        let handle = SystemHandle(host.allocate());
        host.handles.insert(handle, id.to_string());
        Ok(handle)
    }

    fn close_system(&self, handle: SystemHandle) -> Result<(), EngineError> {
        let mut host = self.host.lock();
        host.system_id(handle, "HcsCloseComputeSystem")?;
        host.handles.remove(&handle);
        Ok(())
    }

    fn invoke(&self, verb: Verb, handle: SystemHandle, options: &str) -> Result<CallStatus, EngineError> {
        let call = call_name(verb);
        let mut host = self.host.lock();
        let id = host.system_id(handle, call)?;

        if verb == Verb::Create {
            return Err(EngineError::with_message(call, hresult::INVALID_ARG, "create takes a configuration, not a handle"));
        }

        let fault = host.take_fault(verb.name());
        if let Some(SimFault::Reject(hr)) = fault {
            return Err(EngineError::with_message(call, hr, format!("{} refused", verb)));
        }

        let document = parse_document(call, options)?;
        let system = host
            .systems
            .get_mut(&id)
            .ok_or_else(|| EngineError::new(call, hresult::SYSTEM_NOT_FOUND))?;

        let next = match (verb, system.state) {
            (Verb::Start, SimState::Created) => SimState::Running,
            (Verb::Pause, SimState::Running) => SimState::Paused,
            (Verb::Resume, SimState::Paused) => SimState::Running,
            (Verb::Save, SimState::Paused) => SimState::Paused,
            (Verb::Modify, state @ (SimState::Running | SimState::Paused)) => state,
            (Verb::Shutdown | Verb::Terminate, SimState::Stopped) => {
                return Err(EngineError::with_message(call, hresult::ALREADY_STOPPED, "the system is already stopped"));
            }
            (Verb::Shutdown | Verb::Terminate, _) => SimState::Stopped,
            (_, state) => return Err(invalid_state(call, state)),
        };

        let mut fault = fault;
        if verb == Verb::Save && fault.is_none() {
            let path = document.get("SaveStateFilePath").and_then(Value::as_str).unwrap_or_default();
            if path.is_empty() {
                return Err(EngineError::with_message(call, hresult::INVALID_ARG, "SaveStateFilePath is required"));
            }
            let snapshot = json!({
                "Id": id,
                "RuntimeId": system.runtime_id.to_string(),
                "SystemType": system.system_type,
            });
            if let Err(e) = std::fs::write(path, snapshot.to_string()) {
                fault = Some(SimFault::Fail {
                    status: hresult::FAIL,
                    message: format!("failed to write saved state to {}: {}", path, e),
                });
            }
        }

        if matches!(fault, None | Some(SimFault::Preface(_))) {
            system.state = next;
        }

        let events = self.completion_events(verb.terminal_notification(), &id, fault.as_ref());
        self.dispatch(&mut host, &id, events);

        tracing::debug!(id = %id, "sim: {} accepted", verb);
        Ok(CallStatus::Pending)
    }

    fn register_callback(
        &self,
        handle: SystemHandle,
        adapter: CallbackAdapter,
        key: CorrelationKey,
    ) -> Result<CallbackToken, EngineError> {
        const CALL: &str = "HcsRegisterComputeSystemCallback";
        let mut host = self.host.lock();
        let id = host.system_id(handle, CALL)?;
        if host.subscribers.contains_key(&handle) {
            return Err(EngineError::with_message(CALL, hresult::ALREADY_EXISTS, "a callback is already registered"));
        }

        let mut subscriber = spawn_dispatcher(adapter, key, self.latency)
            .map_err(|e| EngineError::with_message(CALL, hresult::FAIL, format!("failed to start callback thread: {}", e)))?;
        let token = CallbackToken(host.allocate());
        subscriber.token = token;

        let backlog = host
            .systems
            .get_mut(&id)
            .map(|system| std::mem::take(&mut system.backlog))
            .unwrap_or_default();
        if !backlog.is_empty() {
            let _ = subscriber.events.send(backlog);
        }

        host.subscribers.insert(handle, subscriber);
        host.callbacks.insert(token, handle);
        Ok(token)
    }

    fn unregister_callback(&self, token: CallbackToken) -> Result<(), EngineError> {
        let subscriber = {
            let mut host = self.host.lock();
            let handle = host.callbacks.remove(&token).ok_or_else(|| {
                EngineError::with_message("HcsUnregisterComputeSystemCallback", hresult::INVALID_ARG, "unknown callback")
            })?;
            host.subscribers.remove(&handle)
        };

        // In-flight callbacks finish before unregistering returns.
        if let Some(subscriber) = subscriber {
            debug_assert_eq!(subscriber.token, token);
            drop(subscriber.events);
            if subscriber.worker.join().is_err() {
                tracing::warn!("sim callback thread panicked");
            }
        }
        Ok(())
    }

    fn properties(&self, handle: SystemHandle, query: &str) -> Result<String, EngineError> {
        const CALL: &str = "HcsGetComputeSystemProperties";
        let host = self.host.lock();
        let id = host.system_id(handle, CALL)?;
        let system = host
            .systems
            .get(&id)
            .ok_or_else(|| EngineError::new(CALL, hresult::SYSTEM_NOT_FOUND))?;

        let query = parse_document(CALL, query)?;
        let mut responses = Map::new();
        for name in requested_properties(&query) {
            let response = match name.as_str() {
                "Basic" => json!({
                    "State": system.state.as_str(),
                    "RuntimeId": system.runtime_id.to_string(),
                    "SystemType": system.system_type,
                    "Owner": system.owner,
                }),
                "VmVersion" => json!({"Major": 12, "Minor": 0}),
                _ => continue,
            };
            responses.insert(name, json!({ "Response": response }));
        }

        Ok(json!({ "PropertyResponses": responses }).to_string())
    }

    fn enumerate_systems(&self, query: &str) -> Result<String, EngineError> {
        parse_document("HcsEnumerateComputeSystems", query)?;
        let host = self.host.lock();

        let mut ids: Vec<&String> = host.systems.keys().collect();
        ids.sort();
        let rows: Vec<Value> = ids
            .into_iter()
            .map(|id| {
                let system = &host.systems[id];
                json!({
                    "Id": id,
                    "Name": id,
                    "SystemType": system.system_type,
                    "Owner": system.owner,
                    "State": system.state.as_str(),
                    "RuntimeId": system.runtime_id.to_string(),
                })
            })
            .collect();

        Ok(Value::Array(rows).to_string())
    }

    fn service_properties(&self, query: &str) -> Result<String, EngineError> {
        let query = parse_document("HcsGetServiceProperties", query)?;
        let mut responses = Map::new();
        let requested = query
            .get("PropertyQueries")
            .and_then(Value::as_object)
            .map(|queries| queries.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        for name in requested {
            let response = match name.as_str() {
                "Basic" => json!({
                    "SupportedSchemaVersions": [
                        {"Major": 1, "Minor": 0},
                        {"Major": 2, "Minor": 1},
                        {"Major": 2, "Minor": 5}
                    ]
                }),
                "ProcessorCapabilities" => json!({
                    "ProcessorFeatures": ["Sse3", "Avx", "Avx2"],
                    "XsaveFeatures": ["Legacy", "Avx"],
                    "CacheLineFlushSize": 64,
                    "ImplementedPhysicalAddressBits": 48,
                    "MaxPhysicalAddressBits": 52,
                }),
                _ => continue,
            };
            responses.insert(name, json!({ "Response": response }));
        }

        Ok(json!({ "PropertyResponses": responses }).to_string())
    }

    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<(), EngineError> {
        if !path.is_absolute() {
            return Err(EngineError::with_message("GrantVmAccess", hresult::INVALID_ARG, "path must be absolute"));
        }
        self.host.lock().grants.push((vm_id.to_string(), path.to_path_buf()));
        Ok(())
    }

    fn begin_migration(
        &self,
        id: &str,
        phase: MigrationPhase,
        options: &str,
        transport: Option<&MigrationTransport>,
    ) -> Result<Box<dyn OperationHandle>, EngineError> {
        let call = match phase {
            MigrationPhase::Initialize => "HcsInitializeLiveMigrationOnSource",
            MigrationPhase::Start => "HcsStartLiveMigrationOnSource",
            MigrationPhase::Transfer => "HcsStartLiveMigrationTransfer",
            MigrationPhase::Finalize => "HcsFinalizeLiveMigration",
        };

        let mut host = self.host.lock();
        let fault = host.take_fault(phase.name());
        if let Some(SimFault::Reject(hr)) = fault {
            return Err(EngineError::with_message(call, hr, format!("{} refused", phase)));
        }
        parse_document(call, options)?;

        let system = host.systems.get_mut(id).ok_or_else(|| {
            EngineError::with_message(call, hresult::SYSTEM_NOT_FOUND, format!("compute system {} does not exist", id))
        })?;

        let expected = match phase {
            MigrationPhase::Initialize => None,
            MigrationPhase::Start => Some(MigrationPhase::Initialize),
            MigrationPhase::Transfer => Some(MigrationPhase::Start),
            MigrationPhase::Finalize => Some(MigrationPhase::Transfer),
        };
        if system.migration != expected || (phase == MigrationPhase::Initialize && system.state != SimState::Running) {
            return Err(invalid_state(call, system.state));
        }
        if phase.needs_transport() {
            let transport = transport
                .ok_or_else(|| EngineError::with_message(call, hresult::INVALID_ARG, "a migration transport is required"))?;
            tracing::debug!(peer = %transport.peer(), "sim: migration transport attached");
        }

        let result = match &fault {
            None | Some(SimFault::Reject(_)) | Some(SimFault::Preface(_)) => {
                system.migration = Some(phase);
                if phase == MigrationPhase::Finalize {
                    system.state = SimState::Stopped;
                    system.migration = None;
                }
                Some(OperationResult {
                    status: hresult::S_OK,
                    document: Some(json!({ "Phase": phase.name() }).to_string()),
                })
            }
            Some(SimFault::Silent) => None,
            Some(SimFault::Fail { status, message }) => Some(OperationResult {
                status: *status,
                document: Some(failure_document(*status, message, id)),
            }),
            Some(SimFault::Garbage) => Some(OperationResult {
                status: hresult::FAIL,
                document: Some("<<not json>>".to_string()),
            }),
        };

        Ok(Box::new(SimOperation {
            ready_at: Instant::now() + self.latency,
            result,
        }))
    }
}

fn requested_properties(query: &Value) -> Vec<String> {
    if let Some(queries) = query.get("Queries").and_then(Value::as_object) {
        return queries.keys().cloned().collect();
    }
    if let Some(types) = query.get("PropertyTypes").and_then(Value::as_array) {
        return types.iter().filter_map(Value::as_str).map(str::to_string).collect();
    }
    vec!["Basic".to_string()]
}

struct SimOperation {
    ready_at: Instant,
    result: Option<OperationResult>,
}

impl OperationHandle for SimOperation {
    fn wait(&mut self, timeout: Option<Duration>) -> OperationResult {
        let remaining = self.ready_at.saturating_duration_since(Instant::now());
        let timed_out = OperationResult {
            status: hresult::TIMEOUT,
            document: None,
        };

        match (&self.result, timeout) {
            (Some(_), Some(timeout)) if timeout < remaining => {
                std::thread::sleep(timeout);
                timed_out
            }
            (Some(result), _) => {
                std::thread::sleep(remaining);
                result.clone()
            }
            (None, Some(timeout)) => {
                std::thread::sleep(timeout);
                timed_out
            }
            (None, None) => loop {
                std::thread::park();
            },
        }
    }
}

#[cfg(test)]
#[path = "sim_tests.rs"]
mod sim_tests;
