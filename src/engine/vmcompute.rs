//! Bindings to the platform compute service.
//!
//! Verbs on a compute system go through `vmcompute.dll`, which completes them
//! through a registered notification callback. Live migration is only offered
//! by `computecore.dll`, which completes calls through operation handles.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::io::AsRawSocket;
use std::path::Path;
use std::ptr;
use std::time::Duration;
use widestring::{U16CStr, U16CString};
use windows_sys::Win32::Foundation::LocalFree;
use windows_sys::Win32::System::Com::CoTaskMemFree;

use super::{
    hresult, CallStatus, CallbackToken, Engine, EngineError, MigrationPhase, MigrationTransport, OperationHandle,
    OperationResult, SystemHandle, Verb,
};
use crate::bridge::{CallbackAdapter, CorrelationKey};

type Handle = *mut c_void;
type NotificationCallback = unsafe extern "system" fn(u32, *mut c_void, i32, *const u16);

const GENERIC_ALL: u32 = 0x1000_0000;
const INFINITE: u32 = u32::MAX;

#[allow(clashing_extern_declarations)]
mod sys {
    use super::{Handle, NotificationCallback};
    use std::ffi::c_void;

    #[link(name = "vmcompute", kind = "raw-dylib")]
    extern "system" {
        pub fn HcsEnumerateComputeSystems(query: *const u16, systems: *mut *mut u16, result: *mut *mut u16) -> i32;
        pub fn HcsCreateComputeSystem(
            id: *const u16,
            configuration: *const u16,
            identity: Handle,
            system: *mut Handle,
            result: *mut *mut u16,
        ) -> i32;
        pub fn HcsOpenComputeSystem(id: *const u16, system: *mut Handle, result: *mut *mut u16) -> i32;
        pub fn HcsCloseComputeSystem(system: Handle) -> i32;
        pub fn HcsStartComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsShutdownComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsTerminateComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsPauseComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsResumeComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsSaveComputeSystem(system: Handle, options: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsModifyComputeSystem(system: Handle, configuration: *const u16, result: *mut *mut u16) -> i32;
        pub fn HcsGetComputeSystemProperties(
            system: Handle,
            query: *const u16,
            properties: *mut *mut u16,
            result: *mut *mut u16,
        ) -> i32;
        pub fn HcsGetServiceProperties(query: *const u16, properties: *mut *mut u16, result: *mut *mut u16) -> i32;
        pub fn HcsRegisterComputeSystemCallback(
            system: Handle,
            callback: NotificationCallback,
            context: *mut c_void,
            callback_handle: *mut Handle,
        ) -> i32;
        pub fn HcsUnregisterComputeSystemCallback(callback_handle: Handle) -> i32;
        pub fn GrantVmAccess(vm_id: *const u16, path: *const u16) -> i32;
    }

    pub mod computecore {
        use super::Handle;
        use std::ffi::c_void;

        #[link(name = "computecore", kind = "raw-dylib")]
        extern "system" {
            pub fn HcsCreateOperation(context: *const c_void, callback: *const c_void) -> Handle;
            pub fn HcsCloseOperation(operation: Handle);
            pub fn HcsWaitForOperationResult(operation: Handle, timeout_ms: u32, result: *mut *mut u16) -> i32;
            pub fn HcsOpenComputeSystem(id: *const u16, access: u32, system: *mut Handle) -> i32;
            pub fn HcsCloseComputeSystem(system: Handle);
            pub fn HcsInitializeLiveMigrationOnSource(system: Handle, operation: Handle, options: *const u16) -> i32;
            pub fn HcsStartLiveMigrationOnSource(
                system: Handle,
                operation: Handle,
                socket: Handle,
                options: *const u16,
            ) -> i32;
            pub fn HcsStartLiveMigrationTransfer(system: Handle, operation: Handle, options: *const u16) -> i32;
            pub fn HcsFinalizeLiveMigration(system: Handle, operation: Handle, options: *const u16) -> i32;
        }
    }
}

fn wide(call: &'static str, value: &str) -> Result<U16CString, EngineError> {
    U16CString::from_str(value)
        .map_err(|_| EngineError::with_message(call, hresult::INVALID_ARG, "argument contains an interior NUL"))
}

/// Copy out and free a string allocated by vmcompute.
unsafe fn take_co_task_string(p: *mut u16) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let text = U16CStr::from_ptr_str(p).to_string_lossy();
    CoTaskMemFree(p as *const c_void);
    Some(text)
}

/// Copy out and free a string allocated by computecore.
unsafe fn take_local_string(p: *mut u16) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let text = U16CStr::from_ptr_str(p).to_string_lossy();
    LocalFree(p as *mut c_void);
    Some(text)
}

/// Classify a vmcompute HRESULT, consuming its result document.
unsafe fn check(call: &'static str, hr: i32, result: *mut u16) -> Result<CallStatus, EngineError> {
    let document = take_co_task_string(result);
    match hr as u32 {
        hresult::S_OK => Ok(CallStatus::Completed),
        hresult::OPERATION_PENDING => Ok(CallStatus::Pending),
        code => Err(EngineError::with_result(call, code, document.as_deref())),
    }
}

struct CallbackContext {
    adapter: CallbackAdapter,
    key: CorrelationKey,
}

unsafe extern "system" fn on_notification(code: u32, context: *mut c_void, status: i32, data: *const u16) {
    if context.is_null() {
        return;
    }
    let context = &*(context as *const CallbackContext);
    let payload = if data.is_null() {
        None
    } else {
        Some(U16CStr::from_ptr_str(data).to_string_lossy())
    };

    // Unwinding into the engine is undefined behavior.
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        context
            .adapter
            .on_event(context.key, code, status as u32, payload.as_deref());
    }));
}

struct Registration {
    callback_handle: usize,
    context: usize,
}

/// Engine backed by the Windows host compute service.
pub struct VmcomputeEngine {
    callbacks: Mutex<HashMap<CallbackToken, Registration>>,
}

impl Default for VmcomputeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl VmcomputeEngine {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

impl Engine for VmcomputeEngine {
    fn name(&self) -> &'static str {
        "vmcompute"
    }

    fn create_system(&self, id: &str, configuration: &str) -> Result<(SystemHandle, CallStatus), EngineError> {
        const CALL: &str = "HcsCreateComputeSystem";
        let id = wide(CALL, id)?;
        let configuration = wide(CALL, configuration)?;
        let mut system: Handle = ptr::null_mut();
        let mut result: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::HcsCreateComputeSystem(
                id.as_ptr(),
                configuration.as_ptr(),
                ptr::null_mut(),
                &mut system,
                &mut result,
            );
            let status = check(CALL, hr, result)?;
            Ok((SystemHandle(system as usize), status))
        }
    }

    fn open_system(&self, id: &str) -> Result<SystemHandle, EngineError> {
        const CALL: &str = "HcsOpenComputeSystem";
        let id = wide(CALL, id)?;
        let mut system: Handle = ptr::null_mut();
        let mut result: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::HcsOpenComputeSystem(id.as_ptr(), &mut system, &mut result);
            check(CALL, hr, result)?;
        }
        Ok(SystemHandle(system as usize))
    }

    fn close_system(&self, handle: SystemHandle) -> Result<(), EngineError> {
        unsafe {
            check("HcsCloseComputeSystem", sys::HcsCloseComputeSystem(handle.0 as Handle), ptr::null_mut())?;
        }
        Ok(())
    }

    fn invoke(&self, verb: Verb, handle: SystemHandle, options: &str) -> Result<CallStatus, EngineError> {
        type VerbFn = unsafe extern "system" fn(Handle, *const u16, *mut *mut u16) -> i32;
        let (call, function): (&'static str, VerbFn) = match verb {
            Verb::Start => ("HcsStartComputeSystem", sys::HcsStartComputeSystem),
            Verb::Shutdown => ("HcsShutdownComputeSystem", sys::HcsShutdownComputeSystem),
            Verb::Terminate => ("HcsTerminateComputeSystem", sys::HcsTerminateComputeSystem),
            Verb::Pause => ("HcsPauseComputeSystem", sys::HcsPauseComputeSystem),
            Verb::Resume => ("HcsResumeComputeSystem", sys::HcsResumeComputeSystem),
            Verb::Save => ("HcsSaveComputeSystem", sys::HcsSaveComputeSystem),
            Verb::Modify => ("HcsModifyComputeSystem", sys::HcsModifyComputeSystem),
            Verb::Create => {
                return Err(EngineError::with_message(
                    "HcsCreateComputeSystem",
                    hresult::INVALID_ARG,
                    "create takes a configuration, not a handle",
                ))
            }
        };

        let options = wide(call, options)?;
        let mut result: *mut u16 = ptr::null_mut();
        unsafe {
            let hr = function(handle.0 as Handle, options.as_ptr(), &mut result);
            check(call, hr, result)
        }
    }

    fn register_callback(
        &self,
        handle: SystemHandle,
        adapter: CallbackAdapter,
        key: CorrelationKey,
    ) -> Result<CallbackToken, EngineError> {
        let context = Box::into_raw(Box::new(CallbackContext { adapter, key }));
        let mut callback_handle: Handle = ptr::null_mut();

        let hr = unsafe {
            sys::HcsRegisterComputeSystemCallback(
                handle.0 as Handle,
                on_notification,
                context as *mut c_void,
                &mut callback_handle,
            )
        };
        if hr != 0 {
            // SAFETY: the engine refused the registration and never saw the context.
            drop(unsafe { Box::from_raw(context) });
            return Err(EngineError::new("HcsRegisterComputeSystemCallback", hr as u32));
        }

        let token = CallbackToken(callback_handle as usize);
        self.callbacks.lock().insert(
            token,
            Registration {
                callback_handle: callback_handle as usize,
                context: context as usize,
            },
        );
        Ok(token)
    }

    fn unregister_callback(&self, token: CallbackToken) -> Result<(), EngineError> {
        const CALL: &str = "HcsUnregisterComputeSystemCallback";
        let registration = self
            .callbacks
            .lock()
            .remove(&token)
            .ok_or_else(|| EngineError::with_message(CALL, hresult::INVALID_ARG, "unknown callback"))?;

        let hr = unsafe { sys::HcsUnregisterComputeSystemCallback(registration.callback_handle as Handle) };
        if hr != 0 {
            // The engine may still call back; the context has to stay alive.
            self.callbacks.lock().insert(token, registration);
            return Err(EngineError::new(CALL, hr as u32));
        }

        // SAFETY: unregistering waits for in-flight callbacks to return.
        drop(unsafe { Box::from_raw(registration.context as *mut CallbackContext) });
        Ok(())
    }

    fn properties(&self, handle: SystemHandle, query: &str) -> Result<String, EngineError> {
        const CALL: &str = "HcsGetComputeSystemProperties";
        let query = wide(CALL, query)?;
        let mut properties: *mut u16 = ptr::null_mut();
        let mut result: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::HcsGetComputeSystemProperties(handle.0 as Handle, query.as_ptr(), &mut properties, &mut result);
            let properties = take_co_task_string(properties);
            check(CALL, hr, result)?;
            Ok(properties.unwrap_or_default())
        }
    }

    fn enumerate_systems(&self, query: &str) -> Result<String, EngineError> {
        const CALL: &str = "HcsEnumerateComputeSystems";
        let query = wide(CALL, query)?;
        let mut systems: *mut u16 = ptr::null_mut();
        let mut result: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::HcsEnumerateComputeSystems(query.as_ptr(), &mut systems, &mut result);
            let systems = take_co_task_string(systems);
            check(CALL, hr, result)?;
            Ok(systems.unwrap_or_else(|| "[]".to_string()))
        }
    }

    fn service_properties(&self, query: &str) -> Result<String, EngineError> {
        const CALL: &str = "HcsGetServiceProperties";
        let query = wide(CALL, query)?;
        let mut properties: *mut u16 = ptr::null_mut();
        let mut result: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::HcsGetServiceProperties(query.as_ptr(), &mut properties, &mut result);
            let properties = take_co_task_string(properties);
            check(CALL, hr, result)?;
            Ok(properties.unwrap_or_default())
        }
    }

    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<(), EngineError> {
        const CALL: &str = "GrantVmAccess";
        let vm_id = wide(CALL, vm_id)?;
        let path = U16CString::from_os_str(path.as_os_str())
            .map_err(|_| EngineError::with_message(CALL, hresult::INVALID_ARG, "path contains an interior NUL"))?;

        let hr = unsafe { sys::GrantVmAccess(vm_id.as_ptr(), path.as_ptr()) };
        if hr != 0 {
            return Err(EngineError::new(CALL, hr as u32));
        }
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
        let socket = match (phase.needs_transport(), transport) {
            (true, None) => {
                return Err(EngineError::with_message(call, hresult::INVALID_ARG, "a migration transport is required"))
            }
            (_, transport) => transport.map(|t| t.stream().as_raw_socket() as usize as Handle),
        };

        let id = wide(call, id)?;
        let options = wide(call, options)?;

        unsafe {
            let mut system: Handle = ptr::null_mut();
            let hr = sys::computecore::HcsOpenComputeSystem(id.as_ptr(), GENERIC_ALL, &mut system);
            if hr != 0 {
                return Err(EngineError::new("HcsOpenComputeSystem", hr as u32));
            }

            let operation = sys::computecore::HcsCreateOperation(ptr::null(), ptr::null());
            if operation.is_null() {
                sys::computecore::HcsCloseComputeSystem(system);
                return Err(EngineError::new("HcsCreateOperation", hresult::FAIL));
            }

            let hr = match phase {
                MigrationPhase::Initialize => {
                    sys::computecore::HcsInitializeLiveMigrationOnSource(system, operation, options.as_ptr())
                }
                MigrationPhase::Start => sys::computecore::HcsStartLiveMigrationOnSource(
                    system,
                    operation,
                    socket.unwrap_or(ptr::null_mut()),
                    options.as_ptr(),
                ),
                MigrationPhase::Transfer => {
                    sys::computecore::HcsStartLiveMigrationTransfer(system, operation, options.as_ptr())
                }
                MigrationPhase::Finalize => {
                    sys::computecore::HcsFinalizeLiveMigration(system, operation, options.as_ptr())
                }
            };

            let pending = ComputeOperation {
                operation: operation as usize,
                system: system as usize,
            };
            if hr != 0 {
                return Err(EngineError::new(call, hr as u32));
            }
            Ok(Box::new(pending))
        }
    }
}

/// A computecore operation and the system handle it was issued on.
struct ComputeOperation {
    operation: usize,
    system: usize,
}

impl OperationHandle for ComputeOperation {
    fn wait(&mut self, timeout: Option<Duration>) -> OperationResult {
        let timeout_ms = match timeout {
            Some(timeout) => u32::try_from(timeout.as_millis()).unwrap_or(INFINITE - 1),
            None => INFINITE,
        };
        let mut document: *mut u16 = ptr::null_mut();

        unsafe {
            let hr = sys::computecore::HcsWaitForOperationResult(self.operation as Handle, timeout_ms, &mut document);
            OperationResult {
                status: hr as u32,
                document: take_local_string(document),
            }
        }
    }
}

impl Drop for ComputeOperation {
    fn drop(&mut self) {
        unsafe {
            sys::computecore::HcsCloseOperation(self.operation as Handle);
            sys::computecore::HcsCloseComputeSystem(self.system as Handle);
        }
    }
}
