//! Windows AppContainer-backed sandbox.
//!
//! The profile is acquired once per session: created when missing, with
//! `ERROR_ALREADY_EXISTS` treated as "derive the SID and proceed". Each
//! execution packs the configured capability SIDs into a
//! `SECURITY_CAPABILITIES` attribute list, wires anonymous pipes for
//! capture, and creates the child with `EXTENDED_STARTUPINFO_PRESENT`
//! inside a kill-on-close job object so a timeout can take down the whole
//! process tree.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use warden_protocol::CommandResult;
use warden_protocol::SandboxKind;

use crate::config::Config;
use crate::error::Result;
use crate::error::WardenErr;
use crate::sandbox::SandboxProvider;
use crate::sandbox::capabilities::resolve_capabilities;

// On non-Windows targets only the constructor and the stubbed trait methods
// are reachable; the session fields exist for the Windows implementation.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) struct AppContainerProvider {
    profile_name: String,
    capability_sids: Vec<String>,
    timeout: Duration,
    allowed_dirs: Vec<PathBuf>,
    #[cfg(windows)]
    session: Option<std::sync::Arc<imp::ProfileSession>>,
    #[cfg(not(windows))]
    session: Option<()>,
}

impl AppContainerProvider {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            profile_name: config.sandbox.container_name.clone(),
            capability_sids: resolve_capabilities(&config.sandbox.capabilities)?,
            timeout: config.command.timeout(),
            allowed_dirs: Vec::new(),
            session: None,
        })
    }
}

#[async_trait]
impl SandboxProvider for AppContainerProvider {
    fn kind(&self) -> SandboxKind {
        SandboxKind::AppContainer
    }

    fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    #[cfg(windows)]
    async fn initialize(&mut self, allowed_dirs: &[PathBuf]) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        for dir in allowed_dirs {
            if !dir.is_dir() {
                return Err(WardenErr::Configuration(format!(
                    "allowed directory '{}' does not exist",
                    dir.display()
                )));
            }
        }

        // Acquire the profile first; if granting any directory fails the
        // session handle is dropped and the SID freed before we return.
        let session = std::sync::Arc::new(imp::ProfileSession::acquire(&self.profile_name)?);
        super::windows_acl::grant_directories(session.sid_ptr(), allowed_dirs)?;

        self.allowed_dirs = allowed_dirs.to_vec();
        self.session = Some(session);
        Ok(())
    }

    #[cfg(not(windows))]
    async fn initialize(&mut self, _allowed_dirs: &[PathBuf]) -> Result<()> {
        Err(WardenErr::Configuration(
            "AppContainer sandboxing is only available on Windows".to_string(),
        ))
    }

    async fn execute(
        &self,
        exe: &str,
        args: &[String],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(exe.to_string());
        command.extend(args.iter().cloned());
        self.run(command, cwd, cancel).await
    }

    async fn execute_shell(
        &self,
        command: &str,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        self.run(
            vec![
                "cmd.exe".to_string(),
                "/C".to_string(),
                command.to_string(),
            ],
            cwd,
            cancel,
        )
        .await
    }

    async fn dispose(&mut self) -> Result<()> {
        // The profile and the granted ACEs persist deliberately: grants are
        // idempotent and removal races concurrent sessions with the same
        // profile name. `delete_profile` is the operator's cleanup path.
        self.session = None;
        self.allowed_dirs.clear();
        Ok(())
    }
}

impl AppContainerProvider {
    #[cfg(windows)]
    async fn run(
        &self,
        command: Vec<String>,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let Some(session) = self.session.clone() else {
            return Err(WardenErr::State(
                "sandbox session is not initialized".to_string(),
            ));
        };

        let capability_sids = self.capability_sids.clone();
        let timeout = self.timeout;
        let cwd = cwd.map(Path::to_path_buf);
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            imp::execute_in_container(&session, &capability_sids, &command, cwd.as_deref(), timeout, &cancel)
        })
        .await
        .map_err(|err| WardenErr::Sandbox(format!("sandbox worker panicked: {err}")))?
    }

    #[cfg(not(windows))]
    async fn run(
        &self,
        _command: Vec<String>,
        _cwd: Option<&Path>,
        _cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        Err(WardenErr::Configuration(
            "AppContainer sandboxing is only available on Windows".to_string(),
        ))
    }
}

/// Remove the AppContainer profile from the OS registry. Granted directory
/// ACEs are left in place; deleting those is the operator's call.
#[cfg(windows)]
pub fn delete_profile(name: &str) -> Result<()> {
    imp::delete_profile(name)
}

#[cfg(not(windows))]
pub fn delete_profile(_name: &str) -> Result<()> {
    Err(WardenErr::Configuration(
        "AppContainer sandboxing is only available on Windows".to_string(),
    ))
}

#[cfg(windows)]
mod imp {
    use super::*;
    use crate::sandbox::exec::MAX_CAPTURED_BYTES;
    use std::ffi::OsStr;
    use std::ffi::c_void;
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr::null_mut;
    use std::time::Instant;
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::Foundation::ERROR_ALREADY_EXISTS;
    use windows::Win32::Foundation::GetLastError;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Foundation::HANDLE_FLAG_INHERIT;
    use windows::Win32::Foundation::HANDLE_FLAGS;
    use windows::Win32::Foundation::HLOCAL;
    use windows::Win32::Foundation::SetHandleInformation;
    use windows::Win32::Foundation::LocalFree;
    use windows::Win32::Foundation::WAIT_OBJECT_0;
    use windows::Win32::Foundation::WAIT_TIMEOUT;
    use windows::Win32::Foundation::WIN32_ERROR;
    use windows::Win32::Security::Authorization::ConvertStringSidToSidW;
    use windows::Win32::Security::FreeSid;
    use windows::Win32::Security::Isolation::CreateAppContainerProfile;
    use windows::Win32::Security::Isolation::DeleteAppContainerProfile;
    use windows::Win32::Security::Isolation::DeriveAppContainerSidFromAppContainerName;
    use windows::Win32::Security::PSID;
    use windows::Win32::Security::SECURITY_ATTRIBUTES;
    use windows::Win32::Security::SECURITY_CAPABILITIES;
    use windows::Win32::Security::SE_GROUP_ENABLED;
    use windows::Win32::Security::SID_AND_ATTRIBUTES;
    use windows::Win32::System::JobObjects::AssignProcessToJobObject;
    use windows::Win32::System::JobObjects::CreateJobObjectW;
    use windows::Win32::System::JobObjects::JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    use windows::Win32::System::JobObjects::JOBOBJECT_BASIC_LIMIT_INFORMATION;
    use windows::Win32::System::JobObjects::JOBOBJECT_EXTENDED_LIMIT_INFORMATION;
    use windows::Win32::System::JobObjects::JobObjectExtendedLimitInformation;
    use windows::Win32::System::JobObjects::SetInformationJobObject;
    use windows::Win32::System::JobObjects::TerminateJobObject;
    use windows::Win32::System::Memory::GetProcessHeap;
    use windows::Win32::System::Memory::HEAP_FLAGS;
    use windows::Win32::System::Memory::HEAP_ZERO_MEMORY;
    use windows::Win32::System::Memory::HeapAlloc;
    use windows::Win32::System::Memory::HeapFree;
    use windows::Win32::System::Pipes::CreatePipe;
    use windows::Win32::Storage::FileSystem::ReadFile;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;
    use windows::Win32::System::Threading::CREATE_UNICODE_ENVIRONMENT;
    use windows::Win32::System::Threading::CreateProcessW;
    use windows::Win32::System::Threading::DeleteProcThreadAttributeList;
    use windows::Win32::System::Threading::EXTENDED_STARTUPINFO_PRESENT;
    use windows::Win32::System::Threading::GetExitCodeProcess;
    use windows::Win32::System::Threading::InitializeProcThreadAttributeList;
    use windows::Win32::System::Threading::LPPROC_THREAD_ATTRIBUTE_LIST;
    use windows::Win32::System::Threading::PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES;
    use windows::Win32::System::Threading::PROCESS_INFORMATION;
    use windows::Win32::System::Threading::STARTF_USESTDHANDLES;
    use windows::Win32::System::Threading::STARTUPINFOEXW;
    use windows::Win32::System::Threading::UpdateProcThreadAttribute;
    use windows::Win32::System::Threading::WaitForSingleObject;
    use windows::core::PCWSTR;
    use windows::core::PWSTR;

    const PROFILE_DESCRIPTION: &str = "Warden agent sandbox profile";
    const WAIT_SLICE_MS: u32 = 100;

    fn to_wide<S: AsRef<OsStr>>(s: S) -> Vec<u16> {
        s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
    }

    fn os_err(api: &'static str, err: windows::core::Error) -> WardenErr {
        WardenErr::os(api, io::Error::from_raw_os_error(err.code().0))
    }

    /// Owned AppContainer SID, freed with the OS-provided deallocator.
    pub(super) struct SidHandle {
        ptr: PSID,
    }

    // The SID is immutable memory owned by this handle; freeing happens
    // exactly once in Drop.
    unsafe impl Send for SidHandle {}
    unsafe impl Sync for SidHandle {}

    impl SidHandle {
        fn sid(&self) -> PSID {
            self.ptr
        }
    }

    impl Drop for SidHandle {
        fn drop(&mut self) {
            unsafe {
                if !self.ptr.is_invalid() {
                    FreeSid(self.ptr);
                }
            }
        }
    }

    /// One acquired AppContainer profile: the name plus its derived SID.
    pub(super) struct ProfileSession {
        sid: SidHandle,
    }

    impl ProfileSession {
        pub(super) fn acquire(name: &str) -> Result<Self> {
            ensure_profile(name)?;
            let sid = derive_sid(name)?;
            Ok(Self { sid })
        }

        pub(super) fn sid_ptr(&self) -> PSID {
            self.sid.sid()
        }
    }

    fn ensure_profile(name: &str) -> Result<()> {
        let name_w = to_wide(name);
        let desc_w = to_wide(PROFILE_DESCRIPTION);
        unsafe {
            match CreateAppContainerProfile(
                PCWSTR(name_w.as_ptr()),
                PCWSTR(name_w.as_ptr()),
                PCWSTR(desc_w.as_ptr()),
                None,
            ) {
                Ok(profile_sid) => {
                    if !profile_sid.is_invalid() {
                        FreeSid(profile_sid);
                    }
                    Ok(())
                }
                Err(error) => {
                    if GetLastError() == WIN32_ERROR::from(ERROR_ALREADY_EXISTS) {
                        Ok(())
                    } else {
                        Err(os_err("CreateAppContainerProfile", error))
                    }
                }
            }
        }
    }

    fn derive_sid(name: &str) -> Result<SidHandle> {
        let name_w = to_wide(name);
        unsafe {
            let sid = DeriveAppContainerSidFromAppContainerName(PCWSTR(name_w.as_ptr()))
                .map_err(|e| os_err("DeriveAppContainerSidFromAppContainerName", e))?;
            Ok(SidHandle { ptr: sid })
        }
    }

    pub(super) fn delete_profile(name: &str) -> Result<()> {
        let name_w = to_wide(name);
        unsafe {
            DeleteAppContainerProfile(PCWSTR(name_w.as_ptr()))
                .map_err(|e| os_err("DeleteAppContainerProfile", e))
        }
    }

    /// Capability SID converted from its string form; freed with LocalFree.
    struct CapabilitySid {
        sid: PSID,
    }

    impl CapabilitySid {
        fn from_string(value: &str) -> Result<Self> {
            let wide = to_wide(value);
            unsafe {
                let mut sid_ptr = PSID::default();
                ConvertStringSidToSidW(PCWSTR(wide.as_ptr()), &mut sid_ptr)
                    .map_err(|e| os_err("ConvertStringSidToSidW", e))?;
                Ok(Self { sid: sid_ptr })
            }
        }

        fn sid_and_attributes(&self) -> SID_AND_ATTRIBUTES {
            SID_AND_ATTRIBUTES {
                Sid: self.sid,
                Attributes: SE_GROUP_ENABLED,
            }
        }
    }

    impl Drop for CapabilitySid {
        fn drop(&mut self) {
            unsafe {
                if !self.sid.is_invalid() {
                    let _ = LocalFree(HLOCAL(self.sid.0));
                }
            }
        }
    }

    /// Extended process-thread attribute list holding one security
    /// capabilities entry. The buffer, the list, and the packed capability
    /// array all live exactly as long as this guard.
    struct AttributeList<'a> {
        heap: HANDLE,
        buffer: *mut c_void,
        list: LPPROC_THREAD_ATTRIBUTE_LIST,
        #[allow(dead_code)]
        sec_caps: SECURITY_CAPABILITIES,
        #[allow(dead_code)]
        sid_and_attributes: Vec<SID_AND_ATTRIBUTES>,
        #[allow(dead_code)]
        capabilities: &'a [CapabilitySid],
    }

    impl<'a> AttributeList<'a> {
        fn new(container_sid: PSID, capabilities: &'a [CapabilitySid]) -> Result<Self> {
            unsafe {
                let mut list_size = 0usize;
                let _ = InitializeProcThreadAttributeList(
                    LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                    1,
                    0,
                    &mut list_size,
                );
                let heap = GetProcessHeap().map_err(|e| os_err("GetProcessHeap", e))?;
                let buffer = HeapAlloc(heap, HEAP_ZERO_MEMORY, list_size);
                if buffer.is_null() {
                    return Err(WardenErr::os("HeapAlloc", io::Error::last_os_error()));
                }
                let list = LPPROC_THREAD_ATTRIBUTE_LIST(buffer);
                if let Err(error) = InitializeProcThreadAttributeList(list, 1, 0, &mut list_size) {
                    let _ = HeapFree(heap, HEAP_FLAGS(0), Some(buffer));
                    return Err(os_err("InitializeProcThreadAttributeList", error));
                }

                let mut sid_and_attributes: Vec<SID_AND_ATTRIBUTES> = capabilities
                    .iter()
                    .map(CapabilitySid::sid_and_attributes)
                    .collect();

                let mut sec_caps = SECURITY_CAPABILITIES {
                    AppContainerSid: container_sid,
                    Capabilities: if sid_and_attributes.is_empty() {
                        null_mut()
                    } else {
                        sid_and_attributes.as_mut_ptr()
                    },
                    CapabilityCount: sid_and_attributes.len() as u32,
                    Reserved: 0,
                };

                if let Err(error) = UpdateProcThreadAttribute(
                    list,
                    0,
                    PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES as usize,
                    Some(&mut sec_caps as *mut _ as *const c_void),
                    std::mem::size_of::<SECURITY_CAPABILITIES>(),
                    None,
                    None,
                ) {
                    DeleteProcThreadAttributeList(list);
                    let _ = HeapFree(heap, HEAP_FLAGS(0), Some(buffer));
                    return Err(os_err("UpdateProcThreadAttribute", error));
                }

                Ok(Self {
                    heap,
                    buffer,
                    list,
                    sec_caps,
                    sid_and_attributes,
                    capabilities,
                })
            }
        }

        fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
            self.list
        }
    }

    impl Drop for AttributeList<'_> {
        fn drop(&mut self) {
            unsafe {
                if !self.list.is_invalid() {
                    DeleteProcThreadAttributeList(self.list);
                }
                if !self.heap.is_invalid() && !self.buffer.is_null() {
                    let _ = HeapFree(self.heap, HEAP_FLAGS(0), Some(self.buffer));
                }
            }
        }
    }

    /// Closes the wrapped handle on every exit path.
    struct HandleGuard(HANDLE);

    // Raw handles are plain kernel object references; ownership is unique
    // and closing happens exactly once in Drop.
    unsafe impl Send for HandleGuard {}

    impl Drop for HandleGuard {
        fn drop(&mut self) {
            unsafe {
                if !self.0.is_invalid() {
                    let _ = CloseHandle(self.0);
                }
            }
        }
    }

    /// Anonymous pipe with an inheritable write end for the child and a
    /// non-inheritable read end for the parent.
    struct CapturePipe {
        read: Option<HandleGuard>,
        write: Option<HandleGuard>,
    }

    impl CapturePipe {
        fn new() -> Result<Self> {
            let sa = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: null_mut(),
                bInheritHandle: true.into(),
            };
            unsafe {
                let mut read = HANDLE::default();
                let mut write = HANDLE::default();
                CreatePipe(&mut read, &mut write, Some(&sa), 0)
                    .map_err(|e| os_err("CreatePipe", e))?;
                let read = HandleGuard(read);
                let write = HandleGuard(write);
                SetHandleInformation(read.0, HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))
                    .map_err(|e| os_err("SetHandleInformation", e))?;
                Ok(Self {
                    read: Some(read),
                    write: Some(write),
                })
            }
        }

        fn write_handle(&self) -> HANDLE {
            self.write.as_ref().map(|w| w.0).unwrap_or_default()
        }

        /// The parent must close its copy of the write end right after
        /// process creation or the read side never sees EOF.
        fn close_write(&mut self) {
            self.write = None;
        }

        fn take_read(&mut self) -> Option<HandleGuard> {
            self.read.take()
        }
    }

    /// Kill-on-close job object; the whole child tree dies with this guard.
    struct JobObject {
        handle: HandleGuard,
    }

    impl JobObject {
        fn new() -> Result<Self> {
            unsafe {
                let handle = CreateJobObjectW(None, None).map_err(|e| os_err("CreateJobObjectW", e))?;
                let handle = HandleGuard(handle);
                let info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
                    BasicLimitInformation: JOBOBJECT_BASIC_LIMIT_INFORMATION {
                        LimitFlags: JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                SetInformationJobObject(
                    handle.0,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
                .map_err(|e| os_err("SetInformationJobObject", e))?;
                Ok(Self { handle })
            }
        }

        fn assign(&self, process: HANDLE) -> Result<()> {
            unsafe {
                AssignProcessToJobObject(self.handle.0, process)
                    .map_err(|e| os_err("AssignProcessToJobObject", e))
            }
        }

        fn terminate(&self) {
            unsafe {
                let _ = TerminateJobObject(self.handle.0, 1);
            }
        }
    }

    /// Build one quoted command line the way `CreateProcessW` expects:
    /// program always quoted, arguments quoted when they contain whitespace,
    /// embedded quotes escaped together with their preceding backslashes.
    fn build_command_line(command: &[String]) -> Result<Vec<u16>> {
        let (program, args) = command.split_first().ok_or_else(|| {
            WardenErr::Configuration("command cannot be empty".to_string())
        })?;

        let mut line: Vec<u16> = Vec::new();
        append_quoted(&mut line, program, true)?;
        for arg in args {
            line.push(' ' as u16);
            append_quoted(&mut line, arg, false)?;
        }
        line.push(0);
        Ok(line)
    }

    fn append_quoted(line: &mut Vec<u16>, value: &str, force_quotes: bool) -> Result<()> {
        let wide: Vec<u16> = OsStr::new(value).encode_wide().collect();
        if wide.contains(&0) {
            return Err(WardenErr::Configuration(
                "command argument contains an embedded NUL".to_string(),
            ));
        }

        let needs_quotes = force_quotes
            || wide.is_empty()
            || wide
                .iter()
                .any(|&c| c == ' ' as u16 || c == '\t' as u16 || c == '"' as u16);
        if !needs_quotes {
            line.extend(wide);
            return Ok(());
        }

        line.push('"' as u16);
        let mut backslashes = 0;
        for &c in &wide {
            if c == '\\' as u16 {
                backslashes += 1;
            } else {
                if c == '"' as u16 {
                    for _ in 0..=backslashes {
                        line.push('\\' as u16);
                    }
                }
                backslashes = 0;
            }
            line.push(c);
        }
        for _ in 0..backslashes {
            line.push('\\' as u16);
        }
        line.push('"' as u16);
        Ok(())
    }

    /// Drain one pipe to completion on a dedicated thread. Reading keeps
    /// going past the capture cap so the child never stalls on a full pipe.
    fn drain_pipe(read: HandleGuard) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let mut captured = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let mut bytes_read = 0u32;
                let ok = unsafe {
                    ReadFile(read.0, Some(&mut chunk), Some(&mut bytes_read), None)
                };
                match ok {
                    Ok(()) if bytes_read > 0 => {
                        if captured.len() < MAX_CAPTURED_BYTES {
                            let take =
                                (bytes_read as usize).min(MAX_CAPTURED_BYTES - captured.len());
                            captured.extend_from_slice(&chunk[..take]);
                        }
                    }
                    // EOF, or the child exited and the pipe broke.
                    Ok(()) | Err(_) => break,
                }
            }
            captured
        })
    }

    pub(super) fn execute_in_container(
        session: &ProfileSession,
        capability_sids: &[String],
        command: &[String],
        cwd: Option<&Path>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let capabilities: Vec<CapabilitySid> = capability_sids
            .iter()
            .map(|sid| CapabilitySid::from_string(sid))
            .collect::<Result<_>>()?;
        let mut attribute_list = AttributeList::new(session.sid_ptr(), &capabilities)?;

        let mut stdout_pipe = CapturePipe::new()?;
        let mut stderr_pipe = CapturePipe::new()?;

        let mut startup_info = STARTUPINFOEXW::default();
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        startup_info.lpAttributeList = attribute_list.as_mut_ptr();
        startup_info.StartupInfo.dwFlags |= STARTF_USESTDHANDLES;
        startup_info.StartupInfo.hStdOutput = stdout_pipe.write_handle();
        startup_info.StartupInfo.hStdError = stderr_pipe.write_handle();

        let mut command_line = build_command_line(command)?;
        let cwd_wide = cwd.map(|dir| to_wide(dir.as_os_str()));
        let mut process_info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                Some(PWSTR(command_line.as_mut_ptr())),
                None,
                None,
                true,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_NO_WINDOW | CREATE_UNICODE_ENVIRONMENT,
                None,
                cwd_wide
                    .as_ref()
                    .map(|wide| PCWSTR(wide.as_ptr()))
                    .unwrap_or(PCWSTR::null()),
                &startup_info.StartupInfo,
                &mut process_info,
            )
            .map_err(|e| os_err("CreateProcessW", e))?;
        }

        let process = HandleGuard(process_info.hProcess);
        let _thread = HandleGuard(process_info.hThread);

        // Close the parent's copies of the write ends immediately so the
        // drain threads observe EOF when the child exits.
        stdout_pipe.close_write();
        stderr_pipe.close_write();

        let job = JobObject::new()?;
        job.assign(process.0)?;

        let stdout_thread = stdout_pipe
            .take_read()
            .map(drain_pipe)
            .ok_or_else(|| WardenErr::Sandbox("stdout pipe already taken".to_string()))?;
        let stderr_thread = stderr_pipe
            .take_read()
            .map(drain_pipe)
            .ok_or_else(|| WardenErr::Sandbox("stderr pipe already taken".to_string()))?;

        let deadline = Instant::now() + timeout;
        let timed_out = loop {
            let wait = unsafe { WaitForSingleObject(process.0, WAIT_SLICE_MS) };
            if wait == WAIT_OBJECT_0 {
                break false;
            }
            if wait != WAIT_TIMEOUT {
                job.terminate();
                return Err(WardenErr::os(
                    "WaitForSingleObject",
                    io::Error::last_os_error(),
                ));
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                job.terminate();
                // Give the tree a moment to die so the pipes break and the
                // drain threads finish.
                unsafe {
                    let _ = WaitForSingleObject(process.0, 5_000);
                }
                break true;
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        if timed_out {
            return Ok(CommandResult::timed_out());
        }

        let mut exit_code = 0u32;
        unsafe {
            GetExitCodeProcess(process.0, &mut exit_code)
                .map_err(|e| os_err("GetExitCodeProcess", e))?;
        }

        Ok(CommandResult {
            exit_code: exit_code as i32,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}
