//! DACL grants for the AppContainer SID on mounted directories.
//!
//! Each allowed directory receives one inheritable grant ACE before the
//! first execution. Grants are idempotent and deliberately never revoked on
//! dispose: removal races other live sessions sharing the same profile.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::null_mut;

use windows::Win32::Foundation::ERROR_SUCCESS;
use windows::Win32::Foundation::GENERIC_EXECUTE;
use windows::Win32::Foundation::GENERIC_READ;
use windows::Win32::Foundation::GENERIC_WRITE;
use windows::Win32::Foundation::HLOCAL;
use windows::Win32::Foundation::LocalFree;
use windows::Win32::Foundation::WIN32_ERROR;
use windows::Win32::Security::ACL;
use windows::Win32::Security::Authorization::EXPLICIT_ACCESS_W;
use windows::Win32::Security::Authorization::GetNamedSecurityInfoW;
use windows::Win32::Security::Authorization::SE_FILE_OBJECT;
use windows::Win32::Security::Authorization::SET_ACCESS;
use windows::Win32::Security::Authorization::SetEntriesInAclW;
use windows::Win32::Security::Authorization::SetNamedSecurityInfoW;
use windows::Win32::Security::Authorization::TRUSTEE_IS_SID;
use windows::Win32::Security::Authorization::TRUSTEE_IS_UNKNOWN;
use windows::Win32::Security::Authorization::TRUSTEE_W;
use windows::Win32::Security::DACL_SECURITY_INFORMATION;
use windows::Win32::Security::OBJECT_INHERIT_ACE;
use windows::Win32::Security::PSECURITY_DESCRIPTOR;
use windows::Win32::Security::PSID;
use windows::Win32::Security::SUB_CONTAINERS_AND_OBJECTS_INHERIT;
use windows::core::PCWSTR;
use windows::core::PWSTR;

use crate::error::Result;
use crate::error::WardenErr;

/// Frees a LocalAlloc'd pointer on every exit path.
struct LocalGuard(*mut core::ffi::c_void);

impl Drop for LocalGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let _ = LocalFree(HLOCAL(self.0));
            }
        }
    }
}

/// Grant the AppContainer SID read/write/execute on each directory, with
/// inheritance down to every contained object. Any failure aborts session
/// initialization.
pub(crate) fn grant_directories(sid: PSID, dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs {
        grant_directory(sid, dir)?;
    }
    Ok(())
}

fn grant_directory(sid: PSID, dir: &Path) -> Result<()> {
    let wide: Vec<u16> = dir
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let mut existing_dacl: *mut ACL = null_mut();
        let mut security_descriptor = PSECURITY_DESCRIPTOR::default();
        let status = GetNamedSecurityInfoW(
            PCWSTR(wide.as_ptr()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(&mut existing_dacl),
            None,
            &mut security_descriptor,
        );
        let _descriptor_guard = LocalGuard(security_descriptor.0);
        if status != WIN32_ERROR::from(ERROR_SUCCESS) {
            return Err(acl_error("GetNamedSecurityInfoW", status, dir));
        }

        let explicit = EXPLICIT_ACCESS_W {
            grfAccessPermissions: (GENERIC_READ | GENERIC_WRITE | GENERIC_EXECUTE).0,
            grfAccessMode: SET_ACCESS,
            grfInheritance: SUB_CONTAINERS_AND_OBJECTS_INHERIT | OBJECT_INHERIT_ACE,
            Trustee: TRUSTEE_W {
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_UNKNOWN,
                ptstrName: PWSTR(sid.0.cast()),
                ..Default::default()
            },
        };

        let explicit_entries = [explicit];
        let mut new_dacl: *mut ACL = null_mut();
        let status = SetEntriesInAclW(Some(&explicit_entries), Some(existing_dacl), &mut new_dacl);
        let _dacl_guard = LocalGuard(new_dacl.cast());
        if status != WIN32_ERROR::from(ERROR_SUCCESS) {
            return Err(acl_error("SetEntriesInAclW", status, dir));
        }

        let status = SetNamedSecurityInfoW(
            PCWSTR(wide.as_ptr()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(new_dacl),
            None,
        );
        if status != WIN32_ERROR::from(ERROR_SUCCESS) {
            return Err(acl_error("SetNamedSecurityInfoW", status, dir));
        }
    }

    Ok(())
}

fn acl_error(api: &'static str, status: WIN32_ERROR, dir: &Path) -> WardenErr {
    tracing::warn!("{api} failed for {}", dir.display());
    WardenErr::os(api, io::Error::from_raw_os_error(status.0 as i32))
}
