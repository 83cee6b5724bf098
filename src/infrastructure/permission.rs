//! Radio permission gate.
//!
//! Mobile platforms gate BLE scanning behind a runtime permission prompt.
//! The link asks once before its first scan and remembers a grant.

use async_trait::async_trait;

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Ask for permission to scan; `true` when granted.
    async fn request_permission(&self) -> bool;
}

/// Gate for platforms without a runtime prompt (desktop BlueZ, CoreBluetooth
/// once the app is authorized, WinRT).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn request_permission(&self) -> bool {
        true
    }
}
