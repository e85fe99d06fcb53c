//! # Microphone Permissions
//!
//! Platform permission checks in front of audio capture. A permission
//! request is a value: [`MicrophonePermissions::request`] returns a
//! [`PermissionRequest`] whose answer arrives over a one-shot channel, so
//! the asking code and the notified code need not be the same. Dropping the
//! request abandons interest in the answer; the platform side notices the
//! closed channel and does nothing.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// The user has not been asked yet.
    NotDetermined,
    Granted,
    Denied,
    /// Blocked by policy; asking again will not help.
    Restricted,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == PermissionStatus::Granted
    }
}

/// Requester side of a pending permission prompt.
pub struct PermissionRequest {
    rx: Receiver<PermissionStatus>,
}

/// Platform side of a pending permission prompt.
pub struct PermissionResponder {
    tx: Sender<PermissionStatus>,
}

/// Creates a connected request/responder pair.
pub fn permission_request() -> (PermissionResponder, PermissionRequest) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (PermissionResponder { tx }, PermissionRequest { rx })
}

impl PermissionRequest {
    /// A request that is already answered.
    pub fn resolved(status: PermissionStatus) -> Self {
        let (responder, request) = permission_request();
        responder.respond(status);
        request
    }

    /// Blocks until the platform answers. A responder that goes away
    /// without answering leaves the status undetermined.
    pub fn wait(self) -> PermissionStatus {
        self.rx.recv().unwrap_or(PermissionStatus::NotDetermined)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> PermissionStatus {
        match self.rx.recv_timeout(timeout) {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                PermissionStatus::NotDetermined
            }
        }
    }

    /// Non-blocking poll, for display loops that check once per tick.
    pub fn try_result(&self) -> Option<PermissionStatus> {
        match self.rx.try_recv() {
            Ok(status) => Some(status),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(PermissionStatus::NotDetermined),
        }
    }

    /// Underlying channel, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<PermissionStatus> {
        &self.rx
    }
}

impl PermissionResponder {
    /// Delivers the answer. Returns false when the requester already gave up.
    pub fn respond(self, status: PermissionStatus) -> bool {
        self.tx.send(status).is_ok()
    }
}

pub trait MicrophonePermissions: Send + Sync {
    fn status(&self) -> PermissionStatus;

    /// Starts a permission prompt, or answers at once when no prompt is needed.
    fn request(&self) -> PermissionRequest;
}

/// Desktop platforms gate microphone access outside the application.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopPermissions;

impl MicrophonePermissions for DesktopPermissions {
    fn status(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    fn request(&self) -> PermissionRequest {
        PermissionRequest::resolved(PermissionStatus::Granted)
    }
}

/// Answers every request with a fixed status.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions(pub PermissionStatus);

impl MicrophonePermissions for StaticPermissions {
    fn status(&self) -> PermissionStatus {
        self.0
    }

    fn request(&self) -> PermissionRequest {
        PermissionRequest::resolved(self.0)
    }
}

/// Checks microphone access and prompts when it is still undetermined.
///
/// # Returns
/// * The final status; `NotDetermined` when no answer came within `timeout`
pub fn resolve_microphone_access(permissions: &dyn MicrophonePermissions, timeout: Duration) -> PermissionStatus {
    let status = permissions.status();
    if status != PermissionStatus::NotDetermined {
        debug!(?status, "microphone permission already determined");
        return status;
    }

    info!("requesting microphone permission");
    let status = permissions.request().wait_timeout(timeout);
    info!(?status, "microphone permission answered");
    status
}
