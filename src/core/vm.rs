use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ManagerResult, VmError};

/// Lifecycle state of a single VM as the hypervisor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Undefined,
    Running,
    Paused,
    Shutoff,
    Crashed,
    Dying,
    Pmsuspended,
}

impl VmState {
    pub fn is_running(self) -> bool {
        self == VmState::Running
    }

    /// States in which the domain is still consuming host resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Paused | VmState::Dying | VmState::Pmsuspended
        )
    }

    /// Parse the text `virsh domstate` prints.
    pub fn from_virsh(text: &str) -> Self {
        match text.trim() {
            "running" | "idle" | "blocked" => VmState::Running,
            "paused" => VmState::Paused,
            "shut off" => VmState::Shutoff,
            "crashed" => VmState::Crashed,
            "in shutdown" => VmState::Dying,
            "pmsuspended" => VmState::Pmsuspended,
            _ => VmState::Undefined,
        }
    }
}

// libvirt virDomainState numbering
impl From<u32> for VmState {
    fn from(state: u32) -> Self {
        match state {
            1 | 2 => VmState::Running,
            3 => VmState::Paused,
            4 => VmState::Dying,
            5 => VmState::Shutoff,
            6 => VmState::Crashed,
            7 => VmState::Pmsuspended,
            _ => VmState::Undefined,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Undefined => "UNDEFINED",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Shutoff => "SHUTOFF",
            VmState::Crashed => "CRASHED",
            VmState::Dying => "DYING",
            VmState::Pmsuspended => "PMSUSPENDED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    /// Define and boot in one go.
    Define,
    /// Define and boot with vCPUs paused.
    DefinePaused,
    /// Define only; the domain exists but is not booted (`auto_start = false`).
    DefineInactive,
    Start,
    Pause,
    Resume,
    Shutdown,
    ShutdownComplete,
    Timeout,
    Crash,
    Recover,
    Destroy,
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmEvent::Define => "define",
            VmEvent::DefinePaused => "define paused",
            VmEvent::DefineInactive => "define without starting",
            VmEvent::Start => "start",
            VmEvent::Pause => "pause",
            VmEvent::Resume => "resume",
            VmEvent::Shutdown => "shut down",
            VmEvent::ShutdownComplete => "finish shutdown",
            VmEvent::Timeout => "force stop",
            VmEvent::Crash => "crash",
            VmEvent::Recover => "recover",
            VmEvent::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Next state for `event`, or `None` when the transition is not allowed.
pub fn transition(from: VmState, event: VmEvent) -> Option<VmState> {
    use VmEvent::*;
    use VmState::*;

    let next = match (from, event) {
        (Undefined, Define) => Running,
        (Undefined, DefinePaused) => Paused,
        (Undefined, DefineInactive) => Shutoff,

        (Running, Pause) => Paused,
        (Running, Shutdown) => Dying,
        (Running, Crash) => Crashed,

        (Paused, Resume) => Running,
        (Paused, Shutdown) => Dying,

        (Pmsuspended, Resume) => Running,
        (Pmsuspended, Shutdown) => Dying,

        (Dying, ShutdownComplete) => Shutoff,
        (Dying, Timeout) => Shutoff,

        (Shutoff, Start) => Running,
        (Shutoff, Destroy) => Undefined,

        (Crashed, Recover) => Running,
        (Crashed, Destroy) => Undefined,

        _ => return None,
    };
    Some(next)
}

const EVENTS: [VmEvent; 12] = [
    VmEvent::Define,
    VmEvent::DefinePaused,
    VmEvent::DefineInactive,
    VmEvent::Start,
    VmEvent::Pause,
    VmEvent::Resume,
    VmEvent::Shutdown,
    VmEvent::ShutdownComplete,
    VmEvent::Timeout,
    VmEvent::Crash,
    VmEvent::Recover,
    VmEvent::Destroy,
];

/// The event that accounts for an observed change from `from` to `to`.
///
/// Used when a status refresh finds a domain somewhere the manager did not
/// put it (a guest crash, a domain created paused by hand). `None` means no
/// single event in the table explains the jump.
pub fn explain(from: VmState, to: VmState) -> Option<VmEvent> {
    EVENTS.into_iter().find(|&event| transition(from, event) == Some(to))
}

/// Like [`transition`], but names the VM in the error.
pub fn apply(vm: &str, from: VmState, event: VmEvent) -> ManagerResult<VmState> {
    transition(from, event).ok_or_else(|| {
        VmError::InvalidTransition {
            vm: vm.to_string(),
            from,
            event,
        }
        .into()
    })
}
