//! Control plane for firmware-emulation sandboxes.
//!
//! Each sandbox is a container running one QEMU-emulated firmware image. This
//! crate locates sandboxes and emulation instances, drives QEMU's human
//! monitor for live snapshots, and sequences checkpoint/restore and reset
//! flows against the container runtime.

pub mod checkpoint;
pub mod command;
pub mod error;
pub mod firmware;
pub mod instance;
pub mod lifecycle;
pub mod locator;
pub mod monitor;
pub mod prepare;
pub mod reset;
pub mod runtime;
pub mod snapshot;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner},
    error::{Error, Result},
    firmware::FirmwareRef,
    lifecycle::{EmulationMode, ExistingPolicy, LaunchOptions, LifecycleManager},
    locator::{LocatedSandbox, SandboxState},
    monitor::MonitorClient,
    runtime::Docker,
};
