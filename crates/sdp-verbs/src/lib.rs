//! RDMA fabric interface consumed by the SDP engine.
//!
//! The engine never talks to verbs directly. It drives a [`Fabric`], which
//! bundles the connection-manager primitives (address/route resolution,
//! connect, accept, disconnect), memory registration, work-request posting
//! and completion-queue polling. Asynchronous notifications (CM events and
//! completion-queue interrupts) are delivered as [`FabricEvent`]s on a channel
//! installed with [`Fabric::set_event_sink`].
//!
//! # Architecture
//!
//! - `RemoteBuf` / `RegionHandle` / `DmaMapping`: memory handles.
//! - `DeviceInfo` / `DeviceCaps`: what the device can do (sge limits, reads).
//! - `Fabric`: the collaborator trait.
//! - `LoopbackNetwork` / `LoopbackDevice`: an in-memory fabric where several
//!   hosts exchange messages and serve remote reads without hardware.

pub mod buf;
pub mod device;
pub mod error;
pub mod fabric;
pub mod loopback;

pub use buf::{AccessFlags, DmaMapping, RegionHandle, RemoteBuf};
pub use device::{DeviceCaps, DeviceInfo, LinkLayer};
pub use error::FabricError;
pub use fabric::{
    CmEvent, CqKind, EndpointId, EventSender, Fabric, FabricEvent, QpCaps, ReadWr, RecvWr,
    SendWr, WcOpcode, WcStatus, WorkCompletion,
};
pub use loopback::{LoopbackDevice, LoopbackNetwork};
