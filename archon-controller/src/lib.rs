// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! High-level driver for the STA Archon CCD controller.
//!
//! An [`ArchonController`] owns one TCP session to the device and the
//! bookkeeping around it: the in-flight command table, the identifier
//! pool, and the status bitmask that tracks where the controller is in
//! the exposure lifecycle. On top of the session it implements the
//! multi-step procedures an observatory actor drives: powering the
//! device, streaming a configuration, integrating, reading the sensor
//! out into a frame buffer, and fetching the buffer back as a pixel
//! array.
//!
//! The wire-level pieces (framing, reply parsing, command objects) live
//! in the `archon-protocol` crate.

pub mod acf;
pub mod config;
pub(crate) mod connection;
pub mod controller;
pub mod device;
pub mod error;
pub mod frame;
pub mod status;

pub use acf::AcfDocument;
pub use config::{ArchonConfig, Timeouts, UserPreferences};
pub use controller::{
    ArchonController, Notifier, ReadoutOptions, WriteConfigOptions,
};
pub use device::{ArchonPower, ModType, StatusValue};
pub use error::ArchonError;
pub use frame::{BufferSelection, FrameImage, FrameInfo, PixelData};
pub use status::{ControllerStatus, UpdateMode};

/// TCP port the Archon listens on by default.
pub const DEFAULT_PORT: u16 = 4242;
