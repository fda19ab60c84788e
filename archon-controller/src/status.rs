// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Controller status bitmask and change notifications.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use tokio::sync::watch;

use crate::error::ArchonError;

bitflags! {
    /// Status of the controller.
    ///
    /// `ACTIVE` is the union of the bits that describe work in
    /// progress. `IDLE` and any `ACTIVE` bit are mutually exclusive;
    /// [`StatusTracker::update`] maintains that invariant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControllerStatus: u16 {
        const UNKNOWN = 0x1;
        const IDLE = 0x2;
        const EXPOSING = 0x4;
        const READOUT_PENDING = 0x8;
        const READING = 0x10;
        const FETCHING = 0x20;
        const FLUSHING = 0x40;
        const ERROR = 0x80;
        const POWERON = 0x100;
        const POWEROFF = 0x200;
        const POWERBAD = 0x400;
        const ACTIVE = Self::EXPOSING.bits()
            | Self::READING.bits()
            | Self::FETCHING.bits()
            | Self::FLUSHING.bits();
        const ERRORED = Self::ERROR.bits() | Self::POWERBAD.bits();
    }
}

/// How [`StatusTracker::update`] combines the given bits with the
/// current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    On,
    Off,
    Toggle,
}

/// Holds the current status and publishes changes to subscribers.
///
/// Notifications go through a watch channel, so a slow consumer
/// observes the latest value rather than every intermediate one.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    current: Mutex<ControllerStatus>,
    notify: watch::Sender<ControllerStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(ControllerStatus::UNKNOWN);
        Self {
            current: Mutex::new(ControllerStatus::UNKNOWN),
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerStatus> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> ControllerStatus {
        *self.lock()
    }

    /// Replaces the status without publishing a change.
    pub fn set(&self, status: ControllerStatus) {
        *self.lock() = status;
    }

    /// Turns the given bits on, off, or toggles them.
    ///
    /// A single call may not name `IDLE` together with any `ACTIVE`
    /// bit. After the bits are applied, setting `IDLE` clears every
    /// `ACTIVE` bit, and a status with any `ACTIVE` bit loses `IDLE`.
    pub fn update(
        &self,
        bits: ControllerStatus,
        mode: UpdateMode,
        notify: bool,
    ) -> Result<ControllerStatus, ArchonError> {
        if bits.intersects(ControllerStatus::IDLE) && bits.intersects(ControllerStatus::ACTIVE) {
            return Err(ArchonError::InvalidState(
                "cannot set IDLE and ACTIVE bits at the same time".to_string(),
            ));
        }

        let updated = {
            let mut current = self.lock();
            let mut status = *current;
            match mode {
                UpdateMode::On => status |= bits,
                UpdateMode::Off => status &= !bits,
                UpdateMode::Toggle => status ^= bits,
            }
            if bits.contains(ControllerStatus::IDLE) {
                status &= !ControllerStatus::ACTIVE;
            } else if status.intersects(ControllerStatus::ACTIVE) {
                status &= !ControllerStatus::IDLE;
            }
            *current = status;
            status
        };

        if notify {
            self.notify.send_replace(updated);
        }

        Ok(updated)
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.notify.subscribe()
    }
}
