// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of free command identifiers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::ProtocolError;

/// The set of command identifiers not currently bound to an in-flight
/// command.
///
/// An identifier is either free in the pool or bound to exactly one
/// running command. No allocation order is guaranteed; callers must not
/// assume identifiers are handed out sequentially.
#[derive(Debug)]
pub struct IdPool {
    free: HashSet<u8>,
}

impl IdPool {
    /// Creates a pool containing every identifier in `[0, 255]`.
    pub fn new() -> Self {
        Self {
            free: (0..=crate::MAX_COMMAND_ID).collect(),
        }
    }

    /// Removes and returns an arbitrary free identifier.
    pub fn acquire(&mut self) -> Result<u8, ProtocolError> {
        let id = *self
            .free
            .iter()
            .next()
            .ok_or(ProtocolError::PoolExhausted)?;
        self.free.remove(&id);
        Ok(id)
    }

    /// Removes a specific identifier from the pool. Returns `false` if
    /// the identifier was not free.
    pub fn claim(&mut self, id: u8) -> bool {
        self.free.remove(&id)
    }

    /// Returns an identifier to the pool. Releasing an identifier that
    /// is already free is a no-op.
    pub fn release(&mut self, id: u8) {
        self.free.insert(id);
    }

    /// Number of identifiers currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to an [`IdPool`] shared between a controller and
/// the commands that return their identifiers on completion.
#[derive(Debug, Clone)]
pub struct SharedIdPool(Arc<Mutex<IdPool>>);

impl SharedIdPool {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(IdPool::new())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdPool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> Result<u8, ProtocolError> {
        self.lock().acquire()
    }

    pub fn claim(&self, id: u8) -> bool {
        self.lock().claim(id)
    }

    pub fn release(&self, id: u8) {
        self.lock().release(id);
    }

    pub fn available(&self) -> usize {
        self.lock().available()
    }
}

impl Default for SharedIdPool {
    fn default() -> Self {
        Self::new()
    }
}
