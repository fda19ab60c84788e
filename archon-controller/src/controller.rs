// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The controller façade.
//!
//! [`ArchonController`] is cheap to clone; every clone shares the same
//! session state. Long-running procedures hold no locks across
//! suspension points, and all status changes go through the tracker so
//! the IDLE/ACTIVE invariant holds no matter how operations interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use archon_protocol::{
    ArchonCommand, ArchonCommandStatus, BinaryReplySize, CommandOptions, SharedIdPool,
    BINARY_CHUNK_SIZE, RAW_CHUNK_SIZE,
};
use futures::Stream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::acf::{decode_entry, encode_entry, AcfDocument};
use crate::config::{secs, ArchonConfig, UserPreferences};
use crate::connection::{CommandTable, Connection};
use crate::device::{parse_keywords, ArchonPower, ModType, StatusValue};
use crate::error::ArchonError;
use crate::frame::{BufferSelection, FrameImage, FrameInfo};
use crate::status::{ControllerStatus, StatusTracker, UpdateMode};

/// Callback receiving progress messages from multi-step procedures.
pub type Notifier = Box<dyn Fn(&str) + Send + Sync>;

/// Options for [`ArchonController::write_config`].
#[derive(Default)]
pub struct WriteConfigOptions {
    /// Send `APPLYALL` after the configuration has been written.
    pub applyall: bool,
    /// Send `POWERON` after `APPLYALL`. Only meaningful with
    /// `applyall`.
    pub poweron: bool,
    /// Per-command timeout; defaults to the configured
    /// `write_config_timeout`.
    pub timeout: Option<Duration>,
    pub notifier: Option<Notifier>,
}

/// Options for [`ArchonController::readout`].
pub struct ReadoutOptions {
    /// Trigger the readout regardless of the current lifecycle state.
    pub force: bool,
    /// Block until the write buffer reports complete.
    pub block: bool,
    /// Extra seconds the firmware waits before reading, for photon
    /// transfer frames.
    pub delay: u32,
    /// Initial wait before polling the frame table, so the new frame
    /// has started filling. Defaults to 3 seconds.
    pub wait_for: Option<Duration>,
}

impl Default for ReadoutOptions {
    fn default() -> Self {
        Self {
            force: false,
            block: true,
            delay: 0,
            wait_for: None,
        }
    }
}

struct ControllerState {
    name: String,
    host: String,
    port: u16,
    config: ArchonConfig,
    table: Arc<CommandTable>,
    id_pool: SharedIdPool,
    binary_reply_size: BinaryReplySize,
    status: StatusTracker,
    connection: tokio::sync::Mutex<Option<Connection>>,
    auto_flush: Mutex<Option<bool>>,
    acf_loaded: Mutex<Option<PathBuf>>,
}

/// Talks to an Archon controller over TCP.
#[derive(Clone)]
pub struct ArchonController {
    state: Arc<ControllerState>,
}

impl ArchonController {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self::with_config(name, host, port, ArchonConfig::default())
    }

    pub fn with_config(name: &str, host: &str, port: u16, config: ArchonConfig) -> Self {
        Self {
            state: Arc::new(ControllerState {
                name: name.to_string(),
                host: host.to_string(),
                port,
                config,
                table: Arc::new(CommandTable::new()),
                id_pool: SharedIdPool::new(),
                binary_reply_size: BinaryReplySize::new(),
                status: StatusTracker::new(),
                connection: tokio::sync::Mutex::new(None),
                auto_flush: Mutex::new(None),
                acf_loaded: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn host(&self) -> &str {
        &self.state.host
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    pub fn config(&self) -> &ArchonConfig {
        &self.state.config
    }

    /// Opens the TCP session. With `reset`, also runs [`Self::reset`];
    /// a reset failure right after a power cycle is logged and
    /// swallowed because the controller answers nothing until it has
    /// been initialised.
    pub async fn start(&self, reset: bool) -> Result<(), ArchonError> {
        let connection = Connection::open(
            &self.state.host,
            self.state.port,
            secs(self.state.config.timeouts.controller_connect),
            Arc::clone(&self.state.table),
            self.state.binary_reply_size.clone(),
        )
        .await?;
        *self.state.connection.lock().await = Some(connection);

        if reset {
            if let Err(err) = self.reset().await {
                warn!(controller = %self.state.name, %err, "reset failed after connecting");
            }
        }
        Ok(())
    }

    /// Closes the session and cancels whatever is still in flight.
    pub async fn stop(&self) {
        if let Some(connection) = self.state.connection.lock().await.take() {
            connection.stop().await;
        }
        self.state.table.cancel_all();
    }

    pub async fn is_connected(&self) -> bool {
        self.state.connection.lock().await.is_some()
    }

    // ---- status ----

    pub fn status(&self) -> ControllerStatus {
        self.state.status.get()
    }

    /// Turns status bits on, off, or toggles them. See
    /// [`crate::status::StatusTracker::update`] for the IDLE/ACTIVE
    /// rules.
    pub fn update_status(
        &self,
        bits: ControllerStatus,
        mode: UpdateMode,
        notify: bool,
    ) -> Result<ControllerStatus, ArchonError> {
        self.state.status.update(bits, mode, notify)
    }

    /// Yields the current status and every subsequent change. A slow
    /// consumer observes the latest value, not every intermediate one.
    pub fn status_stream(&self) -> impl Stream<Item = ControllerStatus> + Send + 'static {
        let receiver = self.state.status.subscribe();
        futures::stream::unfold(
            (None::<ControllerStatus>, receiver),
            |(last, mut receiver)| async move {
                if last.is_none() {
                    let current = *receiver.borrow_and_update();
                    return Some((current, (Some(current), receiver)));
                }
                loop {
                    if receiver.changed().await.is_err() {
                        return None;
                    }
                    let value = *receiver.borrow_and_update();
                    if Some(value) != last {
                        return Some((value, (Some(value), receiver)));
                    }
                }
            },
        )
    }

    fn latch_error(&self) {
        let _ = self
            .state
            .status
            .update(ControllerStatus::ERROR, UpdateMode::On, true);
    }

    // ---- command plumbing ----

    /// Sends a single command and returns the in-flight handle. The
    /// caller awaits the handle for completion.
    pub async fn send_command(
        &self,
        command_string: &str,
    ) -> Result<Arc<ArchonCommand>, ArchonError> {
        self.send_command_with(command_string, CommandOptions::default())
            .await
    }

    pub async fn send_command_with(
        &self,
        command_string: &str,
        options: CommandOptions,
    ) -> Result<Arc<ArchonCommand>, ArchonError> {
        let (command_id, claimed) = match options.command_id {
            Some(id) => (id, self.state.id_pool.claim(id)),
            None => (self.state.id_pool.acquire()?, true),
        };

        let command = Arc::new(ArchonCommand::with_options(
            command_string,
            command_id,
            options.expected_replies,
            options.timeout,
            Some(self.state.id_pool.clone()),
        ));

        if let Err(err) = self.state.table.register(Arc::clone(&command)) {
            if claimed {
                self.state.id_pool.release(command_id);
            }
            return Err(err);
        }
        command.spawn_timeout();

        let result = {
            let connection = self.state.connection.lock().await;
            match connection.as_ref() {
                Some(connection) => connection.write_frame(&command.raw()).await,
                None => Err(ArchonError::NotConnected),
            }
        };
        if let Err(err) = result {
            self.state.table.remove(command_id);
            command.cancel();
            return Err(err);
        }

        Ok(command)
    }

    /// Sends and waits, without interpreting the completion status.
    async fn run_command(
        &self,
        command_string: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<ArchonCommand>, ArchonError> {
        let command = self
            .send_command_with(
                command_string,
                CommandOptions {
                    timeout,
                    ..Default::default()
                },
            )
            .await?;
        command.wait().await;
        Ok(command)
    }

    /// Sends and waits, failing unless the command succeeded.
    async fn run_checked(
        &self,
        command_string: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<ArchonCommand>, ArchonError> {
        let command = self.run_command(command_string, timeout).await?;
        if !command.succeeded() {
            return Err(ArchonError::command_failed(&command));
        }
        Ok(command)
    }

    /// Sends many commands in chunks bounded by `max_chunk` and the
    /// number of free identifiers, waiting for each chunk to complete
    /// before issuing the next.
    ///
    /// Returns the commands that completed successfully and those that
    /// failed. As soon as one command of a chunk fails, the remaining
    /// chunks are not issued; completed commands of the failed chunk
    /// are still reported as done. Completion order is not guaranteed
    /// to match input order; callers that need ordered replies should
    /// use [`Self::send_command`] directly.
    pub async fn send_many(
        &self,
        command_strings: &[String],
        max_chunk: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Arc<ArchonCommand>>, Vec<Arc<ArchonCommand>>), ArchonError> {
        let mut done = Vec::new();
        let mut index = 0;

        while index < command_strings.len() {
            let chunk = max_chunk
                .min(command_strings.len() - index)
                .min(self.state.id_pool.available());
            if chunk == 0 {
                return Err(archon_protocol::ProtocolError::PoolExhausted.into());
            }

            let mut pending = Vec::with_capacity(chunk);
            for _ in 0..chunk {
                let command = self
                    .send_command_with(
                        &command_strings[index],
                        CommandOptions {
                            timeout,
                            ..Default::default()
                        },
                    )
                    .await?;
                pending.push(command);
                index += 1;
            }

            futures::future::join_all(pending.iter().map(|command| command.wait())).await;

            if pending.iter().all(|command| command.succeeded()) {
                done.extend(pending);
            } else {
                let (succeeded, failed): (Vec<_>, Vec<_>) = pending
                    .into_iter()
                    .partition(|command| command.succeeded());
                done.extend(succeeded);
                return Ok((done, failed));
            }
        }

        Ok((done, Vec::new()))
    }

    fn first_reply_text(command: &ArchonCommand) -> Result<String, ArchonError> {
        let replies = command.replies();
        let reply = replies.first().ok_or_else(|| {
            ArchonError::InvalidReply(format!(
                "{} returned no replies",
                command.command_string()
            ))
        })?;
        Ok(reply.as_text()?.to_string())
    }

    // ---- device reports ----

    /// Returns the `SYSTEM` report as a map, keys lower-cased. For
    /// every `MOD<n>_TYPE` keyword a derived `mod<n>_name` entry is
    /// added with the module type spelled out.
    pub async fn get_system(&self) -> Result<HashMap<String, String>, ArchonError> {
        let command = self
            .run_checked("SYSTEM", Some(Duration::from_secs(1)))
            .await?;
        let text = Self::first_reply_text(&command)?;

        let mut system = HashMap::new();
        for (key, value) in parse_keywords(&text)? {
            system.insert(key.to_lowercase(), value.clone());
            if let Some(slot) = mod_type_slot(&key) {
                let code = value.parse::<i64>().map_err(|_| {
                    ArchonError::InvalidReply(format!("bad module type {key}={value}"))
                })?;
                let mod_type = ModType::from_code(code)?;
                system.insert(format!("mod{slot}_name"), mod_type.name().to_string());
            }
        }
        Ok(system)
    }

    /// Returns the `STATUS` report. As a side effect, refreshes the
    /// POWERBAD bit from the `POWERGOOD` keyword.
    pub async fn get_device_status(
        &self,
    ) -> Result<HashMap<String, StatusValue>, ArchonError> {
        let command = self
            .run_checked("STATUS", Some(Duration::from_secs(1)))
            .await?;
        let text = Self::first_reply_text(&command)?;

        let mut status = HashMap::new();
        for (key, value) in parse_keywords(&text)? {
            status.insert(key.to_lowercase(), StatusValue::parse(&value)?);
        }

        let powergood = status
            .get("powergood")
            .ok_or_else(|| ArchonError::MissingKey("powergood".to_string()))?;
        let mode = if powergood.as_i64() == Some(1) {
            UpdateMode::Off
        } else {
            UpdateMode::On
        };
        self.update_status(ControllerStatus::POWERBAD, mode, true)?;

        Ok(status)
    }

    /// Returns the frame buffer table.
    pub async fn get_frame(&self) -> Result<FrameInfo, ArchonError> {
        let command = self
            .run_checked("FRAME", Some(Duration::from_secs(1)))
            .await?;
        FrameInfo::from_reply(&Self::first_reply_text(&command)?)
    }

    // ---- configuration ----

    /// Reads every configuration line from the controller, in slot
    /// order. With `save`, also queries `SYSTEM` and writes both
    /// sections to an ACF file at the given path.
    pub async fn read_config(&self, save: Option<&Path>) -> Result<Vec<String>, ArchonError> {
        self.run_command("POLLOFF", None).await?;

        let command_strings: Vec<String> = (0..self.state.config.max_config_lines)
            .map(|line| format!("RCONFIG{line:04X}"))
            .collect();
        let sent = self
            .send_many(&command_strings, 100, Some(secs(0.5)))
            .await;

        self.run_command("POLLON", None).await?;
        let (done, failed) = sent?;

        if let Some(first) = failed.first() {
            return Err(ArchonError::command_failed(first));
        }
        if done.iter().any(|command| command.replies().is_empty()) {
            return Err(ArchonError::InvalidReply(
                "some RCONFIG commands did not get any reply".to_string(),
            ));
        }

        // Completion order is not input order, aggregate by the slot
        // index embedded in the command.
        let mut lines: Vec<(usize, String)> = Vec::with_capacity(done.len());
        for command in &done {
            let slot = usize::from_str_radix(&command.command_string()[7..11], 16)
                .map_err(|_| {
                    ArchonError::InvalidReply(format!("bad RCONFIG index in {}", command.raw()))
                })?;
            lines.push((slot, Self::first_reply_text(command)?));
        }
        lines.sort_by_key(|(slot, _)| *slot);

        let joined = lines
            .into_iter()
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n");
        let config_lines: Vec<String> = joined.trim().lines().map(str::to_string).collect();

        if let Some(path) = save {
            let system = self.get_system().await?;
            let mut document = AcfDocument::new();

            let section = document.add_section("SYSTEM");
            let mut system_keys: Vec<_> = system
                .keys()
                .filter(|key| !key.contains("_name"))
                .collect();
            system_keys.sort();
            for key in system_keys {
                let line = format!("{}={}", key.to_uppercase(), system[key]);
                section.entries.push(encode_entry(&line)?);
            }

            let section = document.add_section("CONFIG");
            for line in &config_lines {
                section.entries.push(encode_entry(line)?);
            }

            std::fs::write(path, document.to_text())?;
        }

        Ok(config_lines)
    }

    /// Streams an ACF configuration to the controller.
    ///
    /// `input` is either a path to an ACF file or the configuration
    /// text itself. The `[CONFIG]` section is written line by line with
    /// `WCONFIG`; any failure latches the ERROR bit and aborts the
    /// procedure. On success the controller is reset and, when the
    /// input was a file, its absolute path is recorded as the last ACF
    /// loaded.
    pub async fn write_config(
        &self,
        input: &str,
        options: WriteConfigOptions,
    ) -> Result<(), ArchonError> {
        let notify = |message: &str| {
            debug!(controller = %self.state.name, "{message}");
            if let Some(notifier) = &options.notifier {
                notifier(message);
            }
        };

        notify("Reading configuration file");
        let timeout = options
            .timeout
            .unwrap_or_else(|| secs(self.state.config.timeouts.write_config_timeout));
        let delay = secs(self.state.config.timeouts.write_config_delay);

        let path = Path::new(input);
        let (content, source) = if path.exists() {
            (std::fs::read_to_string(path)?, Some(path.to_path_buf()))
        } else {
            (input.to_string(), None)
        };

        let document = AcfDocument::parse(&content)?;
        let config_section = document.section("CONFIG").ok_or_else(|| {
            ArchonError::Acf("the configuration does not have a CONFIG section".to_string())
        })?;
        let lines: Vec<String> = config_section
            .entries
            .iter()
            .map(|(key, value)| decode_entry(key, value))
            .collect();

        notify("Clearing previous configuration");
        let command = self.run_command("CLEARCONFIG", Some(timeout)).await?;
        if !command.succeeded() {
            self.latch_error();
            return Err(ArchonError::command_failed(&command));
        }

        notify("Sending configuration lines");
        // The controller polls its modules internally; turning that off
        // speeds up the network response during the burst.
        self.run_command("POLLOFF", None).await?;

        for (slot, line) in lines.iter().enumerate() {
            let command = self
                .run_command(&format!("WCONFIG{slot:04X}{line}"), Some(timeout))
                .await?;
            if matches!(
                command.status(),
                ArchonCommandStatus::Failed | ArchonCommandStatus::TimedOut
            ) {
                self.latch_error();
                self.run_command("POLLON", None).await?;
                return Err(ArchonError::command_failed(&command));
            }
            tokio::time::sleep(delay).await;
        }

        notify("Successfully sent config lines");

        if let Some(source) = source {
            self.record_acf_loaded(&source)?;
        }

        self.run_command("POLLON", None).await?;

        if options.applyall {
            notify("Sending APPLYALL");
            let command = self
                .run_command("APPLYALL", Some(Duration::from_secs(5)))
                .await?;
            if !command.succeeded() {
                self.latch_error();
                return Err(ArchonError::command_failed(&command));
            }

            if options.poweron {
                notify("Sending POWERON");
                let command = self.run_command("POWERON", Some(timeout)).await?;
                if !command.succeeded() {
                    self.latch_error();
                    return Err(ArchonError::command_failed(&command));
                }
            }
        }

        self.reset().await?;
        Ok(())
    }

    /// The last ACF loaded, falling back to the user preferences file
    /// when nothing has been loaded in this session.
    pub fn acf_loaded(&self) -> Option<PathBuf> {
        if let Some(path) = self
            .state
            .acf_loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Some(path);
        }
        let preferences_path = self.state.config.user_config_file.as_ref()?;
        let preferences = UserPreferences::load(preferences_path).ok()?;
        preferences
            .last_acf_loaded
            .get(&self.state.name)
            .map(PathBuf::from)
    }

    fn record_acf_loaded(&self, path: &Path) -> Result<(), ArchonError> {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        *self
            .state
            .acf_loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resolved.clone());

        if let Some(preferences_path) = &self.state.config.user_config_file {
            let mut preferences = UserPreferences::load(preferences_path)?;
            preferences
                .last_acf_loaded
                .insert(self.state.name.clone(), resolved.display().to_string());
            preferences.store(preferences_path)?;
        }
        Ok(())
    }

    // ---- firmware parameters ----

    /// Sets a firmware parameter through `FASTLOADPARAM`.
    pub async fn set_param(
        &self,
        parameter: &str,
        value: i64,
    ) -> Result<Arc<ArchonCommand>, ArchonError> {
        let command = self
            .run_command(&format!("FASTLOADPARAM {parameter} {value}"), None)
            .await?;
        if !command.succeeded() {
            return Err(ArchonError::command_failed(&command));
        }
        Ok(command)
    }

    /// Enables or disables autoflushing and caches the setting.
    pub async fn set_autoflush(&self, mode: bool) -> Result<(), ArchonError> {
        self.set_param("AutoFlush", i64::from(mode)).await?;
        *self
            .state
            .auto_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(mode);
        Ok(())
    }

    pub fn auto_flush(&self) -> Option<bool> {
        *self
            .state
            .auto_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets timing and discards current exposures, leaving the
    /// controller IDLE with the power bit refreshed.
    pub async fn reset(&self) -> Result<(), ArchonError> {
        self.reset_with(true, true).await
    }

    pub async fn reset_with(
        &self,
        autoflush: bool,
        restart_timing: bool,
    ) -> Result<(), ArchonError> {
        self.run_command("HOLDTIMING", None).await?;

        self.set_autoflush(autoflush).await?;
        for parameter in ["Exposures", "ReadOut", "AbortExposure", "DoFlush", "WaitCount"] {
            self.set_param(parameter, 0).await?;
        }

        for (parameter, value) in &self.state.config.default_parameters {
            self.set_param(parameter, *value).await?;
        }

        if restart_timing {
            for command_string in ["RELEASETIMING", "RESETTIMING"] {
                let command = self
                    .run_command(command_string, Some(Duration::from_secs(1)))
                    .await?;
                if !command.succeeded() {
                    self.latch_error();
                    return Err(ArchonError::command_failed(&command));
                }
            }
        }

        self.state.status.set(ControllerStatus::IDLE);
        // Refreshes POWERBAD.
        self.get_device_status().await?;
        Ok(())
    }

    // ---- exposure lifecycle ----

    /// Starts integrating for `exposure_time` and returns once the
    /// integration has begun.
    ///
    /// The returned task sleeps for the integration time and then
    /// drives the status transition: to `IDLE | READOUT_PENDING` when
    /// `readout` is off, or to `READING` after verifying through the
    /// frame table that the controller started reading. If the
    /// exposure was aborted in the meantime the task returns silently.
    pub async fn expose(
        &self,
        exposure_time: Duration,
        binning: i64,
        readout: bool,
    ) -> Result<JoinHandle<Result<(), ArchonError>>, ArchonError> {
        if self.status().intersects(ControllerStatus::READOUT_PENDING) {
            return Err(ArchonError::InvalidState(
                "the controller has a readout pending; read the device or flush".to_string(),
            ));
        }

        self.reset_with(false, false).await?;

        self.set_param("ReadOut", i64::from(readout)).await?;
        self.set_param("IntMS", exposure_time.as_millis() as i64)
            .await?;
        self.set_param("Exposures", 1).await?;
        self.set_param("HorizontalBinning", binning).await?;
        self.set_param("VerticalBinning", binning).await?;

        self.run_command("RESETTIMING", None).await?;
        self.run_command("RELEASETIMING", None).await?;

        self.update_status(
            ControllerStatus::EXPOSING | ControllerStatus::READOUT_PENDING,
            UpdateMode::On,
            true,
        )?;

        let controller = self.clone();
        Ok(tokio::spawn(async move {
            tokio::time::sleep(exposure_time).await;

            if !controller.status().intersects(ControllerStatus::EXPOSING) {
                // Aborted while integrating.
                return Ok(());
            }

            if !readout {
                controller.update_status(
                    ControllerStatus::IDLE | ControllerStatus::READOUT_PENDING,
                    UpdateMode::On,
                    true,
                )?;
                return Ok(());
            }

            let frame = controller.get_frame().await?;
            let wbuf = frame.wbuf()?;
            if !frame.buffer_complete(wbuf)? {
                controller.update_status(
                    ControllerStatus::EXPOSING | ControllerStatus::READOUT_PENDING,
                    UpdateMode::Off,
                    false,
                )?;
                controller.update_status(ControllerStatus::READING, UpdateMode::On, true)?;
                Ok(())
            } else {
                Err(ArchonError::InvalidState(
                    "the controller did not start reading".to_string(),
                ))
            }
        }))
    }

    /// Aborts the current exposure without flushing the charge.
    pub async fn abort(&self, readout: bool) -> Result<(), ArchonError> {
        if !self.status().intersects(ControllerStatus::EXPOSING) {
            return Err(ArchonError::InvalidState(
                "the controller is not exposing".to_string(),
            ));
        }

        self.set_param("ReadOut", i64::from(readout)).await?;
        self.set_param("AbortExposure", 1).await?;

        if readout {
            self.update_status(
                ControllerStatus::EXPOSING | ControllerStatus::READOUT_PENDING,
                UpdateMode::Off,
                false,
            )?;
            self.update_status(ControllerStatus::READING, UpdateMode::On, true)?;
        } else {
            self.update_status(
                ControllerStatus::IDLE | ControllerStatus::READOUT_PENDING,
                UpdateMode::On,
                true,
            )?;
        }
        Ok(())
    }

    /// Resets and flushes the detector `count` times, blocking until
    /// flushing completes.
    pub async fn flush(
        &self,
        count: u32,
        wait_for: Option<Duration>,
    ) -> Result<(), ArchonError> {
        self.reset().await?;

        self.run_command("HOLDTIMING", None).await?;
        self.set_param("FlushCount", i64::from(count)).await?;
        self.set_param("DoFlush", 1).await?;
        self.run_command("RELEASETIMING", None).await?;

        self.update_status(ControllerStatus::FLUSHING, UpdateMode::On, true)?;

        let wait_for = wait_for.unwrap_or_else(|| secs(self.state.config.timeouts.flushing));
        tokio::time::sleep(wait_for * count).await;

        self.update_status(ControllerStatus::IDLE, UpdateMode::On, true)?;
        Ok(())
    }

    /// Reads the sensor into a frame buffer.
    ///
    /// Unless forced, requires the status to be exactly
    /// `IDLE | READOUT_PENDING`. When blocking, polls the frame table
    /// once per second until the write buffer reports complete; if
    /// `readout_max` elapses first, the ERROR bit is latched and the
    /// procedure fails.
    pub async fn readout(&self, options: ReadoutOptions) -> Result<(), ArchonError> {
        let expected = ControllerStatus::READOUT_PENDING | ControllerStatus::IDLE;
        if !options.force && self.status() != expected {
            return Err(ArchonError::InvalidState(
                "the controller is not in a readable state".to_string(),
            ));
        }

        self.run_command("HOLDTIMING", None).await?;
        self.set_param("ReadOut", 1).await?;
        if options.delay > 0 {
            self.set_param("WaitCount", i64::from(options.delay)).await?;
        }
        self.run_command("RESETTIMING", None).await?;
        self.run_command("RELEASETIMING", None).await?;

        self.update_status(ControllerStatus::READOUT_PENDING, UpdateMode::Off, false)?;
        self.update_status(ControllerStatus::READING, UpdateMode::On, true)?;

        if !options.block {
            return Ok(());
        }

        let max_wait = secs(self.state.config.timeouts.readout_max);
        // Minimum delay so the new frame starts filling before the
        // first poll.
        let wait_for = options.wait_for.unwrap_or(Duration::from_secs(3));
        tokio::time::sleep(wait_for).await;
        let mut waited = wait_for;

        let frame = self.get_frame().await?;
        let wbuf = frame.wbuf()?;

        loop {
            if waited > max_wait {
                self.latch_error();
                return Err(ArchonError::Timeout(
                    "waiting for the controller to finish reading".to_string(),
                ));
            }
            let frame = self.get_frame().await?;
            if frame.buffer_complete(wbuf)? {
                self.update_status(ControllerStatus::IDLE, UpdateMode::On, true)?;
                self.set_autoflush(true).await?;
                return Ok(());
            }
            waited += Duration::from_secs(1);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Fetches a completed frame buffer and returns it as a pixel
    /// array.
    ///
    /// The buffer is locked for reading, transferred in 1024-byte
    /// chunks whose total size is pre-declared to the framer, and
    /// unlocked again. The first `width * height * bytes_per_pixel`
    /// bytes of the transfer are the row-major little-endian image.
    pub async fn fetch(
        &self,
        buffer: BufferSelection,
        notifier: Option<Notifier>,
    ) -> Result<FrameImage, ArchonError> {
        if self.status().intersects(ControllerStatus::FETCHING) {
            return Err(ArchonError::InvalidState(
                "the controller is already fetching".to_string(),
            ));
        }

        let notify = |message: &str| {
            debug!(controller = %self.state.name, "{message}");
            if let Some(notifier) = &notifier {
                notifier(message);
            }
        };

        let frame = self.get_frame().await?;

        let buffer_no = match buffer {
            BufferSelection::Buffer(number) => {
                if !(1..=3).contains(&number) {
                    return Err(ArchonError::InvalidState(format!(
                        "invalid frame buffer {number}"
                    )));
                }
                if !frame.buffer_complete(i64::from(number))? {
                    return Err(ArchonError::InvalidState(format!(
                        "buffer frame {number} cannot be read"
                    )));
                }
                i64::from(number)
            }
            BufferSelection::Latest => frame.latest_complete()?.ok_or_else(|| {
                ArchonError::InvalidState("there are no buffers ready to be read".to_string())
            })?,
        };

        self.update_status(ControllerStatus::FETCHING, UpdateMode::On, true)?;

        notify(&format!("Locking buffer {buffer_no}"));
        self.run_command(&format!("LOCK{buffer_no}"), None).await?;

        let width = frame.buffer_width(buffer_no)? as usize;
        let height = frame.buffer_height(buffer_no)? as usize;
        let bytes_per_pixel = frame.buffer_bytes_per_pixel(buffer_no)? as usize;
        let n_bytes = width * height * bytes_per_pixel;
        let n_blocks = n_bytes.div_ceil(BINARY_CHUNK_SIZE);
        let start_address = frame.buffer_base(buffer_no)?;

        notify("Reading frame buffer ...");

        // Expected transfer size on the wire, headers included.
        self.set_binary_reply_size(RAW_CHUNK_SIZE * n_blocks);

        let command = self
            .send_command_with(
                &format!("FETCH{start_address:08X}{n_blocks:08X}"),
                CommandOptions {
                    timeout: None,
                    ..Default::default()
                },
            )
            .await?;
        command.wait().await;

        notify("Frame buffer readout complete. Unlocking all buffers.");
        self.run_command("LOCK0", None).await?;

        if !command.succeeded() {
            self.state.binary_reply_size.clear();
            self.latch_error();
            return Err(ArchonError::command_failed(&command));
        }

        let replies = command.replies();
        let reply = replies.first().ok_or_else(|| {
            ArchonError::InvalidReply("FETCH returned no replies".to_string())
        })?;
        let raw = reply.as_binary()?;

        // The transfer is padded up to whole chunks, only the first
        // n_bytes belong to the image.
        let image = FrameImage::from_le_bytes(&raw[..n_bytes], width, height, bytes_per_pixel)?;

        self.update_status(ControllerStatus::IDLE, UpdateMode::On, true)?;
        Ok(image)
    }

    /// Declares the total size of the next binary reply, wire headers
    /// included.
    pub fn set_binary_reply_size(&self, size: usize) {
        self.state.binary_reply_size.set(size);
    }

    // ---- power ----

    /// Switches the power supplies on or off, or just reports the
    /// power state when `mode` is `None`. Drives the POWERON, POWEROFF
    /// and POWERBAD bits from the `STATUS` readback.
    pub async fn power(&self, mode: Option<bool>) -> Result<ArchonPower, ArchonError> {
        if let Some(on) = mode {
            let command_string = if on { "POWERON" } else { "POWEROFF" };
            let command = self
                .run_command(command_string, Some(Duration::from_secs(10)))
                .await?;
            if !command.succeeded() {
                self.latch_error();
                return Err(ArchonError::command_failed(&command));
            }
            // Let the supplies settle before reading the state back.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let device_status = self.get_device_status().await?;
        let code = device_status
            .get("power")
            .and_then(StatusValue::as_i64)
            .ok_or_else(|| ArchonError::MissingKey("power".to_string()))?;
        let power = ArchonPower::from_code(code)?;
        let powergood = device_status
            .get("powergood")
            .and_then(StatusValue::as_i64)
            == Some(1);

        match power {
            ArchonPower::On if powergood => {
                self.update_status(
                    ControllerStatus::POWEROFF | ControllerStatus::POWERBAD,
                    UpdateMode::Off,
                    false,
                )?;
                self.update_status(ControllerStatus::POWERON, UpdateMode::On, true)?;
            }
            ArchonPower::Off if powergood => {
                self.update_status(
                    ControllerStatus::POWERON | ControllerStatus::POWERBAD,
                    UpdateMode::Off,
                    false,
                )?;
                self.update_status(ControllerStatus::POWEROFF, UpdateMode::On, true)?;
            }
            _ => {
                self.update_status(ControllerStatus::POWERBAD, UpdateMode::On, true)?;
            }
        }

        Ok(power)
    }
}

/// Matches `MOD<n>_TYPE` keywords, returning the module slot digits.
fn mod_type_slot(key: &str) -> Option<&str> {
    let upper_prefix = key.get(..3)?;
    if !upper_prefix.eq_ignore_ascii_case("MOD") {
        return None;
    }
    let rest = &key[3..];
    let slot = rest
        .strip_suffix("_TYPE")
        .or_else(|| rest.strip_suffix("_type"))?;
    if slot.is_empty() || !slot.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn recognizes_module_type_keywords() {
        assert_eq!(mod_type_slot("MOD1_TYPE"), Some("1"));
        assert_eq!(mod_type_slot("MOD12_TYPE"), Some("12"));
        assert_eq!(mod_type_slot("mod3_type"), Some("3"));
        assert_eq!(mod_type_slot("MOD_TYPE"), None);
        assert_eq!(mod_type_slot("MODA_TYPE"), None);
        assert_eq!(mod_type_slot("BACKPLANE_TYPE"), None);
    }
}
