// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed views of the device report commands.
//!
//! `SYSTEM`, `STATUS` and `FRAME` all answer with one line of
//! space-separated `KEY=VALUE` tokens. The helpers here split those
//! lines and map the enumerated codes the device uses for module types
//! and the power state.

use crate::error::ArchonError;

/// Splits a `KEY=VALUE KEY=VALUE ...` report line.
pub(crate) fn parse_keywords(reply: &str) -> Result<Vec<(String, String)>, ArchonError> {
    reply
        .split_whitespace()
        .map(|token| {
            token
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    ArchonError::InvalidReply(format!("keyword {token:?} is not KEY=VALUE"))
                })
        })
        .collect()
}

/// A value from the `STATUS` report, which mixes integer counters with
/// floating point sensor readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusValue {
    Int(i64),
    Float(f64),
}

impl StatusValue {
    /// Parses a token as an integer when it is an integer literal with
    /// an optional leading sign, and as a float otherwise.
    pub fn parse(token: &str) -> Result<Self, ArchonError> {
        let digits = token.strip_prefix(['-', '+']).unwrap_or(token);
        if !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit()) {
            let value = token
                .parse::<i64>()
                .map_err(|_| ArchonError::InvalidReply(format!("bad integer {token:?}")))?;
            return Ok(StatusValue::Int(value));
        }
        let value = token
            .parse::<f64>()
            .map_err(|_| ArchonError::InvalidReply(format!("bad number {token:?}")))?;
        Ok(StatusValue::Float(value))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StatusValue::Int(value) => Some(*value),
            StatusValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            StatusValue::Int(value) => *value as f64,
            StatusValue::Float(value) => *value,
        }
    }
}

/// Backplane module types reported by `SYSTEM` as `MOD<n>_TYPE` codes.
///
/// Code 6 is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModType {
    None = 0,
    Driver = 1,
    Ad = 2,
    Lvbias = 3,
    Hvbias = 4,
    Heater = 5,
    Hs = 7,
    Hvxbias = 8,
    Lvxbias = 9,
    Lvds = 10,
    Heaterx = 11,
    Xvbias = 12,
    Adf = 13,
    Adx = 14,
    Adln = 15,
    Unknown = 16,
}

impl ModType {
    pub fn from_code(code: i64) -> Result<Self, ArchonError> {
        let mod_type = match code {
            0 => ModType::None,
            1 => ModType::Driver,
            2 => ModType::Ad,
            3 => ModType::Lvbias,
            4 => ModType::Hvbias,
            5 => ModType::Heater,
            7 => ModType::Hs,
            8 => ModType::Hvxbias,
            9 => ModType::Lvxbias,
            10 => ModType::Lvds,
            11 => ModType::Heaterx,
            12 => ModType::Xvbias,
            13 => ModType::Adf,
            14 => ModType::Adx,
            15 => ModType::Adln,
            16 => ModType::Unknown,
            _ => {
                return Err(ArchonError::InvalidReply(format!(
                    "unknown module type code {code}"
                )))
            }
        };
        Ok(mod_type)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModType::None => "NONE",
            ModType::Driver => "DRIVER",
            ModType::Ad => "AD",
            ModType::Lvbias => "LVBIAS",
            ModType::Hvbias => "HVBIAS",
            ModType::Heater => "HEATER",
            ModType::Hs => "HS",
            ModType::Hvxbias => "HVXBIAS",
            ModType::Lvxbias => "LVXBIAS",
            ModType::Lvds => "LVDS",
            ModType::Heaterx => "HEATERX",
            ModType::Xvbias => "XVBIAS",
            ModType::Adf => "ADF",
            ModType::Adx => "ADX",
            ModType::Adln => "ADLN",
            ModType::Unknown => "UNKNOWN",
        }
    }
}

/// Power state reported by `STATUS` in the `POWER` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchonPower {
    Unknown = 0,
    NotConfigured = 1,
    Off = 2,
    Intermediate = 3,
    On = 4,
    Standby = 5,
}

impl ArchonPower {
    pub fn from_code(code: i64) -> Result<Self, ArchonError> {
        let power = match code {
            0 => ArchonPower::Unknown,
            1 => ArchonPower::NotConfigured,
            2 => ArchonPower::Off,
            3 => ArchonPower::Intermediate,
            4 => ArchonPower::On,
            5 => ArchonPower::Standby,
            _ => {
                return Err(ArchonError::InvalidReply(format!(
                    "unknown power status code {code}"
                )))
            }
        };
        Ok(power)
    }
}
