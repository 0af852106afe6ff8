// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level driver configuration document.
///
/// Driver parameters live in the `[nvme]` table; every key is optional and
/// takes its default when absent.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub nvme: DriverParams,
}

/// Tunables for the NVMe driver core.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DriverParams {
    /// Log verbosity.
    ///
    /// 1 - error, 2 - warning, 3 - info, 4 - verbose, 5 - debug
    pub log_level: u32,

    /// Number of Admin submission queue entries.
    pub admin_sub_queue_size: u32,

    /// Number of Admin completion queue entries.
    pub admin_cpl_queue_size: u32,

    /// Number of I/O submission queue entries.
    pub io_sub_queue_size: u32,

    /// Number of I/O completion queue entries.
    pub io_cpl_queue_size: u32,

    /// Number of command slots (and so command IDs) per queue.
    pub io_command_id_size: u32,

    /// Maximum number of I/O queue pairs requested from the controller.
    pub max_io_queues: u32,

    /// Maximum number of namespaces tracked.
    pub max_namespaces: u32,

    /// I/O command timeout in seconds. Zero disables timeout checking.
    pub io_timeout: u32,

    /// Timeout for synchronous admin commands, in milliseconds.
    pub admin_timeout_ms: u32,

    /// Upper bound on outstanding Asynchronous Event Requests.
    pub max_async_events: u32,

    /// Poll interval used while waiting on controller status changes.
    pub poll_interval_us: u32,
}

struct ParamRange {
    name: &'static str,
    default: u32,
    min: u32,
    max: u32,
}

const LOG_LEVEL: ParamRange =
    ParamRange { name: "log_level", default: 2, min: 1, max: 5 };
const ADMIN_SUB_QUEUE_SIZE: ParamRange = ParamRange {
    name: "admin_sub_queue_size",
    default: 256,
    min: 16,
    max: 256,
};
const ADMIN_CPL_QUEUE_SIZE: ParamRange = ParamRange {
    name: "admin_cpl_queue_size",
    default: 256,
    min: 16,
    max: 256,
};
const IO_SUB_QUEUE_SIZE: ParamRange = ParamRange {
    name: "io_sub_queue_size",
    default: 1024,
    min: 32,
    max: 1024,
};
const IO_CPL_QUEUE_SIZE: ParamRange = ParamRange {
    name: "io_cpl_queue_size",
    default: 1024,
    min: 32,
    max: 1024,
};
// Command IDs are 16 bits wide with 0 reserved.
const IO_COMMAND_ID_SIZE: ParamRange = ParamRange {
    name: "io_command_id_size",
    default: 1024,
    min: 16,
    max: 4095,
};
const MAX_IO_QUEUES: ParamRange =
    ParamRange { name: "max_io_queues", default: 16, min: 1, max: 16 };
const MAX_NAMESPACES: ParamRange =
    ParamRange { name: "max_namespaces", default: 1024, min: 1, max: 1024 };
const IO_TIMEOUT: ParamRange =
    ParamRange { name: "io_timeout", default: 30, min: 0, max: 120 };
const ADMIN_TIMEOUT_MS: ParamRange = ParamRange {
    name: "admin_timeout_ms",
    default: 2000,
    min: 100,
    max: 60_000,
};
const MAX_ASYNC_EVENTS: ParamRange =
    ParamRange { name: "max_async_events", default: 7, min: 1, max: 16 };
const POLL_INTERVAL_US: ParamRange = ParamRange {
    name: "poll_interval_us",
    default: 1000,
    min: 10,
    max: 100_000,
};

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            log_level: LOG_LEVEL.default,
            admin_sub_queue_size: ADMIN_SUB_QUEUE_SIZE.default,
            admin_cpl_queue_size: ADMIN_CPL_QUEUE_SIZE.default,
            io_sub_queue_size: IO_SUB_QUEUE_SIZE.default,
            io_cpl_queue_size: IO_CPL_QUEUE_SIZE.default,
            io_command_id_size: IO_COMMAND_ID_SIZE.default,
            max_io_queues: MAX_IO_QUEUES.default,
            max_namespaces: MAX_NAMESPACES.default,
            io_timeout: IO_TIMEOUT.default,
            admin_timeout_ms: ADMIN_TIMEOUT_MS.default,
            max_async_events: MAX_ASYNC_EVENTS.default,
            poll_interval_us: POLL_INTERVAL_US.default,
        }
    }
}

/// A parameter which was outside of its accepted range and has been reset
/// to its default value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Adjustment {
    pub name: &'static str,
    pub requested: u32,
    pub applied: u32,
    pub min: u32,
    pub max: u32,
}

impl std::fmt::Display for Adjustment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} = {} is outside [{}, {}], using {}",
            self.name, self.requested, self.min, self.max, self.applied
        )
    }
}

fn validate_param(
    val: &mut u32,
    range: &ParamRange,
    adjusted: &mut Vec<Adjustment>,
) {
    if *val < range.min || *val > range.max {
        adjusted.push(Adjustment {
            name: range.name,
            requested: *val,
            applied: range.default,
            min: range.min,
            max: range.max,
        });
        *val = range.default;
    }
}

impl DriverParams {
    /// Check every parameter against its accepted range, resetting those
    /// which fall outside of it to their default.
    ///
    /// Returns the list of parameters which were adjusted.
    pub fn validate(&mut self) -> Vec<Adjustment> {
        let mut adjusted = Vec::new();
        validate_param(&mut self.log_level, &LOG_LEVEL, &mut adjusted);
        validate_param(
            &mut self.admin_sub_queue_size,
            &ADMIN_SUB_QUEUE_SIZE,
            &mut adjusted,
        );
        validate_param(
            &mut self.admin_cpl_queue_size,
            &ADMIN_CPL_QUEUE_SIZE,
            &mut adjusted,
        );
        validate_param(
            &mut self.io_sub_queue_size,
            &IO_SUB_QUEUE_SIZE,
            &mut adjusted,
        );
        validate_param(
            &mut self.io_cpl_queue_size,
            &IO_CPL_QUEUE_SIZE,
            &mut adjusted,
        );
        validate_param(
            &mut self.io_command_id_size,
            &IO_COMMAND_ID_SIZE,
            &mut adjusted,
        );
        validate_param(&mut self.max_io_queues, &MAX_IO_QUEUES, &mut adjusted);
        validate_param(
            &mut self.max_namespaces,
            &MAX_NAMESPACES,
            &mut adjusted,
        );
        validate_param(&mut self.io_timeout, &IO_TIMEOUT, &mut adjusted);
        validate_param(
            &mut self.admin_timeout_ms,
            &ADMIN_TIMEOUT_MS,
            &mut adjusted,
        );
        validate_param(
            &mut self.max_async_events,
            &MAX_ASYNC_EVENTS,
            &mut adjusted,
        );
        validate_param(
            &mut self.poll_interval_us,
            &POLL_INTERVAL_US,
            &mut adjusted,
        );
        adjusted
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms as u64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us as u64)
    }
}

/// Errors which may be returned when parsing the driver configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML document into a configuration object.
pub fn from_str(raw: &str) -> Result<Config, ParseError> {
    Ok(toml::from_str::<Config>(raw)?)
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}
