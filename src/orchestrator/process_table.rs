//! OS process table access for the supervisor.
//!
//! [`ProcessTable`] is the seam between the supervisor and the operating
//! system: enumeration by executable name, per-pid resource sampling and
//! best-effort termination. [`SysinfoTable`] is the production
//! implementation; tests substitute an in-memory table.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Instant;

use sysinfo::{Pid, Process, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::{AppError, Result};

/// Linux truncates the kernel process name (`comm`) to this many bytes.
const COMM_LEN: usize = 15;

/// A process found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// OS pid.
    pub pid: u32,
    /// Process name as reported by the OS.
    pub name: String,
    /// Full command line, program first.
    pub args: Vec<String>,
}

/// Resource usage of one process at refresh time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    /// CPU usage since the previous refresh, in percent of one core.
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub resident_memory_bytes: u64,
    /// OS scheduler state.
    pub os_state: String,
}

/// Read and act on the OS process table.
pub trait ProcessTable: Send {
    /// Re-read the process table. Other methods see the last refresh.
    ///
    /// May block; async callers run it on the blocking pool.
    fn refresh(&mut self);

    /// Processes whose executable is called `name`.
    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry>;

    /// Resource sample for `pid`, or `None` if it no longer exists.
    fn sample(&self, pid: u32) -> Option<ProcessSample>;

    /// Terminate `pid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the process is gone and
    /// `AppError::Io` if the signal could not be delivered.
    fn terminate(&mut self, pid: u32) -> Result<()>;
}

/// [`ProcessTable`] backed by `sysinfo`.
///
/// CPU usage is a delta between two readings, so a refresh waits until at
/// least [`MINIMUM_CPU_UPDATE_INTERVAL`] has passed since the previous one.
pub struct SysinfoTable {
    system: System,
    last_refresh: Instant,
}

impl std::fmt::Debug for SysinfoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoTable").finish_non_exhaustive()
    }
}

impl SysinfoTable {
    /// Create a table and take an initial reading.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_all();
        Self {
            system,
            last_refresh: Instant::now(),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn refresh(&mut self) {
        let since = self.last_refresh.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.system.refresh_all();
        self.last_refresh = Instant::now();
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        let mut found: Vec<ProcessEntry> = self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| matches_name(process, name))
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                args: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
            .collect();
        found.sort_by_key(|entry| entry.pid);
        found
    }

    fn sample(&self, pid: u32) -> Option<ProcessSample> {
        self.system
            .process(Pid::from_u32(pid))
            .map(|process| ProcessSample {
                cpu_percent: process.cpu_usage(),
                resident_memory_bytes: process.memory(),
                os_state: process.status().to_string().to_lowercase(),
            })
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        let process = self
            .system
            .process(Pid::from_u32(pid))
            .ok_or_else(|| AppError::NotFound(format!("process {pid} is gone")))?;

        if process.kill() {
            Ok(())
        } else {
            Err(AppError::Io(format!("failed to kill process {pid}")))
        }
    }
}

/// Match on the OS name, allowing for `comm` truncation, or on the file
/// name of the program in the command line.
fn matches_name(process: &Process, name: &str) -> bool {
    let os_name = process.name().to_string_lossy();
    if name_matches(&os_name, name) {
        return true;
    }

    process
        .cmd()
        .first()
        .and_then(|program| Path::new(program).file_name())
        .is_some_and(|program| program == OsStr::new(name))
}

/// Compare a reported process name with the wanted executable name.
#[must_use]
pub fn name_matches(reported: &str, wanted: &str) -> bool {
    if wanted.is_empty() {
        return false;
    }
    reported == wanted || (reported.len() == COMM_LEN && wanted.starts_with(reported))
}

/// Whether `args` carries every flag in `required`.
///
/// With no required flags nothing can be judged non-headless, so every
/// command line passes.
#[must_use]
pub fn has_headless_flags(args: &[String], required: &[String]) -> bool {
    required
        .iter()
        .all(|flag| args.iter().skip(1).any(|arg| arg == flag))
}
