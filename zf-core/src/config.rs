//! Control-params store
//!
//! The daemon and the manual CLI coordinate through one flock-guarded
//! JSON file. The daemon polls it at ~1 Hz and replaces its in-memory
//! snapshot wholesale; the CLI rewrites it to flip the operating mode.
//! A file that fails to parse is regenerated from defaults rather than
//! left to wedge both processes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use zf_error::{Result, ZonefanError};
use zf_protocol::{ControlParams, Strategy, TransportKind};

use crate::constants::timing;

/// Deployment-level choices read once at daemon startup. The hot-polled
/// part of the record is only `mode` and the bus-id list.
#[derive(Debug, Clone)]
pub struct DeploymentProfile {
    pub strategy: Strategy,
    pub transport: TransportKind,
    pub system_fan: bool,
    pub target_step_offset: u8,
}

impl From<&ControlParams> for DeploymentProfile {
    fn from(params: &ControlParams) -> Self {
        Self {
            strategy: params.strategy,
            transport: params.transport.clone(),
            system_fan: params.system_fan,
            target_step_offset: params.target_step_offset,
        }
    }
}

/// The snapshot shared between the poll thread (writer) and the control
/// thread (reader). Writes are infrequent, reads are cheap clones of a
/// small record.
#[derive(Debug)]
pub struct SharedParams {
    inner: RwLock<ControlParams>,
}

impl SharedParams {
    pub fn new(initial: ControlParams) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    /// Replace the snapshot wholesale.
    pub fn update(&self, params: ControlParams) {
        *self.inner.write() = params;
    }

    pub fn snapshot(&self) -> ControlParams {
        self.inner.read().clone()
    }

    /// True when the operator has the daemon in automatic mode.
    pub fn mode(&self) -> bool {
        self.inner.read().mode
    }

    pub fn bus_ids(&self) -> Vec<i32> {
        self.inner.read().card_fan_bus_id_list.clone()
    }
}

/// Advisory lock held for the lifetime of the guard
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn shared(file: &'a File, path: &Path) -> Result<Self> {
        Self::acquire(file, path, libc::LOCK_SH)
    }

    fn exclusive(file: &'a File, path: &Path) -> Result<Self> {
        Self::acquire(file, path, libc::LOCK_EX)
    }

    fn acquire(file: &'a File, path: &Path, operation: libc::c_int) -> Result<Self> {
        // SAFETY: flock on a valid open fd; blocks until the lock is granted.
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret != 0 {
            return Err(ZonefanError::FileLock(path.to_path_buf()));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: unlocking an fd this process locked.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Reader/writer for the on-disk params record
pub struct ParamsStore {
    path: PathBuf,
}

impl ParamsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record under a shared lock.
    pub fn load(&self) -> Result<ControlParams> {
        let file = File::open(&self.path).map_err(|source| ZonefanError::FileRead {
            path: self.path.clone(),
            source,
        })?;
        let _lock = FileLock::shared(&file, &self.path)?;
        let mut text = String::new();
        (&file).read_to_string(&mut text).map_err(|source| ZonefanError::FileRead {
            path: self.path.clone(),
            source,
        })?;
        ControlParams::from_json(&text)
    }

    /// Write a record under an exclusive lock.
    pub fn write(&self, params: &ControlParams) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ZonefanError::FileWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| ZonefanError::FileWrite {
                path: self.path.clone(),
                source,
            })?;
        let _lock = FileLock::exclusive(&file, &self.path)?;
        file.set_len(0).map_err(|source| ZonefanError::FileWrite {
            path: self.path.clone(),
            source,
        })?;
        let text = params.to_json()?;
        (&file)
            .write_all(text.as_bytes())
            .and_then(|_| (&file).write_all(b"\n"))
            .map_err(|source| ZonefanError::FileWrite {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Regenerate the default record in place.
    pub fn write_default(&self) -> Result<ControlParams> {
        let params = ControlParams::default();
        self.write(&params)?;
        info!("wrote default params file at {:?}", self.path);
        Ok(params)
    }

    /// Load the record, creating or regenerating the default when the
    /// file is missing or unparsable. Used once at daemon startup.
    pub fn ensure(&self) -> Result<ControlParams> {
        if !self.path.exists() {
            return self.write_default();
        }
        match self.load() {
            Ok(params) => Ok(params),
            Err(e) => {
                warn!("params file unusable ({}), regenerating default", e);
                self.write_default()
            }
        }
    }

    /// Poll the record until shutdown, replacing the shared snapshot on
    /// every successful read. Unparsable content is repaired in place;
    /// the previous snapshot stays active meanwhile.
    pub fn poll_loop(&self, shared: &SharedParams, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.load() {
                Ok(params) => shared.update(params),
                Err(e) => {
                    warn!("params poll failed ({}), regenerating default", e);
                    if let Err(e) = self.write_default() {
                        warn!("could not regenerate params file: {}", e);
                    }
                }
            }
            std::thread::sleep(timing::MODE_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ParamsStore {
        ParamsStore::new(dir.path().join("params.json"))
    }

    #[test]
    fn ensure_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let params = store.ensure().unwrap();
        assert!(params.mode);
        assert_eq!(store.load().unwrap(), params);
    }

    #[test]
    fn ensure_repairs_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();
        let params = store.ensure().unwrap();
        assert_eq!(params, ControlParams::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut params = ControlParams::default();
        params.mode = false;
        params.card_fan_bus_id_list = vec![7, -1];
        store.write(&params).unwrap();
        assert_eq!(store.load().unwrap(), params);
    }

    #[test]
    fn rewrite_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut long = ControlParams::default();
        long.card_fan_bus_id_list = vec![1, 2, 3, 4, 5, 6, 7, 8];
        store.write(&long).unwrap();
        store.write(&ControlParams::default()).unwrap();
        assert_eq!(store.load().unwrap(), ControlParams::default());
    }

    #[test]
    fn shared_params_snapshot_is_wholesale() {
        let shared = SharedParams::new(ControlParams::default());
        assert!(shared.mode());
        let mut next = ControlParams::default();
        next.mode = false;
        next.card_fan_bus_id_list = vec![9];
        shared.update(next);
        assert!(!shared.mode());
        assert_eq!(shared.bus_ids(), vec![9]);
    }
}
