//! Live capture worker
//!
//! The worker loops on a short-timeout live handle so it can notice the
//! stop flag; pcap has no cross-thread break primitive we could use from
//! the closing thread. Matching frames go straight to the savefile.

use pcap::{Active, Capture, Device};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Poll interval of the capture loop, also the worst-case extra latency
/// of a stop request.
const POLL_TIMEOUT_MS: i32 = 100;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDevice,

    #[error(transparent)]
    Pcap(#[from] pcap::Error),

    #[error("capture thread could not be spawned: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One running capture: worker thread plus its stop flag.
pub struct CaptureSession {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<u64>>,
}

impl CaptureSession {
    /// Open the device, install `filter` and start dumping matching
    /// frames to `path`.
    pub fn start(
        device: Option<&str>,
        filter: &str,
        path: &Path,
    ) -> Result<Self, CaptureError> {
        let device = match device {
            Some(name) => Device::from(name),
            None => Device::lookup()?.ok_or(CaptureError::NoDevice)?,
        };
        debug!("opening capture on {:?} with filter '{}'", device.name, filter);

        let mut capture: Capture<Active> = Capture::from_device(device)?
            .promisc(false)
            .snaplen(65535)
            .timeout(POLL_TIMEOUT_MS)
            .open()?;
        capture.filter(filter, true)?;
        let mut savefile = capture.savefile(path)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("tcpsnitch-capture".into())
            .spawn(move || {
                let mut count: u64 = 0;
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    match capture.next_packet() {
                        Ok(packet) => {
                            savefile.write(&packet);
                            count += 1;
                        }
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(err) => {
                            warn!("capture loop ended: {}", err);
                            break;
                        }
                    }
                }
                if let Err(err) = savefile.flush() {
                    warn!("could not flush capture file: {}", err);
                }
                count
            })?;

        Ok(Self {
            stop,
            worker: Some(worker),
        })
    }

    /// Stop the worker after `linger` and wait for it.
    ///
    /// The linger leaves room for the connection teardown packets to
    /// reach the filter before the loop is interrupted. Returns the
    /// number of captured frames.
    pub fn stop(mut self, linger: Duration) -> u64 {
        if !linger.is_zero() {
            std::thread::sleep(linger);
        }
        self.stop.store(true, Ordering::Release);
        let count = match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_default(),
            None => 0,
        };
        info!("capture stopped after {} packets", count);
        count
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // Dropping without stop() detaches the worker; it exits on the
        // next poll once the flag is raised.
        self.stop.store(true, Ordering::Release);
    }
}
