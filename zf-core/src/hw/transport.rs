//! Hardware transport for fan commands
//!
//! Two chassis generations exist: one exposes the fan controller board
//! over a serial line speaking the textual `$F<ch>S<ddd>` grammar, the
//! other exposes SuperIO fan registers through a char-device ioctl.
//! Both sit behind [`FanTransport`] so the control loop is agnostic.
//!
//! Calls are blocking with a fixed post-write settle delay and no read
//! timeout of their own; a device that never responds stalls the loop.
//! That limitation is inherited from the controller boards, which have
//! no framing to time out against.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use zf_error::{Result, ZonefanError};
use zf_protocol::serial::set_duty_command;
use zf_protocol::sio::{SioFanData, IOC_COMMAND_GET, IOC_COMMAND_RPM, IOC_COMMAND_SET};
use zf_protocol::MAX_RESPONSE_SIZE;

#[cfg(test)]
use mockall::automock;

/// Byte-oriented command channel to the fan hardware
#[cfg_attr(test, automock)]
pub trait FanTransport: Send {
    /// Open the underlying device. Fatal to the daemon when this fails
    /// at startup or at automatic-mode resume.
    fn open(&mut self) -> Result<()>;

    /// Release the underlying device so another process may claim it.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Command a channel to the given duty percentage.
    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<()>;

    /// Issue a textual query and return the raw response.
    fn query(&mut self, cmd: &str) -> Result<String>;
}

// ============================================================================
// Serial controller board
// ============================================================================

/// Serial transport: 115200 8N1, raw mode, non-blocking reads after a
/// fixed settle delay.
pub struct SerialTransport {
    device: PathBuf,
    settle: Duration,
    file: Option<File>,
}

impl SerialTransport {
    pub fn new(device: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            device: device.into(),
            settle,
            file: None,
        }
    }

    fn configure_line(&self, file: &File) -> Result<()> {
        let fd = file.as_raw_fd();
        // SAFETY: tcgetattr/tcsetattr operate on a valid, open fd and a
        // properly initialized termios struct.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                return Err(self.setup_error("tcgetattr failed"));
            }

            libc::cfsetispeed(&mut tio, libc::B115200);
            libc::cfsetospeed(&mut tio, libc::B115200);

            // 8N1, receiver on, modem lines ignored
            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            tio.c_cflag &= !libc::CSIZE;
            tio.c_cflag |= libc::CS8;
            tio.c_cflag &= !libc::PARENB;
            tio.c_cflag &= !libc::CSTOPB;

            // Raw in both directions, no flow control
            tio.c_iflag &= !(libc::ICRNL
                | libc::INLCR
                | libc::IGNCR
                | libc::INPCK
                | libc::IXON
                | libc::IXOFF
                | libc::IXANY);
            tio.c_oflag &= !(libc::OPOST | libc::ONLCR | libc::OCRNL);
            tio.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);

            tio.c_cc[libc::VTIME] = 1;
            tio.c_cc[libc::VMIN] = 1;

            libc::tcflush(fd, libc::TCIFLUSH);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(self.setup_error("tcsetattr failed"));
            }
        }
        Ok(())
    }

    fn setup_error(&self, reason: &str) -> ZonefanError {
        ZonefanError::SerialSetup {
            device: self.device.clone(),
            reason: reason.to_string(),
        }
    }
}

impl FanTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NDELAY)
            .open(&self.device)
            .map_err(|e| ZonefanError::TransportOpen {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;
        self.configure_line(&file)?;
        self.file = Some(file);
        debug!("serial transport open on {:?}", self.device);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<()> {
        let cmd = set_duty_command(channel, duty)?;
        self.query(&cmd).map(|_| ())
    }

    fn query(&mut self, cmd: &str) -> Result<String> {
        let file = self.file.as_mut().ok_or(ZonefanError::TransportNotOpen)?;

        file.write_all(cmd.as_bytes())
            .map_err(|e| ZonefanError::CommandWrite {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            })?;

        // The board needs a moment before its response is readable.
        std::thread::sleep(self.settle);

        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        match file.read(&mut buf) {
            Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            // Non-blocking read with nothing queued: set commands are not
            // always acknowledged.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(String::new()),
            Err(e) => Err(ZonefanError::CommandRead {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// SuperIO register interface
// ============================================================================

/// ioctl transport against the SuperIO char device. The device is opened
/// per call, so `open`/`close` only gate whether calls are permitted;
/// that is all the mode arbitration needs.
pub struct IoctlTransport {
    device: PathBuf,
    enabled: bool,
}

impl IoctlTransport {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            enabled: false,
        }
    }

    fn run_ioctl(&self, request: u64, arg: *mut libc::c_void) -> Result<()> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| ZonefanError::TransportOpen {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;
        // SAFETY: the fd is valid for the duration of the call and arg
        // points at a live object of the size the request encodes.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as libc::c_ulong, arg) };
        if ret != 0 {
            return Err(ZonefanError::Ioctl {
                request,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    /// Read back a channel's raw duty register.
    pub fn read_raw_duty(&self, channel: usize) -> Result<i32> {
        let mut value = channel as i32;
        self.run_ioctl(IOC_COMMAND_GET, &mut value as *mut i32 as *mut libc::c_void)?;
        Ok(value)
    }

    /// Read a channel's tachometer.
    pub fn read_rpm(&self, channel: usize) -> Result<i32> {
        let mut value = channel as i32;
        self.run_ioctl(IOC_COMMAND_RPM, &mut value as *mut i32 as *mut libc::c_void)?;
        Ok(value)
    }
}

impl FanTransport for IoctlTransport {
    fn open(&mut self) -> Result<()> {
        // Probe the device so a missing driver is fatal at startup, like
        // a missing serial node would be.
        File::options()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| ZonefanError::TransportOpen {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;
        self.enabled = true;
        Ok(())
    }

    fn close(&mut self) {
        self.enabled = false;
    }

    fn is_open(&self) -> bool {
        self.enabled
    }

    fn set_duty(&mut self, channel: usize, duty: u8) -> Result<()> {
        if !self.enabled {
            return Err(ZonefanError::TransportNotOpen);
        }
        let mut data = SioFanData::set_duty(channel, duty)?;
        self.run_ioctl(
            IOC_COMMAND_SET,
            &mut data as *mut SioFanData as *mut libc::c_void,
        )
    }

    fn query(&mut self, cmd: &str) -> Result<String> {
        Err(ZonefanError::NotSupported(format!(
            "textual query {:?} on the SuperIO register interface",
            cmd
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_rejects_commands_while_closed() {
        let mut transport =
            SerialTransport::new("/dev/null", Duration::from_millis(1));
        assert!(!transport.is_open());
        assert!(matches!(
            transport.set_duty(0, 30),
            Err(ZonefanError::TransportNotOpen)
        ));
        assert!(matches!(
            transport.query("!GTP"),
            Err(ZonefanError::TransportNotOpen)
        ));
    }

    #[test]
    fn ioctl_rejects_commands_while_closed() {
        let mut transport = IoctlTransport::new("/dev/null");
        assert!(matches!(
            transport.set_duty(2, 50),
            Err(ZonefanError::TransportNotOpen)
        ));
    }

    #[test]
    fn ioctl_query_is_unsupported() {
        let mut transport = IoctlTransport::new("/dev/null");
        transport.enabled = true;
        assert!(matches!(
            transport.query("!GTP"),
            Err(ZonefanError::NotSupported(_))
        ));
    }
}
