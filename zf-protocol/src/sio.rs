//! SuperIO control-register interface
//!
//! Chassis variants without the serial controller board expose the fan
//! outputs through a SuperIO character device. A set operation writes a
//! `(fan_num, fan_mode, duty)` tuple; queries read back an `int`.
//!
//! Duty on this interface is the raw 0-255 PWM register value, converted
//! linearly from the 0-100 percentage the controller works in.

use zf_error::{Result, ZonefanError};

/// ioctl type byte shared by all fan requests
pub const IOC_MAGIC: u8 = b'c';

/// Register mode written alongside every duty update
pub const DEFAULT_FAN_MODE: u8 = 2;

/// Raw PWM register ceiling
pub const RAW_DUTY_MAX: u16 = 255;

// _IOC direction bits (asm-generic layout)
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u64) << IOC_TYPESHIFT)
        | ((nr as u64) << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

/// The tuple the SuperIO driver accepts for a duty update
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SioFanData {
    pub fan_num: u8,
    pub fan_mode: u8,
    pub duty: u8,
}

/// `_IOW('c', 0, struct sio_ioctl_data)` — set a channel's mode and duty
pub const IOC_COMMAND_SET: u64 = ioc(IOC_WRITE, IOC_MAGIC, 0, std::mem::size_of::<SioFanData>());

/// `_IOWR('c', 1, int)` — read back a channel's duty register
pub const IOC_COMMAND_GET: u64 =
    ioc(IOC_READ | IOC_WRITE, IOC_MAGIC, 1, std::mem::size_of::<libc_int>());

/// `_IOWR('c', 2, int)` — read a channel's tachometer
pub const IOC_COMMAND_RPM: u64 =
    ioc(IOC_READ | IOC_WRITE, IOC_MAGIC, 2, std::mem::size_of::<libc_int>());

#[allow(non_camel_case_types)]
type libc_int = i32;

/// Convert a 0-100 duty percentage to the raw 0-255 register value.
pub fn raw_from_percent(percent: u8) -> Result<u8> {
    if percent > 100 {
        return Err(ZonefanError::InvalidDuty { value: percent as i64 });
    }
    Ok((percent as u16 * RAW_DUTY_MAX / 100) as u8)
}

/// Convert a raw 0-255 register value back to a duty percentage.
pub fn percent_from_raw(raw: u8) -> u8 {
    (raw as u16 * 100 / RAW_DUTY_MAX) as u8
}

impl SioFanData {
    /// Build the set-duty tuple for a channel from a 0-100 percentage.
    pub fn set_duty(channel: usize, percent: u8) -> Result<Self> {
        if channel > u8::MAX as usize {
            return Err(ZonefanError::InvalidChannel(format!("channel {}", channel)));
        }
        Ok(Self {
            fan_num: channel as u8,
            fan_mode: DEFAULT_FAN_MODE,
            duty: raw_from_percent(percent)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_kernel_encoding() {
        // _IOW('c', 0, 3-byte struct) / _IOWR('c', 1, int) / _IOWR('c', 2, int)
        assert_eq!(IOC_COMMAND_SET, 0x4003_6300);
        assert_eq!(IOC_COMMAND_GET, 0xC004_6301);
        assert_eq!(IOC_COMMAND_RPM, 0xC004_6302);
    }

    #[test]
    fn raw_conversion_truncates_like_the_register() {
        assert_eq!(raw_from_percent(0).unwrap(), 0);
        assert_eq!(raw_from_percent(100).unwrap(), 255);
        // 50 * 255 / 100 = 127 (integer truncation)
        assert_eq!(raw_from_percent(50).unwrap(), 127);
        assert_eq!(raw_from_percent(20).unwrap(), 51);
        assert!(raw_from_percent(101).is_err());
    }

    #[test]
    fn percent_round_trip_is_lossy_but_close() {
        for percent in [0u8, 20, 50, 75, 100] {
            let raw = raw_from_percent(percent).unwrap();
            let back = percent_from_raw(raw);
            assert!((percent as i16 - back as i16).abs() <= 1);
        }
    }

    #[test]
    fn set_duty_tuple_carries_mode() {
        let data = SioFanData::set_duty(2, 40).unwrap();
        assert_eq!(data.fan_num, 2);
        assert_eq!(data.fan_mode, DEFAULT_FAN_MODE);
        assert_eq!(data.duty, 102);
    }
}
