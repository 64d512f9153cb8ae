//! Serial command grammar of the fan controller board
//!
//! The board speaks a terse line-less ASCII protocol:
//!
//! - `$F<channel>S<duty>` sets a channel's duty, duty zero-padded to
//!   three digits (`$F0S030` = CPU fan to 30%).
//! - `!GTP` queries the mainboard temperature; the two digits at byte
//!   offset 5..7 of the response are the reading in °C.
//! - `#GPV` queries the CPU power rail; the value sits between the last
//!   `=` and the last space of the response, in milliwatts.
//! - `@GSV` queries the CPU fan tachometer.
//!
//! Responses carry no terminator; the caller reads whatever arrives
//! within the settle window.

use zf_error::{Result, ZonefanError};

use crate::validate_duty;

/// Query: mainboard temperature
pub const QUERY_BOARD_TEMP: &str = "!GTP";

/// Query: CPU power draw
pub const QUERY_CPU_POWER: &str = "#GPV";

/// Query: CPU fan speed
pub const QUERY_FAN_SPEED: &str = "@GSV";

/// Byte range of the temperature digits in a `!GTP` response
const BOARD_TEMP_OFFSET: usize = 5;
const BOARD_TEMP_LEN: usize = 2;

/// Zero-pad a value to the given width, the way the board expects duty
/// fields (`30` -> `"030"`).
pub fn pad_zero(value: u32, width: usize) -> String {
    let mut result = value.to_string();
    while result.len() < width {
        result.insert(0, '0');
    }
    result
}

/// Build the set-duty command for a channel.
pub fn set_duty_command(channel: usize, duty: u8) -> Result<String> {
    if channel > 9 {
        return Err(ZonefanError::InvalidChannel(format!("channel {}", channel)));
    }
    let duty = validate_duty(duty as i64)?;
    Ok(format!("$F{}S{}", channel, pad_zero(duty as u32, 3)))
}

/// Parse the mainboard temperature out of a `!GTP` response.
pub fn parse_board_temp(response: &str) -> Result<i32> {
    response
        .as_bytes()
        .get(BOARD_TEMP_OFFSET..BOARD_TEMP_OFFSET + BOARD_TEMP_LEN)
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(|digits| digits.parse::<i32>().ok())
        .ok_or_else(|| ZonefanError::ResponseParse {
            cmd: QUERY_BOARD_TEMP.to_string(),
            response: response.to_string(),
        })
}

/// Parse the CPU power (milliwatts) out of a `#GPV` response.
///
/// The board formats the reading as `...=<value> mW` with trailing
/// status text; the value is delimited by the last `=` and the last
/// space in the buffer.
pub fn parse_cpu_power(response: &str) -> Result<i64> {
    let start = response.rfind('=').map(|pos| pos + 1);
    let end = response.rfind(' ');
    match (start, end) {
        (Some(start), Some(end)) if start < end => response[start..end]
            .trim()
            .parse::<i64>()
            .map_err(|_| ZonefanError::ResponseParse {
                cmd: QUERY_CPU_POWER.to_string(),
                response: response.to_string(),
            }),
        _ => Err(ZonefanError::ResponseParse {
            cmd: QUERY_CPU_POWER.to_string(),
            response: response.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_command_is_zero_padded() {
        assert_eq!(set_duty_command(0, 30).unwrap(), "$F0S030");
        assert_eq!(set_duty_command(1, 5).unwrap(), "$F1S005");
        assert_eq!(set_duty_command(3, 100).unwrap(), "$F3S100");
    }

    #[test]
    fn duty_command_rejects_out_of_range() {
        assert!(set_duty_command(10, 50).is_err());
    }

    #[test]
    fn board_temp_parses_fixed_offset() {
        // Board replies e.g. "$GTP=42C ok"
        assert_eq!(parse_board_temp("$GTP=42C ok").unwrap(), 42);
        assert_eq!(parse_board_temp("$GTP=07C").unwrap(), 7);
    }

    #[test]
    fn board_temp_rejects_short_or_garbled() {
        assert!(parse_board_temp("$GTP").is_err());
        assert!(parse_board_temp("$GTP=xyC ok").is_err());
    }

    #[test]
    fn cpu_power_parses_between_delimiters() {
        assert_eq!(parse_cpu_power("#GPV P=45200 mW").unwrap(), 45_200);
        // Extra '=' earlier in the buffer: the last one wins.
        assert_eq!(parse_cpu_power("#GPV V=12 P=9000 mW").unwrap(), 9000);
    }

    #[test]
    fn cpu_power_rejects_missing_delimiters() {
        assert!(parse_cpu_power("#GPV 45200").is_err());
        assert!(parse_cpu_power("#GPV =45200mW").is_err());
    }

    #[test]
    fn pad_zero_widths() {
        assert_eq!(pad_zero(7, 3), "007");
        assert_eq!(pad_zero(100, 3), "100");
        assert_eq!(pad_zero(1234, 3), "1234");
    }
}
