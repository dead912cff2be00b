// RFC 2347/2348/2349 - TFTP Options
//
// Each negotiator reads the client's raw value, applies its own bounds and
// reports what to advertise back in the OACK. Only options the client
// actually asked for are advertised.

use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TftpError};

pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// An option value as advertised in the OACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedOption {
    Timeout(u64),
    BlockSize(usize),
    TransferSize(u64),
}

impl NegotiatedOption {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiatedOption::Timeout(_) => "timeout",
            NegotiatedOption::BlockSize(_) => "blksize",
            NegotiatedOption::TransferSize(_) => "tsize",
        }
    }

    pub fn value(&self) -> String {
        match self {
            NegotiatedOption::Timeout(secs) => secs.to_string(),
            NegotiatedOption::BlockSize(size) => size.to_string(),
            NegotiatedOption::TransferSize(size) => size.to_string(),
        }
    }
}

/// Collect the requested options, or `None` when the client asked for none
/// and option acknowledgment must be skipped.
pub fn gather(
    negotiated: impl IntoIterator<Item = Option<NegotiatedOption>>,
) -> Option<Vec<NegotiatedOption>> {
    let requested: Vec<_> = negotiated.into_iter().flatten().collect();
    (!requested.is_empty()).then_some(requested)
}

/// RFC 2349 - Timeout Interval Option.
///
/// Values outside `1..=255` seconds are ignored rather than rejected: the
/// transfer proceeds with the server default and no `timeout` in the OACK.
#[derive(Debug, Clone, Copy)]
pub struct AckTimeout {
    requested_secs: u8,
    default: Duration,
}

impl AckTimeout {
    pub fn from_options(options: &HashMap<String, String>, default: Duration) -> Self {
        let requested_secs = match options.get("timeout") {
            None => 0,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => match u8::try_from(secs) {
                    Ok(secs) if secs >= 1 => secs,
                    _ => {
                        warn!("Ignore invalid timeout value {}", secs);
                        0
                    }
                },
                Err(_) => {
                    warn!("Ignore unparseable timeout value {:?}", raw);
                    0
                }
            },
        };
        Self {
            requested_secs,
            default,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested_secs > 0
    }

    pub fn value(&self) -> Duration {
        if self.is_requested() {
            Duration::from_secs(u64::from(self.requested_secs))
        } else {
            self.default
        }
    }

    pub fn requested(&self) -> Option<NegotiatedOption> {
        self.is_requested()
            .then(|| NegotiatedOption::Timeout(u64::from(self.requested_secs)))
    }
}

/// RFC 2348 - Block Size Option.
///
/// An unsupported size rejects the whole request: serving it could produce
/// datagrams the client cannot frame.
#[derive(Debug, Clone, Copy)]
pub struct BlockSize {
    requested: Option<usize>,
}

impl BlockSize {
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let Some(raw) = options.get("blksize") else {
            return Ok(Self { requested: None });
        };
        let size = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| TftpError::undefined(format!("Unsupported block size {}", raw)))?;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
            return Err(TftpError::undefined(format!(
                "Unsupported block size {}",
                size
            )));
        }
        Ok(Self {
            requested: Some(size),
        })
    }

    pub fn value(&self) -> usize {
        self.requested.unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    pub fn requested(&self) -> Option<NegotiatedOption> {
        self.requested.map(NegotiatedOption::BlockSize)
    }
}

/// RFC 2349 - Transfer Size Option.
#[derive(Debug, Clone, Copy)]
pub struct FileSize {
    requested: bool,
    size: Option<u64>,
}

impl FileSize {
    pub fn is_requested_in(options: &HashMap<String, String>) -> bool {
        options.contains_key("tsize")
    }

    /// `size` is the open file's length, looked up only when requested.
    pub fn from_options(options: &HashMap<String, String>, size: Option<u64>) -> Self {
        let requested = Self::is_requested_in(options);
        Self {
            requested,
            size: if requested { size } else { None },
        }
    }

    pub fn requested(&self) -> Option<NegotiatedOption> {
        // An unknown size is advertised as 0.
        self.requested
            .then(|| NegotiatedOption::TransferSize(self.size.unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn timeout_within_bounds_is_advertised() {
        let timeout = AckTimeout::from_options(&options(&[("timeout", "3")]), DEFAULT_ACK_TIMEOUT);
        assert_eq!(timeout.value(), Duration::from_secs(3));
        assert_eq!(timeout.requested(), Some(NegotiatedOption::Timeout(3)));

        let timeout =
            AckTimeout::from_options(&options(&[("timeout", "255")]), DEFAULT_ACK_TIMEOUT);
        assert_eq!(timeout.requested(), Some(NegotiatedOption::Timeout(255)));
    }

    #[test]
    fn timeout_out_of_bounds_falls_back_to_default() {
        for raw in ["0", "256", "-1", "soon", ""] {
            let timeout =
                AckTimeout::from_options(&options(&[("timeout", raw)]), DEFAULT_ACK_TIMEOUT);
            assert!(!timeout.is_requested(), "{raw} must not be accepted");
            assert_eq!(timeout.value(), DEFAULT_ACK_TIMEOUT);
            assert_eq!(timeout.requested(), None);
        }
    }

    #[test]
    fn block_size_bounds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let size = BlockSize::from_options(&options(&[]))?;
        assert_eq!(size.value(), DEFAULT_BLOCK_SIZE);
        assert_eq!(size.requested(), None);

        let size = BlockSize::from_options(&options(&[("blksize", "1468")]))?;
        assert_eq!(size.value(), 1468);
        assert_eq!(size.requested(), Some(NegotiatedOption::BlockSize(1468)));

        assert_eq!(BlockSize::from_options(&options(&[("blksize", "8")]))?.value(), 8);
        assert_eq!(
            BlockSize::from_options(&options(&[("blksize", "65464")]))?.value(),
            65464
        );
        Ok(())
    }

    #[test]
    fn block_size_out_of_bounds_rejects_request() {
        for raw in ["7", "65465", "big"] {
            match BlockSize::from_options(&options(&[("blksize", raw)])) {
                Err(TftpError::Protocol { code, message }) => {
                    assert_eq!(code, crate::error::ErrorCode::Undefined);
                    assert!(message.starts_with("Unsupported block size"));
                }
                other => panic!("{raw}: unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn file_size_only_when_requested() {
        let size = FileSize::from_options(&options(&[("tsize", "0")]), Some(5120));
        assert_eq!(size.requested(), Some(NegotiatedOption::TransferSize(5120)));

        let size = FileSize::from_options(&options(&[("tsize", "0")]), None);
        assert_eq!(size.requested(), Some(NegotiatedOption::TransferSize(0)));

        let size = FileSize::from_options(&options(&[]), Some(5120));
        assert_eq!(size.requested(), None);
    }

    #[test]
    fn gather_skips_unrequested() {
        assert_eq!(gather([None, None, None]), None);
        assert_eq!(
            gather([None, Some(NegotiatedOption::BlockSize(1024)), None]),
            Some(vec![NegotiatedOption::BlockSize(1024)])
        );
    }
}
