//! Logical code channels.
//!
//! Every code entering the system belongs to one of twelve channels; each
//! channel is fully independent at the transport level and carries its own
//! execution stack on the host side.

use serde::{Deserialize, Serialize};

/// A logical input source multiplexed onto the SPI link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CodeChannel {
    Http = 0,
    Telnet = 1,
    File = 2,
    Usb = 3,
    Aux = 4,
    Daemon = 5,
    Trigger = 6,
    Queue = 7,
    Lcd = 8,
    Sbc = 9,
    AutoPause = 10,
    Unknown = 11,
}

/// Number of channels, including `Unknown`.
pub const CHANNEL_COUNT: usize = 12;

impl CodeChannel {
    /// All channels in wire order.
    pub const ALL: [CodeChannel; CHANNEL_COUNT] = [
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Daemon,
        CodeChannel::Trigger,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Sbc,
        CodeChannel::AutoPause,
        CodeChannel::Unknown,
    ];

    /// Decode a wire channel number; out-of-range values map to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        *Self::ALL.get(value as usize).unwrap_or(&CodeChannel::Unknown)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CodeChannel::Http => "HTTP",
            CodeChannel::Telnet => "Telnet",
            CodeChannel::File => "File",
            CodeChannel::Usb => "USB",
            CodeChannel::Aux => "Aux",
            CodeChannel::Daemon => "Daemon",
            CodeChannel::Trigger => "Trigger",
            CodeChannel::Queue => "Queue",
            CodeChannel::Lcd => "LCD",
            CodeChannel::Sbc => "SBC",
            CodeChannel::AutoPause => "AutoPause",
            CodeChannel::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_roundtrip() {
        for channel in CodeChannel::ALL {
            assert_eq!(CodeChannel::from_u8(channel as u8), channel);
        }
    }

    #[test]
    fn out_of_range_maps_to_unknown() {
        assert_eq!(CodeChannel::from_u8(12), CodeChannel::Unknown);
        assert_eq!(CodeChannel::from_u8(255), CodeChannel::Unknown);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&CodeChannel::AutoPause).unwrap();
        assert_eq!(json, "\"autopause\"");
        let back: CodeChannel = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(back, CodeChannel::Http);
    }
}
