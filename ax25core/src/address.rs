use std::fmt::Display;

use crate::frame::FrameError;

/// Longest permitted digipeater path.
pub const MAX_PATH_LEN: usize = 8;

/// A station address: a callsign of up to six uppercase letters and digits
/// plus a secondary station identifier from 0 to 15.
///
/// The two reserved bits default to set, matching what virtually all deployed
/// equipment transmits. The command/repeat bit is cleared by default and is
/// managed by whoever builds the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    callsign: String,
    ssid: u8,
    pub reserved_bit_5: bool,
    pub reserved_bit_6: bool,
    pub command_repeat_bit: bool,
}

impl Address {
    /// Create an address, normalising the callsign to uppercase.
    pub fn new(callsign: &str, ssid: u8) -> Result<Self, FrameError> {
        let callsign = callsign.trim().to_uppercase();
        if callsign.is_empty()
            || callsign.len() > 6
            || !callsign
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return Err(FrameError::InvalidCallsign(callsign));
        }
        if ssid > 15 {
            return Err(FrameError::InvalidSsid(ssid));
        }
        Ok(Self {
            callsign,
            ssid,
            reserved_bit_5: true,
            reserved_bit_6: true,
            command_repeat_bit: false,
        })
    }

    /// Parse the dashed form, e.g. `"K0JLB-9"`. A bare callsign means SSID 0.
    pub fn from_callsign(callsign: &str) -> Result<Self, FrameError> {
        match callsign.split_once('-') {
            Some((call, ssid)) => {
                let ssid = ssid
                    .parse::<u8>()
                    .map_err(|_| FrameError::InvalidCallsign(callsign.to_string()))?;
                Self::new(call, ssid)
            }
            None => Self::new(callsign, 0),
        }
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Canonical `CALL-SSID` form used for connection identity.
    pub fn call_with_ssid(&self) -> String {
        format!("{}-{}", self.callsign, self.ssid)
    }

    /// Decode one 7-byte address. Bit 0 of the final byte (the end-of-address
    /// marker) is ignored here; the address field handles it.
    pub fn decode(bytes: &[u8; 7]) -> Result<Self, FrameError> {
        let mut callsign = String::with_capacity(6);
        for &byte in &bytes[0..6] {
            callsign.push((byte >> 1) as char);
        }
        let ssid = (bytes[6] & 0x1E) >> 1;
        let mut address = Self::new(&callsign, ssid)?;
        address.reserved_bit_5 = bytes[6] & 0x20 != 0;
        address.reserved_bit_6 = bytes[6] & 0x40 != 0;
        address.command_repeat_bit = bytes[6] & 0x80 != 0;
        Ok(address)
    }

    /// Encode as 7 bytes: each callsign character shifted left one bit (space
    /// padded), then the SSID byte packing crb | rb6 | rb5 | ssid | 0.
    pub fn encode(&self) -> [u8; 7] {
        let mut out = [b' ' << 1; 7];
        for (i, byte) in self.callsign.bytes().enumerate() {
            out[i] = byte << 1;
        }
        let mut ssid_byte = self.ssid << 1;
        if self.reserved_bit_5 {
            ssid_byte |= 0x20;
        }
        if self.reserved_bit_6 {
            ssid_byte |= 0x40;
        }
        if self.command_repeat_bit {
            ssid_byte |= 0x80;
        }
        out[6] = ssid_byte;
        out
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ssid != 0 {
            write!(f, "{}-{}", self.callsign, self.ssid)?;
        } else {
            write!(f, "{}", self.callsign)?;
        }
        if self.command_repeat_bit {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// The complete address field of a frame: destination, source and up to eight
/// digipeaters, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressField {
    pub destination: Address,
    pub source: Address,
    pub path: Vec<Address>,
}

impl AddressField {
    pub fn new(destination: Address, source: Address) -> Self {
        Self {
            destination,
            source,
            path: Vec::new(),
        }
    }

    pub fn with_path(
        destination: Address,
        source: Address,
        path: Vec<Address>,
    ) -> Result<Self, FrameError> {
        if path.len() > MAX_PATH_LEN {
            return Err(FrameError::PathTooLong(path.len()));
        }
        Ok(Self {
            destination,
            source,
            path,
        })
    }

    /// Decode a complete address field. The caller has already located the
    /// end-of-address marker and passes exactly the address bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 14 || bytes.len() % 7 != 0 {
            return Err(FrameError::Truncated("address field"));
        }
        let destination = Address::decode(bytes[0..7].try_into().unwrap())?;
        let source = Address::decode(bytes[7..14].try_into().unwrap())?;
        let mut path = Vec::with_capacity((bytes.len() - 14) / 7);
        for chunk in bytes[14..].chunks(7) {
            path.push(Address::decode(chunk.try_into().unwrap())?);
        }
        if path.len() > MAX_PATH_LEN {
            return Err(FrameError::PathTooLong(path.len()));
        }
        Ok(Self {
            destination,
            source,
            path,
        })
    }

    /// Encode in wire order with the end-of-address marker set on the final
    /// byte only.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.destination.encode());
        out.extend_from_slice(&self.source.encode());
        for repeater in &self.path {
            out.extend_from_slice(&repeater.encode());
        }
        if let Some(last) = out.last_mut() {
            *last |= 1;
        }
        out
    }

    pub fn encoded_len(&self) -> usize {
        14 + 7 * self.path.len()
    }

    /// Address field for a response to a frame carrying this one: source and
    /// destination swap, the path reverses, the new source is marked as the
    /// responder and all other command/repeat bits clear.
    pub fn response_field(&self) -> AddressField {
        let mut source = self.destination.clone();
        source.command_repeat_bit = true;
        let mut destination = self.source.clone();
        destination.command_repeat_bit = false;
        let mut path: Vec<Address> = self.path.iter().rev().cloned().collect();
        for repeater in &mut path {
            repeater.command_repeat_bit = false;
        }
        AddressField {
            destination,
            source,
            path,
        }
    }
}

impl Display for AddressField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}",
            self.source.call_with_ssid(),
            self.destination.call_with_ssid()
        )?;
        for repeater in &self.path {
            write!(f, ",{}", repeater.call_with_ssid())?;
        }
        Ok(())
    }
}
