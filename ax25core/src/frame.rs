use thiserror::Error;

use crate::address::AddressField;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("callsign must be 1-6 uppercase ASCII letters or digits: {0:?}")]
    InvalidCallsign(String),
    #[error("SSID must be between 0 and 15 inclusive: {0}")]
    InvalidSsid(u8),
    #[error("digipeater path may hold at most 8 addresses: {0}")]
    PathTooLong(usize),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unrecognised unnumbered control pattern: {0:#04x}")]
    InvalidControl(u8),
    #[error("unrecognised PID: {0:#04x}")]
    InvalidPid(u8),
    #[error("modulo-128 frames are not supported")]
    UnsupportedModulo,
}

/// Sequence numbering scheme for a link. Only modulo-8 control fields are
/// implemented; every codec entry point refuses `Mod128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulo {
    Mod8,
    Mod128,
}

/// Layer 3 protocol identifier, present on I and UI frames only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    None,
    Iso8208,
    TcpCompressed,
    TcpUncompressed,
    Fragment,
    Texnet,
    Lqp,
    Appletalk,
    AppletalkArp,
    ArpaIp,
    ArpaAddr,
    Flexnet,
    Netrom,
    NoLayer3,
    Escape,
}

impl Pid {
    pub fn from_proto(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x00 => Pid::None,
            0x01 => Pid::Iso8208,
            0x06 => Pid::TcpCompressed,
            0x07 => Pid::TcpUncompressed,
            0x08 => Pid::Fragment,
            0xC3 => Pid::Texnet,
            0xC4 => Pid::Lqp,
            0xCA => Pid::Appletalk,
            0xCB => Pid::AppletalkArp,
            0xCC => Pid::ArpaIp,
            0xCD => Pid::ArpaAddr,
            0xCE => Pid::Flexnet,
            0xCF => Pid::Netrom,
            0xF0 => Pid::NoLayer3,
            0xFF => Pid::Escape,
            _ => return Err(FrameError::InvalidPid(value)),
        })
    }

    pub fn proto_value(&self) -> u8 {
        match self {
            Pid::None => 0x00,
            Pid::Iso8208 => 0x01,
            Pid::TcpCompressed => 0x06,
            Pid::TcpUncompressed => 0x07,
            Pid::Fragment => 0x08,
            Pid::Texnet => 0xC3,
            Pid::Lqp => 0xC4,
            Pid::Appletalk => 0xCA,
            Pid::AppletalkArp => 0xCB,
            Pid::ArpaIp => 0xCC,
            Pid::ArpaAddr => 0xCD,
            Pid::Flexnet => 0xCE,
            Pid::Netrom => 0xCF,
            Pid::NoLayer3 => 0xF0,
            Pid::Escape => 0xFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryKind {
    ReceiveReady,
    ReceiveNotReady,
    Reject,
    SelectiveReject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnnumberedKind {
    Sabme,
    Sabm,
    Disconnect,
    DisconnectedMode,
    UnnumberedAck,
    FrameReject,
    UnnumberedInfo,
    ExchangeId,
    Test,
}

/// Modulo-8 control field. The frame family is a tagged sum so that a
/// supervisory frame cannot carry a send sequence, nor an unnumbered frame
/// either sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlField {
    Information {
        sequence: u8,
        receive: u8,
        poll: bool,
    },
    Supervisory {
        kind: SupervisoryKind,
        receive: u8,
        poll_final: bool,
    },
    Unnumbered {
        kind: UnnumberedKind,
        poll_final: bool,
    },
}

impl ControlField {
    pub fn decode(byte: u8) -> Result<Self, FrameError> {
        let poll_final = byte & 0x10 != 0;
        Ok(match byte & 0x03 {
            0 | 2 => ControlField::Information {
                sequence: (byte & 0x0E) >> 1,
                receive: (byte & 0xE0) >> 5,
                poll: poll_final,
            },
            1 => ControlField::Supervisory {
                kind: match byte & 0x0C {
                    0x00 => SupervisoryKind::ReceiveReady,
                    0x04 => SupervisoryKind::ReceiveNotReady,
                    0x08 => SupervisoryKind::Reject,
                    _ => SupervisoryKind::SelectiveReject,
                },
                receive: (byte & 0xE0) >> 5,
                poll_final,
            },
            _ => ControlField::Unnumbered {
                kind: match byte & 0xEC {
                    0x6C => UnnumberedKind::Sabme,
                    0x2C => UnnumberedKind::Sabm,
                    0x40 => UnnumberedKind::Disconnect,
                    0x0C => UnnumberedKind::DisconnectedMode,
                    0x60 => UnnumberedKind::UnnumberedAck,
                    0x84 => UnnumberedKind::FrameReject,
                    0x00 => UnnumberedKind::UnnumberedInfo,
                    0xAC => UnnumberedKind::ExchangeId,
                    0xE0 => UnnumberedKind::Test,
                    _ => return Err(FrameError::InvalidControl(byte)),
                },
                poll_final,
            },
        })
    }

    pub fn encode(&self) -> u8 {
        match *self {
            ControlField::Information {
                sequence,
                receive,
                poll,
            } => (sequence << 1) | ((poll as u8) << 4) | (receive << 5),
            ControlField::Supervisory {
                kind,
                receive,
                poll_final,
            } => {
                let kind_bits = match kind {
                    SupervisoryKind::ReceiveReady => 0x00,
                    SupervisoryKind::ReceiveNotReady => 0x04,
                    SupervisoryKind::Reject => 0x08,
                    SupervisoryKind::SelectiveReject => 0x0C,
                };
                0x01 | kind_bits | ((poll_final as u8) << 4) | (receive << 5)
            }
            ControlField::Unnumbered { kind, poll_final } => {
                let kind_bits = match kind {
                    UnnumberedKind::Sabme => 0x6C,
                    UnnumberedKind::Sabm => 0x2C,
                    UnnumberedKind::Disconnect => 0x40,
                    UnnumberedKind::DisconnectedMode => 0x0C,
                    UnnumberedKind::UnnumberedAck => 0x60,
                    UnnumberedKind::FrameReject => 0x84,
                    UnnumberedKind::UnnumberedInfo => 0x00,
                    UnnumberedKind::ExchangeId => 0xAC,
                    UnnumberedKind::Test => 0xE0,
                };
                0x03 | kind_bits | ((poll_final as u8) << 4)
            }
        }
    }

    pub fn poll_final(&self) -> bool {
        match *self {
            ControlField::Information { poll, .. } => poll,
            ControlField::Supervisory { poll_final, .. } => poll_final,
            ControlField::Unnumbered { poll_final, .. } => poll_final,
        }
    }

    /// I and UI frames carry a PID byte; nothing else does.
    pub fn has_pid(&self) -> bool {
        matches!(
            self,
            ControlField::Information { .. }
                | ControlField::Unnumbered {
                    kind: UnnumberedKind::UnnumberedInfo,
                    ..
                }
        )
    }
}

/// A complete AX.25 frame as carried in the data field of a KISS frame
/// (no flags, no FCS - KISS strips both).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    pub address_field: AddressField,
    pub control_field: ControlField,
    pub pid: Option<Pid>,
    pub information: Vec<u8>,
    pub modulo: Modulo,
}

impl Ax25Frame {
    pub fn decode(data: &[u8], modulo: Modulo) -> Result<Self, FrameError> {
        if modulo == Modulo::Mod128 {
            return Err(FrameError::UnsupportedModulo);
        }
        let addr_end = data
            .iter()
            .position(|b| b & 1 == 1)
            .ok_or(FrameError::Truncated("address field"))?;
        let address_field = AddressField::decode(&data[..=addr_end])?;
        let mut offset = addr_end + 1;
        let control_byte = *data
            .get(offset)
            .ok_or(FrameError::Truncated("control field"))?;
        let control_field = ControlField::decode(control_byte)?;
        offset += 1;
        let pid = if control_field.has_pid() {
            let byte = *data.get(offset).ok_or(FrameError::Truncated("PID"))?;
            offset += 1;
            Some(Pid::from_proto(byte)?)
        } else {
            None
        };
        Ok(Self {
            address_field,
            control_field,
            pid,
            information: data[offset..].to_vec(),
            modulo,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.modulo == Modulo::Mod128 {
            return Err(FrameError::UnsupportedModulo);
        }
        let mut out = self.address_field.encode();
        out.push(self.control_field.encode());
        if let Some(pid) = self.pid {
            out.push(pid.proto_value());
        }
        out.extend_from_slice(&self.information);
        Ok(out)
    }

    /// An unnumbered frame with no payload. UI frames get PID `None` so the
    /// PID-iff-I-or-UI invariant holds by construction.
    pub fn unnumbered(address_field: AddressField, kind: UnnumberedKind, poll_final: bool) -> Self {
        let pid = (kind == UnnumberedKind::UnnumberedInfo).then_some(Pid::None);
        Self {
            address_field,
            control_field: ControlField::Unnumbered { kind, poll_final },
            pid,
            information: Vec::new(),
            modulo: Modulo::Mod8,
        }
    }

    /// A UI frame carrying a payload.
    pub fn unnumbered_information(
        address_field: AddressField,
        pid: Pid,
        poll: bool,
        information: Vec<u8>,
    ) -> Self {
        Self {
            address_field,
            control_field: ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final: poll,
            },
            pid: Some(pid),
            information,
            modulo: Modulo::Mod8,
        }
    }

    pub fn supervisory(
        address_field: AddressField,
        kind: SupervisoryKind,
        receive: u8,
        poll_final: bool,
    ) -> Self {
        Self {
            address_field,
            control_field: ControlField::Supervisory {
                kind,
                receive,
                poll_final,
            },
            pid: None,
            information: Vec::new(),
            modulo: Modulo::Mod8,
        }
    }

    pub fn information(
        address_field: AddressField,
        sequence: u8,
        receive: u8,
        poll: bool,
        pid: Pid,
        information: Vec<u8>,
    ) -> Self {
        Self {
            address_field,
            control_field: ControlField::Information {
                sequence,
                receive,
                poll,
            },
            pid: Some(pid),
            information,
            modulo: Modulo::Mod8,
        }
    }

    /// DM addressed back to this frame's sender.
    pub fn dm_response(&self, poll_final: bool) -> Self {
        Self::unnumbered(
            self.address_field.response_field(),
            UnnumberedKind::DisconnectedMode,
            poll_final,
        )
    }

    /// UA addressed back to this frame's sender.
    pub fn ua_response(&self, poll_final: bool) -> Self {
        Self::unnumbered(
            self.address_field.response_field(),
            UnnumberedKind::UnnumberedAck,
            poll_final,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A real APRS position beacon: WB7GR-9 > TQ0YVW via N7JJY-8, W0UPS-15,
    // WIDE2, UI frame, PID 0xF0.
    const APRS_FRAME: [u8; 91] = [
        0xA8, 0xA2, 0x60, 0xB2, 0xAC, 0xAE, 0x60, 0xAE, 0x84, 0x6E, 0x8E, 0xA4, 0x40, 0xF2, 0x9C,
        0x6E, 0x94, 0x94, 0xB2, 0x40, 0xF0, 0xAE, 0x60, 0xAA, 0xA0, 0xA6, 0x40, 0xFE, 0xAE, 0x92,
        0x88, 0x8A, 0x64, 0x40, 0xE1, 0x03, 0xF0, 0x60, 0x70, 0x4B, 0x28, 0x6E, 0x49, 0x69, 0x6B,
        0x2F, 0x60, 0x22, 0x48, 0x31, 0x7D, 0x4C, 0x69, 0x73, 0x74, 0x65, 0x6E, 0x69, 0x6E, 0x67,
        0x20, 0x6F, 0x6E, 0x20, 0x34, 0x34, 0x39, 0x2E, 0x33, 0x30, 0x30, 0x20, 0x2D, 0x20, 0x77,
        0x62, 0x37, 0x67, 0x72, 0x40, 0x61, 0x72, 0x72, 0x6C, 0x2E, 0x6E, 0x65, 0x74, 0x5F, 0x25,
        0x0D,
    ];

    #[test]
    fn entire_frame_decode_encode() {
        let frame = Ax25Frame::decode(&APRS_FRAME, Modulo::Mod8).unwrap();
        assert_eq!(frame.address_field.source.call_with_ssid(), "WB7GR-9");
        assert!(frame.address_field.source.command_repeat_bit);
        assert_eq!(frame.address_field.destination.call_with_ssid(), "TQ0YVW-0");
        assert!(!frame.address_field.destination.command_repeat_bit);
        let path: Vec<String> = frame
            .address_field
            .path
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(path, vec!["N7JJY-8*", "W0UPS-15*", "WIDE2*"]);
        assert_eq!(
            frame.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final: false,
            }
        );
        assert_eq!(frame.pid, Some(Pid::NoLayer3));
        assert_eq!(
            frame.information,
            b"`pK(nIik/`\"H1}Listening on 449.300 - wb7gr@arrl.net_%\r".to_vec()
        );
        assert_eq!(frame.encode().unwrap(), APRS_FRAME.to_vec());
    }

    #[test]
    fn uframe_control_decode() {
        let control = ControlField::decode(0x03).unwrap();
        assert_eq!(
            control,
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedInfo,
                poll_final: false,
            }
        );
        assert_eq!(control.encode(), 0x03);
    }

    #[test]
    fn iframe_control_decode() {
        let control = ControlField::decode(0xDC).unwrap();
        assert_eq!(
            control,
            ControlField::Information {
                sequence: 6,
                receive: 6,
                poll: true,
            }
        );
        assert_eq!(control.encode(), 0xDC);
    }

    #[test]
    fn sframe_control_decode() {
        let control = ControlField::decode(0xD9).unwrap();
        assert_eq!(
            control,
            ControlField::Supervisory {
                kind: SupervisoryKind::Reject,
                receive: 6,
                poll_final: true,
            }
        );
        assert_eq!(control.encode(), 0xD9);
    }

    #[test]
    fn exhaustive_control_roundtrip() {
        for sequence in 0..8u8 {
            for receive in 0..8u8 {
                for poll in [false, true] {
                    let control = ControlField::Information {
                        sequence,
                        receive,
                        poll,
                    };
                    assert_eq!(ControlField::decode(control.encode()).unwrap(), control);
                }
            }
        }
        let supervisory = [
            SupervisoryKind::ReceiveReady,
            SupervisoryKind::ReceiveNotReady,
            SupervisoryKind::Reject,
            SupervisoryKind::SelectiveReject,
        ];
        for kind in supervisory {
            for receive in 0..8u8 {
                for poll_final in [false, true] {
                    let control = ControlField::Supervisory {
                        kind,
                        receive,
                        poll_final,
                    };
                    assert_eq!(ControlField::decode(control.encode()).unwrap(), control);
                }
            }
        }
        let unnumbered = [
            UnnumberedKind::Sabme,
            UnnumberedKind::Sabm,
            UnnumberedKind::Disconnect,
            UnnumberedKind::DisconnectedMode,
            UnnumberedKind::UnnumberedAck,
            UnnumberedKind::FrameReject,
            UnnumberedKind::UnnumberedInfo,
            UnnumberedKind::ExchangeId,
            UnnumberedKind::Test,
        ];
        for kind in unnumbered {
            for poll_final in [false, true] {
                let control = ControlField::Unnumbered { kind, poll_final };
                assert_eq!(ControlField::decode(control.encode()).unwrap(), control);
            }
        }
    }

    #[test]
    fn pid_roundtrip() {
        for value in [
            0x00u8, 0x01, 0x06, 0x07, 0x08, 0xC3, 0xC4, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF, 0xF0,
            0xFF,
        ] {
            let pid = Pid::from_proto(value).unwrap();
            assert_eq!(pid.proto_value(), value);
        }
        assert_eq!(Pid::from_proto(0x55), Err(FrameError::InvalidPid(0x55)));
    }

    #[test]
    fn invalid_unnumbered_pattern_rejected() {
        // 0x23: U-frame family with an unassigned type pattern.
        assert_eq!(
            ControlField::decode(0x23),
            Err(FrameError::InvalidControl(0x23))
        );
    }

    #[test]
    fn truncated_frames_rejected() {
        assert_eq!(
            Ax25Frame::decode(&[], Modulo::Mod8),
            Err(FrameError::Truncated("address field"))
        );
        // Address bytes with no end-of-address marker anywhere.
        assert_eq!(
            Ax25Frame::decode(&[0xA8, 0xA2, 0x60], Modulo::Mod8),
            Err(FrameError::Truncated("address field"))
        );
        // Good address field, nothing after it.
        assert_eq!(
            Ax25Frame::decode(&APRS_FRAME[0..35], Modulo::Mod8),
            Err(FrameError::Truncated("control field"))
        );
        // UI control byte but the PID is missing.
        assert_eq!(
            Ax25Frame::decode(&APRS_FRAME[0..36], Modulo::Mod8),
            Err(FrameError::Truncated("PID"))
        );
    }

    #[test]
    fn modulo_128_refused() {
        assert_eq!(
            Ax25Frame::decode(&APRS_FRAME, Modulo::Mod128),
            Err(FrameError::UnsupportedModulo)
        );
        let mut frame = Ax25Frame::decode(&APRS_FRAME, Modulo::Mod8).unwrap();
        frame.modulo = Modulo::Mod128;
        assert_eq!(frame.encode(), Err(FrameError::UnsupportedModulo));
    }

    #[test]
    fn response_builders() {
        let frame = Ax25Frame::decode(&APRS_FRAME, Modulo::Mod8).unwrap();
        let dm = frame.dm_response(true);
        assert_eq!(
            dm.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::DisconnectedMode,
                poll_final: true,
            }
        );
        assert_eq!(dm.pid, None);
        assert_eq!(dm.address_field.destination.call_with_ssid(), "WB7GR-9");
        assert_eq!(dm.address_field.source.call_with_ssid(), "TQ0YVW-0");
        let ua = frame.ua_response(false);
        assert_eq!(
            ua.control_field,
            ControlField::Unnumbered {
                kind: UnnumberedKind::UnnumberedAck,
                poll_final: false,
            }
        );
        assert_eq!(ua.pid, None);
    }

    #[test]
    fn pid_present_only_on_i_and_ui() {
        let addr = AddressField::new(
            crate::address::Address::from_callsign("NOCALL").unwrap(),
            crate::address::Address::from_callsign("K0JLB-9").unwrap(),
        );
        let ui = Ax25Frame::unnumbered(addr.clone(), UnnumberedKind::UnnumberedInfo, false);
        assert_eq!(ui.pid, Some(Pid::None));
        let sabm = Ax25Frame::unnumbered(addr.clone(), UnnumberedKind::Sabm, true);
        assert_eq!(sabm.pid, None);
        let rr = Ax25Frame::supervisory(addr.clone(), SupervisoryKind::ReceiveReady, 3, false);
        assert_eq!(rr.pid, None);
        let info = Ax25Frame::information(addr, 1, 2, false, Pid::NoLayer3, vec![0x41]);
        assert_eq!(info.pid, Some(Pid::NoLayer3));
        // Each re-decodes to itself.
        for frame in [ui, sabm, rr, info] {
            let decoded = Ax25Frame::decode(&frame.encode().unwrap(), Modulo::Mod8).unwrap();
            assert_eq!(decoded, frame);
        }
    }
}
