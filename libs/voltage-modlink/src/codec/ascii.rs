//! Modbus ASCII framing: `':' hex([unit][PDU][LRC]) CR LF`

use std::borrow::Cow;
use tracing::debug;

use super::{pdu, AduHeader, ModbusProtocol};
use crate::checksum::lrc;
use crate::constants;
use crate::error::{ModbusError, ModbusResult};

const START: u8 = b':';
const END: &[u8; 2] = b"\r\n";

/// ':' + unit(2) + FC(2) + LRC(2) + CRLF
const MIN_FRAME_LEN: usize = 9;

#[derive(Debug, Default, Clone, Copy)]
pub struct AsciiProtocol;

impl AsciiProtocol {
    pub fn new() -> Self {
        Self
    }

    fn frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(pdu.len() + 2);
        body.push(unit_id);
        body.extend_from_slice(pdu);
        body.push(lrc(&body));

        let mut frame = Vec::with_capacity(1 + body.len() * 2 + 2);
        frame.push(START);
        frame.extend_from_slice(hex::encode_upper(&body).as_bytes());
        frame.extend_from_slice(END);
        debug!("ASCII frame: unit={}, {}B", unit_id, frame.len());
        frame
    }

    /// Strip delimiters and hex-decode; the LRC byte stays at the end
    fn decode_body(adu: &[u8]) -> ModbusResult<Vec<u8>> {
        if adu.len() < MIN_FRAME_LEN {
            return Err(ModbusError::framing(format!(
                "ASCII frame too short: {} chars",
                adu.len()
            )));
        }
        if adu[0] != START || !adu.ends_with(END) {
            return Err(ModbusError::framing("Frame delimiters missing"));
        }
        hex::decode(&adu[1..adu.len() - 2])
            .map_err(|e| ModbusError::framing(format!("Invalid hex encoding: {e}")))
    }

    fn lrc_matches(body: &[u8]) -> bool {
        match body.split_last() {
            Some((check, data)) => lrc(data) == *check,
            None => false,
        }
    }
}

impl ModbusProtocol for AsciiProtocol {
    fn name(&self) -> &'static str {
        "ASCII"
    }

    fn max_adu_len(&self) -> usize {
        constants::ASCII_MAX_ADU_LEN
    }

    fn max_pdu_len(&self) -> usize {
        constants::MAX_PDU_SIZE
    }

    fn frame_request(&self, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        Self::frame(unit_id, pdu)
    }

    fn frame_response(&self, header: AduHeader, pdu: &[u8]) -> Vec<u8> {
        Self::frame(header.unit_id, pdu)
    }

    fn parse_frame<'a>(&self, adu: &'a [u8]) -> ModbusResult<(AduHeader, Cow<'a, [u8]>)> {
        let body = Self::decode_body(adu)?;
        if !Self::lrc_matches(&body) {
            return Err(ModbusError::framing("Checksum does not match"));
        }
        let pdu = body[1..body.len() - 1].to_vec();
        Ok((AduHeader::new(body[0]), Cow::Owned(pdu)))
    }

    fn check_response_complete(&self, bytes: &[u8]) -> bool {
        bytes.len() >= 3 && bytes.windows(2).rev().any(|w| w == END)
    }

    fn check_request_complete(&self, bytes: &[u8]) -> bool {
        self.check_response_complete(bytes)
    }

    fn validate_response(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let request = Self::decode_body(request)
            .ok()
            .filter(|body| body.len() >= 3)
            .ok_or_else(|| ModbusError::invalid_argument("Request is not an ASCII frame"))?;
        let body = Self::decode_body(response)?;
        if body.len() < 3 {
            return Err(ModbusError::framing("Response too short"));
        }
        if body[0] != request[0] {
            return Err(ModbusError::framing(format!(
                "Unit identifier does not match: expected {}, got {}",
                request[0], body[0]
            )));
        }

        let pdu = &body[1..body.len() - 1];
        pdu::expect_function(request[1], pdu)?;

        if !Self::lrc_matches(&body) {
            return Err(ModbusError::framing("Checksum does not match"));
        }
        pdu::check_response_shape(&request[1..request.len() - 1], pdu)
    }
}
