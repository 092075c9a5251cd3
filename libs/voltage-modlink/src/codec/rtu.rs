//! Modbus RTU framing: `[unit][PDU][CRC lo][CRC hi]`

use std::borrow::Cow;
use tracing::debug;

use super::{pdu, AduHeader, ModbusProtocol};
use crate::checksum::{crc16, verify_crc16};
use crate::constants::{self, ERROR_FLAG};
use crate::error::{ModbusError, ModbusResult};

/// Unit id + function code + CRC
const MIN_FRAME_LEN: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct RtuProtocol;

impl RtuProtocol {
    pub fn new() -> Self {
        Self
    }

    fn frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc);
        debug!(
            "RTU frame: unit={}, FC={:02X}, {}B",
            unit_id,
            pdu.first().copied().unwrap_or(0),
            frame.len()
        );
        frame
    }
}

/// Bytes needed for a complete device identification reply, or `None` while
/// the object headers themselves are still arriving
fn device_id_frame_len(bytes: &[u8]) -> Option<usize> {
    // unit + FC + MEI + code + conformity + more + next + count
    let mut pos = 1 + constants::DEVICE_ID_HEADER_LEN;
    if bytes.len() < pos {
        return None;
    }
    for _ in 0..bytes[pos - 1] {
        let len = *bytes.get(pos + 1)?;
        pos += 2 + usize::from(len);
    }
    Some(pos + 2)
}

impl ModbusProtocol for RtuProtocol {
    fn name(&self) -> &'static str {
        "RTU"
    }

    fn max_adu_len(&self) -> usize {
        constants::RTU_MAX_ADU_LEN
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
        if adu.len() < MIN_FRAME_LEN {
            return Err(ModbusError::framing(format!(
                "RTU frame too short: {} bytes",
                adu.len()
            )));
        }
        if !verify_crc16(adu) {
            return Err(ModbusError::framing("Checksum does not match"));
        }
        Ok((
            AduHeader::new(adu[0]),
            Cow::Borrowed(&adu[1..adu.len() - 2]),
        ))
    }

    fn check_response_complete(&self, bytes: &[u8]) -> bool {
        if bytes.len() < MIN_FRAME_LEN {
            return false;
        }
        let function_code = bytes[1];
        if function_code & ERROR_FLAG != 0 {
            return bytes.len() >= 5;
        }
        match function_code {
            constants::FC_READ_COILS..=constants::FC_READ_INPUT_REGISTERS => {
                bytes.len() >= 5 + usize::from(bytes[2])
            },
            constants::FC_WRITE_SINGLE_COIL
            | constants::FC_WRITE_SINGLE_REGISTER
            | constants::FC_WRITE_MULTIPLE_COILS
            | constants::FC_WRITE_MULTIPLE_REGISTERS => bytes.len() >= 8,
            constants::FC_ENCAPSULATED_INTERFACE => {
                device_id_frame_len(bytes).is_some_and(|needed| bytes.len() >= needed)
            },
            _ => true,
        }
    }

    fn check_request_complete(&self, bytes: &[u8]) -> bool {
        if bytes.len() < MIN_FRAME_LEN {
            return false;
        }
        match bytes[1] {
            constants::FC_READ_COILS..=constants::FC_WRITE_SINGLE_REGISTER => bytes.len() >= 8,
            constants::FC_WRITE_MULTIPLE_COILS | constants::FC_WRITE_MULTIPLE_REGISTERS => {
                bytes.len() >= 7 && bytes.len() >= 9 + usize::from(bytes[6])
            },
            constants::FC_ENCAPSULATED_INTERFACE => bytes.len() >= 7,
            _ => true,
        }
    }

    fn validate_response(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        if request.len() < MIN_FRAME_LEN {
            return Err(ModbusError::invalid_argument("Request is not an RTU frame"));
        }
        if response.len() < MIN_FRAME_LEN {
            return Err(ModbusError::framing(format!(
                "Response too short: {} bytes",
                response.len()
            )));
        }
        if response[0] != request[0] {
            return Err(ModbusError::framing(format!(
                "Unit identifier does not match: expected {}, got {}",
                request[0], response[0]
            )));
        }

        let body = &response[1..response.len() - 2];
        // Error replies short-circuit here, before the checksum
        pdu::expect_function(request[1], body)?;

        if !verify_crc16(response) {
            return Err(ModbusError::framing("Checksum does not match"));
        }
        pdu::check_response_shape(&request[1..request.len() - 2], body)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::{DeviceIdentificationCategory, DeviceIdentity, ExceptionCode};

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body));
        frame
    }

    #[test]
    fn test_read_coils_scenario() {
        let codec = RtuProtocol::new();
        let request = codec.serialize_read_coils(0x2A, 19, 19).unwrap();
        assert_eq!(request, with_crc(&[0x2A, 0x01, 0x00, 0x13, 0x00, 0x13]));

        let response = with_crc(&[0x2A, 0x01, 0x03, 0xCD, 0x6B, 0x05]);
        assert!(codec.check_response_complete(&response));
        codec.validate_response(&request, &response).unwrap();

        let coils = codec.deserialize_read_coils(&response, 19, 19).unwrap();
        assert_eq!(coils.len(), 19);
        assert_eq!(coils[0].address, 19);
        assert_eq!(coils[18].address, 37);

        let expected = [0xCDu8, 0x6B, 0x05];
        for (i, coil) in coils.iter().enumerate() {
            assert_eq!(coil.value, expected[i / 8] & (1 << (i % 8)) != 0, "coil {i}");
        }
    }

    #[test]
    fn test_completeness_is_reached_at_the_same_length_bytewise() {
        let codec = RtuProtocol::new();
        let frames = [
            with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]),
            with_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]),
            with_crc(&[0x01, 0x83, 0x02]),
            with_crc(&[
                0x01, 0x2B, 0x0E, 0x01, 0x81, 0x00, 0x00, 0x02, 0x00, 0x02, b'V', b'X', 0x01,
                0x01, b'7',
            ]),
        ];
        for frame in &frames {
            let first = (1..=frame.len())
                .find(|&n| codec.check_response_complete(&frame[..n]))
                .unwrap();
            assert_eq!(first, frame.len(), "frame {frame:02X?}");
        }
    }

    #[test]
    fn test_request_completeness() {
        let codec = RtuProtocol::new();
        let read = codec.serialize_read_holding_registers(1, 0, 10).unwrap();
        assert!(!codec.check_request_complete(&read[..7]));
        assert!(codec.check_request_complete(&read));

        let regs = [
            crate::types::HoldingRegister::new(1, 1),
            crate::types::HoldingRegister::new(2, 2),
        ];
        let write = codec.serialize_write_multiple_holding_registers(1, &regs).unwrap();
        assert_eq!(write.len(), 13);
        assert!(!codec.check_request_complete(&write[..12]));
        assert!(codec.check_request_complete(&write));
    }

    fn good_exchange() -> (Vec<u8>, Vec<u8>) {
        let codec = RtuProtocol::new();
        let request = codec.serialize_read_holding_registers(0x11, 0x006B, 2).unwrap();
        let response = with_crc(&[0x11, 0x03, 0x04, 0x02, 0x2B, 0x00, 0x64]);
        (request, response)
    }

    #[test]
    fn test_validation_reports_the_injected_fault() {
        let codec = RtuProtocol::new();
        let (request, response) = good_exchange();
        codec.validate_response(&request, &response).unwrap();

        let mut bad_crc = response.clone();
        *bad_crc.last_mut().unwrap() ^= 0xFF;
        let err = codec.validate_response(&request, &bad_crc).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Checksum")));

        let mut bad_unit = response.clone();
        bad_unit[0] = 0x12;
        let err = codec.validate_response(&request, &bad_unit).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Unit identifier")));

        let mut bad_fc = response.clone();
        bad_fc[1] = 0x04;
        let err = codec.validate_response(&request, &bad_fc).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Function code")));

        let mut bad_count = response[..response.len() - 2].to_vec();
        bad_count[2] = 0x06;
        let bad_count = with_crc(&bad_count);
        let err = codec.validate_response(&request, &bad_count).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Byte count")));
    }

    #[test]
    fn test_error_reply_carries_remote_code() {
        let codec = RtuProtocol::new();
        let (request, _) = good_exchange();
        let response = with_crc(&[0x11, 0x83, 0x02]);
        assert!(codec.check_response_complete(&response));
        let err = codec.validate_response(&request, &response).unwrap_err();
        assert_eq!(
            err,
            ModbusError::Exception {
                function_code: 0x03,
                code: ExceptionCode::IllegalDataAddress
            }
        );
    }

    #[test]
    fn test_write_single_register_round_trip() {
        let codec = RtuProtocol::new();
        let register = crate::types::HoldingRegister::new(0x0001, 0x0003);
        let request = codec.serialize_write_single_holding_register(0x11, &register).unwrap();
        assert_eq!(request, with_crc(&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]));
        // The device echoes the request
        codec.validate_response(&request, &request).unwrap();
        assert_eq!(
            codec.deserialize_write_single_holding_register(&request).unwrap(),
            register
        );
    }

    #[test]
    fn test_device_identification_request_response() {
        let codec = RtuProtocol::new();
        let request = codec
            .serialize_read_device_identification(0x01, DeviceIdentificationCategory::Basic, 0x00)
            .unwrap();
        assert!(codec.check_request_complete(&request));

        let (header, decoded) = codec.deserialize_request(&request).unwrap();
        assert_eq!(header.unit_id, 0x01);

        let identity = DeviceIdentity::basic("Voltage", "VX-1", "1.0").unwrap();
        let reply = match decoded {
            crate::codec::Request::ReadDeviceIdentification {
                category,
                object_id,
            } => codec.encode_device_identification(&identity, category, object_id),
            other => panic!("unexpected request {other:?}"),
        };
        let response = codec.serialize_response(header, &reply);
        assert!(codec.check_response_complete(&response));
        codec.validate_response(&request, &response).unwrap();

        let raw = codec.deserialize_read_device_identification(&response).unwrap();
        assert!(raw.allows_individual_access);
        assert!(!raw.more_requests_needed);
        assert_eq!(raw.object(0x00), Some(&b"Voltage"[..]));
        assert_eq!(raw.objects.len(), 3);

        // A well-formed reply for another category does not answer this request
        let regular =
            codec.encode_device_identification(&identity, DeviceIdentificationCategory::Regular, 0);
        let wrong_code = codec.serialize_response(header, &regular);
        let err = codec.validate_response(&request, &wrong_code).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Read device id code")));
    }

    #[test]
    fn test_parse_frame_rejects_bad_checksum() {
        let codec = RtuProtocol::new();
        let mut frame = with_crc(&[0x01, 0x05, 0x00, 0x01, 0xFF, 0x00]);
        frame[3] = 0x02;
        assert!(matches!(
            codec.deserialize_request(&frame),
            Err(ModbusError::Framing(_))
        ));
    }
}
