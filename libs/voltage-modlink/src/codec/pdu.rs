//! Transport-independent PDU encoding
//!
//! Everything between the unit id and the checksum/end of frame. Offsets in
//! this module are relative to the function code byte.

use tracing::trace;

use crate::constants::{self, ERROR_FLAG};
use crate::error::{ModbusError, ModbusResult};
use crate::types::{
    Coil, DeviceIdentificationCategory, DeviceIdentificationRaw, DeviceIdentity, ExceptionCode,
    HoldingRegister,
};

// ============================================================================
// Decoded requests / responses (responder side)
// ============================================================================

/// A request as seen by a responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { start_address: u16, count: u16 },
    ReadDiscreteInputs { start_address: u16, count: u16 },
    ReadHoldingRegisters { start_address: u16, count: u16 },
    ReadInputRegisters { start_address: u16, count: u16 },
    WriteSingleCoil(Coil),
    WriteSingleRegister(HoldingRegister),
    WriteMultipleCoils(Vec<Coil>),
    WriteMultipleRegisters(Vec<HoldingRegister>),
    ReadDeviceIdentification {
        category: DeviceIdentificationCategory,
        object_id: u8,
    },
    /// Known function with an illegal payload; answered with `code`
    Invalid { function_code: u8, code: ExceptionCode },
    /// Function code this stack does not serve
    Unsupported { function_code: u8 },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => constants::FC_READ_COILS,
            Request::ReadDiscreteInputs { .. } => constants::FC_READ_DISCRETE_INPUTS,
            Request::ReadHoldingRegisters { .. } => constants::FC_READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => constants::FC_READ_INPUT_REGISTERS,
            Request::WriteSingleCoil(_) => constants::FC_WRITE_SINGLE_COIL,
            Request::WriteSingleRegister(_) => constants::FC_WRITE_SINGLE_REGISTER,
            Request::WriteMultipleCoils(_) => constants::FC_WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters(_) => constants::FC_WRITE_MULTIPLE_REGISTERS,
            Request::ReadDeviceIdentification { .. } => constants::FC_ENCAPSULATED_INTERFACE,
            Request::Invalid { function_code, .. } | Request::Unsupported { function_code } => {
                *function_code
            },
        }
    }

    /// Exception reply for this request
    pub fn exception(&self, code: ExceptionCode) -> Response {
        Response::Exception {
            function_code: self.function_code(),
            code,
        }
    }
}

/// A reply as produced by a responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil(Coil),
    WriteSingleRegister(HoldingRegister),
    WriteMultipleCoils { start_address: u16, count: u16 },
    WriteMultipleRegisters { start_address: u16, count: u16 },
    ReadDeviceIdentification(DeviceIdentificationResponse),
    Exception { function_code: u8, code: ExceptionCode },
}

/// One Read Device Identification reply fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentificationResponse {
    pub category: DeviceIdentificationCategory,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<(u8, Vec<u8>)>,
}

impl DeviceIdentificationResponse {
    /// Re-wrap a fragment received from another device
    pub fn from_raw(category: DeviceIdentificationCategory, raw: DeviceIdentificationRaw) -> Self {
        let access = if raw.allows_individual_access { 0x80 } else { 0x00 };
        Self {
            category,
            conformity_level: access | category as u8,
            more_follows: raw.more_requests_needed,
            next_object_id: raw.next_object_id_to_request,
            objects: raw.objects,
        }
    }
}

// ============================================================================
// Bit packing
// ============================================================================

/// Pack booleans LSB-first, 8 per byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, bit)| **bit) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Unpack the first `count` LSB-first bits
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Attach consecutive addresses to decoded values
pub(crate) fn addressed<V, T>(
    start_address: u16,
    values: Vec<V>,
    ctor: impl Fn(u16, V) -> T,
) -> Vec<T> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| ctor(start_address.wrapping_add(i as u16), v))
        .collect()
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

// ============================================================================
// Request encoding (client side)
// ============================================================================

fn check_read_range(start_address: u16, count: u16, max: u16) -> ModbusResult<()> {
    if !(constants::MIN_READ_COUNT..=max).contains(&count) {
        return Err(ModbusError::out_of_range(format!(
            "Count must be between {} and {}, got {count}",
            constants::MIN_READ_COUNT,
            max
        )));
    }
    if u32::from(start_address) + u32::from(count) - 1 > u32::from(u16::MAX) {
        return Err(ModbusError::out_of_range(format!(
            "Start address {start_address} with count {count} exceeds the address space"
        )));
    }
    Ok(())
}

/// FC01-FC04 request
pub fn read_request(function_code: u8, start_address: u16, count: u16) -> ModbusResult<Vec<u8>> {
    let max = match function_code {
        constants::FC_READ_COILS | constants::FC_READ_DISCRETE_INPUTS => {
            constants::MAX_DISCRETE_READ_COUNT
        },
        _ => constants::MAX_REGISTER_READ_COUNT,
    };
    check_read_range(start_address, count, max)?;

    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code);
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

pub fn write_single_coil_request(coil: &Coil) -> Vec<u8> {
    let value = if coil.value {
        constants::COIL_ON
    } else {
        constants::COIL_OFF
    };
    let mut pdu = vec![constants::FC_WRITE_SINGLE_COIL];
    pdu.extend_from_slice(&coil.address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

pub fn write_single_register_request(register: &HoldingRegister) -> Vec<u8> {
    let mut pdu = vec![constants::FC_WRITE_SINGLE_REGISTER];
    pdu.extend_from_slice(&register.address.to_be_bytes());
    pdu.push(register.high_byte);
    pdu.push(register.low_byte);
    pdu
}

/// Check a write batch: non-empty, within `max`, unique and contiguous.
/// Returns the sorted addresses' `(start, count)`.
fn contiguous_range(mut addresses: Vec<u16>, max: u16) -> ModbusResult<(u16, u16)> {
    if addresses.is_empty() {
        return Err(ModbusError::invalid_argument(
            "At least one object must be written",
        ));
    }
    if addresses.len() > usize::from(max) {
        return Err(ModbusError::out_of_range(format!(
            "Count must be between {} and {max}, got {}",
            constants::MIN_WRITE_COUNT,
            addresses.len()
        )));
    }

    addresses.sort_unstable();
    for pair in addresses.windows(2) {
        if pair[0] == pair[1] {
            return Err(ModbusError::invalid_argument(format!(
                "Duplicate address {}",
                pair[0]
            )));
        }
        if pair[1] != pair[0] + 1 {
            return Err(ModbusError::invalid_argument(format!(
                "Gap between addresses {} and {}",
                pair[0], pair[1]
            )));
        }
    }

    Ok((addresses[0], addresses.len() as u16))
}

/// FC15 request; coils may be given in any order
pub fn write_multiple_coils_request(coils: &[Coil]) -> ModbusResult<Vec<u8>> {
    let (start, count) = contiguous_range(
        coils.iter().map(|c| c.address).collect(),
        constants::MAX_DISCRETE_WRITE_COUNT,
    )?;

    let mut sorted = coils.to_vec();
    sorted.sort_unstable_by_key(|c| c.address);
    let values: Vec<bool> = sorted.iter().map(|c| c.value).collect();
    let packed = pack_bits(&values);

    let mut pdu = Vec::with_capacity(6 + packed.len());
    pdu.push(constants::FC_WRITE_MULTIPLE_COILS);
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    Ok(pdu)
}

/// FC16 request; registers may be given in any order
pub fn write_multiple_registers_request(registers: &[HoldingRegister]) -> ModbusResult<Vec<u8>> {
    let (start, count) = contiguous_range(
        registers.iter().map(|r| r.address).collect(),
        constants::MAX_REGISTER_WRITE_COUNT,
    )?;

    let mut sorted = registers.to_vec();
    sorted.sort_unstable_by_key(|r| r.address);

    let mut pdu = Vec::with_capacity(6 + sorted.len() * 2);
    pdu.push(constants::FC_WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push((sorted.len() * 2) as u8);
    for register in &sorted {
        pdu.push(register.high_byte);
        pdu.push(register.low_byte);
    }
    Ok(pdu)
}

pub fn device_identification_request(
    category: DeviceIdentificationCategory,
    object_id: u8,
) -> Vec<u8> {
    vec![
        constants::FC_ENCAPSULATED_INTERFACE,
        constants::MEI_READ_DEVICE_IDENTIFICATION,
        category as u8,
        object_id,
    ]
}

// ============================================================================
// Response decoding (client side)
// ============================================================================

/// Check the echoed function code; error replies surface as [`ModbusError::Exception`]
pub(crate) fn expect_function(function_code: u8, pdu: &[u8]) -> ModbusResult<()> {
    match pdu.first() {
        None => Err(ModbusError::framing("Empty PDU")),
        Some(&fc) if fc == function_code => Ok(()),
        Some(&fc) if fc == function_code | ERROR_FLAG => match pdu.get(1) {
            Some(&code) => Err(ModbusError::Exception {
                function_code,
                code: ExceptionCode::from(code),
            }),
            None => Err(ModbusError::framing("Exception reply without exception code")),
        },
        Some(&fc) => Err(ModbusError::framing(format!(
            "Function code does not match: expected 0x{function_code:02X}, got 0x{fc:02X}"
        ))),
    }
}

/// Payload of a FC01-FC04 reply after the byte count cross-check
fn read_payload(function_code: u8, pdu: &[u8]) -> ModbusResult<&[u8]> {
    expect_function(function_code, pdu)?;
    if pdu.len() < 2 {
        return Err(ModbusError::framing("Response too short"));
    }
    let byte_count = usize::from(pdu[1]);
    let data = &pdu[2..];
    if data.len() != byte_count {
        return Err(ModbusError::framing(format!(
            "Byte count does not match: declared {byte_count}, got {}",
            data.len()
        )));
    }
    Ok(data)
}

pub fn decode_bits_response(function_code: u8, pdu: &[u8], count: u16) -> ModbusResult<Vec<bool>> {
    let data = read_payload(function_code, pdu)?;
    let expected = usize::from(count).div_ceil(8);
    if data.len() != expected {
        return Err(ModbusError::framing(format!(
            "Byte count does not match: expected {expected} for {count} values, got {}",
            data.len()
        )));
    }
    Ok(unpack_bits(data, usize::from(count)))
}

pub fn decode_registers_response(
    function_code: u8,
    pdu: &[u8],
    count: u16,
) -> ModbusResult<Vec<u16>> {
    let data = read_payload(function_code, pdu)?;
    if data.len() < usize::from(count) * 2 {
        return Err(ModbusError::framing(format!(
            "Byte count does not match: {} bytes cannot hold {count} registers",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .take(usize::from(count))
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn write_echo(function_code: u8, pdu: &[u8]) -> ModbusResult<(u16, u16)> {
    expect_function(function_code, pdu)?;
    if pdu.len() != 5 {
        return Err(ModbusError::framing(format!(
            "Response length does not match: expected 5 PDU bytes, got {}",
            pdu.len()
        )));
    }
    Ok((be_u16(pdu, 1), be_u16(pdu, 3)))
}

pub fn decode_write_single_coil(pdu: &[u8]) -> ModbusResult<Coil> {
    let (address, value) = write_echo(constants::FC_WRITE_SINGLE_COIL, pdu)?;
    match value {
        constants::COIL_ON => Ok(Coil::new(address, true)),
        constants::COIL_OFF => Ok(Coil::new(address, false)),
        other => Err(ModbusError::framing(format!(
            "Invalid coil value 0x{other:04X}"
        ))),
    }
}

pub fn decode_write_single_register(pdu: &[u8]) -> ModbusResult<HoldingRegister> {
    let (address, value) = write_echo(constants::FC_WRITE_SINGLE_REGISTER, pdu)?;
    Ok(HoldingRegister::new(address, value))
}

/// `(start_address, count)` echoed by FC15/FC16
pub fn decode_write_multiple(function_code: u8, pdu: &[u8]) -> ModbusResult<(u16, u16)> {
    write_echo(function_code, pdu)
}

pub fn decode_device_identification(pdu: &[u8]) -> ModbusResult<DeviceIdentificationRaw> {
    expect_function(constants::FC_ENCAPSULATED_INTERFACE, pdu)?;
    if pdu.len() < constants::DEVICE_ID_HEADER_LEN {
        return Err(ModbusError::framing("Response too short"));
    }
    if pdu[1] != constants::MEI_READ_DEVICE_IDENTIFICATION {
        return Err(ModbusError::framing(format!(
            "MEI type does not match: expected 0x{:02X}, got 0x{:02X}",
            constants::MEI_READ_DEVICE_IDENTIFICATION,
            pdu[1]
        )));
    }

    let mut raw = DeviceIdentificationRaw {
        allows_individual_access: pdu[3] & 0x80 != 0,
        more_requests_needed: pdu[4] == 0xFF,
        next_object_id_to_request: pdu[5],
        objects: Vec::with_capacity(usize::from(pdu[6])),
    };

    let mut pos = constants::DEVICE_ID_HEADER_LEN;
    for _ in 0..pdu[6] {
        if pos + 2 > pdu.len() {
            return Err(ModbusError::framing("Number of objects does not match"));
        }
        let id = pdu[pos];
        let len = usize::from(pdu[pos + 1]);
        let end = pos + 2 + len;
        if end > pdu.len() {
            return Err(ModbusError::framing(format!(
                "Object 0x{id:02X} length does not match"
            )));
        }
        raw.objects.push((id, pdu[pos + 2..end].to_vec()));
        pos = end;
    }
    if pos != pdu.len() {
        return Err(ModbusError::framing(format!(
            "{} trailing bytes after the last object",
            pdu.len() - pos
        )));
    }

    trace!(
        "Device id fragment: {} objects, more={}",
        raw.objects.len(),
        raw.more_requests_needed
    );
    Ok(raw)
}

/// Function-specific shape check of a reply PDU against its request PDU,
/// shared by every validator
pub(crate) fn check_response_shape(request: &[u8], pdu: &[u8]) -> ModbusResult<()> {
    let Some(&function_code) = pdu.first() else {
        return Err(ModbusError::framing("Empty PDU"));
    };
    match function_code {
        constants::FC_READ_COILS..=constants::FC_READ_INPUT_REGISTERS => {
            read_payload(function_code, pdu).map(|_| ())
        },
        constants::FC_WRITE_SINGLE_COIL
        | constants::FC_WRITE_SINGLE_REGISTER
        | constants::FC_WRITE_MULTIPLE_COILS
        | constants::FC_WRITE_MULTIPLE_REGISTERS => write_echo(function_code, pdu).map(|_| ()),
        constants::FC_ENCAPSULATED_INTERFACE => {
            decode_device_identification(pdu)?;
            match (request.get(2), pdu.get(2)) {
                (Some(asked), Some(got)) if asked != got => Err(ModbusError::framing(format!(
                    "Read device id code does not match: expected 0x{asked:02X}, got 0x{got:02X}"
                ))),
                _ => Ok(()),
            }
        },
        _ => Ok(()),
    }
}

// ============================================================================
// Request decoding (responder side)
// ============================================================================

fn invalid(function_code: u8, code: ExceptionCode) -> Request {
    Request::Invalid {
        function_code,
        code,
    }
}

fn decode_read(function_code: u8, pdu: &[u8], max: u16) -> Request {
    if pdu.len() != 5 {
        return invalid(function_code, ExceptionCode::IllegalDataValue);
    }
    let start_address = be_u16(pdu, 1);
    let count = be_u16(pdu, 3);
    if !(constants::MIN_READ_COUNT..=max).contains(&count) {
        return invalid(function_code, ExceptionCode::IllegalDataValue);
    }
    if u32::from(start_address) + u32::from(count) - 1 > u32::from(u16::MAX) {
        return invalid(function_code, ExceptionCode::IllegalDataAddress);
    }
    match function_code {
        constants::FC_READ_COILS => Request::ReadCoils {
            start_address,
            count,
        },
        constants::FC_READ_DISCRETE_INPUTS => Request::ReadDiscreteInputs {
            start_address,
            count,
        },
        constants::FC_READ_HOLDING_REGISTERS => Request::ReadHoldingRegisters {
            start_address,
            count,
        },
        _ => Request::ReadInputRegisters {
            start_address,
            count,
        },
    }
}

/// Header of FC15/FC16: `(start, count, payload)` when consistent
fn decode_write_header(
    pdu: &[u8],
    max: u16,
    bytes_for: fn(u16) -> usize,
) -> Option<(u16, u16, &[u8])> {
    if pdu.len() < 6 {
        return None;
    }
    let start_address = be_u16(pdu, 1);
    let count = be_u16(pdu, 3);
    let byte_count = usize::from(pdu[5]);
    let data = &pdu[6..];
    if !(constants::MIN_WRITE_COUNT..=max).contains(&count)
        || byte_count != bytes_for(count)
        || data.len() != byte_count
    {
        return None;
    }
    Some((start_address, count, data))
}

/// Decode a request PDU. Payload violations become [`Request::Invalid`];
/// only an empty PDU is an error.
pub fn decode_request(pdu: &[u8]) -> ModbusResult<Request> {
    let Some(&function_code) = pdu.first() else {
        return Err(ModbusError::framing("Empty PDU"));
    };

    let request = match function_code {
        constants::FC_READ_COILS | constants::FC_READ_DISCRETE_INPUTS => {
            decode_read(function_code, pdu, constants::MAX_DISCRETE_READ_COUNT)
        },
        constants::FC_READ_HOLDING_REGISTERS | constants::FC_READ_INPUT_REGISTERS => {
            decode_read(function_code, pdu, constants::MAX_REGISTER_READ_COUNT)
        },
        constants::FC_WRITE_SINGLE_COIL => {
            if pdu.len() != 5 {
                return Ok(invalid(function_code, ExceptionCode::IllegalDataValue));
            }
            match be_u16(pdu, 3) {
                constants::COIL_ON => Request::WriteSingleCoil(Coil::new(be_u16(pdu, 1), true)),
                constants::COIL_OFF => Request::WriteSingleCoil(Coil::new(be_u16(pdu, 1), false)),
                _ => invalid(function_code, ExceptionCode::IllegalDataValue),
            }
        },
        constants::FC_WRITE_SINGLE_REGISTER => {
            if pdu.len() != 5 {
                return Ok(invalid(function_code, ExceptionCode::IllegalDataValue));
            }
            Request::WriteSingleRegister(HoldingRegister::new(be_u16(pdu, 1), be_u16(pdu, 3)))
        },
        constants::FC_WRITE_MULTIPLE_COILS => {
            match decode_write_header(pdu, constants::MAX_DISCRETE_WRITE_COUNT, |n| {
                usize::from(n).div_ceil(8)
            }) {
                Some((start, count, _)) if u32::from(start) + u32::from(count) - 1 > 0xFFFF => {
                    invalid(function_code, ExceptionCode::IllegalDataAddress)
                },
                Some((start, count, data)) => Request::WriteMultipleCoils(addressed(
                    start,
                    unpack_bits(data, usize::from(count)),
                    Coil::new,
                )),
                None => invalid(function_code, ExceptionCode::IllegalDataValue),
            }
        },
        constants::FC_WRITE_MULTIPLE_REGISTERS => {
            match decode_write_header(pdu, constants::MAX_REGISTER_WRITE_COUNT, |n| {
                usize::from(n) * 2
            }) {
                Some((start, count, _)) if u32::from(start) + u32::from(count) - 1 > 0xFFFF => {
                    invalid(function_code, ExceptionCode::IllegalDataAddress)
                },
                Some((start, _, data)) => {
                    let values = data
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    Request::WriteMultipleRegisters(addressed(start, values, HoldingRegister::new))
                },
                None => invalid(function_code, ExceptionCode::IllegalDataValue),
            }
        },
        constants::FC_ENCAPSULATED_INTERFACE => {
            if pdu.get(1) != Some(&constants::MEI_READ_DEVICE_IDENTIFICATION) {
                invalid(function_code, ExceptionCode::IllegalFunction)
            } else if pdu.len() != 4 {
                invalid(function_code, ExceptionCode::IllegalDataValue)
            } else {
                match DeviceIdentificationCategory::try_from(pdu[2]) {
                    Ok(category) => Request::ReadDeviceIdentification {
                        category,
                        object_id: pdu[3],
                    },
                    Err(_) => invalid(function_code, ExceptionCode::IllegalDataValue),
                }
            }
        },
        _ => Request::Unsupported { function_code },
    };

    Ok(request)
}

// ============================================================================
// Response encoding (responder side)
// ============================================================================

fn bits_reply(function_code: u8, bits: &[bool]) -> Vec<u8> {
    let packed = pack_bits(bits);
    let mut pdu = Vec::with_capacity(2 + packed.len());
    pdu.push(function_code);
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

fn registers_reply(function_code: u8, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(function_code);
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

fn multiple_reply(function_code: u8, start_address: u16, count: u16) -> Vec<u8> {
    let mut pdu = vec![function_code];
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    match response {
        Response::ReadCoils(bits) => bits_reply(constants::FC_READ_COILS, bits),
        Response::ReadDiscreteInputs(bits) => bits_reply(constants::FC_READ_DISCRETE_INPUTS, bits),
        Response::ReadHoldingRegisters(values) => {
            registers_reply(constants::FC_READ_HOLDING_REGISTERS, values)
        },
        Response::ReadInputRegisters(values) => {
            registers_reply(constants::FC_READ_INPUT_REGISTERS, values)
        },
        Response::WriteSingleCoil(coil) => write_single_coil_request(coil),
        Response::WriteSingleRegister(register) => write_single_register_request(register),
        Response::WriteMultipleCoils {
            start_address,
            count,
        } => multiple_reply(constants::FC_WRITE_MULTIPLE_COILS, *start_address, *count),
        Response::WriteMultipleRegisters {
            start_address,
            count,
        } => multiple_reply(constants::FC_WRITE_MULTIPLE_REGISTERS, *start_address, *count),
        Response::ReadDeviceIdentification(ident) => {
            let mut pdu = vec![
                constants::FC_ENCAPSULATED_INTERFACE,
                constants::MEI_READ_DEVICE_IDENTIFICATION,
                ident.category as u8,
                ident.conformity_level,
                if ident.more_follows { 0xFF } else { 0x00 },
                ident.next_object_id,
                ident.objects.len() as u8,
            ];
            for (id, data) in &ident.objects {
                pdu.push(*id);
                pdu.push(data.len() as u8);
                pdu.extend_from_slice(data);
            }
            pdu
        },
        Response::Exception {
            function_code,
            code,
        } => vec![function_code | ERROR_FLAG, u8::from(*code)],
    }
}

/// Build one Read Device Identification reply fragment.
///
/// Objects are taken in id order from the start id up to the category
/// ceiling, skipping reserved ids. An object that would push the PDU past
/// `max_pdu_len` ends the fragment and becomes `next_object_id`.
pub fn encode_device_identification(
    identity: &DeviceIdentity,
    category: DeviceIdentificationCategory,
    first_object_id: u8,
    max_pdu_len: usize,
) -> Response {
    let fail = |code| Response::Exception {
        function_code: constants::FC_ENCAPSULATED_INTERFACE,
        code,
    };
    let objects = identity.objects();
    let ceiling = category.last_object_id(first_object_id);

    let start = match category {
        DeviceIdentificationCategory::Individual => {
            if !objects.contains_key(&first_object_id) {
                return fail(ExceptionCode::IllegalDataAddress);
            }
            first_object_id
        },
        _ if first_object_id <= ceiling && objects.contains_key(&first_object_id) => {
            first_object_id
        },
        _ => constants::OBJECT_VENDOR_NAME,
    };

    let mut reply = DeviceIdentificationResponse {
        category,
        conformity_level: identity.conformity_level(),
        more_follows: false,
        next_object_id: 0x00,
        objects: Vec::new(),
    };
    let mut len = constants::DEVICE_ID_HEADER_LEN;

    for (&id, data) in objects.range(start..=ceiling) {
        if constants::RESERVED_OBJECT_IDS.contains(&id) {
            continue;
        }
        let size = 2 + data.len();
        if len + size > max_pdu_len {
            if reply.objects.is_empty() {
                return fail(ExceptionCode::SlaveDeviceFailure);
            }
            reply.more_follows = true;
            reply.next_object_id = id;
            break;
        }
        len += size;
        reply.objects.push((id, data.clone()));
    }

    Response::ReadDeviceIdentification(reply)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn coils(addresses: &[u16]) -> Vec<Coil> {
        addresses.iter().map(|&a| Coil::new(a, a % 2 == 0)).collect()
    }

    #[test]
    fn test_pack_bits_lsb_first() {
        let bits = [true, false, true, true, false, false, true, true, true, false];
        assert_eq!(pack_bits(&bits), vec![0xCD, 0x01]);
        assert_eq!(unpack_bits(&[0xCD, 0x01], 10), bits.to_vec());
    }

    #[test]
    fn test_read_request_count_limits() {
        assert!(read_request(constants::FC_READ_COILS, 0, 2000).is_ok());
        assert!(matches!(
            read_request(constants::FC_READ_COILS, 0, 2001),
            Err(ModbusError::OutOfRange(_))
        ));
        assert!(matches!(
            read_request(constants::FC_READ_HOLDING_REGISTERS, 0, 126),
            Err(ModbusError::OutOfRange(_))
        ));
        assert!(matches!(
            read_request(constants::FC_READ_INPUT_REGISTERS, 0, 0),
            Err(ModbusError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_read_request_address_space_edge() {
        assert!(read_request(constants::FC_READ_HOLDING_REGISTERS, 65535, 1).is_ok());
        assert!(read_request(constants::FC_READ_HOLDING_REGISTERS, 65411, 125).is_ok());
        assert!(matches!(
            read_request(constants::FC_READ_HOLDING_REGISTERS, 65535, 2),
            Err(ModbusError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_write_batch_accepts_unordered_contiguous() {
        let pdu = write_multiple_coils_request(&coils(&[12, 10, 11])).unwrap();
        // start 10, count 3, 1 byte: 10->true, 11->false, 12->true
        assert_eq!(pdu, vec![0x0F, 0x00, 0x0A, 0x00, 0x03, 0x01, 0b101]);
    }

    #[test]
    fn test_write_batch_rejects_duplicate_and_gap() {
        let err = write_multiple_coils_request(&coils(&[1, 2, 2])).unwrap_err();
        assert!(matches!(
            &err,
            ModbusError::InvalidArgument(m) if m.contains("Duplicate address 2")
        ));

        let regs = [HoldingRegister::new(5, 1), HoldingRegister::new(7, 2)];
        let err = write_multiple_registers_request(&regs).unwrap_err();
        assert!(matches!(&err, ModbusError::InvalidArgument(m) if m.contains("Gap")));

        assert!(matches!(
            write_multiple_registers_request(&[]),
            Err(ModbusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_batch_contiguity_matches_sorted_range() {
        // Every subset of 0..6 as a bitmask: accepted iff the set bits form one run
        for mask in 1u8..64 {
            let addresses: Vec<u16> = (0..6).filter(|i| mask & (1 << i) != 0).collect();
            let first = *addresses.first().unwrap();
            let last = *addresses.last().unwrap();
            let contiguous = usize::from(last - first) + 1 == addresses.len();
            let result = write_multiple_coils_request(&coils(&addresses));
            assert_eq!(result.is_ok(), contiguous, "addresses {addresses:?}");
        }
    }

    #[test]
    fn test_write_batch_count_limit() {
        let regs: Vec<_> = (0..124).map(|a| HoldingRegister::new(a, 0)).collect();
        assert!(matches!(
            write_multiple_registers_request(&regs),
            Err(ModbusError::OutOfRange(_))
        ));
        assert!(write_multiple_registers_request(&regs[..123]).is_ok());
    }

    #[test]
    fn test_decode_bits_byte_count_mismatch() {
        let err = decode_bits_response(0x01, &[0x01, 0x03, 0xCD, 0x6B], 19).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("Byte count does not match")));
    }

    #[test]
    fn test_decode_bits_rejects_oversized_payload() {
        // Consistent byte count, but 8 coils fit in one byte
        let err = decode_bits_response(0x01, &[0x01, 0x02, 0xFF, 0x01], 8).unwrap_err();
        assert!(matches!(err, ModbusError::Framing(m) if m.contains("expected 1 for 8 values")));
        assert_eq!(
            decode_bits_response(0x01, &[0x01, 0x01, 0xFF], 8).unwrap(),
            vec![true; 8]
        );
    }

    #[test]
    fn test_decode_exception_reply() {
        let err = decode_registers_response(0x03, &[0x83, 0x02], 1).unwrap_err();
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_decode_device_identification_rejects_mei_type() {
        let pdu = [0x2B, 0x0D, 0x01, 0x81, 0x00, 0x00, 0x00];
        assert!(matches!(
            decode_device_identification(&pdu),
            Err(ModbusError::Framing(m)) if m.contains("MEI type")
        ));
    }

    #[test]
    fn test_decode_request_variants() {
        assert_eq!(
            decode_request(&[0x03, 0x00, 0x6B, 0x00, 0x03]).unwrap(),
            Request::ReadHoldingRegisters {
                start_address: 0x6B,
                count: 3
            }
        );
        assert_eq!(
            decode_request(&[0x03, 0x00, 0x00, 0x00, 0x7E]).unwrap(),
            Request::Invalid {
                function_code: 0x03,
                code: ExceptionCode::IllegalDataValue
            }
        );
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x01, 0x12, 0x34]).unwrap(),
            Request::Invalid {
                function_code: 0x05,
                code: ExceptionCode::IllegalDataValue
            }
        );
        assert_eq!(
            decode_request(&[0x42]).unwrap(),
            Request::Unsupported { function_code: 0x42 }
        );
        assert!(decode_request(&[]).is_err());
    }

    #[test]
    fn test_decode_write_multiple_registers_request() {
        let pdu = write_multiple_registers_request(&[
            HoldingRegister::new(0x0102, 0x000A),
            HoldingRegister::new(0x0101, 0xBEEF),
        ])
        .unwrap();
        assert_eq!(
            decode_request(&pdu).unwrap(),
            Request::WriteMultipleRegisters(vec![
                HoldingRegister::new(0x0101, 0xBEEF),
                HoldingRegister::new(0x0102, 0x000A),
            ])
        );
    }

    #[test]
    fn test_exception_response_encoding() {
        let request = Request::Unsupported { function_code: 0x42 };
        let pdu = encode_response(&request.exception(ExceptionCode::IllegalFunction));
        assert_eq!(pdu, vec![0xC2, 0x01]);
    }

    fn large_identity() -> DeviceIdentity {
        let mut identity = DeviceIdentity::basic("Voltage", "VX-1", "1.0").unwrap();
        identity.set_object(constants::OBJECT_PRODUCT_NAME, "Modlink").unwrap();
        for id in 0x80..0x86 {
            identity.set_object(id, vec![id; 60]).unwrap();
        }
        identity
    }

    fn fragment(response: Response) -> DeviceIdentificationResponse {
        match response {
            Response::ReadDeviceIdentification(r) => r,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_device_identification_pagination_has_no_gaps() {
        let identity = large_identity();
        let first = fragment(encode_device_identification(
            &identity,
            DeviceIdentificationCategory::Extended,
            0x00,
            constants::MAX_PDU_SIZE,
        ));
        assert!(first.more_follows);
        assert!(encode_response(&Response::ReadDeviceIdentification(first.clone())).len() <= 253);

        let second = fragment(encode_device_identification(
            &identity,
            DeviceIdentificationCategory::Extended,
            first.next_object_id,
            constants::MAX_PDU_SIZE,
        ));
        assert!(!second.more_follows);

        let ids: Vec<u8> = first
            .objects
            .iter()
            .chain(second.objects.iter())
            .map(|(id, _)| *id)
            .collect();
        let expected: Vec<u8> = identity.objects().keys().copied().collect();
        assert_eq!(ids, expected);
        assert_eq!(first.next_object_id, second.objects[0].0);
    }

    #[test]
    fn test_device_identification_category_ceiling() {
        let identity = large_identity();
        let basic = fragment(encode_device_identification(
            &identity,
            DeviceIdentificationCategory::Basic,
            0x00,
            constants::MAX_PDU_SIZE,
        ));
        let ids: Vec<u8> = basic.objects.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0x00, 0x01, 0x02]);
        assert_eq!(basic.conformity_level, 0x83);
    }

    #[test]
    fn test_device_identification_individual_and_restart() {
        let identity = large_identity();
        let single = fragment(encode_device_identification(
            &identity,
            DeviceIdentificationCategory::Individual,
            0x04,
            constants::MAX_PDU_SIZE,
        ));
        assert_eq!(single.objects, vec![(0x04, b"Modlink".to_vec())]);

        assert_eq!(
            encode_device_identification(
                &identity,
                DeviceIdentificationCategory::Individual,
                0x05,
                constants::MAX_PDU_SIZE,
            ),
            Response::Exception {
                function_code: 0x2B,
                code: ExceptionCode::IllegalDataAddress
            }
        );

        // Stream access from a missing object restarts at the vendor name
        let regular = fragment(encode_device_identification(
            &identity,
            DeviceIdentificationCategory::Regular,
            0x05,
            constants::MAX_PDU_SIZE,
        ));
        assert_eq!(regular.objects[0].0, 0x00);
        assert_eq!(regular.objects.len(), 4);
    }
}
