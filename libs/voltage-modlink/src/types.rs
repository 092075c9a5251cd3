//! Modbus data model
//!
//! Addressable objects exchanged with a device, exception codes and the
//! device identification records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants;
use crate::error::{ModbusError, ModbusResult};

// ============================================================================
// Addressable Objects
// ============================================================================

/// Single-bit read/write value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coil {
    pub address: u16,
    pub value: bool,
}

impl Coil {
    pub fn new(address: u16, value: bool) -> Self {
        Self { address, value }
    }
}

/// Single-bit read-only value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscreteInput {
    pub address: u16,
    pub value: bool,
}

impl DiscreteInput {
    pub fn new(address: u16, value: bool) -> Self {
        Self { address, value }
    }
}

/// 16-bit read/write register, stored as it travels on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldingRegister {
    pub address: u16,
    pub high_byte: u8,
    pub low_byte: u8,
}

impl HoldingRegister {
    pub fn new(address: u16, value: u16) -> Self {
        let [high_byte, low_byte] = value.to_be_bytes();
        Self {
            address,
            high_byte,
            low_byte,
        }
    }

    /// Big-endian combination of both bytes
    pub fn value(&self) -> u16 {
        u16::from_be_bytes([self.high_byte, self.low_byte])
    }
}

/// 16-bit read-only register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputRegister {
    pub address: u16,
    pub high_byte: u8,
    pub low_byte: u8,
}

impl InputRegister {
    pub fn new(address: u16, value: u16) -> Self {
        let [high_byte, low_byte] = value.to_be_bytes();
        Self {
            address,
            high_byte,
            low_byte,
        }
    }

    pub fn value(&self) -> u16 {
        u16::from_be_bytes([self.high_byte, self.low_byte])
    }
}

/// Any addressable Modbus object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModbusObject {
    Coil(Coil),
    DiscreteInput(DiscreteInput),
    HoldingRegister(HoldingRegister),
    InputRegister(InputRegister),
}

impl ModbusObject {
    pub fn address(&self) -> u16 {
        match self {
            ModbusObject::Coil(c) => c.address,
            ModbusObject::DiscreteInput(d) => d.address,
            ModbusObject::HoldingRegister(h) => h.address,
            ModbusObject::InputRegister(i) => i.address,
        }
    }
}

impl From<Coil> for ModbusObject {
    fn from(v: Coil) -> Self {
        Self::Coil(v)
    }
}

impl From<DiscreteInput> for ModbusObject {
    fn from(v: DiscreteInput) -> Self {
        Self::DiscreteInput(v)
    }
}

impl From<HoldingRegister> for ModbusObject {
    fn from(v: HoldingRegister) -> Self {
        Self::HoldingRegister(v)
    }
}

impl From<InputRegister> for ModbusObject {
    fn from(v: InputRegister) -> Self {
        Self::InputRegister(v)
    }
}

// ============================================================================
// Exception Codes
// ============================================================================

/// Modbus exception code carried by an error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    /// Code outside the defined set, kept verbatim
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDeviceFailedToRespond,
            other => Self::Other(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        match code {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::NegativeAcknowledge => 0x07,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetDeviceFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "Illegal Function"),
            ExceptionCode::IllegalDataAddress => write!(f, "Illegal Data Address"),
            ExceptionCode::IllegalDataValue => write!(f, "Illegal Data Value"),
            ExceptionCode::SlaveDeviceFailure => write!(f, "Slave Device Failure"),
            ExceptionCode::Acknowledge => write!(f, "Acknowledge"),
            ExceptionCode::SlaveDeviceBusy => write!(f, "Slave Device Busy"),
            ExceptionCode::NegativeAcknowledge => write!(f, "Negative Acknowledge"),
            ExceptionCode::MemoryParityError => write!(f, "Memory Parity Error"),
            ExceptionCode::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            ExceptionCode::GatewayTargetDeviceFailedToRespond => {
                write!(f, "Gateway Target Device Failed to Respond")
            },
            ExceptionCode::Other(code) => write!(f, "Unknown exception 0x{code:02X}"),
        }
    }
}

// ============================================================================
// Device Identification
// ============================================================================

/// Read Device Identification access category (ReadDevId code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdentificationCategory {
    Basic = 0x01,
    Regular = 0x02,
    Extended = 0x03,
    Individual = 0x04,
}

impl DeviceIdentificationCategory {
    /// Highest object id a stream access of this category may return
    pub fn last_object_id(self, requested: u8) -> u8 {
        match self {
            Self::Basic => constants::OBJECT_MAJOR_MINOR_REVISION,
            Self::Regular => constants::OBJECT_USER_APPLICATION_NAME,
            Self::Extended => 0xFF,
            Self::Individual => requested,
        }
    }
}

impl TryFrom<u8> for DeviceIdentificationCategory {
    type Error = ModbusError;

    fn try_from(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(Self::Basic),
            0x02 => Ok(Self::Regular),
            0x03 => Ok(Self::Extended),
            0x04 => Ok(Self::Individual),
            other => Err(ModbusError::out_of_range(format!(
                "Device identification category 0x{other:02X} is not defined"
            ))),
        }
    }
}

impl std::str::FromStr for DeviceIdentificationCategory {
    type Err = ModbusError;

    fn from_str(s: &str) -> ModbusResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "regular" => Ok(Self::Regular),
            "extended" => Ok(Self::Extended),
            "individual" => Ok(Self::Individual),
            other => Err(ModbusError::out_of_range(format!(
                "Unknown device identification category: {other}"
            ))),
        }
    }
}

/// One decoded Encapsulated Interface response fragment
///
/// `objects` keeps wire order. When `more_requests_needed` is set the caller
/// re-requests starting at `next_object_id_to_request`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentificationRaw {
    pub allows_individual_access: bool,
    pub more_requests_needed: bool,
    pub next_object_id_to_request: u8,
    pub objects: Vec<(u8, Vec<u8>)>,
}

impl DeviceIdentificationRaw {
    /// Raw bytes of an object, if present in this fragment
    pub fn object(&self, id: u8) -> Option<&[u8]> {
        self.objects
            .iter()
            .find(|(object_id, _)| *object_id == id)
            .map(|(_, data)| data.as_slice())
    }
}

/// Device identification with the standard objects decoded as text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentification {
    pub vendor_name: Option<String>,
    pub product_code: Option<String>,
    pub major_minor_revision: Option<String>,
    pub vendor_url: Option<String>,
    pub product_name: Option<String>,
    pub model_name: Option<String>,
    pub user_application_name: Option<String>,
    /// Vendor-extended objects (0x80-0xFF), raw
    pub extended_objects: Vec<(u8, Vec<u8>)>,
    pub allows_individual_access: bool,
}

impl DeviceIdentification {
    /// Fold one fragment into the accumulated identification
    pub fn merge(&mut self, fragment: &DeviceIdentificationRaw) {
        self.allows_individual_access |= fragment.allows_individual_access;
        for (id, data) in &fragment.objects {
            let text = || Some(String::from_utf8_lossy(data).into_owned());
            match *id {
                constants::OBJECT_VENDOR_NAME => self.vendor_name = text(),
                constants::OBJECT_PRODUCT_CODE => self.product_code = text(),
                constants::OBJECT_MAJOR_MINOR_REVISION => self.major_minor_revision = text(),
                constants::OBJECT_VENDOR_URL => self.vendor_url = text(),
                constants::OBJECT_PRODUCT_NAME => self.product_name = text(),
                constants::OBJECT_MODEL_NAME => self.model_name = text(),
                constants::OBJECT_USER_APPLICATION_NAME => self.user_application_name = text(),
                id if id >= constants::FIRST_EXTENDED_OBJECT_ID => {
                    self.extended_objects.push((id, data.clone()));
                },
                _ => {},
            }
        }
    }
}

/// Object table a responder serves through Read Device Identification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    objects: BTreeMap<u8, Vec<u8>>,
}

impl DeviceIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity carrying the three mandatory basic objects
    pub fn basic(
        vendor_name: &str,
        product_code: &str,
        major_minor_revision: &str,
    ) -> ModbusResult<Self> {
        let mut identity = Self::new();
        identity.set_object(constants::OBJECT_VENDOR_NAME, vendor_name)?;
        identity.set_object(constants::OBJECT_PRODUCT_CODE, product_code)?;
        identity.set_object(constants::OBJECT_MAJOR_MINOR_REVISION, major_minor_revision)?;
        Ok(identity)
    }

    /// Store an object; reserved ids and objects too large for one reply are rejected
    pub fn set_object(&mut self, id: u8, data: impl Into<Vec<u8>>) -> ModbusResult<()> {
        if constants::RESERVED_OBJECT_IDS.contains(&id) {
            return Err(ModbusError::out_of_range(format!(
                "Object id 0x{id:02X} is reserved"
            )));
        }
        let data = data.into();
        if data.len() > constants::MAX_DEVICE_ID_OBJECT_LEN {
            return Err(ModbusError::out_of_range(format!(
                "Object 0x{id:02X} is {} bytes, at most {} fit a reply",
                data.len(),
                constants::MAX_DEVICE_ID_OBJECT_LEN
            )));
        }
        self.objects.insert(id, data);
        Ok(())
    }

    pub fn object(&self, id: u8) -> Option<&[u8]> {
        self.objects.get(&id).map(Vec::as_slice)
    }

    pub fn objects(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.objects
    }

    /// Conformity level byte: highest populated category, 0x80 = individual access supported
    pub fn conformity_level(&self) -> u8 {
        let level = if self
            .objects
            .keys()
            .any(|&id| id >= constants::FIRST_EXTENDED_OBJECT_ID)
        {
            DeviceIdentificationCategory::Extended
        } else if self.objects.keys().any(|&id| {
            (constants::OBJECT_VENDOR_URL..=constants::OBJECT_USER_APPLICATION_NAME).contains(&id)
        }) {
            DeviceIdentificationCategory::Regular
        } else {
            DeviceIdentificationCategory::Basic
        };
        0x80 | level as u8
    }
}
