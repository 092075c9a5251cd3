//! Modbus protocol constants
//!
//! Frame limits per transport and the count limits every codec enforces.
//! Count limits are derived from the 253 byte PDU ceiling.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (function code + payload) size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU: unit id(1) + PDU(253) + CRC(2)
pub const RTU_MAX_ADU_LEN: usize = 256;

/// Maximum ASCII ADU in characters: ':' + hex(unit + PDU + LRC) + CRLF
pub const ASCII_MAX_ADU_LEN: usize = 513;

/// Maximum TCP ADU: MBAP(7) + PDU(253)
pub const TCP_MAX_ADU_LEN: usize = 260;

/// MBAP header length including the unit id
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Response read buffer size for a single transport read
pub const READ_BUFFER_SIZE: usize = 512;

// ============================================================================
// Count Limits
// ============================================================================

/// Minimum quantity for any read request
pub const MIN_READ_COUNT: u16 = 1;

/// Maximum coils / discrete inputs per read (FC01/FC02)
pub const MAX_DISCRETE_READ_COUNT: u16 = 2000;

/// Maximum registers per read (FC03/FC04)
pub const MAX_REGISTER_READ_COUNT: u16 = 125;

/// Minimum quantity for any write-multiple request
pub const MIN_WRITE_COUNT: u16 = 1;

/// Maximum coils per write (FC15)
pub const MAX_DISCRETE_WRITE_COUNT: u16 = 1968;

/// Maximum registers per write (FC16)
pub const MAX_REGISTER_WRITE_COUNT: u16 = 123;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

/// Error replies set this bit on the echoed function code
pub const ERROR_FLAG: u8 = 0x80;

/// MEI type for Read Device Identification
pub const MEI_READ_DEVICE_IDENTIFICATION: u8 = 0x0E;

/// Single coil ON value
pub const COIL_ON: u16 = 0xFF00;

/// Single coil OFF value
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Device Identification Object Ids
// ============================================================================

pub const OBJECT_VENDOR_NAME: u8 = 0x00;
pub const OBJECT_PRODUCT_CODE: u8 = 0x01;
pub const OBJECT_MAJOR_MINOR_REVISION: u8 = 0x02;
pub const OBJECT_VENDOR_URL: u8 = 0x03;
pub const OBJECT_PRODUCT_NAME: u8 = 0x04;
pub const OBJECT_MODEL_NAME: u8 = 0x05;
pub const OBJECT_USER_APPLICATION_NAME: u8 = 0x06;

/// Reserved object ids, never emitted
pub const RESERVED_OBJECT_IDS: std::ops::RangeInclusive<u8> = 0x07..=0x7F;

/// First vendor-extended object id
pub const FIRST_EXTENDED_OBJECT_ID: u8 = 0x80;

/// Read Device Identification reply header:
/// FC + MEI type + ReadDevId code + conformity + more follows + next id + object count
pub const DEVICE_ID_HEADER_LEN: usize = 7;

/// Largest object that still fits a reply on its own: id(1) + length(1) + data
pub const MAX_DEVICE_ID_OBJECT_LEN: usize = MAX_PDU_SIZE - DEVICE_ID_HEADER_LEN - 2;
