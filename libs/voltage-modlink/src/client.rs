//! Typed Modbus client
//!
//! Combines a wire codec with a [`ModbusConnection`]: every operation
//! serializes a request, queues it on the connection, validates the reply and
//! decodes it. Dropping an operation's future abandons the request. To
//! cancel through a token instead, run the operations on a handle from
//! [`ModbusClient::with_cancellation`]; a fired token fails them with
//! [`ModbusError::Cancelled`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::ModbusProtocol;
use crate::config::{LinkConfig, TransportConfig};
use crate::connection::{Completeness, ModbusConnection};
use crate::error::{ModbusError, ModbusResult};
use crate::types::{
    Coil, DeviceIdentification, DeviceIdentificationCategory, DeviceIdentificationRaw,
    DiscreteInput, HoldingRegister, InputRegister,
};

/// Modbus client over one codec and one connection
#[derive(Debug, Clone)]
pub struct ModbusClient {
    protocol: Arc<dyn ModbusProtocol>,
    connection: Arc<ModbusConnection>,
    /// Dispose the connection on [`ModbusClient::close`]
    dispose_connection: bool,
    /// Caller token every typed operation runs under
    cancel: CancellationToken,
}

impl ModbusClient {
    pub fn new(
        protocol: Arc<dyn ModbusProtocol>,
        connection: Arc<ModbusConnection>,
        dispose_connection: bool,
    ) -> Self {
        Self {
            protocol,
            connection,
            dispose_connection,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle on the same codec and connection whose operations are cancelled
    /// by `cancel`. The handle never disposes the connection.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            protocol: self.protocol.clone(),
            connection: self.connection.clone(),
            dispose_connection: false,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Build codec and connection from a link configuration; the client owns the connection
    pub fn from_config(config: &LinkConfig) -> ModbusResult<Self> {
        config.validate()?;
        let options = config.connection_options();
        let connection = match &config.transport {
            TransportConfig::Tcp(tcp) => ModbusConnection::tcp(tcp.clone(), options)?,
            TransportConfig::Serial(serial) => ModbusConnection::serial(serial.clone(), options)?,
        };
        debug!("{} client on {}", config.protocol, connection.name());
        Ok(Self::new(config.protocol.create(), Arc::new(connection), true))
    }

    pub fn protocol(&self) -> &Arc<dyn ModbusProtocol> {
        &self.protocol
    }

    pub fn connection(&self) -> &Arc<ModbusConnection> {
        &self.connection
    }

    fn completeness(&self) -> Completeness {
        let protocol = self.protocol.clone();
        Arc::new(move |bytes: &[u8]| protocol.check_response_complete(bytes))
    }

    /// Forward an already framed request; the reply is returned unvalidated
    pub async fn invoke_raw(
        &self,
        request: Vec<u8>,
        cancel: &CancellationToken,
    ) -> ModbusResult<Vec<u8>> {
        self.connection
            .invoke(request, self.completeness(), cancel)
            .await
    }

    async fn exchange(&self, request: Vec<u8>) -> ModbusResult<Vec<u8>> {
        let response = self
            .connection
            .invoke(request.clone(), self.completeness(), &self.cancel)
            .await?;
        self.protocol.validate_response(&request, &response)?;
        Ok(response)
    }

    pub async fn read_coils(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<Coil>> {
        let request = self
            .protocol
            .serialize_read_coils(unit_id, start_address, count)?;
        let response = self.exchange(request).await?;
        self.protocol
            .deserialize_read_coils(&response, start_address, count)
    }

    pub async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<DiscreteInput>> {
        let request = self
            .protocol
            .serialize_read_discrete_inputs(unit_id, start_address, count)?;
        let response = self.exchange(request).await?;
        self.protocol
            .deserialize_read_discrete_inputs(&response, start_address, count)
    }

    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<HoldingRegister>> {
        let request = self
            .protocol
            .serialize_read_holding_registers(unit_id, start_address, count)?;
        let response = self.exchange(request).await?;
        self.protocol
            .deserialize_read_holding_registers(&response, start_address, count)
    }

    pub async fn read_input_registers(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<InputRegister>> {
        let request = self
            .protocol
            .serialize_read_input_registers(unit_id, start_address, count)?;
        let response = self.exchange(request).await?;
        self.protocol
            .deserialize_read_input_registers(&response, start_address, count)
    }

    /// Returns true when the device echoed the written coil
    pub async fn write_single_coil(&self, unit_id: u8, coil: Coil) -> ModbusResult<bool> {
        let request = self.protocol.serialize_write_single_coil(unit_id, &coil)?;
        let response = self.exchange(request).await?;
        let echo = self.protocol.deserialize_write_single_coil(&response)?;
        Ok(echo == coil)
    }

    /// Returns true when the device echoed the written register
    pub async fn write_single_holding_register(
        &self,
        unit_id: u8,
        register: HoldingRegister,
    ) -> ModbusResult<bool> {
        let request = self
            .protocol
            .serialize_write_single_holding_register(unit_id, &register)?;
        let response = self.exchange(request).await?;
        let echo = self
            .protocol
            .deserialize_write_single_holding_register(&response)?;
        Ok(echo == register)
    }

    /// Returns true when the device echoed the written range
    pub async fn write_multiple_coils(&self, unit_id: u8, coils: &[Coil]) -> ModbusResult<bool> {
        let request = self.protocol.serialize_write_multiple_coils(unit_id, coils)?;
        let response = self.exchange(request).await?;
        let echo = self.protocol.deserialize_write_multiple_coils(&response)?;
        Ok(echo == written_range(coils.iter().map(|c| c.address)))
    }

    /// Returns true when the device echoed the written range
    pub async fn write_multiple_holding_registers(
        &self,
        unit_id: u8,
        registers: &[HoldingRegister],
    ) -> ModbusResult<bool> {
        let request = self
            .protocol
            .serialize_write_multiple_holding_registers(unit_id, registers)?;
        let response = self.exchange(request).await?;
        let echo = self
            .protocol
            .deserialize_write_multiple_holding_registers(&response)?;
        Ok(echo == written_range(registers.iter().map(|r| r.address)))
    }

    /// One Read Device Identification fragment
    pub async fn read_device_identification_raw(
        &self,
        unit_id: u8,
        category: DeviceIdentificationCategory,
        object_id: u8,
    ) -> ModbusResult<DeviceIdentificationRaw> {
        let request = self
            .protocol
            .serialize_read_device_identification(unit_id, category, object_id)?;
        let response = self.exchange(request).await?;
        self.protocol.deserialize_read_device_identification(&response)
    }

    /// Read every object of a stream category, following the fragment chain
    pub async fn read_device_identification(
        &self,
        unit_id: u8,
        category: DeviceIdentificationCategory,
    ) -> ModbusResult<DeviceIdentification> {
        if category == DeviceIdentificationCategory::Individual {
            return Err(ModbusError::invalid_argument(
                "Individual access reads one object; use read_device_identification_raw",
            ));
        }

        let mut identification = DeviceIdentification::default();
        let mut object_id = 0u8;
        loop {
            let fragment = self
                .read_device_identification_raw(unit_id, category, object_id)
                .await?;
            identification.merge(&fragment);
            if !fragment.more_requests_needed {
                return Ok(identification);
            }
            if fragment.next_object_id_to_request <= object_id {
                return Err(ModbusError::framing(format!(
                    "Device identification chain does not advance: 0x{:02X} after 0x{:02X}",
                    fragment.next_object_id_to_request, object_id
                )));
            }
            debug!(
                "Device id unit={} continues at 0x{:02X}",
                unit_id, fragment.next_object_id_to_request
            );
            object_id = fragment.next_object_id_to_request;
        }
    }

    /// Dispose the connection if this client owns it
    pub async fn close(&self) {
        if self.dispose_connection {
            self.connection.dispose().await;
        } else if self.connection.is_disposed() {
            warn!("{}: shared connection already disposed", self.connection.name());
        }
    }
}

/// `(first address, count)` of a write batch the codec accepted
fn written_range(addresses: impl Iterator<Item = u16>) -> (u16, u16) {
    let (first, count) = addresses.fold((u16::MAX, 0u16), |(first, count), address| {
        (first.min(address), count + 1)
    });
    (first, count)
}
