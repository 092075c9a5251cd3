//! Forwarding handler
//!
//! Answers each request by replaying it on a backend [`ModbusClient`]. Any
//! backend failure becomes an exception reply so the front end keeps serving.

use async_trait::async_trait;
use tracing::warn;

use super::handler::RequestHandler;
use crate::client::ModbusClient;
use crate::codec::{DeviceIdentificationResponse, Request, Response};
use crate::error::{ModbusError, ModbusResult};
use crate::types::ExceptionCode;

#[derive(Debug, Clone)]
pub struct ProxyHandler {
    client: ModbusClient,
}

impl ProxyHandler {
    pub fn new(client: ModbusClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ModbusClient {
        &self.client
    }

    async fn forward(&self, unit_id: u8, request: Request) -> ModbusResult<Response> {
        let client = &self.client;
        let response = match request {
            Request::ReadCoils {
                start_address,
                count,
            } => {
                let coils = client.read_coils(unit_id, start_address, count).await?;
                Response::ReadCoils(coils.into_iter().map(|c| c.value).collect())
            },
            Request::ReadDiscreteInputs {
                start_address,
                count,
            } => {
                let inputs = client
                    .read_discrete_inputs(unit_id, start_address, count)
                    .await?;
                Response::ReadDiscreteInputs(inputs.into_iter().map(|d| d.value).collect())
            },
            Request::ReadHoldingRegisters {
                start_address,
                count,
            } => {
                let registers = client
                    .read_holding_registers(unit_id, start_address, count)
                    .await?;
                Response::ReadHoldingRegisters(registers.iter().map(|r| r.value()).collect())
            },
            Request::ReadInputRegisters {
                start_address,
                count,
            } => {
                let registers = client
                    .read_input_registers(unit_id, start_address, count)
                    .await?;
                Response::ReadInputRegisters(registers.iter().map(|r| r.value()).collect())
            },
            Request::WriteSingleCoil(coil) => {
                confirm_echo(client.write_single_coil(unit_id, coil).await?)?;
                Response::WriteSingleCoil(coil)
            },
            Request::WriteSingleRegister(register) => {
                confirm_echo(
                    client
                        .write_single_holding_register(unit_id, register)
                        .await?,
                )?;
                Response::WriteSingleRegister(register)
            },
            Request::WriteMultipleCoils(coils) => {
                confirm_echo(client.write_multiple_coils(unit_id, &coils).await?)?;
                Response::WriteMultipleCoils {
                    start_address: coils.first().map_or(0, |c| c.address),
                    count: coils.len() as u16,
                }
            },
            Request::WriteMultipleRegisters(registers) => {
                confirm_echo(
                    client
                        .write_multiple_holding_registers(unit_id, &registers)
                        .await?,
                )?;
                Response::WriteMultipleRegisters {
                    start_address: registers.first().map_or(0, |r| r.address),
                    count: registers.len() as u16,
                }
            },
            Request::ReadDeviceIdentification {
                category,
                object_id,
            } => {
                let raw = client
                    .read_device_identification_raw(unit_id, category, object_id)
                    .await?;
                Response::ReadDeviceIdentification(DeviceIdentificationResponse::from_raw(
                    category, raw,
                ))
            },
            Request::Invalid {
                function_code,
                code,
            } => Response::Exception {
                function_code,
                code,
            },
            unsupported @ Request::Unsupported { .. } => {
                unsupported.exception(ExceptionCode::IllegalFunction)
            },
        };
        Ok(response)
    }
}

/// A backend that acknowledged something other than the write is treated as failed
fn confirm_echo(matches: bool) -> ModbusResult<()> {
    if matches {
        Ok(())
    } else {
        Err(ModbusError::framing("Backend echo does not match the write"))
    }
}

#[async_trait]
impl RequestHandler for ProxyHandler {
    async fn handle(&self, unit_id: u8, request: Request) -> Option<Response> {
        let function_code = request.function_code();
        match self.forward(unit_id, request).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(
                    "Proxy unit={} FC={:02X} failed: {e}",
                    unit_id, function_code
                );
                Some(Response::Exception {
                    function_code,
                    code: e
                        .exception_code()
                        .unwrap_or(ExceptionCode::SlaveDeviceFailure),
                })
            },
        }
    }
}
