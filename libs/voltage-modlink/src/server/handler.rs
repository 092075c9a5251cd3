//! Request handlers
//!
//! A handler turns one decoded request into the reply to send back, or into
//! no reply at all (a unit that does not exist on the bus stays silent).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::store::RegisterStore;
use crate::codec::{pdu, Request, Response};
use crate::constants::MAX_PDU_SIZE;
use crate::types::{Coil, ExceptionCode, HoldingRegister};

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `None` suppresses the reply
    async fn handle(&self, unit_id: u8, request: Request) -> Option<Response>;
}

/// Values a client wrote into the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteNotification {
    Coils { unit_id: u8, coils: Vec<Coil> },
    HoldingRegisters {
        unit_id: u8,
        registers: Vec<HoldingRegister>,
    },
}

/// Serves requests from a [`RegisterStore`]
#[derive(Debug, Clone)]
pub struct DeviceHandler {
    store: Arc<RegisterStore>,
    notifications: Option<mpsc::UnboundedSender<WriteNotification>>,
}

impl DeviceHandler {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self {
            store,
            notifications: None,
        }
    }

    /// Handler that reports every applied write on the returned channel
    pub fn with_notifications(
        store: Arc<RegisterStore>,
    ) -> (Self, mpsc::UnboundedReceiver<WriteNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            store,
            notifications: Some(tx),
        };
        (handler, rx)
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    fn notify(&self, notification: WriteNotification) {
        if let Some(tx) = &self.notifications {
            // Nobody listening is fine
            if tx.send(notification).is_err() {
                trace!("Write notification dropped, receiver closed");
            }
        }
    }

    fn write_coils(&self, unit_id: u8, coils: Vec<Coil>) {
        for coil in &coils {
            self.store.set_coil(unit_id, coil.address, coil.value);
        }
        self.notify(WriteNotification::Coils { unit_id, coils });
    }

    fn write_registers(&self, unit_id: u8, registers: Vec<HoldingRegister>) {
        for register in &registers {
            self.store
                .set_holding_register(unit_id, register.address, register.value());
        }
        self.notify(WriteNotification::HoldingRegisters { unit_id, registers });
    }
}

#[async_trait]
impl RequestHandler for DeviceHandler {
    async fn handle(&self, unit_id: u8, request: Request) -> Option<Response> {
        if !self.store.has_unit(unit_id) {
            debug!("No unit {}, request ignored", unit_id);
            return None;
        }

        let store = &self.store;
        let response = match request {
            Request::ReadCoils {
                start_address,
                count,
            } => Response::ReadCoils(store.read_coils(unit_id, start_address, count)?),
            Request::ReadDiscreteInputs {
                start_address,
                count,
            } => Response::ReadDiscreteInputs(store.read_discrete_inputs(
                unit_id,
                start_address,
                count,
            )?),
            Request::ReadHoldingRegisters {
                start_address,
                count,
            } => Response::ReadHoldingRegisters(store.read_holding_registers(
                unit_id,
                start_address,
                count,
            )?),
            Request::ReadInputRegisters {
                start_address,
                count,
            } => Response::ReadInputRegisters(store.read_input_registers(
                unit_id,
                start_address,
                count,
            )?),
            Request::WriteSingleCoil(coil) => {
                self.write_coils(unit_id, vec![coil]);
                Response::WriteSingleCoil(coil)
            },
            Request::WriteSingleRegister(register) => {
                self.write_registers(unit_id, vec![register]);
                Response::WriteSingleRegister(register)
            },
            Request::WriteMultipleCoils(coils) => {
                let start_address = coils.first().map_or(0, |c| c.address);
                let count = coils.len() as u16;
                self.write_coils(unit_id, coils);
                Response::WriteMultipleCoils {
                    start_address,
                    count,
                }
            },
            Request::WriteMultipleRegisters(registers) => {
                let start_address = registers.first().map_or(0, |r| r.address);
                let count = registers.len() as u16;
                self.write_registers(unit_id, registers);
                Response::WriteMultipleRegisters {
                    start_address,
                    count,
                }
            },
            Request::ReadDeviceIdentification {
                category,
                object_id,
            } => pdu::encode_device_identification(
                &store.identity(),
                category,
                object_id,
                MAX_PDU_SIZE,
            ),
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
        Some(response)
    }
}
