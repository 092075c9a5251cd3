//! In-memory register image of simulated devices

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::DeviceIdentity;

#[derive(Debug, Default)]
struct UnitImage {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
}

/// Per-unit coils, inputs and registers; unset addresses read as zero
#[derive(Debug, Default)]
pub struct RegisterStore {
    units: RwLock<HashMap<u8, UnitImage>>,
    identity: RwLock<DeviceIdentity>,
}

fn read_range<V: Copy + Default>(map: &HashMap<u16, V>, start: u16, count: u16) -> Vec<V> {
    (0..count)
        .map(|i| {
            map.get(&start.wrapping_add(i))
                .copied()
                .unwrap_or_default()
        })
        .collect()
}

impl RegisterStore {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            identity: RwLock::new(identity),
        }
    }

    /// Make `unit_id` answer requests
    pub fn add_unit(&self, unit_id: u8) {
        self.units.write().entry(unit_id).or_default();
    }

    pub fn has_unit(&self, unit_id: u8) -> bool {
        self.units.read().contains_key(&unit_id)
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.units.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.write() = identity;
    }

    pub fn read_coils(&self, unit_id: u8, start: u16, count: u16) -> Option<Vec<bool>> {
        let units = self.units.read();
        units.get(&unit_id).map(|u| read_range(&u.coils, start, count))
    }

    pub fn read_discrete_inputs(&self, unit_id: u8, start: u16, count: u16) -> Option<Vec<bool>> {
        let units = self.units.read();
        units
            .get(&unit_id)
            .map(|u| read_range(&u.discrete_inputs, start, count))
    }

    pub fn read_holding_registers(&self, unit_id: u8, start: u16, count: u16) -> Option<Vec<u16>> {
        let units = self.units.read();
        units
            .get(&unit_id)
            .map(|u| read_range(&u.holding_registers, start, count))
    }

    pub fn read_input_registers(&self, unit_id: u8, start: u16, count: u16) -> Option<Vec<u16>> {
        let units = self.units.read();
        units
            .get(&unit_id)
            .map(|u| read_range(&u.input_registers, start, count))
    }

    /// Creates the unit if needed
    pub fn set_coil(&self, unit_id: u8, address: u16, value: bool) {
        self.units
            .write()
            .entry(unit_id)
            .or_default()
            .coils
            .insert(address, value);
    }

    pub fn set_discrete_input(&self, unit_id: u8, address: u16, value: bool) {
        self.units
            .write()
            .entry(unit_id)
            .or_default()
            .discrete_inputs
            .insert(address, value);
    }

    pub fn set_holding_register(&self, unit_id: u8, address: u16, value: u16) {
        self.units
            .write()
            .entry(unit_id)
            .or_default()
            .holding_registers
            .insert(address, value);
    }

    pub fn set_input_register(&self, unit_id: u8, address: u16, value: u16) {
        self.units
            .write()
            .entry(unit_id)
            .or_default()
            .input_registers
            .insert(address, value);
    }
}
