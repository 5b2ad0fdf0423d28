//! Real MIDI port sink built on midir.

use std::sync::Mutex;

use midir::{MidiOutput as MidirClient, MidiOutputConnection};

use crate::traits::{MidiError, MidiOutput};

const CLIENT_NAME: &str = "pulssi";

/// A sink connected to a system MIDI output port.
pub struct MidirOutput {
    name: String,
    connection: Mutex<MidiOutputConnection>,
}

impl MidirOutput {
    /// List the names of the available output ports.
    pub fn ports() -> Result<Vec<String>, MidiError> {
        let client =
            MidirClient::new(CLIENT_NAME).map_err(|e| MidiError::ClientInit(e.to_string()))?;
        Ok(client
            .ports()
            .iter()
            .filter_map(|port| client.port_name(port).ok())
            .collect())
    }

    /// Connect to the first port whose name contains `name`.
    pub fn connect(name: &str) -> Result<Self, MidiError> {
        let client =
            MidirClient::new(CLIENT_NAME).map_err(|e| MidiError::ClientInit(e.to_string()))?;

        let mut target = None;
        for port in client.ports() {
            if let Ok(port_name) = client.port_name(&port) {
                if port_name.contains(name) {
                    target = Some((port, port_name));
                    break;
                }
            }
        }
        let Some((port, port_name)) = target else {
            return Err(MidiError::NoPort(name.to_string()));
        };

        let connection = client
            .connect(&port, CLIENT_NAME)
            .map_err(|e| MidiError::Connect(e.to_string()))?;
        Ok(Self {
            name: port_name,
            connection: Mutex::new(connection),
        })
    }
}

impl MidiOutput for MidirOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn write_raw(&self, data: &[u8]) {
        let mut connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = connection.send(data) {
            log::warn!("MIDI send to '{}' failed: {}", self.name, e);
        }
    }
}
