//! Session identity negotiation
//!
//! Long-lived station, image type and image source codes are mapped to dense
//! 8-bit ids so content packets stay small. The server keeps one id table per
//! authorisation code for the life of the process, so ids are stable across
//! reconnects, but each authenticated connection only trusts the snapshot it
//! was issued.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use wxpush_protocol::{Code, CodeMapping, HardwareType, StationEntry, StationId, StationInfo};
use wxpush_storage::{ImageSourceRecord, StationRecord};

/// Ids 0..=254 are assignable; 255 entries per space
pub const MAX_IDS: usize = 255;

/// One id space: codes to dense ids in first-seen order
#[derive(Debug, Default)]
struct IdSpace {
    ids: HashMap<Code, u8>,
}

impl IdSpace {
    fn assign(&mut self, code: &Code) -> Option<u8> {
        if let Some(&id) = self.ids.get(code) {
            return Some(id);
        }
        if self.ids.len() >= MAX_IDS {
            return None;
        }
        let id = self.ids.len() as u8;
        self.ids.insert(code.clone(), id);
        Some(id)
    }
}

#[derive(Debug, Default)]
struct CodeTable {
    stations: IdSpace,
    image_types: IdSpace,
    image_sources: IdSpace,
}

/// Server-wide id tables, one per authorisation code
#[derive(Default)]
pub struct IdentityRegistry {
    tables: DashMap<u64, Arc<Mutex<CodeTable>>>,
}

impl IdentityRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Assign ids for everything visible to `auth_code` and return the
    /// snapshot for one connection.
    pub fn issue(
        &self,
        auth_code: u64,
        stations: &[StationRecord],
        image_types: &[Code],
        image_sources: &[ImageSourceRecord],
    ) -> SessionIdentity {
        let table = self
            .tables
            .entry(auth_code)
            .or_insert_with(|| Arc::new(Mutex::new(CodeTable::default())))
            .clone();
        // Connections sharing a code serialise here
        let mut table = table.lock();

        let mut identity = SessionIdentity {
            auth_code,
            ..Default::default()
        };

        for station in stations {
            match table.stations.assign(&station.code) {
                Some(id) => identity.add_station(station.clone(), StationId::new(id)),
                None => warn!(
                    "Station id space exhausted for auth code {}, station {} not synced",
                    auth_code, station.code
                ),
            }
        }
        for code in image_types {
            match table.image_types.assign(code) {
                Some(id) => identity.image_types.push(CodeMapping {
                    code: code.clone(),
                    id,
                }),
                None => warn!(
                    "Image type id space exhausted for auth code {}, type {} not synced",
                    auth_code, code
                ),
            }
        }
        for source in image_sources {
            match table.image_sources.assign(&source.code) {
                Some(id) => identity.image_sources.push(CodeMapping {
                    code: source.code.clone(),
                    id,
                }),
                None => warn!(
                    "Image source id space exhausted for auth code {}, source {} not synced",
                    auth_code, source.code
                ),
            }
        }

        debug!(
            auth_code,
            stations = identity.stations.len(),
            image_types = identity.image_types.len(),
            image_sources = identity.image_sources.len(),
            "Issued session identity"
        );
        identity
    }
}

/// Identity snapshot owned by one authenticated connection
#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    auth_code: u64,
    stations: Vec<StationEntry>,
    station_ids: HashMap<StationId, usize>,
    image_types: Vec<CodeMapping>,
    image_sources: Vec<CodeMapping>,
}

impl SessionIdentity {
    fn add_station(&mut self, station: StationRecord, id: StationId) {
        self.station_ids.insert(id, self.stations.len());
        self.stations.push(StationEntry {
            code: station.code,
            hardware: station.hardware,
            station_id: id,
        });
    }

    pub fn auth_code(&self) -> u64 {
        self.auth_code
    }

    pub fn stations(&self) -> &[StationEntry] {
        &self.stations
    }

    /// Station for an id issued in this snapshot
    pub fn station(&self, id: StationId) -> Option<&StationEntry> {
        self.station_ids.get(&id).map(|&i| &self.stations[i])
    }

    pub fn image_type(&self, id: u8) -> Option<&Code> {
        self.image_types.iter().find(|m| m.id == id).map(|m| &m.code)
    }

    pub fn image_source(&self, id: u8) -> Option<&Code> {
        self.image_sources.iter().find(|m| m.id == id).map(|m| &m.code)
    }

    pub fn to_station_info(&self) -> StationInfo {
        StationInfo {
            stations: self.stations.clone(),
            image_types: self.image_types.clone(),
            image_sources: self.image_sources.clone(),
        }
    }
}

/// Client view of the server's identity table
///
/// Content may only be sent while the table is valid. It is invalidated on
/// every disconnect and rebuilt from the next StationInfo.
#[derive(Debug, Default)]
pub struct IdentityTable {
    valid: bool,
    stations: HashMap<Code, (StationId, HardwareType)>,
    station_codes: HashMap<StationId, Code>,
    image_types: HashMap<Code, u8>,
    image_type_codes: HashMap<u8, Code>,
    image_sources: HashMap<Code, u8>,
    image_source_codes: HashMap<u8, Code>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    /// Replace the table from a TCP StationInfo packet
    pub fn load(&mut self, info: &StationInfo) {
        self.load_stations(&info.stations);
        for m in &info.image_types {
            self.image_types.insert(m.code.clone(), m.id);
            self.image_type_codes.insert(m.id, m.code.clone());
        }
        for m in &info.image_sources {
            self.image_sources.insert(m.code.clone(), m.id);
            self.image_source_codes.insert(m.id, m.code.clone());
        }
    }

    /// Replace the table from a station list (UDP carries no image ids)
    pub fn load_stations(&mut self, stations: &[StationEntry]) {
        self.invalidate();
        for entry in stations {
            self.stations
                .insert(entry.code.clone(), (entry.station_id, entry.hardware));
            self.station_codes
                .insert(entry.station_id, entry.code.clone());
        }
        self.valid = true;
    }

    pub fn station_id(&self, code: &Code) -> Option<StationId> {
        self.stations.get(code).map(|(id, _)| *id)
    }

    pub fn hardware(&self, code: &Code) -> Option<HardwareType> {
        self.stations.get(code).map(|(_, hw)| *hw)
    }

    pub fn station_code(&self, id: StationId) -> Option<&Code> {
        self.station_codes.get(&id)
    }

    pub fn station_codes(&self) -> impl Iterator<Item = &Code> {
        self.stations.keys()
    }

    pub fn image_type_id(&self, code: &Code) -> Option<u8> {
        self.image_types.get(code).copied()
    }

    pub fn image_source_id(&self, code: &Code) -> Option<u8> {
        self.image_sources.get(code).copied()
    }

    pub fn image_type_code(&self, id: u8) -> Option<&Code> {
        self.image_type_codes.get(&id)
    }

    pub fn image_source_code(&self, id: u8) -> Option<&Code> {
        self.image_source_codes.get(&id)
    }
}
