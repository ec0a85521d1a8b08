//! # Observation Database
//!
//! Owns the four in-memory stores and links them so nested filters resolve
//! across store boundaries:
//!
//! ```text
//!              procedures ◄──────────► datastreams
//!                                         ▲   │
//!                                         │   ▼
//!                  fois ◄──────────────► observations
//! ```
//!
//! Links are weak: a store never keeps its peers alive, so dropping the
//! database frees every store even though the link graph has cycles.
//!
//! ## Backup Layout
//!
//! [`ObsDatabase::backup_dir`] writes one JSON snapshot per store into a
//! directory; [`ObsDatabase::restore_dir`] reads them back.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::store::{
    DataStore, InMemoryDataStreamStore, InMemoryFoiStore, InMemoryObsStore,
    InMemoryProcedureStore,
};

const PROCEDURES_FILE: &str = "procedures.json";
const FOIS_FILE: &str = "fois.json";
const DATASTREAMS_FILE: &str = "datastreams.json";
const OBSERVATIONS_FILE: &str = "observations.json";

/// In-memory observation database.
#[derive(Debug, Clone)]
pub struct ObsDatabase {
    procedures: Arc<InMemoryProcedureStore>,
    fois: Arc<InMemoryFoiStore>,
    datastreams: Arc<InMemoryDataStreamStore>,
    observations: Arc<InMemoryObsStore>,
}

impl Default for ObsDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl ObsDatabase {
    /// Creates empty, linked stores.
    pub fn new() -> Self {
        let procedures = Arc::new(InMemoryProcedureStore::new());
        let fois = Arc::new(InMemoryFoiStore::new());
        let datastreams = Arc::new(InMemoryDataStreamStore::new());
        let observations = Arc::new(InMemoryObsStore::new());

        procedures.datastreams.set(&datastreams);
        datastreams.procedures.set(&procedures);
        datastreams.observations.set(&observations);
        fois.observations.set(&observations);
        observations.datastreams.set(&datastreams);
        observations.fois.set(&fois);

        Self {
            procedures,
            fois,
            datastreams,
            observations,
        }
    }

    pub fn procedures(&self) -> &Arc<InMemoryProcedureStore> {
        &self.procedures
    }

    pub fn fois(&self) -> &Arc<InMemoryFoiStore> {
        &self.fois
    }

    pub fn datastreams(&self) -> &Arc<InMemoryDataStreamStore> {
        &self.datastreams
    }

    pub fn observations(&self) -> &Arc<InMemoryObsStore> {
        &self.observations
    }

    /// Switches every store between read-only and writable.
    pub fn set_read_only(&self, read_only: bool) {
        self.procedures.set_read_only(read_only);
        self.fois.set_read_only(read_only);
        self.datastreams.set_read_only(read_only);
        self.observations.set_read_only(read_only);
    }

    /// Commits every store.
    pub fn commit(&self) -> Result<()> {
        self.procedures.commit()?;
        self.fois.commit()?;
        self.datastreams.commit()?;
        self.observations.commit()
    }

    /// Writes a snapshot of every store into `dir`, creating it if needed.
    pub fn backup_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        backup_to(&*self.procedures, &dir.join(PROCEDURES_FILE))?;
        backup_to(&*self.fois, &dir.join(FOIS_FILE))?;
        backup_to(&*self.datastreams, &dir.join(DATASTREAMS_FILE))?;
        backup_to(&*self.observations, &dir.join(OBSERVATIONS_FILE))?;
        info!(path = %dir.display(), "database backed up");
        Ok(())
    }

    /// Replaces the contents of every store with the snapshots in `dir`.
    pub fn restore_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        restore_from(&*self.procedures, &dir.join(PROCEDURES_FILE))?;
        restore_from(&*self.fois, &dir.join(FOIS_FILE))?;
        restore_from(&*self.datastreams, &dir.join(DATASTREAMS_FILE))?;
        restore_from(&*self.observations, &dir.join(OBSERVATIONS_FILE))?;
        info!(path = %dir.display(), "database restored");
        Ok(())
    }
}

fn backup_to<S: DataStore + ?Sized>(store: &S, path: &Path) -> Result<()> {
    let mut sink = BufWriter::new(File::create(path)?);
    store.backup(&mut sink)?;
    sink.flush()?;
    Ok(())
}

fn restore_from<S: DataStore + ?Sized>(store: &S, path: &Path) -> Result<()> {
    let mut source = BufReader::new(File::open(path)?);
    store.restore(&mut source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        DataBlock, DataStreamInfo, DataType, DataValue, Feature, ObsData, RecordEncoding, RecordField,
        RecordSchema,
    };
    use crate::error::Error;
    use crate::filter::ObsFilter;
    use crate::store::{DataStreamStore, FeatureStore, ObsStore};
    use crate::types::FeatureId;
    use chrono::{TimeZone, Utc};

    fn populate(db: &ObsDatabase) {
        let proc_key = db.procedures().add(Feature::new("urn:sensor:1", "Sensor 1")).unwrap();
        let schema = RecordSchema::new("weather")
            .with_field(RecordField::new("temp", DataType::Double).with_definition("urn:temp"));
        let ds = DataStreamInfo::builder()
            .procedure(FeatureId::new(proc_key.internal_id(), "urn:sensor:1"))
            .record_schema(schema)
            .record_encoding(RecordEncoding::default())
            .build()
            .unwrap();
        let ds_key = db.datastreams().add(ds).unwrap();
        for i in 0..3 {
            let obs = ObsData::builder()
                .datastream(ds_key)
                .phenomenon_time(Utc.timestamp_opt(100 + i, 0).unwrap())
                .result(DataBlock::new(vec![DataValue::from(i as f64)]))
                .build()
                .unwrap();
            db.observations().add(obs).unwrap();
        }
    }

    #[test]
    fn test_backup_and_restore_dir() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObsDatabase::new();
        populate(&db);
        db.backup_dir(dir.path()).unwrap();

        let restored = ObsDatabase::new();
        restored.restore_dir(dir.path()).unwrap();
        assert_eq!(restored.procedures().num_features(), 1);
        assert_eq!(restored.datastreams().num_records(), 1);
        assert_eq!(restored.observations().count_matching(&ObsFilter::all()).unwrap(), 3);
    }

    #[test]
    fn test_read_only_database_rejects_adds() {
        let db = ObsDatabase::new();
        db.set_read_only(true);
        let err = db.procedures().add(Feature::new("urn:sensor:1", "Sensor 1")).unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[test]
    fn test_restore_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = ObsDatabase::new();
        let err = db.restore_dir(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
