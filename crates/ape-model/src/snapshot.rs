//! Model persistence
//!
//! The model and the controller are written as one bincode blob. Naming
//! results are not stored; they are recomputed on load.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ape_common::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controller::Controller;
use crate::model::Model;

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model: Model,
    pub controller: Controller,
}

impl ModelSnapshot {
    pub fn to_bytes(model: &Model, controller: &Controller) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(model, controller))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (mut model, controller): (Model, Controller) = bincode::deserialize(bytes)?;
        model.restore()?;
        Ok(Self { model, controller })
    }

    pub fn save(path: &Path, model: &Model, controller: &Controller) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &(model, controller))?;
        info!(
            path = %path.display(),
            states = model.graph().len(),
            trees = model.trees().len(),
            "model saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let (mut model, controller): (Model, Controller) = bincode::deserialize_from(reader)?;
        model.restore()?;
        info!(path = %path.display(), states = model.graph().len(), "model loaded");
        Ok(Self { model, controller })
    }
}
