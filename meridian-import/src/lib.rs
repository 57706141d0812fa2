//! # Meridian import pipeline
//!
//! Offline, single-pass transformation of raw OSM-derived scratch files into
//! a meridian database directory. The pipeline is a fixed sequence of
//! processors communicating through files; malformed individual records are
//! reported and skipped, I/O failures abort the import.

pub mod gen_index;
pub mod gen_location;
pub mod gen_objects;
pub mod raw;
pub mod rel_area;
pub mod route_graph;

use meridian_db::area_index::IndexError;
use meridian_db::io::{AccessMode, FileScanner, IoError};
use meridian_db::location::LocationError;
use meridian_db::objects::ObjectError;
use meridian_db::progress::Progress;
use meridian_db::store::{StoreError, StoredObject};
use meridian_db::types::buffer::BufferError;
use meridian_db::types::{TypeConfig, TypeConfigError};
use meridian_db::Id;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const REL_AREA_TMP: &str = "relarea.tmp";
pub const WAY_AREA_BLACK_DAT: &str = "wayareablack.dat";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    TypeConfig(#[from] TypeConfigError),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("Relation {id}: {message}")]
    Relation { id: Id, message: String },
}

/// Import configuration.
#[derive(Debug, Clone)]
pub struct ImporterParameter {
    /// Reject multipolygon rings that are not simple polygons.
    pub strict_areas: bool,
    /// Cell level of the area indices.
    pub area_index_level: u32,
    /// Optimisation levels the low-zoom index is built for.
    pub optimization_levels: Vec<u32>,
}

impl Default for ImporterParameter {
    fn default() -> Self {
        Self {
            strict_areas: false,
            area_index_level: 14,
            optimization_levels: vec![6, 8, 10],
        }
    }
}

/// Everything a processor gets to see.
pub struct ImportContext<'a> {
    pub directory: &'a Path,
    pub parameter: &'a ImporterParameter,
    pub config: &'a Arc<TypeConfig>,
    pub progress: &'a dyn Progress,
}

/// One stage of the pipeline.
pub trait Processor {
    fn description(&self) -> &'static str;

    fn process(&self, ctx: &ImportContext<'_>) -> Result<(), ImportError>;
}

/// Drives the processor sequence over a directory prepared with
/// [`raw::ScratchWriter`].
pub struct Importer {
    parameter: ImporterParameter,
}

impl Importer {
    pub fn new(parameter: ImporterParameter) -> Self {
        Self { parameter }
    }

    /// Runs the full pipeline. Consumes the type config (sealed by this
    /// point) and writes it out as `types.dat` first.
    pub fn run(
        &self,
        config: TypeConfig,
        directory: impl AsRef<Path>,
        progress: &dyn Progress,
    ) -> Result<(), ImportError> {
        let directory = directory.as_ref();

        progress.set_action("Store types.dat");
        config.store_to_data_file(directory)?;
        let config = Arc::new(config);

        let ctx = ImportContext {
            directory,
            parameter: &self.parameter,
            config: &config,
            progress,
        };

        let processors: Vec<Box<dyn Processor>> = vec![
            Box::new(rel_area::RelAreaProcessor),
            Box::new(gen_objects::NodeGenProcessor),
            Box::new(gen_objects::WayAreaGenProcessor),
            Box::new(gen_index::AreaIndexProcessor),
            Box::new(gen_index::LowZoomProcessor),
            Box::new(route_graph::RouteGraphProcessor),
            Box::new(gen_location::LocationIndexProcessor),
        ];

        for processor in processors {
            progress.set_action(processor.description());
            processor.process(&ctx)?;
        }

        Ok(())
    }
}

/// Sequential pass over a plain object file (no record count header).
pub(crate) fn for_each_object<T, F>(
    path: impl AsRef<Path>,
    config: &TypeConfig,
    mut f: F,
) -> Result<(), ImportError>
where
    T: StoredObject,
    F: FnMut(T) -> Result<(), ImportError>,
{
    let mut scanner = FileScanner::open(path, AccessMode::Sequential, false)?;
    while scanner.pos() < scanner.len() {
        f(T::read_record(config, &mut scanner)?)?;
    }
    Ok(())
}
