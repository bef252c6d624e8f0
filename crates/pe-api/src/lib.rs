pub mod definition;
pub mod memory;
pub mod registry;

use pe_core::{BindingKind, Diagnostic, ProcError};
use tracing::info;

pub use definition::{Definitions, PoolDefinition, MEMORY_POOL_TYPE};
pub use memory::{MemoryChannel, MemoryFactory, MemoryStore};
pub use pe_core::{Value, ValueMap};
pub use pe_runtime::{CallContext, CallOptions, Invocation, Library, LogEntry};
pub use registry::{ChannelTypes, FactoryBuilder};

#[derive(Default)]
pub struct LoadLibraryOptions {
    pub channel_types: ChannelTypes,
    pub call_options: CallOptions,
}

/// Builds a library with every pool and procedure of the definitions.
/// Pools are created before procedures so nothing is half registered when a
/// pool definition is rejected.
pub fn load_library(
    definitions: &Definitions,
    options: &LoadLibraryOptions,
) -> Result<Library, ProcError> {
    let mut pools = Vec::with_capacity(definitions.pools.len());
    for (name, definition) in &definitions.pools {
        match options.channel_types.create_pool(name, definition) {
            Ok(pool) => pools.push(pool),
            Err(error) => {
                for pool in pools {
                    pool.close();
                }
                return Err(error);
            }
        }
    }

    let library = Library::with_options(options.call_options.clone());
    for pool in pools {
        library.add_pool(pool);
    }
    for def in &definitions.procedures {
        if let Err(error) = library.add_script(def.clone()) {
            library.close_pools();
            return Err(error);
        }
    }
    info!(
        pools = definitions.pools.len(),
        procedures = definitions.procedures.len(),
        "library loaded"
    );
    Ok(library)
}

pub fn load_library_from_json(
    origin: &str,
    text: &str,
    options: &LoadLibraryOptions,
) -> Result<Library, ProcError> {
    let definitions = Definitions::from_json_str(origin, text)?;
    load_library(&definitions, options)
}

/// Outcome of checking one procedure without running it.
#[derive(Debug)]
pub struct CheckReport {
    pub id: String,
    pub warnings: Vec<Diagnostic>,
    pub errors: Vec<ProcError>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compiles every script procedure and confirms that each binding names a
/// pool or procedure the library knows.
pub fn check_library(library: &Library) -> Vec<CheckReport> {
    library
        .procedure_ids()
        .into_iter()
        .filter_map(|id| library.procedure(&id).ok())
        .map(|procedure| {
            let mut report = CheckReport {
                id: procedure.id().to_string(),
                warnings: Vec::new(),
                errors: Vec::new(),
            };
            for binding in procedure.bindings() {
                let Some(target) = binding.reference() else {
                    continue;
                };
                let found = match binding.kind {
                    BindingKind::Connection => library.pool(target).map(|_| ()),
                    BindingKind::Procedure => library.procedure(target).map(|_| ()),
                    BindingKind::Data | BindingKind::Argument => Ok(()),
                };
                if let Err(error) = found {
                    report.errors.push(error);
                }
            }
            if procedure.is_script() {
                match procedure.compiled() {
                    Ok(compiled) => report.warnings = compiled.warnings().to_vec(),
                    Err(error) => report.errors.push(error),
                }
            }
            report
        })
        .collect()
}
