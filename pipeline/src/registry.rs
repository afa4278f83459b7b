//! Process-wide type registry.
//!
//! Hands out stable numeric ids for application message types so that
//! type-tagged records survive process boundaries. Allocation is a monotone
//! counter starting at 1000; the ids below that are reserved for well-known
//! protocol types. The name table is initialised on first use and guarded
//! by a reader/writer lock.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{OnceLock, RwLock};

/// First dynamically allocated type id.
pub const FIRST_DYNAMIC_TYPE_ID: u32 = 1000;

static NEXT_ID: AtomicU32 = AtomicU32::new(FIRST_DYNAMIC_TYPE_ID);

fn names() -> &'static RwLock<FxHashMap<u32, String>> {
    static NAMES: OnceLock<RwLock<FxHashMap<u32, String>>> = OnceLock::new();
    NAMES.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Allocates a fresh type id and records its name.
pub fn register_type(name: &str) -> u32 {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    names()
        .write()
        .expect("type registry lock poisoned")
        .insert(id, name.to_owned());
    id
}

/// Records a name for an externally assigned (well-known) id.
pub fn register_type_as(id: u32, name: &str) {
    names()
        .write()
        .expect("type registry lock poisoned")
        .insert(id, name.to_owned());
}

/// The recorded name for an id, or a synthetic `unknown_type_<id>`.
pub fn type_name(id: u32) -> String {
    names()
        .read()
        .expect("type registry lock poisoned")
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("unknown_type_{id}"))
}

pub fn is_registered(id: u32) -> bool {
    names()
        .read()
        .expect("type registry lock poisoned")
        .contains_key(&id)
}
