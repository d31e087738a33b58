use super::datapath::Datapath;
use crate::error::{DpError, DpResult};

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// GLOBAL PROVIDER & DATAPATH REGISTRY
//
// A process-wide map from datapath name to its live instance, plus a
// class-name registry used only to validate open()'s class argument.
// Single-writer discipline: every mutation takes the same lock that
// protects the map, readers always see a just-published snapshot.

static DATAPATHS: Lazy<Mutex<HashMap<String, Arc<Datapath>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static CLASSES: Lazy<Mutex<Vec<String>>> =
    Lazy::new(|| Mutex::new(vec!["netdev".to_string()]));

pub const DEFAULT_CLASS: &str = "netdev";

// Registers an additional class name that behaves identically to the
// default "netdev" class, so tests can open datapaths under a distinct
// type tag without a second implementation.
pub fn register_dummy_class(name: &str) {
    let mut classes = CLASSES.lock().unwrap();
    if !classes.iter().any(|c| c == name) {
        classes.push(name.to_string());
    }
}

pub fn class_exists(name: &str) -> bool {
    CLASSES.lock().unwrap().iter().any(|c| c == name)
}

pub fn lookup(name: &str) -> Option<Arc<Datapath>> {
    DATAPATHS.lock().unwrap().get(name).cloned()
}

// A point-in-time list of live datapaths, used by the I/O worker to
// build its poll set each iteration. Held only for the duration of the
// clone, matching the single-writer/consistent-snapshot discipline.
pub fn snapshot() -> Vec<Arc<Datapath>> {
    DATAPATHS.lock().unwrap().values().cloned().collect()
}

pub fn open(class: &str, name: &str, create: bool) -> DpResult<Arc<Datapath>> {
    if !class_exists(class) {
        return Err(DpError::Invalid);
    }
    let mut table = DATAPATHS.lock().unwrap();
    match table.get(name) {
        Some(dp) => {
            if dp.class() != class {
                return Err(DpError::Invalid);
            }
            if create {
                return Err(DpError::Exists);
            }
            dp.bump_open_cnt();
            Ok(dp.clone())
        }
        None => {
            if !create {
                return Err(DpError::NoEntry);
            }
            let dp = Arc::new(Datapath::new(class, name));
            table.insert(name.to_string(), dp.clone());
            Ok(dp)
        }
    }
}

// Called by Datapath::close when open_cnt reaches zero on a destroyed
// datapath: removes it from the registry so it can be freed once the
// caller drops its last Arc.
pub fn forget(name: &str) {
    DATAPATHS.lock().unwrap().remove(name);
}

#[cfg(test)]
pub fn reset_for_test() {
    DATAPATHS.lock().unwrap().clear();
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn open_create_then_reopen() {
        reset_for_test();
        let a = open(DEFAULT_CLASS, "test-dp-1", true).unwrap();
        assert_eq!(Arc::strong_count(&a), 2); // registry + our handle
        let b = open(DEFAULT_CLASS, "test-dp-1", false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn create_existing_is_exists() {
        reset_for_test();
        open(DEFAULT_CLASS, "test-dp-2", true).unwrap();
        assert!(matches!(open(DEFAULT_CLASS, "test-dp-2", true), Err(DpError::Exists)));
    }

    #[test]
    fn missing_without_create_is_no_entry() {
        reset_for_test();
        assert!(matches!(open(DEFAULT_CLASS, "nonexistent", false), Err(DpError::NoEntry)));
    }

    #[test]
    fn unknown_class_is_invalid() {
        reset_for_test();
        assert!(matches!(open("bogus-class", "test-dp-3", true), Err(DpError::Invalid)));
    }
}
